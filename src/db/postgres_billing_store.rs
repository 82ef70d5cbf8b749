use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::billing_store::{
    BillingStore, BillingTx, BillingUpdate, InsertOutcome, UpdateOutcome,
};
use crate::models::webhook_event::NewProcessingRecord;

pub struct PostgresBillingStore {
    pub pool: PgPool,
}

struct PostgresBillingTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingStore for PostgresBillingStore {
    async fn begin(&self) -> Result<Box<dyn BillingTx>, sqlx::Error> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresBillingTx { tx }))
    }
}

#[async_trait]
impl BillingTx for PostgresBillingTx {
    async fn insert_processing_record(
        &mut self,
        record: &NewProcessingRecord,
    ) -> Result<InsertOutcome, sqlx::Error> {
        let conn: &mut PgConnection = &mut self.tx;
        let result = sqlx::query::<Postgres>(
            r#"
            INSERT INTO webhook_event_log (external_event_id, object_id, received_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_event_id) DO NOTHING
            "#,
        )
        .bind(&record.external_event_id)
        .bind(&record.object_id)
        .bind(record.received_at)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn mark_processed(
        &mut self,
        external_event_id: &str,
        processed_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        let conn: &mut PgConnection = &mut self.tx;
        sqlx::query::<Postgres>(
            "UPDATE webhook_event_log SET processed_at = $2 WHERE external_event_id = $1",
        )
        .bind(external_event_id)
        .bind(processed_at)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn find_user_id_by_customer(
        &mut self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        let conn: &mut PgConnection = &mut self.tx;
        sqlx::query_scalar::<Postgres, Uuid>("SELECT id FROM users WHERE stripe_customer_id = $1")
            .bind(customer_id)
            .fetch_optional(conn)
            .await
    }

    async fn apply_billing_update(
        &mut self,
        update: &BillingUpdate,
    ) -> Result<UpdateOutcome, sqlx::Error> {
        let conn: &mut PgConnection = &mut self.tx;
        let result = sqlx::query::<Postgres>(
            r#"
            UPDATE users SET
                is_entitled = $2,
                stripe_customer_id = COALESCE($3, stripe_customer_id),
                stripe_subscription_id = COALESCE($4, stripe_subscription_id),
                plan_tier = COALESCE($5, plan_tier),
                billing_version = billing_version + 1,
                last_billing_event_at = $6
            WHERE id = $1
              AND (last_billing_event_at IS NULL OR last_billing_event_at <= $6)
            "#,
        )
        .bind(update.user_id)
        .bind(update.is_entitled)
        .bind(&update.stripe_customer_id)
        .bind(&update.stripe_subscription_id)
        .bind(update.plan_tier.map(|p| p.as_str()))
        .bind(update.event_created_at)
        .execute(conn)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(UpdateOutcome::Applied);
        }

        // Zero rows: either the user does not exist or the guard rejected a
        // stale event. Distinguish so handlers can report the right skip.
        let conn: &mut PgConnection = &mut self.tx;
        let exists = sqlx::query_scalar::<Postgres, i64>("SELECT 1 FROM users WHERE id = $1")
            .bind(update.user_id)
            .fetch_optional(conn)
            .await?
            .is_some();

        if exists {
            Ok(UpdateOutcome::Stale)
        } else {
            Ok(UpdateOutcome::UserMissing)
        }
    }

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}
