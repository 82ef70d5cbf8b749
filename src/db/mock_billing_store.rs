use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::billing_store::{
    BillingStore, BillingTx, BillingUpdate, InsertOutcome, UpdateOutcome,
};
use crate::models::user::User;
use crate::models::webhook_event::{NewProcessingRecord, ProcessingRecord};

#[derive(Default)]
struct StoreState {
    records: HashMap<String, ProcessingRecord>,
    /// Event ids held by open transactions. A second writer observes the
    /// reservation as a conflict, mirroring the unique-constraint race.
    reserved: HashMap<String, u64>,
    users: HashMap<Uuid, User>,
    next_tx_id: u64,
}

/// In-memory store with real commit/rollback semantics: writes are staged
/// on the transaction and only land on commit, so rollback tests run
/// without a database.
#[derive(Clone, Default)]
pub struct MockBillingStore {
    state: Arc<Mutex<StoreState>>,
    fail_apply: Arc<Mutex<bool>>,
    fail_commit: Arc<Mutex<bool>>,
}

impl MockBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_apply(&self) {
        *self.fail_apply.lock().unwrap() = true;
    }

    pub fn fail_next_commit(&self) {
        *self.fail_commit.lock().unwrap() = true;
    }

    pub fn seed_user(&self, user_id: Uuid, stripe_customer_id: Option<&str>) {
        let now = OffsetDateTime::UNIX_EPOCH;
        self.state.lock().unwrap().users.insert(
            user_id,
            User {
                id: user_id,
                email: format!("{}@example.test", user_id),
                handle: format!("creator-{}", &user_id.to_string()[..8]),
                is_entitled: false,
                plan_tier: None,
                stripe_customer_id: stripe_customer_id.map(|s| s.to_string()),
                stripe_subscription_id: None,
                billing_version: 0,
                last_billing_event_at: None,
                created_at: now,
            },
        );
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.state.lock().unwrap().users.get(&user_id).cloned()
    }

    pub fn record(&self, external_event_id: &str) -> Option<ProcessingRecord> {
        self.state
            .lock()
            .unwrap()
            .records
            .get(external_event_id)
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().unwrap().records.len()
    }
}

struct MockBillingTx {
    store: MockBillingStore,
    tx_id: u64,
    staged_record: Option<ProcessingRecord>,
    staged_updates: Vec<BillingUpdate>,
    finished: bool,
}

impl MockBillingTx {
    fn release_reservation(&mut self) {
        if let Some(record) = &self.staged_record {
            let mut state = self.store.state.lock().unwrap();
            if state.reserved.get(&record.external_event_id) == Some(&self.tx_id) {
                state.reserved.remove(&record.external_event_id);
            }
        }
    }
}

impl Drop for MockBillingTx {
    fn drop(&mut self) {
        // A dropped-but-unresolved transaction rolls back, like sqlx's.
        if !self.finished {
            self.release_reservation();
        }
    }
}

#[async_trait]
impl BillingStore for MockBillingStore {
    async fn begin(&self) -> Result<Box<dyn BillingTx>, sqlx::Error> {
        let tx_id = {
            let mut state = self.state.lock().unwrap();
            state.next_tx_id += 1;
            state.next_tx_id
        };
        Ok(Box::new(MockBillingTx {
            store: self.clone(),
            tx_id,
            staged_record: None,
            staged_updates: Vec::new(),
            finished: false,
        }))
    }
}

#[async_trait]
impl BillingTx for MockBillingTx {
    async fn insert_processing_record(
        &mut self,
        record: &NewProcessingRecord,
    ) -> Result<InsertOutcome, sqlx::Error> {
        let mut state = self.store.state.lock().unwrap();
        if state.records.contains_key(&record.external_event_id)
            || state.reserved.contains_key(&record.external_event_id)
        {
            return Ok(InsertOutcome::Duplicate);
        }
        state
            .reserved
            .insert(record.external_event_id.clone(), self.tx_id);
        self.staged_record = Some(ProcessingRecord {
            external_event_id: record.external_event_id.clone(),
            object_id: record.object_id.clone(),
            received_at: record.received_at,
            processed_at: None,
        });
        Ok(InsertOutcome::Inserted)
    }

    async fn mark_processed(
        &mut self,
        external_event_id: &str,
        processed_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        if let Some(record) = self
            .staged_record
            .as_mut()
            .filter(|r| r.external_event_id == external_event_id)
        {
            record.processed_at = Some(processed_at);
        }
        Ok(())
    }

    async fn find_user_id_by_customer(
        &mut self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        let state = self.store.state.lock().unwrap();
        Ok(state
            .users
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .map(|u| u.id))
    }

    async fn apply_billing_update(
        &mut self,
        update: &BillingUpdate,
    ) -> Result<UpdateOutcome, sqlx::Error> {
        if std::mem::take(&mut *self.store.fail_apply.lock().unwrap()) {
            return Err(sqlx::Error::PoolClosed);
        }
        let state = self.store.state.lock().unwrap();
        let user = match state.users.get(&update.user_id) {
            Some(user) => user,
            None => return Ok(UpdateOutcome::UserMissing),
        };
        if let Some(last) = user.last_billing_event_at {
            if last > update.event_created_at {
                return Ok(UpdateOutcome::Stale);
            }
        }
        drop(state);
        self.staged_updates.push(update.clone());
        Ok(UpdateOutcome::Applied)
    }

    async fn commit(mut self: Box<Self>) -> Result<(), sqlx::Error> {
        if std::mem::take(&mut *self.store.fail_commit.lock().unwrap()) {
            self.finished = true;
            self.release_reservation();
            return Err(sqlx::Error::PoolClosed);
        }
        let staged_record = self.staged_record.take();
        let staged_updates = std::mem::take(&mut self.staged_updates);
        let mut state = self.store.state.lock().unwrap();
        if let Some(record) = staged_record {
            state.reserved.remove(&record.external_event_id);
            state
                .records
                .insert(record.external_event_id.clone(), record);
        }
        for update in staged_updates {
            if let Some(user) = state.users.get_mut(&update.user_id) {
                user.is_entitled = update.is_entitled;
                if let Some(customer_id) = update.stripe_customer_id {
                    user.stripe_customer_id = Some(customer_id);
                }
                if let Some(subscription_id) = update.stripe_subscription_id {
                    user.stripe_subscription_id = Some(subscription_id);
                }
                if let Some(plan) = update.plan_tier {
                    user.plan_tier = Some(plan.as_str().to_string());
                }
                user.billing_version += 1;
                user.last_billing_event_at = Some(update.event_created_at);
            }
        }
        drop(state);
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), sqlx::Error> {
        self.release_reservation();
        self.staged_record = None;
        self.staged_updates.clear();
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(id: &str) -> NewProcessingRecord {
        NewProcessingRecord::new(id, Some("sub_1".into()), OffsetDateTime::UNIX_EPOCH)
    }

    #[tokio::test]
    async fn commit_persists_record_and_update() {
        let store = MockBillingStore::new();
        let user_id = Uuid::new_v4();
        store.seed_user(user_id, Some("cus_1"));

        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.insert_processing_record(&new_record("evt_1")).await.unwrap(),
            InsertOutcome::Inserted
        );
        let outcome = tx
            .apply_billing_update(&BillingUpdate {
                user_id,
                is_entitled: true,
                stripe_customer_id: None,
                stripe_subscription_id: Some("sub_1".into()),
                plan_tier: None,
                event_created_at: OffsetDateTime::UNIX_EPOCH,
            })
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Applied);
        tx.commit().await.unwrap();

        assert!(store.record("evt_1").is_some());
        let user = store.user(user_id).unwrap();
        assert!(user.is_entitled);
        assert_eq!(user.billing_version, 1);
    }

    #[tokio::test]
    async fn rollback_leaves_no_trace() {
        let store = MockBillingStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_processing_record(&new_record("evt_rb")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.record("evt_rb").is_none());

        // A later delivery of the same id is treated as new.
        let mut tx = store.begin().await.unwrap();
        assert_eq!(
            tx.insert_processing_record(&new_record("evt_rb")).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn concurrent_insert_of_same_id_conflicts() {
        let store = MockBillingStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        assert_eq!(
            first.insert_processing_record(&new_record("evt_race")).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            second.insert_processing_record(&new_record("evt_race")).await.unwrap(),
            InsertOutcome::Duplicate
        );
    }
}
