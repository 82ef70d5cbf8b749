pub mod billing_store;
pub mod mock_billing_store;
pub mod postgres_billing_store;
