pub mod plan;
pub mod user;
pub mod webhook_event;
