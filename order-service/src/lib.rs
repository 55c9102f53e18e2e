//! Order side of the exactly-once debit flow: writes orders with their outbox
//! entry, relays the outbox to the broker and reconciles debit results back onto
//! the order.

pub mod api;
pub mod models;
pub mod reconciler;
pub mod relay;
pub mod schema;
pub mod store;
pub mod writer;
