//! Payment side of the exactly-once debit flow: account balances, the idempotency
//! ledger and the consumer that applies relayed debits.

pub mod api;
pub mod consumer;
pub mod ledger;
pub mod models;
pub mod schema;
pub mod store;
