//! Types and plumbing shared by the order and payment services: the broker message
//! schema, the error taxonomy, the broker channel abstraction and the ambient pieces
//! (backoff, liveness, shutdown, logging) every background loop needs.

pub mod backoff;
pub mod bus;
pub mod error;
pub mod health;
pub mod message;
pub mod shutdown;

pub use backoff::Backoff;
pub use bus::{Delivery, Disposition, Publisher, Subscription};
pub use error::{Error, Result};
pub use health::{Heartbeat, LoopHealth};
pub use message::*;
pub use shutdown::Shutdown;

/// Installs the fmt subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
