mod core;
pub mod config;
pub mod error;
pub mod handler;
pub mod introduce;
pub mod librarian;
pub mod mem;
pub mod message;
pub mod rpc;
pub mod search;
pub mod sign;
pub mod store;

// Re-export commonly used types for consumers and integration tests
pub use crate::config::Config;
pub use crate::core::id::{Distance, Id, Key, RequestId};
pub use crate::core::peer::{Peer, PeerAddress};
pub use crate::core::routing_table::{PushResult, RoutingTable};
pub use crate::core::storage::{Document, KvStore, StoreOp};
pub use crate::error::{Error, QueryError};
pub use crate::handler::Publication;
pub use crate::librarian::Librarian;

use ctor::ctor;
use tracing_subscriber::{fmt, EnvFilter};

#[ctor]
fn init_tracing() {
    // Avoid duplicate initialization if multiple tests run in parallel
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .try_init();
}
