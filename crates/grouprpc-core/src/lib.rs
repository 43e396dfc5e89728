//! grouprpc - Named-worker RPC agents over a process-group transport.
//!
//! Every worker in a fixed group runs one [`ProcessGroupAgent`]. An agent can
//! invoke a named operation on any other worker (or on itself) and gets back a
//! [`FutureMessage`] that resolves when the reply arrives. Inbound requests
//! are answered by a [`Dispatch`] implementation on the receiving side.
//!
//! # Example
//!
//! ```rust,ignore
//! use grouprpc::{LocalProcessGroup, OperationRegistry, ProcessGroupAgent, RpcAgent};
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> grouprpc::Result<()> {
//!     let mut registry = OperationRegistry::new();
//!     registry.register_json("add", |(a, b): (i64, i64)| Ok(a + b));
//!     let registry = Arc::new(registry);
//!
//!     let names: HashMap<String, usize> =
//!         [("A".to_string(), 0), ("B".to_string(), 1)].into_iter().collect();
//!     let mut group = LocalProcessGroup::create(2).into_iter();
//!     let a = ProcessGroupAgent::new("A", names.clone(), Arc::new(group.next().unwrap()), registry.clone())?;
//!     let b = ProcessGroupAgent::new("B", names, Arc::new(group.next().unwrap()), registry)?;
//!
//!     let reply = a.invoke_sync("B", "add", "[2,3]".into()).await?;
//!     assert_eq!(&reply.payload()[..], b"5");
//!
//!     tokio::try_join!(a.join(), b.join())?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod functions;
pub mod future;
pub mod message;
pub mod process_group;

// Re-export commonly used types
pub use agent::{AgentState, ProcessGroupAgent, RpcAgent};
pub use config::{AgentOptions, ClusterConfig, WorkerEntry};
pub use error::{Fault, Result, RpcError};
pub use functions::{Dispatch, DispatchError, OperationRegistry};
pub use future::{FutureMessage, FutureState};
pub use message::{Message, MessageType};
pub use process_group::{
    GroupEvent, LocalProcessGroup, ProcessGroup, TcpGroupListener, TcpProcessGroup,
};
