//! Reference front end for the worker core.
//!
//! This module provides:
//! - `Listener`: a non-blocking TCP listener served from the shared set
//! - `PassthroughFactory`: a protocol that relays bytes unchanged
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener (any worker) -> client protocol -> backend (pool or connect) -> Server
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let service = Arc::new(Service::new("db", servers, Arc::new(PassthroughFactory)));
//! let listener = Arc::new(Listener::bind("127.0.0.1:4006".parse()?, service)?);
//! fleet.add_listener(listener)?;
//! ```

mod listener;
mod passthrough;

pub use listener::{Listener, ListenerStats};
pub use passthrough::{PassthroughBackend, PassthroughClient, PassthroughFactory};
