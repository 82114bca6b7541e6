//! sqlmux routing worker core.
//!
//! A fixed fleet of routing workers, one OS thread each, multiplexes client
//! sessions onto backend database servers.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────── Fleet ─────────────────────┐
//!   listeners ──> │ shared listener set (nested in every worker)   │
//!                 │                                                │
//!                 │  worker 0 (main)   worker 1   ...   worker N-1 │
//!                 │  ├ poller          ├ poller         ├ poller   │
//!                 │  ├ connections     ├ ...            ├ ...      │
//!                 │  ├ sessions                                    │
//!                 │  └ pools: server -> idle backends              │
//!                 └───────────────┬────────────────────────────────┘
//!                                 │ tasks (broadcast / serial / concurrent)
//!                          admin, statistics, watchdog
//! ```
//!
//! - A client connection belongs to the worker that accepted it, and so do
//!   the backend connections opened for its session.
//! - Idle backends are kept per worker and per server, and are handed to the
//!   next session on the same worker.
//! - Other threads reach worker state only through tasks posted with the
//!   fleet's fan-out calls.

pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod fleet;
pub mod handler;
pub mod load;
pub mod protocol;
pub mod proxy;
pub mod semaphore;
pub mod server;
pub mod service;
pub mod session;
pub mod shared;
pub mod stats;
pub mod task;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock, Tick, TICKS_PER_SECOND};
pub use connection::{ConnId, Connection, Membership, Role, State, Stream};
pub use error::{ConnectionError, ExecuteError, FleetError, WorkerError};
pub use fleet::{Fleet, FleetConfig};
pub use handler::{EventHandler, PoolHandler, ProtocolHandler};
pub use protocol::{Protocol, ProtocolFactory};
pub use semaphore::Semaphore;
pub use server::{Server, ServerSnapshot};
pub use service::Service;
pub use session::{CloseReason, Session, SessionId, SessionState};
pub use shared::{SharedHandler, SharedListeners};
pub use stats::{StatKind, WorkerSnapshot, WorkerStatistics};
pub use task::{ExecuteMode, Task};
pub use worker::{current_id, Evict, ReadOutcome, RunState, Worker, WorkerHandle, WorkerId};
