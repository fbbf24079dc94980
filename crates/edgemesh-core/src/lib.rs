//! EdgeMesh task scheduler and lifecycle engine.
//!
//! This crate is the authoritative "core" of EdgeMesh: the state machine
//! that moves tasks through `queued -> claimed -> running ->
//! done|failed|cancelled` under concurrent producers and workers, the
//! claim-selection algorithm, the lease/timeout reaper, the retry/DLQ
//! decision, and the event fan-out driving telemetry and live subscribers.
//!
//! Transport framing, payload execution, and durable storage specifics are
//! deliberately out of this crate. [`store::Store`] is the seam: callers
//! plug in [`store::local::LocalStore`] for a single process, or an external
//! implementation (see the `edgemesh-db` crate) for a durable backend.

pub mod admin;
pub mod claim;
pub mod clock;
pub mod error;
pub mod events;
pub mod freshness;
pub mod ids;
pub mod lifecycle;
pub mod metrics;
pub mod reaper;
pub mod retry;
pub mod store;
pub mod token;

pub use clock::Clock;
pub use error::{CoreError, CoreResult};
pub use ids::{IdMinter, NodeId, TaskId};
pub use store::Store;
