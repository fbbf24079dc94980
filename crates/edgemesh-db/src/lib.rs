//! Postgres-backed durable storage for the control plane.
//!
//! [`store::PgStore`] implements `edgemesh_core::store::Store` against a
//! `PgPool`, using terminal-status-guarded `UPDATE ... WHERE status NOT IN
//! (...)` statements for single-row transitions and `SELECT ... FOR UPDATE
//! SKIP LOCKED` for the multi-consumer claim query. A single replica's in-process
//! mutex (see `edgemesh_core::store::local::LocalStore`) has no equivalent
//! here: correctness across concurrent callers comes entirely from Postgres
//! row locking, which is also what lets multiple control-plane replicas
//! share one store safely.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use config::DbConfig;
pub use store::PgStore;
