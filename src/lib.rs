//! PDF Dispatch Library
//!
//! Concurrency-safe access to a single-threaded native PDF engine.
//! Callers send typed requests to a [`Dispatcher`]; each document lives on
//! exactly one worker, which serializes every engine call for it.
//!
//! # Modules
//!
//! - `dispatcher`: Entry point, routing and deadlines
//! - `pool`: Worker lifecycle and admission control
//! - `worker`: Worker threads/processes and the engine adapter
//! - `references`: Opaque handles and their registry
//! - `progressive`: Pausable page rendering
//! - `protocol`: Request/response catalogue and wire format
//! - `engine`: Native engine seam and backends

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod pool;
pub mod progressive;
pub mod protocol;
pub mod references;
pub mod worker;

pub use config::{AdmissionPolicy, Isolation, PoolConfig, PoolMode};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, ErrorKind, Result};
pub use pool::PoolStats;
pub use protocol::{requests, responses, Call, PausePredicate, Request, Response};
