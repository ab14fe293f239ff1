//! HTTP control surface for failover tests.
pub mod runtime;

mod error;
mod logs;
mod server;

pub use crate::error::RuntimeError;
pub use crate::runtime::{
    BackendFactory, Controller, FailoverRuntime, Phase, StartRequest, StatusResponse, DEFAULT_PORT,
};
pub use crate::server::{router, RunAccepted};
