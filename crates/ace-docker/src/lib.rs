//! # Container Driver (C3)
//!
//! Thin adapter over `bollard` used by the provisioner, autoscaler, and
//! engine health monitor. Adds a connection pool and a short-TTL inspect
//! cache so hot paths don't pay full Docker API latency on every call, and
//! a bounded-concurrency batch stop for graceful shutdown.

pub mod cache;
pub mod driver;
pub mod error;
pub mod pool;

pub use cache::{get_container_cache, ContainerCache};
pub use driver::{BatchStopResult, ContainerDriver, ContainerSpec, ExecOutput, DEFAULT_SHUTDOWN_CONCURRENCY};
pub use error::{DockerError, Result};
pub use pool::{get_docker_connection, get_pool_stats, DockerPool, PoolConfig, PoolStats};
