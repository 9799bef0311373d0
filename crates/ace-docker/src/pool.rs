//! Docker connection pooling for the container driver.
//!
//! Reduces per-call connection overhead for the provisioner, autoscaler,
//! and health monitor, all of which call into `bollard` frequently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::Docker;
use tokio::sync::{Mutex, Semaphore};

use crate::error::{DockerError, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle_time: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct PooledConnection {
    docker: Docker,
    last_used: Mutex<Instant>,
}

impl PooledConnection {
    fn new(docker: Docker) -> Self {
        Self {
            docker,
            last_used: Mutex::new(Instant::now()),
        }
    }

    async fn mark_used(&self) {
        *self.last_used.lock().await = Instant::now();
    }

    fn docker(&self) -> &Docker {
        &self.docker
    }
}

pub struct DockerPool {
    connections: Arc<Mutex<Vec<Arc<PooledConnection>>>>,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
}

impl DockerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            connections: Arc::new(Mutex::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config,
        }
    }

    pub async fn get_connection(&self) -> Result<PooledDocker> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DockerError::Connection("connection permit closed".into()))?;

        let connection = {
            let mut connections = self.connections.lock().await;
            let now = Instant::now();
            connections.retain(|conn| match conn.last_used.try_lock() {
                Ok(guard) => now.duration_since(*guard) <= self.config.max_idle_time,
                Err(_) => true,
            });
            connections.pop()
        };

        let pooled = match connection {
            Some(conn) => {
                conn.mark_used().await;
                conn
            }
            None => {
                let docker = Docker::connect_with_local_defaults()
                    .map_err(|e| DockerError::Connection(e.to_string()))?;
                Arc::new(PooledConnection::new(docker))
            }
        };

        Ok(PooledDocker {
            connection: pooled,
            pool: self.connections.clone(),
            _permit: permit,
        })
    }

    pub async fn stats(&self) -> PoolStats {
        let connections = self.connections.lock().await;
        PoolStats {
            idle_connections: connections.len(),
            available_permits: self.semaphore.available_permits(),
            max_connections: self.config.max_connections,
        }
    }
}

pub struct PooledDocker {
    connection: Arc<PooledConnection>,
    pool: Arc<Mutex<Vec<Arc<PooledConnection>>>>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl PooledDocker {
    pub fn docker(&self) -> &Docker {
        self.connection.docker()
    }
}

impl Drop for PooledDocker {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let connection = self.connection.clone();
        tokio::spawn(async move {
            pool.lock().await.push(connection);
        });
    }
}

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub idle_connections: usize,
    pub available_permits: usize,
    pub max_connections: usize,
}

static DOCKER_POOL: once_cell::sync::Lazy<DockerPool> =
    once_cell::sync::Lazy::new(|| DockerPool::new(PoolConfig::default()));

pub async fn get_docker_connection() -> Result<PooledDocker> {
    DOCKER_POOL.get_connection().await
}

pub async fn get_pool_stats() -> PoolStats {
    DOCKER_POOL.stats().await
}
