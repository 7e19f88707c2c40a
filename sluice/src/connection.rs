//! Connection provider: one fresh PostgreSQL connection per acquisition.
//!
//! A [`PgConnection`] owns both the client and the task driving the socket. Dropping it closes
//! the connection, so a connection never outlives the scope that acquired it, whichever way that
//! scope exits.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{Result, SluiceError};

#[derive(Clone, Debug)]
pub struct ConnectionProvider {
    config: Arc<ConnectionConfig>,
}

impl ConnectionProvider {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Opens a new connection. No retry: any failure goes straight back to the caller.
    pub async fn acquire(&self) -> Result<PgConnection> {
        let endpoint = self.config.endpoint();
        let pg_config = self.config.to_pg_config();
        let (client, connection) = bounded(
            "connect",
            &endpoint,
            self.config.connect_timeout,
            async {
                pg_config
                    .connect(NoTls)
                    .await
                    .map_err(|source| SluiceError::Connection {
                        endpoint: endpoint.clone(),
                        source,
                    })
            },
        )
        .await?;

        let driver_endpoint = endpoint.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("connection to {driver_endpoint} closed with error: {e}");
            }
        });
        debug!("connected to {endpoint}");

        Ok(PgConnection {
            client,
            driver,
            operation_timeout: self.config.operation_timeout,
        })
    }
}

/// A live connection, released when dropped.
pub struct PgConnection {
    client: Client,
    driver: JoinHandle<()>,
    operation_timeout: Duration,
}

impl PgConnection {
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }
}

impl Deref for PgConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl DerefMut for PgConnection {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self.client
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Runs `fut`, failing with [`SluiceError::Timeout`] when it takes longer than `after`.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    target: &str,
    after: Duration,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(SluiceError::Timeout {
            operation,
            target: target.to_string(),
            after,
        }),
    }
}

/// Provider built from the `PG*` variables, for the live tests.
#[cfg(test)]
pub(crate) fn live_provider() -> ConnectionProvider {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init()
        .ok();
    let config = ConnectionConfig::from_env()
        .expect("PGHOST, PGDATABASE, PGUSER and PGPASSWORD must be set");
    ConnectionProvider::new(config)
}
