use std::time::Duration;

use clap::Args;

use crate::error::{Result, SluiceError};

/// Default port of a PostgreSQL server.
pub const DEFAULT_PORT: u16 = 5432;

/// Default bound on opening a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a single query or bulk copy. Full-file copies of the larger activity logs
/// take a while, so this is generous.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

// ============================================================================
// Connection Configuration
// ============================================================================

/// Everything needed to open a connection to the store.
///
/// No `Default`: credentials and endpoints are always spelled out by the caller, through
/// [`ConnectionConfig::new`], [`ConnectionConfig::from_env`] or the command-line
/// [`ConnectionArgs`].
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Target database name.
    pub database: String,
    pub user: String,
    pub password: String,
    /// Bound on opening a connection.
    pub connect_timeout: Duration,
    /// Bound on each query execution and each bulk copy.
    pub operation_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Reads the standard libpq variables. `PGPORT` may be omitted; everything else is required.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| {
            std::env::var(name)
                .map_err(|e| SluiceError::InvalidConfig(format!("{name} is not usable: {e}")))
        };
        let port = match std::env::var("PGPORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|e| SluiceError::InvalidConfig(format!("PGPORT={raw}: {e}")))?,
            Err(_) => DEFAULT_PORT,
        };
        Ok(Self::new(
            var("PGHOST")?,
            port,
            var("PGDATABASE")?,
            var("PGUSER")?,
            var("PGPASSWORD")?,
        ))
    }

    pub fn with_timeouts(mut self, connect: Duration, operation: Duration) -> Self {
        self.connect_timeout = connect;
        self.operation_timeout = operation;
        self
    }

    /// `host:port/database`, used in logs and error messages. Never includes the password.
    pub fn endpoint(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.database)
    }

    pub(crate) fn to_pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .password(&self.password)
            .connect_timeout(self.connect_timeout)
            .application_name("sluice");
        config
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_timeout", &self.connect_timeout)
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

// ============================================================================
// CLI
// ============================================================================

/// Connection flags shared by every binary. Each flag falls back to its libpq variable.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Hostname of the database server.
    #[arg(long, env = "PGHOST")]
    pub host: String,

    /// Port of the database server.
    #[arg(long, env = "PGPORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Name of the target database.
    #[arg(long, env = "PGDATABASE")]
    pub database: String,

    #[arg(long, env = "PGUSER")]
    pub user: String,

    #[arg(long, env = "PGPASSWORD", hide_env_values = true)]
    pub password: String,

    /// Seconds to wait for a connection before giving up.
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs())]
    pub connect_timeout_secs: u64,

    /// Seconds a single query or bulk copy may run.
    #[arg(long, default_value_t = DEFAULT_OPERATION_TIMEOUT.as_secs())]
    pub operation_timeout_secs: u64,
}

impl From<ConnectionArgs> for ConnectionConfig {
    fn from(args: ConnectionArgs) -> Self {
        ConnectionConfig::new(args.host, args.port, args.database, args.user, args.password)
            .with_timeouts(
                Duration::from_secs(args.connect_timeout_secs),
                Duration::from_secs(args.operation_timeout_secs),
            )
    }
}
