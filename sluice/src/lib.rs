use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub mod config;
pub mod connection;
pub mod error;
pub mod importer;
pub mod loader;
pub mod query;
pub mod schema;
pub mod table;

pub use config::{ConnectionArgs, ConnectionConfig};
pub use connection::{ConnectionProvider, PgConnection};
pub use error::{Result, SluiceError};
pub use importer::{BatchImporter, FileOutcome, ImportOptions, ImportReport};
pub use loader::{BulkLoader, LoadOptions, LoadSummary};
pub use query::QueryExecutor;
pub use table::TableValue;
