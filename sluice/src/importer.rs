//! Batch importer: loads every CSV file under a directory, one table per file.
//!
//! Import is best-effort. Each file is loaded (and indexed) independently, and its outcome is
//! recorded in the [`ImportReport`]; one bad file never stops the others.

use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SluiceError};
use crate::loader::{BulkLoader, LoadSummary, default_table_name};
use crate::schema::quote_ident;

/// Conventional join key of the churn datasets (the hashed user id).
pub const DEFAULT_KEY_COLUMN: &str = "msno";

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Create an index on `key_column` for every loaded table.
    pub build_key_index: bool,
    pub key_column: String,
    /// Drop tables that already exist instead of reporting a schema conflict.
    pub drop_existing: bool,
    /// Files loaded at the same time, each on its own connection.
    pub max_concurrent: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            build_key_index: true,
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            drop_existing: false,
            max_concurrent: 1,
        }
    }
}

/// Outcome of one file.
#[derive(Debug)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub table: String,
    pub load: Result<LoadSummary>,
    /// `None` when indexing was not requested or the load failed.
    pub index: Option<Result<()>>,
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        self.load.is_ok() && !matches!(self.index, Some(Err(_)))
    }
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub outcomes: Vec<FileOutcome>,
}

impl ImportReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(FileOutcome::is_success)
    }

    pub fn total_rows(&self) -> u64 {
        self.outcomes
            .iter()
            .filter_map(|o| o.load.as_ref().ok())
            .map(|s| s.rows)
            .sum()
    }

    /// Flattened, serializable view of the report, one entry per file.
    pub fn entries(&self) -> Vec<ReportEntry> {
        self.outcomes
            .iter()
            .map(|o| ReportEntry {
                path: o.path.display().to_string(),
                table: o.table.clone(),
                rows: o.load.as_ref().ok().map(|s| s.rows),
                load_error: o.load.as_ref().err().map(|e| e.to_string()),
                index_error: match &o.index {
                    Some(Err(e)) => Some(e.to_string()),
                    _ => None,
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportEntry {
    pub path: String,
    pub table: String,
    pub rows: Option<u64>,
    pub load_error: Option<String>,
    pub index_error: Option<String>,
}

#[derive(Clone)]
pub struct BatchImporter {
    loader: BulkLoader,
    options: ImportOptions,
    progress: ProgressBar,
}

impl BatchImporter {
    pub fn new(loader: BulkLoader, options: ImportOptions) -> Self {
        Self {
            loader,
            options,
            progress: ProgressBar::hidden(),
        }
    }

    /// Ticks `progress` once per finished file. Its length is set when the import starts.
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    pub async fn import_all(&self, directory: &Path) -> Result<ImportReport> {
        let files = discover_csv_files(directory)?;
        info!("found {} csv files under {}", files.len(), directory.display());
        self.progress.set_length(files.len() as u64);

        let outcomes: Vec<FileOutcome> = stream::iter(files)
            .map(|path| self.import_file(path))
            .buffer_unordered(self.options.max_concurrent.max(1))
            .collect()
            .await;
        self.progress.finish_and_clear();

        let report = ImportReport { outcomes };
        for failed in report.failed() {
            if let Err(e) = &failed.load {
                warn!("{}: {e}", failed.path.display());
            }
            if let Some(Err(e)) = &failed.index {
                warn!("{}: {e}", failed.path.display());
            }
        }
        Ok(report)
    }

    async fn import_file(&self, path: PathBuf) -> FileOutcome {
        let table = default_table_name(&path).unwrap_or_else(|_| path.display().to_string());
        self.progress.set_message(table.clone());

        let load = self
            .loader
            .load(&path, Some(&table), self.options.drop_existing)
            .await;
        let index = match (&load, self.options.build_key_index) {
            (Ok(_), true) => Some(self.create_key_index(&table).await),
            _ => None,
        };

        self.progress.inc(1);
        FileOutcome {
            path,
            table,
            load,
            index,
        }
    }

    async fn create_key_index(&self, table: &str) -> Result<()> {
        let column = &self.options.key_column;
        let statement = key_index_statement(table, column);
        let conn = self.loader.provider().acquire().await?;
        conn.batch_execute(&statement)
            .await
            .map_err(|source| SluiceError::Index {
                table: table.to_string(),
                column: column.clone(),
                source,
            })
    }
}

fn key_index_statement(table: &str, column: &str) -> String {
    format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("{table}_{column}_idx")),
        quote_ident(table),
        quote_ident(column)
    )
}

/// Every file with a `.csv` extension (any case) under `directory`, recursively, sorted.
pub fn discover_csv_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(directory).follow_links(true) {
        let entry = entry.map_err(|e| {
            SluiceError::Io(std::io::Error::other(format!(
                "walking {}: {e}",
                directory.display()
            )))
        })?;
        let is_csv = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        if entry.file_type().is_file() && is_csv {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}
