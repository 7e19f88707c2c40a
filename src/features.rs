//! Feature aggregator: turns the ingested churn tables into one row of features per labelled user.
//!
//! The time-series tables are collapsed per user, so the granular time information is lost:
//!
//! - **labels** - the version's label table, scanned in full. It drives the join: the output has
//!   exactly one row per labels row.
//! - **user_logs** - listening statistics: seconds per song played and number of active days.
//! - **transactions** - the mean of each payment attribute.
//! - **members** - profile attributes, with gender encoded as a number and the registration date
//!   turned into days of tenure.
//!
//! The four tables are left-joined on the user key and every missing cell becomes `-1`.

use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::NaiveDate;
use sluice::importer::DEFAULT_KEY_COLUMN;
use sluice::{BulkLoader, ConnectionProvider, QueryExecutor, SluiceError, TableValue};
use thiserror::Error;
use tracing::info;

use crate::members::derive_member_features;

/// Value every missing cell of the merged table is replaced with.
pub const MISSING_SENTINEL: i64 = -1;

/// Date tenure is measured against: the end of the competition's observation window.
pub fn default_reference_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2017, 2, 28).unwrap_or_default()
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("dataset version must be 1 or 2, got {0}")]
    InvalidVersion(u8),

    #[error("{source_name} query failed for dataset v{version}: {cause}")]
    Source {
        source_name: Source,
        version: u8,
        #[source]
        cause: SluiceError,
    },

    #[error("failed to derive member features: {0}")]
    Derive(#[source] SluiceError),

    #[error("failed to merge {stage}: {cause}")]
    Merge {
        stage: Source,
        #[source]
        cause: SluiceError,
    },

    #[error("failed to fill missing values with {sentinel}: {cause}")]
    Fill {
        sentinel: i64,
        #[source]
        cause: SluiceError,
    },

    #[error("failed to write snapshot {}: {cause}", path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        cause: SluiceError,
    },

    #[error("failed to persist features into \"{table}\": {cause}")]
    Persist {
        table: String,
        #[source]
        cause: SluiceError,
    },
}

// ============================================================================
// Dataset Versions and Sources
// ============================================================================

/// Release of the competition data. Version 2 tables carry a `_v2` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetVersion {
    V1,
    V2,
}

impl DatasetVersion {
    pub fn number(&self) -> u8 {
        match self {
            DatasetVersion::V1 => 1,
            DatasetVersion::V2 => 2,
        }
    }

    pub fn table_suffix(&self) -> &'static str {
        match self {
            DatasetVersion::V1 => "",
            DatasetVersion::V2 => "_v2",
        }
    }

    /// Name of the persisted feature table (and its snapshot file stem).
    pub fn feature_table(&self) -> String {
        format!("proc_all_features_{}", self.number())
    }
}

impl TryFrom<u8> for DatasetVersion {
    type Error = FeatureError;

    fn try_from(value: u8) -> Result<Self, FeatureError> {
        match value {
            1 => Ok(DatasetVersion::V1),
            2 => Ok(DatasetVersion::V2),
            other => Err(FeatureError::InvalidVersion(other)),
        }
    }
}

impl fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.number())
    }
}

/// One of the four source queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Labels,
    UserLogs,
    Transactions,
    Members,
}

impl Source {
    pub const ALL: [Source; 4] = [
        Source::Labels,
        Source::UserLogs,
        Source::Transactions,
        Source::Members,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Source::Labels => "labels",
            Source::UserLogs => "user_logs",
            Source::Transactions => "transactions",
            Source::Members => "members",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Table names the source queries read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTables {
    pub labels: String,
    pub user_logs: String,
    pub transactions: String,
    pub members: String,
}

impl SourceTables {
    /// The competition's naming: `train`, `user_logs` and `transactions` take the version suffix.
    /// A single `members_v3` profile file serves both versions.
    pub fn for_version(version: DatasetVersion) -> Self {
        let suffix = version.table_suffix();
        Self {
            labels: format!("train{suffix}"),
            user_logs: format!("user_logs{suffix}"),
            transactions: format!("transactions{suffix}"),
            members: "members_v3".to_string(),
        }
    }

    /// SQL for `source`, grouped on `key`.
    pub fn query(&self, source: Source, key: &str) -> String {
        match source {
            Source::Labels => format!("SELECT * FROM {}", self.labels),
            // NULLIF turns an all-zero play count into NULL instead of a division error.
            Source::UserLogs => format!(
                "SELECT
    {key},
    sum(total_secs) / NULLIF(sum(num_25) + sum(num_50) + sum(num_75) + sum(num_985) + sum(num_100), 0) AS seconds_per_song,
    count(DISTINCT date) AS days_active
FROM {}
GROUP BY {key}",
                self.user_logs
            ),
            Source::Transactions => format!(
                "SELECT
    {key},
    avg(payment_method_id) AS payment_method_id,
    avg(payment_plan_days) AS payment_plan_days,
    avg(plan_list_price) AS plan_list_price,
    avg(actual_amount_paid) AS actual_amount_paid,
    avg(is_auto_renew) AS is_auto_renew
FROM {}
GROUP BY {key}",
                self.transactions
            ),
            Source::Members => format!(
                "SELECT {key}, gender, registered_via, registration_init_time FROM {}",
                self.members
            ),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Column every source table is joined on.
    pub key_column: String,
    /// Date `tenure_days` is measured against.
    pub reference_date: NaiveDate,
    pub sentinel: i64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            key_column: DEFAULT_KEY_COLUMN.to_string(),
            reference_date: default_reference_date(),
            sentinel: MISSING_SENTINEL,
        }
    }
}

/// Where a generated feature table goes.
#[derive(Debug, Clone, Default)]
pub struct FeatureOutput {
    /// Directory for the CSV snapshot. No snapshot is written when unset.
    pub snapshot_dir: Option<PathBuf>,
    /// Drop an existing feature table first instead of failing with a schema conflict.
    pub replace_existing: bool,
}

impl FeatureOutput {
    pub fn snapshot_path(&self, version: DatasetVersion) -> Option<PathBuf> {
        self.snapshot_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.csv", version.feature_table())))
    }
}

/// What [`FeatureAggregator::generate`] produced.
#[derive(Debug, Clone)]
pub struct FeatureSummary {
    pub table: String,
    pub rows: u64,
    pub columns: usize,
    pub snapshot: Option<PathBuf>,
}

// ============================================================================
// Aggregator
// ============================================================================

#[derive(Clone, Debug)]
pub struct FeatureAggregator {
    executor: QueryExecutor,
    loader: BulkLoader,
    config: FeatureConfig,
}

impl FeatureAggregator {
    pub fn new(provider: ConnectionProvider, config: FeatureConfig) -> Self {
        Self {
            executor: QueryExecutor::new(provider.clone()),
            loader: BulkLoader::new(provider),
            config,
        }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub async fn build_feature_table(
        &self,
        version: DatasetVersion,
    ) -> Result<TableValue, FeatureError> {
        self.build_from(version, &SourceTables::for_version(version))
            .await
    }

    /// Runs the four source queries against `tables` and merges them. Any failing query aborts
    /// the run.
    pub async fn build_from(
        &self,
        version: DatasetVersion,
        tables: &SourceTables,
    ) -> Result<TableValue, FeatureError> {
        let start = Instant::now();
        let labels = self.fetch(version, tables, Source::Labels).await?;
        info!("  {} labelled users", labels.num_rows());

        info!("Processing user logs, this can take a while...");
        let user_logs = self.fetch(version, tables, Source::UserLogs).await?;
        let transactions = self.fetch(version, tables, Source::Transactions).await?;
        let members = self.fetch(version, tables, Source::Members).await?;

        let members = derive_member_features(&members, self.config.reference_date)
            .map_err(FeatureError::Derive)?;

        info!("Merging all tables...");
        let features = merge_features(
            &labels,
            &[
                (Source::UserLogs, &user_logs),
                (Source::Transactions, &transactions),
                (Source::Members, &members),
            ],
            &self.config.key_column,
            self.config.sentinel,
        )?;
        info!(
            "Built {} feature rows x {} columns for {version} in {:.1}s",
            features.num_rows(),
            features.num_columns(),
            start.elapsed().as_secs_f64()
        );
        Ok(features)
    }

    /// Builds the feature table, optionally snapshots it to CSV, and persists it into
    /// `proc_all_features_<version>`.
    pub async fn generate(
        &self,
        version: DatasetVersion,
        output: &FeatureOutput,
    ) -> Result<FeatureSummary, FeatureError> {
        let features = self.build_feature_table(version).await?;

        let snapshot = output.snapshot_path(version);
        if let Some(path) = &snapshot {
            info!("Writing snapshot to {}", path.display());
            write_snapshot(&features, path).map_err(|cause| FeatureError::Snapshot {
                path: path.clone(),
                cause,
            })?;
        }

        let table = version.feature_table();
        info!("Persisting features into \"{table}\"...");
        let summary = self
            .loader
            .load_table(&features, &table, output.replace_existing)
            .await
            .map_err(|cause| FeatureError::Persist {
                table: table.clone(),
                cause,
            })?;

        Ok(FeatureSummary {
            table,
            rows: summary.rows,
            columns: summary.columns,
            snapshot,
        })
    }

    async fn fetch(
        &self,
        version: DatasetVersion,
        tables: &SourceTables,
        source: Source,
    ) -> Result<TableValue, FeatureError> {
        info!("Processing {source}...");
        let query = tables.query(source, &self.config.key_column);
        self.executor
            .execute_named(&format!("{source} ({version})"), &query)
            .await
            .map_err(|cause| FeatureError::Source {
                source_name: source,
                version: version.number(),
                cause,
            })
    }
}

/// Left-joins each of `others` onto `labels` in order, then fills every missing cell.
pub fn merge_features(
    labels: &TableValue,
    others: &[(Source, &TableValue)],
    key: &str,
    sentinel: i64,
) -> Result<TableValue, FeatureError> {
    let mut merged = labels.clone();
    for (source, table) in others {
        merged = merged
            .left_join(table, key)
            .map_err(|cause| FeatureError::Merge {
                stage: *source,
                cause,
            })?;
    }
    merged
        .fill_missing(sentinel)
        .map_err(|cause| FeatureError::Fill { sentinel, cause })
}

fn write_snapshot(features: &TableValue, path: &Path) -> Result<(), SluiceError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(fs::File::create(path)?);
    features.write_csv(&mut out, true)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::*;
    use std::sync::Arc;

    fn int_column(table: &TableValue, name: &str) -> Vec<i64> {
        table
            .column(name)
            .unwrap()
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .values()
            .to_vec()
    }

    fn float_column(table: &TableValue, name: &str) -> Vec<f64> {
        table
            .column(name)
            .unwrap()
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .values()
            .to_vec()
    }

    #[test]
    fn test_version_parsing_and_naming() {
        assert_eq!(DatasetVersion::try_from(1).unwrap(), DatasetVersion::V1);
        assert!(matches!(
            DatasetVersion::try_from(3),
            Err(FeatureError::InvalidVersion(3))
        ));
        assert_eq!(DatasetVersion::V2.feature_table(), "proc_all_features_2");

        let v1 = SourceTables::for_version(DatasetVersion::V1);
        let v2 = SourceTables::for_version(DatasetVersion::V2);
        assert_eq!(v1.labels, "train");
        assert_eq!(v2.labels, "train_v2");
        assert_eq!(v2.user_logs, "user_logs_v2");
        assert_eq!(v2.transactions, "transactions_v2");
        assert_eq!(v1.members, v2.members);
    }

    #[test]
    fn test_queries_guard_division_and_count_distinct_days() {
        let tables = SourceTables::for_version(DatasetVersion::V2);
        let logs = tables.query(Source::UserLogs, "msno");
        assert!(logs.contains("NULLIF("));
        assert!(logs.contains("count(DISTINCT date) AS days_active"));
        assert!(logs.contains("FROM user_logs_v2"));
        assert!(logs.contains("GROUP BY msno"));

        let transactions = tables.query(Source::Transactions, "msno");
        for column in [
            "payment_method_id",
            "payment_plan_days",
            "plan_list_price",
            "actual_amount_paid",
            "is_auto_renew",
        ] {
            assert!(transactions.contains(&format!("avg({column}) AS {column}")));
        }
        assert_eq!(tables.query(Source::Labels, "msno"), "SELECT * FROM train_v2");
    }

    #[test]
    fn test_output_snapshot_path() {
        let output = FeatureOutput {
            snapshot_dir: Some(PathBuf::from("/data/kkbox")),
            replace_existing: false,
        };
        assert_eq!(
            output.snapshot_path(DatasetVersion::V1),
            Some(PathBuf::from("/data/kkbox/proc_all_features_1.csv"))
        );
        assert_eq!(FeatureOutput::default().snapshot_path(DatasetVersion::V1), None);
    }

    fn fixture() -> (TableValue, TableValue, TableValue, TableValue) {
        let labels = TableValue::from_columns(vec![
            ("msno", Arc::new(StringArray::from(vec!["u1", "u2", "u3", "u4"])) as ArrayRef),
            ("is_churn", Arc::new(Int64Array::from(vec![1, 0, 0, 1])) as ArrayRef),
        ])
        .unwrap();
        // u2 played nothing: the query yields a null seconds_per_song. u4 has no logs at all.
        let logs = TableValue::from_columns(vec![
            ("msno", Arc::new(StringArray::from(vec!["u1", "u2", "u3", "u9"])) as ArrayRef),
            (
                "seconds_per_song",
                Arc::new(Float64Array::from(vec![Some(231.5), None, Some(198.0), Some(1.0)]))
                    as ArrayRef,
            ),
            ("days_active", Arc::new(Int64Array::from(vec![12, 3, 1, 8])) as ArrayRef),
        ])
        .unwrap();
        let transactions = TableValue::from_columns(vec![
            ("msno", Arc::new(StringArray::from(vec!["u3", "u1"])) as ArrayRef),
            ("plan_list_price", Arc::new(Float64Array::from(vec![149.0, 99.0])) as ArrayRef),
            ("is_auto_renew", Arc::new(Float64Array::from(vec![1.0, 0.5])) as ArrayRef),
        ])
        .unwrap();
        let members = TableValue::from_columns(vec![
            ("msno", Arc::new(StringArray::from(vec!["u1", "u2", "u4"])) as ArrayRef),
            (
                "gender",
                Arc::new(StringArray::from(vec![Some("male"), Some("female"), None])) as ArrayRef,
            ),
            ("registered_via", Arc::new(Int64Array::from(vec![7, 9, 4])) as ArrayRef),
            (
                "registration_init_time",
                Arc::new(Int64Array::from(vec![Some(20160101), None, Some(20170227)])) as ArrayRef,
            ),
        ])
        .unwrap();
        (labels, logs, transactions, members)
    }

    #[test]
    fn test_merge_has_one_row_per_label() {
        let (labels, logs, transactions, members) = fixture();
        let members = derive_member_features(&members, default_reference_date()).unwrap();

        let features = merge_features(
            &labels,
            &[
                (Source::UserLogs, &logs),
                (Source::Transactions, &transactions),
                (Source::Members, &members),
            ],
            "msno",
            MISSING_SENTINEL,
        )
        .unwrap();

        assert_eq!(features.num_rows(), labels.num_rows());
        assert_eq!(
            features.column_names(),
            vec![
                "msno",
                "is_churn",
                "seconds_per_song",
                "days_active",
                "plan_list_price",
                "is_auto_renew",
                "gender",
                "registered_via",
                "tenure_days",
            ]
        );
        for column in features.batch().columns() {
            assert_eq!(column.null_count(), 0);
        }

        assert_eq!(
            float_column(&features, "seconds_per_song"),
            vec![231.5, -1.0, 198.0, -1.0]
        );
        assert_eq!(int_column(&features, "days_active"), vec![12, 3, 1, -1]);
        assert_eq!(
            float_column(&features, "plan_list_price"),
            vec![99.0, -1.0, 149.0, -1.0]
        );
        assert_eq!(int_column(&features, "gender"), vec![1, 2, -1, -1]);
        assert_eq!(int_column(&features, "tenure_days"), vec![424, -1, -1, 1]);
    }

    #[test]
    fn test_merge_reports_failing_stage() {
        let (labels, logs, _, _) = fixture();
        let keyless = TableValue::from_columns(vec![(
            "user_id",
            Arc::new(StringArray::from(vec!["u1"])) as ArrayRef,
        )])
        .unwrap();

        let err = merge_features(
            &labels,
            &[(Source::UserLogs, &logs), (Source::Transactions, &keyless)],
            "msno",
            MISSING_SENTINEL,
        )
        .unwrap_err();
        match err {
            FeatureError::Merge { stage, .. } => assert_eq!(stage, Source::Transactions),
            other => panic!("expected merge error, got {other}"),
        }
    }

    #[test]
    fn test_fill_failure_is_not_blamed_on_a_source() {
        use arrow::datatypes::{DataType, Field};

        let flags = StructArray::from(vec![(
            Arc::new(Field::new("trial", DataType::Boolean, false)),
            Arc::new(BooleanArray::from(vec![true, false])) as ArrayRef,
        )]);
        let labels = TableValue::from_columns(vec![
            ("msno", Arc::new(StringArray::from(vec!["u1", "u2"])) as ArrayRef),
            ("flags", Arc::new(flags) as ArrayRef),
        ])
        .unwrap();

        let err = merge_features(&labels, &[], "msno", MISSING_SENTINEL).unwrap_err();
        match err {
            FeatureError::Fill { sentinel, .. } => assert_eq!(sentinel, MISSING_SENTINEL),
            other => panic!("expected fill error, got {other}"),
        }
    }

    #[test]
    fn test_snapshot_creates_directory_and_header() {
        let (labels, ..) = fixture();
        let dir = tempfile::TempDir::new().unwrap();
        let output = FeatureOutput {
            snapshot_dir: Some(dir.path().join("snapshots")),
            replace_existing: false,
        };
        let path = output.snapshot_path(DatasetVersion::V2).unwrap();

        write_snapshot(&labels, &path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("msno,is_churn\n"));
        assert_eq!(written.lines().count(), 5);
    }

    #[tokio::test]
    #[ignore] // requires PGHOST, PGDATABASE, PGUSER and PGPASSWORD
    async fn test_generate_against_live_tables() {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .with_test_writer()
            .try_init()
            .ok();
        let provider = ConnectionProvider::new(
            sluice::ConnectionConfig::from_env()
                .expect("PGHOST, PGDATABASE, PGUSER and PGPASSWORD must be set"),
        );
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir = tempfile::TempDir::new().unwrap();
        let write = |name: &str, lines: &[&str]| {
            let path = dir.path().join(format!("{name}_{nanos}.csv"));
            let mut f = fs::File::create(&path).unwrap();
            for line in lines {
                writeln!(f, "{line}").unwrap();
            }
            path
        };

        let files = [
            write("train", &["msno,is_churn", "u1,1", "u2,0", "u3,0"]),
            write(
                "user_logs",
                &[
                    "msno,date,num_25,num_50,num_75,num_985,num_100,num_unq,total_secs",
                    "u1,20170101,1,0,0,0,3,4,401.0",
                    "u1,20170102,0,0,0,0,2,2,400.0",
                    "u2,20170101,0,0,0,0,0,0,0.0",
                ],
            ),
            write(
                "transactions",
                &[
                    "msno,payment_method_id,payment_plan_days,plan_list_price,actual_amount_paid,is_auto_renew",
                    "u1,41,30,99,99,1",
                    "u1,39,30,149,149,0",
                ],
            ),
            write(
                "members",
                &[
                    "msno,city,bd,gender,registered_via,registration_init_time",
                    "u1,1,0,male,7,20160101",
                    "u3,5,30,,9,",
                ],
            ),
        ];
        let loader = BulkLoader::new(provider.clone());
        for path in &files {
            loader.load(path, None, false).await.expect("load fixture");
        }

        let tables = SourceTables {
            labels: format!("train_{nanos}"),
            user_logs: format!("user_logs_{nanos}"),
            transactions: format!("transactions_{nanos}"),
            members: format!("members_{nanos}"),
        };
        let aggregator = FeatureAggregator::new(provider, FeatureConfig::default());
        let features = aggregator
            .build_from(DatasetVersion::V1, &tables)
            .await
            .expect("build features");

        assert_eq!(features.num_rows(), 3);
        let rows: Vec<String> = {
            let msno = features.column("msno").unwrap();
            let msno = msno.as_any().downcast_ref::<StringArray>().unwrap();
            msno.iter().map(|v| v.unwrap_or_default().to_string()).collect()
        };
        let u1 = rows.iter().position(|m| m == "u1").unwrap();
        let u2 = rows.iter().position(|m| m == "u2").unwrap();
        let u3 = rows.iter().position(|m| m == "u3").unwrap();

        // (401 + 400) seconds over (1 + 3 + 2) plays.
        let secs = float_column(&features, "seconds_per_song");
        assert_eq!(secs[u1], 133.5);
        assert_eq!(secs[u2], -1.0);
        assert_eq!(int_column(&features, "days_active")[u1], 2);
        assert_eq!(float_column(&features, "plan_list_price")[u1], 124.0);
        assert_eq!(int_column(&features, "gender")[u1], 1);
        assert_eq!(int_column(&features, "gender")[u3], -1);
        assert_eq!(int_column(&features, "tenure_days")[u1], 424);
        assert_eq!(int_column(&features, "tenure_days")[u3], -1);
        assert_eq!(int_column(&features, "tenure_days")[u2], -1);

        let err = aggregator
            .build_from(
                DatasetVersion::V2,
                &SourceTables {
                    user_logs: format!("missing_{nanos}"),
                    ..tables.clone()
                },
            )
            .await
            .unwrap_err();
        match err {
            FeatureError::Source {
                source_name,
                version,
                ..
            } => {
                assert_eq!(source_name, Source::UserLogs);
                assert_eq!(version, 2);
            }
            other => panic!("expected a source failure, got {other}"),
        }
    }
}
