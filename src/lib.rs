//! Churn feature generation on top of the tables `sluice` ingests.
//!
//! The global allocator comes from `sluice`, which every binary here links.

pub mod features;
pub mod members;

pub use features::{
    DatasetVersion, FeatureAggregator, FeatureConfig, FeatureError, FeatureOutput, FeatureSummary,
    SourceTables,
};
