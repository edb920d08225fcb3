use std::fmt::{Display, Formatter};

use serde::Serialize;

mod align;
mod reconcile;

#[cfg(test)]
mod fake;

pub use align::{
    align_partition, align_samples, day_bucket, is_day_anchor, run_day_aligner,
    UnanchoredTimestamp, MIDDAY_OFFSET_MS, MS_PER_DAY,
};
pub use reconcile::{reconcile_pair, run_reconciler};

pub const LEGACY_VARIANT: &str = "default";
pub const REPORT_CONTRACT_VERSION: &str = "series-migrate.v1";

#[derive(Debug, thiserror::Error)]
pub enum RepairError {
    #[error("failed to remove overlap between {persystem} and {sum}")]
    OverlapNotRemoved { persystem: Dataset, sum: Dataset },
    #[error("failed to convert legacy variant of {persystem} into {sum}")]
    LegacyNotConverted { persystem: Dataset, sum: Dataset },
    #[error("partition {partition} is not aligned after rewrite: {reason}")]
    PartitionNotAligned { partition: Partition, reason: String },
    #[error("partition {partition} cannot be aligned")]
    TimestampOutOfRange {
        partition: Partition,
        #[source]
        source: UnanchoredTimestamp,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Metric series identifiers as they are stored in the `dataset` column.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dataset {
    #[serde(rename = "SUBSCRIBED_CAPACITY")]
    HpCapacitySubscribedSum,
    #[serde(rename = "LOGICAL_CAPACITY")]
    HpCapacityLogicalSum,
    #[serde(rename = "PHYSICAL_CAPACITY")]
    HpCapacityPhysicalSum,
    #[serde(rename = "SUBSCRIBED_CAPACITY_EMC")]
    EmcCapacitySubscribedSum,
    #[serde(rename = "NET_CAPACITY_EMC")]
    EmcCapacityNetSum,
    #[serde(rename = "PHYSICAL_CAPACITY_EMC")]
    EmcCapacityPhysicalSum,
    #[serde(rename = "CAPACITY")]
    HpCapacityPhysicalPersystem,
    #[serde(rename = "WORKLOAD")]
    HpWorkloadPersystem,
    #[serde(rename = "TRANSFER")]
    HpTransferPersystem,
    #[serde(rename = "CAPACITY_PERSYSTEM_EMC")]
    EmcCapacityPhysicalPersystem,
    #[serde(rename = "WORKLOAD_PERSYSTEM_EMC")]
    EmcWorkloadPersystem,
    #[serde(rename = "TRANSFER_PERSYSTEM_EMC")]
    EmcTransferPersystem,
    #[serde(rename = "BLOCKSIZE_READ")]
    HpBlocksizeReadAvg,
    #[serde(rename = "BLOCKSIZE_WRITE")]
    HpBlocksizeWriteAvg,
    #[serde(rename = "WORKLOAD_SUM")]
    HpWorkloadSum,
    #[serde(rename = "TRANSFER_SUM")]
    HpTransferSum,
    #[serde(rename = "WORKLOAD_EMC")]
    EmcWorkloadSum,
    #[serde(rename = "TRANSFER_EMC")]
    EmcTransferSum,
}

impl Dataset {
    pub const ALL: [Self; 18] = [
        Self::HpCapacitySubscribedSum,
        Self::HpCapacityLogicalSum,
        Self::HpCapacityPhysicalSum,
        Self::EmcCapacitySubscribedSum,
        Self::EmcCapacityNetSum,
        Self::EmcCapacityPhysicalSum,
        Self::HpCapacityPhysicalPersystem,
        Self::HpWorkloadPersystem,
        Self::HpTransferPersystem,
        Self::EmcCapacityPhysicalPersystem,
        Self::EmcWorkloadPersystem,
        Self::EmcTransferPersystem,
        Self::HpBlocksizeReadAvg,
        Self::HpBlocksizeWriteAvg,
        Self::HpWorkloadSum,
        Self::HpTransferSum,
        Self::EmcWorkloadSum,
        Self::EmcTransferSum,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HpCapacitySubscribedSum => "SUBSCRIBED_CAPACITY",
            Self::HpCapacityLogicalSum => "LOGICAL_CAPACITY",
            Self::HpCapacityPhysicalSum => "PHYSICAL_CAPACITY",
            Self::EmcCapacitySubscribedSum => "SUBSCRIBED_CAPACITY_EMC",
            Self::EmcCapacityNetSum => "NET_CAPACITY_EMC",
            Self::EmcCapacityPhysicalSum => "PHYSICAL_CAPACITY_EMC",
            Self::HpCapacityPhysicalPersystem => "CAPACITY",
            Self::HpWorkloadPersystem => "WORKLOAD",
            Self::HpTransferPersystem => "TRANSFER",
            Self::EmcCapacityPhysicalPersystem => "CAPACITY_PERSYSTEM_EMC",
            Self::EmcWorkloadPersystem => "WORKLOAD_PERSYSTEM_EMC",
            Self::EmcTransferPersystem => "TRANSFER_PERSYSTEM_EMC",
            Self::HpBlocksizeReadAvg => "BLOCKSIZE_READ",
            Self::HpBlocksizeWriteAvg => "BLOCKSIZE_WRITE",
            Self::HpWorkloadSum => "WORKLOAD_SUM",
            Self::HpTransferSum => "TRANSFER_SUM",
            Self::EmcWorkloadSum => "WORKLOAD_EMC",
            Self::EmcTransferSum => "TRANSFER_EMC",
        }
    }
}

impl Display for Dataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A legacy per-system series and the aggregate series it is merged into.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DatasetPair {
    pub persystem: Dataset,
    pub sum: Dataset,
}

pub const CORRESPONDING_METRICS: [DatasetPair; 4] = [
    DatasetPair { persystem: Dataset::HpWorkloadPersystem, sum: Dataset::HpWorkloadSum },
    DatasetPair { persystem: Dataset::HpTransferPersystem, sum: Dataset::HpTransferSum },
    DatasetPair { persystem: Dataset::EmcWorkloadPersystem, sum: Dataset::EmcWorkloadSum },
    DatasetPair { persystem: Dataset::EmcTransferPersystem, sum: Dataset::EmcTransferSum },
];

/// All rows sharing one `(dataset, variant)`. Datasets are kept as raw strings
/// because the store may hold identifiers this tool does not know about.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Partition {
    pub dataset: String,
    pub variant: String,
}

impl Partition {
    #[must_use]
    pub fn new(dataset: impl Into<String>, variant: impl Into<String>) -> Self {
        Self { dataset: dataset.into(), variant: variant.into() }
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dataset, self.variant)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Epoch milliseconds.
    pub x: i64,
    pub y: f64,
}

impl Sample {
    #[must_use]
    pub fn new(x: i64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Storage operations both passes are written against.
///
/// Every pair-scoped query only looks at rows whose variant is [`LEGACY_VARIANT`].
pub trait SeriesStore {
    /// Whether any persystem row shares a timestamp with a sum row.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn overlap_exists(&self, pair: DatasetPair) -> anyhow::Result<bool>;

    /// Delete every persystem row whose timestamp also exists in the sum series.
    ///
    /// # Errors
    /// Returns an error when the delete statement fails.
    fn delete_overlapping(&mut self, pair: DatasetPair) -> anyhow::Result<usize>;

    /// Whether any persystem row has a timestamp absent from the sum series.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn legacy_exists(&self, pair: DatasetPair) -> anyhow::Result<bool>;

    /// Rename the dataset of every non-overlapping persystem row to the sum dataset.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    fn promote_legacy(&mut self, pair: DatasetPair) -> anyhow::Result<usize>;

    /// Distinct datasets present in the store, sorted.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn datasets(&self) -> anyhow::Result<Vec<String>>;

    /// Distinct variants stored for `dataset`, sorted.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried.
    fn variants(&self, dataset: &str) -> anyhow::Result<Vec<String>>;

    /// All samples of a partition ordered by timestamp.
    ///
    /// # Errors
    /// Returns an error when the store cannot be queried or a row is malformed.
    fn load_partition(&self, partition: &Partition) -> anyhow::Result<Vec<Sample>>;

    /// Atomically replace every row of `partition` with `samples`.
    ///
    /// `verify` receives the partition as re-read inside the same transaction,
    /// ordered by timestamp. The rewrite is committed only if it returns `Ok`.
    ///
    /// # Errors
    /// Returns the error from `verify`, or [`RepairError::Store`] when the
    /// transaction fails. In both cases the partition is left untouched.
    fn replace_partition<F>(
        &mut self,
        partition: &Partition,
        samples: &[Sample],
        verify: F,
    ) -> Result<(), RepairError>
    where
        F: FnOnce(&[Sample]) -> Result<(), RepairError>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PairReport {
    pub persystem: Dataset,
    pub sum: Dataset,
    pub overlap_deleted: usize,
    pub legacy_promoted: usize,
}

impl PairReport {
    #[must_use]
    pub fn new(pair: DatasetPair) -> Self {
        Self { persystem: pair.persystem, sum: pair.sum, overlap_deleted: 0, legacy_promoted: 0 }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PartitionReport {
    pub dataset: String,
    pub variant: String,
    pub rows_before: usize,
    pub rows_after: usize,
    pub first_day: Option<String>,
    pub last_day: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunReport {
    pub pairs: Vec<PairReport>,
    pub partitions: Vec<PartitionReport>,
}

/// Run the reconciler over every corresponding pair, then align every partition.
///
/// The aligner never starts if any pair fails its convergence check.
///
/// # Errors
/// Returns the first invariant violation or store failure encountered.
pub fn run_migration<S: SeriesStore>(store: &mut S) -> Result<RunReport, RepairError> {
    let pairs = run_reconciler(store)?;
    let partitions = run_day_aligner(store)?;
    Ok(RunReport { pairs, partitions })
}
