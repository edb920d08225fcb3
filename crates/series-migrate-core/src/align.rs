use std::collections::BTreeMap;

use time::OffsetDateTime;
use tracing::{error, info, info_span};

use crate::{Partition, PartitionReport, RepairError, Sample, SeriesStore};

pub const MS_PER_DAY: i64 = 86_400_000;
pub const MIDDAY_OFFSET_MS: i64 = MS_PER_DAY / 2;

/// A stored timestamp whose day anchor does not fit in an `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timestamp {0} has no day anchor within the i64 range")]
pub struct UnanchoredTimestamp(pub i64);

/// UTC midday of the calendar day containing `x` (epoch milliseconds).
///
/// Uses floor division, so timestamps before 1970 land on their own day rather
/// than the following one. Returns `None` in the first and last partial days of
/// the `i64` range, where the anchor would overflow.
#[must_use]
pub fn day_bucket(x: i64) -> Option<i64> {
    x.div_euclid(MS_PER_DAY).checked_mul(MS_PER_DAY)?.checked_add(MIDDAY_OFFSET_MS)
}

#[must_use]
pub fn is_day_anchor(x: i64) -> bool {
    x.rem_euclid(MS_PER_DAY) == MIDDAY_OFFSET_MS
}

/// Collapse samples to one per day bucket, keeping the largest value.
///
/// The result is ordered by timestamp and does not depend on input order.
///
/// # Errors
/// Returns the first timestamp that has no representable day anchor.
pub fn align_samples(samples: &[Sample]) -> Result<Vec<Sample>, UnanchoredTimestamp> {
    let mut buckets: BTreeMap<i64, f64> = BTreeMap::new();
    for sample in samples {
        let bucket = day_bucket(sample.x).ok_or(UnanchoredTimestamp(sample.x))?;
        buckets
            .entry(bucket)
            .and_modify(|current| *current = current.max(sample.y))
            .or_insert(sample.y);
    }
    Ok(buckets.into_iter().map(|(x, y)| Sample { x, y }).collect())
}

/// Align every `(dataset, variant)` partition present in the store.
///
/// Each partition is rewritten in its own transaction; partitions already
/// rewritten stay rewritten if a later one fails.
///
/// # Errors
/// Returns the first store failure or post-write verification failure.
pub fn run_day_aligner<S: SeriesStore>(store: &mut S) -> Result<Vec<PartitionReport>, RepairError> {
    let mut reports = Vec::new();
    for dataset in store.datasets()? {
        for variant in store.variants(&dataset)? {
            let partition = Partition::new(dataset.clone(), variant);
            reports.push(align_partition(store, &partition)?);
        }
    }
    info!(partitions = reports.len(), "day alignment finished");
    Ok(reports)
}

/// Rewrite one partition onto day buckets and verify the stored result before
/// it is committed.
///
/// # Errors
/// Returns [`RepairError::TimestampOutOfRange`] before anything is written when
/// a timestamp cannot be bucketed, [`RepairError::PartitionNotAligned`] when the
/// re-read partition does not match the reduced sample set, or a store error.
/// The partition is unchanged after any of them.
pub fn align_partition<S: SeriesStore>(
    store: &mut S,
    partition: &Partition,
) -> Result<PartitionReport, RepairError> {
    let _span =
        info_span!("partition", dataset = %partition.dataset, variant = %partition.variant)
            .entered();

    let samples = store.load_partition(partition)?;
    let aligned = align_samples(&samples).map_err(|source| {
        error!(x = source.0, "timestamp out of range");
        RepairError::TimestampOutOfRange { partition: partition.clone(), source }
    })?;
    store.replace_partition(partition, &aligned, |stored| {
        verify_partition(partition, &aligned, stored)
    })?;

    let report = PartitionReport {
        dataset: partition.dataset.clone(),
        variant: partition.variant.clone(),
        rows_before: samples.len(),
        rows_after: aligned.len(),
        first_day: aligned.first().and_then(|sample| day_label(sample.x)),
        last_day: aligned.last().and_then(|sample| day_label(sample.x)),
    };
    info!(
        rows_before = report.rows_before,
        rows_after = report.rows_after,
        first_day = report.first_day.as_deref().unwrap_or("-"),
        last_day = report.last_day.as_deref().unwrap_or("-"),
        "partition aligned"
    );
    Ok(report)
}

fn verify_partition(
    partition: &Partition,
    expected: &[Sample],
    stored: &[Sample],
) -> Result<(), RepairError> {
    let reason = if stored.len() != expected.len() {
        Some(format!("expected {} rows, found {}", expected.len(), stored.len()))
    } else if let Some(sample) = stored.iter().find(|sample| !is_day_anchor(sample.x)) {
        Some(format!("timestamp {} is not a day anchor", sample.x))
    } else if !stored.iter().map(|sample| sample.x).eq(expected.iter().map(|sample| sample.x)) {
        Some("stored timestamps differ from the aligned set".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => {
            error!(%reason, "partition verification failed");
            Err(RepairError::PartitionNotAligned { partition: partition.clone(), reason })
        }
        None => Ok(()),
    }
}

fn day_label(x: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(x.div_euclid(1_000))
        .ok()
        .map(|moment| moment.date().to_string())
}
