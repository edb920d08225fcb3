use tracing::{error, info, info_span};

use crate::{DatasetPair, PairReport, RepairError, SeriesStore, CORRESPONDING_METRICS};

/// Reconcile every pair of [`CORRESPONDING_METRICS`] in order, stopping at the
/// first pair whose mutation does not converge.
///
/// # Errors
/// Returns the first invariant violation or store failure.
pub fn run_reconciler<S: SeriesStore>(store: &mut S) -> Result<Vec<PairReport>, RepairError> {
    let reports = CORRESPONDING_METRICS
        .iter()
        .map(|pair| reconcile_pair(store, *pair))
        .collect::<Result<Vec<_>, _>>()?;
    info!(pairs = reports.len(), "dataset reconciliation finished");
    Ok(reports)
}

/// Merge the legacy `default` rows of `pair.persystem` into `pair.sum`.
///
/// Rows whose timestamp already exists in the sum series are deleted first, so
/// the promotion that follows can never create a duplicate timestamp. Each
/// mutation is followed by exactly one re-check.
///
/// # Errors
/// Returns [`RepairError::OverlapNotRemoved`] or [`RepairError::LegacyNotConverted`]
/// when the re-check still finds the condition the mutation should have cleared.
pub fn reconcile_pair<S: SeriesStore>(
    store: &mut S,
    pair: DatasetPair,
) -> Result<PairReport, RepairError> {
    let _span = info_span!("pair", persystem = %pair.persystem, sum = %pair.sum).entered();
    info!("checking datasets");
    let mut report = PairReport::new(pair);

    if store.overlap_exists(pair)? {
        info!("overlap between 'default' and sum exists, removing overlapping 'default' rows");
        report.overlap_deleted = store.delete_overlapping(pair)?;
        if store.overlap_exists(pair)? {
            error!("failed to remove overlap");
            return Err(RepairError::OverlapNotRemoved { persystem: pair.persystem, sum: pair.sum });
        }
        info!(deleted = report.overlap_deleted, "overlap removed");
    } else {
        info!("no overlap");
    }

    if store.legacy_exists(pair)? {
        info!("legacy 'default' rows exist, converting to sum dataset");
        report.legacy_promoted = store.promote_legacy(pair)?;
        if store.legacy_exists(pair)? {
            error!("failed to convert legacy variant");
            return Err(RepairError::LegacyNotConverted {
                persystem: pair.persystem,
                sum: pair.sum,
            });
        }
        info!(promoted = report.legacy_promoted, "legacy variant converted");
    } else {
        info!("no legacy 'default' rows");
    }

    Ok(report)
}
