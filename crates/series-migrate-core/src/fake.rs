//! In-memory `SeriesStore` used by the unit tests. The `ignore_*` switches make
//! a mutating call report success without changing anything, which SQLite
//! itself never does. `replaced` counts committed partition rewrites.

use std::collections::BTreeSet;

use crate::{DatasetPair, Partition, RepairError, Sample, SeriesStore, LEGACY_VARIANT};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Row {
    pub dataset: String,
    pub variant: String,
    pub x: i64,
    pub y: f64,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryStore {
    pub rows: Vec<Row>,
    pub ignore_deletes: bool,
    pub ignore_promotions: bool,
    pub drop_last_on_replace: bool,
    pub replaced: usize,
}

impl MemoryStore {
    pub fn insert(&mut self, dataset: &str, variant: &str, x: i64, y: f64) {
        self.rows.push(Row { dataset: dataset.to_string(), variant: variant.to_string(), x, y });
    }

    pub fn partition_rows(&self, dataset: &str, variant: &str) -> Vec<Sample> {
        let mut samples = self
            .rows
            .iter()
            .filter(|row| row.dataset == dataset && row.variant == variant)
            .map(|row| Sample::new(row.x, row.y))
            .collect::<Vec<_>>();
        samples.sort_by_key(|sample| sample.x);
        samples
    }

    fn sum_timestamps(&self, pair: DatasetPair) -> BTreeSet<i64> {
        self.rows
            .iter()
            .filter(|row| row.dataset == pair.sum.as_str() && row.variant == LEGACY_VARIANT)
            .map(|row| row.x)
            .collect()
    }

    fn is_persystem(row: &Row, pair: DatasetPair) -> bool {
        row.dataset == pair.persystem.as_str() && row.variant == LEGACY_VARIANT
    }
}

impl SeriesStore for MemoryStore {
    fn overlap_exists(&self, pair: DatasetPair) -> anyhow::Result<bool> {
        let sum = self.sum_timestamps(pair);
        Ok(self.rows.iter().any(|row| Self::is_persystem(row, pair) && sum.contains(&row.x)))
    }

    fn delete_overlapping(&mut self, pair: DatasetPair) -> anyhow::Result<usize> {
        let sum = self.sum_timestamps(pair);
        let before = self.rows.len();
        if !self.ignore_deletes {
            self.rows.retain(|row| !(Self::is_persystem(row, pair) && sum.contains(&row.x)));
        }
        Ok(before - self.rows.len())
    }

    fn legacy_exists(&self, pair: DatasetPair) -> anyhow::Result<bool> {
        let sum = self.sum_timestamps(pair);
        Ok(self.rows.iter().any(|row| Self::is_persystem(row, pair) && !sum.contains(&row.x)))
    }

    fn promote_legacy(&mut self, pair: DatasetPair) -> anyhow::Result<usize> {
        if self.ignore_promotions {
            return Ok(0);
        }
        let sum = self.sum_timestamps(pair);
        let mut promoted = 0;
        for row in &mut self.rows {
            if Self::is_persystem(row, pair) && !sum.contains(&row.x) {
                row.dataset = pair.sum.as_str().to_string();
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    fn datasets(&self) -> anyhow::Result<Vec<String>> {
        let datasets = self.rows.iter().map(|row| row.dataset.clone()).collect::<BTreeSet<_>>();
        Ok(datasets.into_iter().collect())
    }

    fn variants(&self, dataset: &str) -> anyhow::Result<Vec<String>> {
        let variants = self
            .rows
            .iter()
            .filter(|row| row.dataset == dataset)
            .map(|row| row.variant.clone())
            .collect::<BTreeSet<_>>();
        Ok(variants.into_iter().collect())
    }

    fn load_partition(&self, partition: &Partition) -> anyhow::Result<Vec<Sample>> {
        Ok(self.partition_rows(&partition.dataset, &partition.variant))
    }

    fn replace_partition<F>(
        &mut self,
        partition: &Partition,
        samples: &[Sample],
        verify: F,
    ) -> Result<(), RepairError>
    where
        F: FnOnce(&[Sample]) -> Result<(), RepairError>,
    {
        let snapshot = self.rows.clone();
        self.rows
            .retain(|row| !(row.dataset == partition.dataset && row.variant == partition.variant));
        let keep = if self.drop_last_on_replace {
            samples.len().saturating_sub(1)
        } else {
            samples.len()
        };
        for sample in &samples[..keep] {
            self.insert(&partition.dataset, &partition.variant, sample.x, sample.y);
        }

        if let Err(err) = verify(&self.partition_rows(&partition.dataset, &partition.variant)) {
            self.rows = snapshot;
            return Err(err);
        }
        self.replaced += 1;
        Ok(())
    }
}
