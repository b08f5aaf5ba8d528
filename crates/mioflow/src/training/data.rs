//! Snapshot sampling and time-step bookkeeping.
//!
//! Training never sees paired trajectories: every step draws fresh,
//! independent mini-batches from the marginal population at each time group.

use std::collections::HashMap;

use burn::prelude::*;
use rand::seq::index;
use rand::Rng;
use serde::{Deserialize, Serialize};

use snapshot::SnapshotTable;

use crate::error::TrainError;
use crate::model::bridge::flat_to_tensor;

/// Which time group to leave out of training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldOut {
    /// Draw a group uniformly at random every batch.
    Random,
    /// Always leave out this group.
    Group(f64),
}

impl HoldOut {
    /// Resolve the group to ignore for one batch.
    ///
    /// `Group(g)` must be one of `groups`.
    pub fn pick(&self, groups: &[f64], rng: &mut impl Rng) -> Result<f64, TrainError> {
        match *self {
            HoldOut::Random => {
                if groups.is_empty() {
                    return Err(TrainError::Sampling(anyhow::anyhow!(
                        "cannot hold out a group from an empty group list"
                    )));
                }
                Ok(groups[rng.gen_range(0..groups.len())])
            }
            HoldOut::Group(g) if groups.contains(&g) => Ok(g),
            HoldOut::Group(g) => Err(TrainError::UnknownHoldOut(g)),
        }
    }

    /// The fixed group, if any.
    pub fn fixed(&self) -> Option<f64> {
        match *self {
            HoldOut::Random => None,
            HoldOut::Group(g) => Some(g),
        }
    }
}

/// Consecutive `(t0, t1)` pairs of a group sequence.
pub fn generate_steps(groups: &[f64]) -> Vec<(f64, f64)> {
    groups.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Loss-history key of a step, e.g. `"1.0:2.0"`.
pub fn step_key(t0: f64, t1: f64) -> String {
    format!("{t0:?}:{t1:?}")
}

/// Random access to the rows of each time group of a snapshot table.
pub struct SnapshotSampler {
    table: SnapshotTable,
    groups: Vec<f64>,
    rows_by_group: HashMap<u64, Vec<usize>>,
}

impl SnapshotSampler {
    /// Index a snapshot table by group.
    ///
    /// # Errors
    /// Returns an error if the table is empty.
    pub fn new(table: SnapshotTable) -> anyhow::Result<Self> {
        if table.is_empty() {
            anyhow::bail!("snapshot table has no rows");
        }
        let groups = table.distinct_groups();
        let mut rows_by_group: HashMap<u64, Vec<usize>> = HashMap::new();
        for i in 0..table.len() {
            rows_by_group.entry(table.group(i).to_bits()).or_default().push(i);
        }
        tracing::info!(
            rows = table.len(),
            dim = table.dim(),
            groups = groups.len(),
            "SnapshotSampler initialized"
        );
        Ok(Self {
            table,
            groups,
            rows_by_group,
        })
    }

    /// Sorted distinct groups.
    pub fn groups(&self) -> &[f64] {
        &self.groups
    }

    pub fn dim(&self) -> usize {
        self.table.dim()
    }

    pub fn table(&self) -> &SnapshotTable {
        &self.table
    }

    /// Number of rows in `group`, or `None` for an unknown group.
    pub fn group_size(&self, group: f64) -> Option<usize> {
        self.rows_by_group.get(&group.to_bits()).map(Vec::len)
    }

    /// Draw `size` rows of `group` as a flat row-major buffer.
    ///
    /// # Errors
    /// Fails for an unknown group, or when sampling without replacement asks
    /// for more rows than the group has.
    pub fn sample_rows(
        &self,
        group: f64,
        size: usize,
        replace: bool,
        rng: &mut impl Rng,
    ) -> anyhow::Result<Vec<f32>> {
        let rows = self
            .rows_by_group
            .get(&group.to_bits())
            .ok_or_else(|| anyhow::anyhow!("unknown group {group}"))?;

        let picked: Vec<usize> = if replace {
            (0..size).map(|_| rows[rng.gen_range(0..rows.len())]).collect()
        } else {
            if size > rows.len() {
                anyhow::bail!(
                    "cannot sample {size} rows without replacement from group {group} ({} rows)",
                    rows.len()
                );
            }
            index::sample(rng, rows.len(), size)
                .into_iter()
                .map(|i| rows[i])
                .collect()
        };

        let mut flat = Vec::with_capacity(size * self.dim());
        for i in picked {
            flat.extend_from_slice(self.table.row(i));
        }
        Ok(flat)
    }

    /// Draw `size` rows of `group` as a `(size, d)` tensor.
    pub fn sample<B: Backend>(
        &self,
        group: f64,
        size: usize,
        replace: bool,
        rng: &mut impl Rng,
        device: &B::Device,
    ) -> anyhow::Result<Tensor<B, 2>> {
        if size == 0 {
            anyhow::bail!("sample size must be > 0");
        }
        let flat = self.sample_rows(group, size, replace, rng)?;
        Ok(flat_to_tensor(flat, size, self.dim(), device))
    }

    /// Every row of `group` as a `(n, d)` tensor, in table order.
    pub fn all<B: Backend>(&self, group: f64, device: &B::Device) -> anyhow::Result<Tensor<B, 2>> {
        let rows = self
            .rows_by_group
            .get(&group.to_bits())
            .ok_or_else(|| anyhow::anyhow!("unknown group {group}"))?;
        let mut flat = Vec::with_capacity(rows.len() * self.dim());
        for &i in rows {
            flat.extend_from_slice(self.table.row(i));
        }
        Ok(flat_to_tensor(flat, rows.len(), self.dim(), device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;

    fn make_sampler() -> SnapshotSampler {
        let mut table = SnapshotTable::with_dim(2);
        for g in 0..3 {
            for i in 0..10 {
                table.push(g as f64, &[g as f32, i as f32]).unwrap();
            }
        }
        SnapshotSampler::new(table).unwrap()
    }

    #[test]
    fn test_generate_steps() {
        assert_eq!(
            generate_steps(&[0.0, 1.0, 3.0]),
            vec![(0.0, 1.0), (1.0, 3.0)]
        );
        assert!(generate_steps(&[2.0]).is_empty());
        assert!(generate_steps(&[]).is_empty());
    }

    #[test]
    fn test_step_key_format() {
        assert_eq!(step_key(1.0, 2.0), "1.0:2.0");
        assert_eq!(step_key(2.5, 0.0), "2.5:0.0");
    }

    #[test]
    fn test_sample_stays_in_group() {
        let sampler = make_sampler();
        let mut rng = StdRng::seed_from_u64(0);
        let flat = sampler.sample_rows(1.0, 5, false, &mut rng).unwrap();
        assert_eq!(flat.len(), 10);
        for row in flat.chunks(2) {
            assert_eq!(row[0], 1.0, "sampled a row from the wrong group");
        }
    }

    #[test]
    fn test_sample_without_replacement_is_distinct() {
        let sampler = make_sampler();
        let mut rng = StdRng::seed_from_u64(1);
        let flat = sampler.sample_rows(2.0, 10, false, &mut rng).unwrap();
        let ids: HashSet<u32> = flat.chunks(2).map(|r| r[1] as u32).collect();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_oversample_without_replacement_fails() {
        let sampler = make_sampler();
        let mut rng = StdRng::seed_from_u64(2);
        assert!(sampler.sample_rows(0.0, 11, false, &mut rng).is_err());
        // With replacement, any size works.
        let flat = sampler.sample_rows(0.0, 50, true, &mut rng).unwrap();
        assert_eq!(flat.len(), 100);
    }

    #[test]
    fn test_unknown_group_fails() {
        let sampler = make_sampler();
        let mut rng = StdRng::seed_from_u64(3);
        let err = sampler.sample_rows(7.0, 1, true, &mut rng).unwrap_err();
        assert!(err.to_string().contains("unknown group"));
        assert!(sampler.group_size(7.0).is_none());
    }

    #[test]
    fn test_sample_tensor_shape() {
        let sampler = make_sampler();
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(4);
        let t = sampler
            .sample::<TestBackend>(0.0, 4, false, &mut rng, &device)
            .unwrap();
        assert_eq!(t.dims(), [4, 2]);
        assert_eq!(sampler.all::<TestBackend>(2.0, &device).unwrap().dims(), [10, 2]);
    }

    #[test]
    fn test_hold_out_pick() {
        let groups = [0.0, 1.0, 2.0];
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(HoldOut::Group(1.0).pick(&groups, &mut rng).unwrap(), 1.0);
        assert!(matches!(
            HoldOut::Group(9.0).pick(&groups, &mut rng),
            Err(TrainError::UnknownHoldOut(g)) if g == 9.0
        ));
        for _ in 0..20 {
            let g = HoldOut::Random.pick(&groups, &mut rng).unwrap();
            assert!(groups.contains(&g));
        }
    }

    #[test]
    fn test_empty_table_rejected() {
        assert!(SnapshotSampler::new(SnapshotTable::with_dim(3)).is_err());
    }
}
