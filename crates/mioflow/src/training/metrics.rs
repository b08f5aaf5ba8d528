use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::training::data::step_key;

/// Losses recorded for one step key, in the order they were produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLosses {
    pub step: String,
    pub losses: Vec<f64>,
}

/// Loss history of a training run.
///
/// `local` keeps one list per step key in first-seen order, `batch` holds the
/// mean local loss of each local batch and `global` the loss of each global
/// batch. Entries are only ever appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub local: Vec<StepLosses>,
    pub batch: Vec<f64>,
    pub global: Vec<f64>,
}

impl LossHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A history with empty lists for the given `(t0, t1)` steps.
    pub fn with_steps(steps: &[(f64, f64)]) -> Self {
        let mut history = Self::new();
        for &(t0, t1) in steps {
            history.entry(&step_key(t0, t1));
        }
        history
    }

    /// Mutable list for `key`, created empty at the end if absent.
    pub fn entry(&mut self, key: &str) -> &mut Vec<f64> {
        let pos = match self.local.iter().position(|s| s.step == key) {
            Some(pos) => pos,
            None => {
                self.local.push(StepLosses {
                    step: key.to_string(),
                    losses: Vec::new(),
                });
                self.local.len() - 1
            }
        };
        &mut self.local[pos].losses
    }

    pub fn record_local(&mut self, key: &str, loss: f64) {
        self.entry(key).push(loss);
    }

    /// Losses recorded under `key`.
    pub fn local_losses(&self, key: &str) -> Option<&[f64]> {
        self.local
            .iter()
            .find(|s| s.step == key)
            .map(|s| s.losses.as_slice())
    }

    /// Step keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.local.iter().map(|s| s.step.as_str())
    }

    /// Append every list of `other` onto this history.
    pub fn merge(&mut self, other: LossHistory) {
        for StepLosses { step, losses } in other.local {
            self.entry(&step).extend(losses);
        }
        self.batch.extend(other.batch);
        self.global.extend(other.global);
    }

    /// Fold reversed-step losses back into their forward steps.
    ///
    /// For each forward step `t0:t1`, before every forward entry at an index
    /// divisible by `reverse_n`, the next unused `t1:t0` entry (if any) is
    /// inserted. Only the forward keys remain afterwards.
    pub fn interleave_reversed(&mut self, forward_steps: &[(f64, f64)], reverse_n: usize) {
        let reverse_n = reverse_n.max(1);
        let mut local = Vec::with_capacity(forward_steps.len());
        for &(t0, t1) in forward_steps {
            let forward = self.local_losses(&step_key(t0, t1)).unwrap_or(&[]);
            let mut reversed = self
                .local_losses(&step_key(t1, t0))
                .unwrap_or(&[])
                .iter()
                .copied();

            let mut merged = Vec::with_capacity(forward.len() * 2);
            for (i, &value) in forward.iter().enumerate() {
                if i % reverse_n == 0 {
                    if let Some(r) = reversed.next() {
                        merged.push(r);
                    }
                }
                merged.push(value);
            }
            local.push(StepLosses {
                step: step_key(t0, t1),
                losses: merged,
            });
        }
        self.local = local;
    }

    /// Mean of the batch (local) losses.
    pub fn mean_batch(&self) -> Option<f64> {
        mean(&self.batch)
    }

    /// Mean of the global losses.
    pub fn mean_global(&self) -> Option<f64> {
        mean(&self.global)
    }

    /// The most recent local-batch or global loss.
    pub fn last(&self) -> Option<f64> {
        self.global.last().or(self.batch.last()).copied()
    }

    pub fn summary(&self) -> LossSummary {
        LossSummary {
            n_steps: self.local.len(),
            n_local_batches: self.batch.len(),
            n_global_batches: self.global.len(),
            mean_batch: self.mean_batch(),
            mean_global: self.mean_global(),
            final_batch: self.batch.last().copied(),
            final_global: self.global.last().copied(),
        }
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", path.display()))?;
        serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))
    }
}

/// Aggregate view of a [`LossHistory`] for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossSummary {
    pub n_steps: usize,
    pub n_local_batches: usize,
    pub n_global_batches: usize,
    pub mean_batch: Option<f64>,
    pub mean_global: Option<f64>,
    pub final_batch: Option<f64>,
    pub final_global: Option<f64>,
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
