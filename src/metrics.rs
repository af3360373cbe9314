//! Scalar metric aggregation across steps and, optionally, across processes.

use std::collections::HashMap;

use candle::{Device, Result, Tensor};

use crate::distributed::Distributed;

#[derive(Debug, Default)]
pub struct Metrics {
    values: HashMap<String, Vec<f64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, name: impl Into<String>, value: f64) {
        self.values.entry(name.into()).or_default().push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Per-key mean over all recorded values, averaged across processes when
    /// a distributed handle is given.
    pub fn compute(&self, dist: Option<&Distributed>) -> Result<HashMap<String, f64>> {
        let mut out = HashMap::new();
        for (name, values) in self.values.iter() {
            let mut mean = values.iter().sum::<f64>() / values.len() as f64;
            if let Some(dist) = dist {
                let local = Tensor::from_vec(vec![mean], 1, &Device::Cpu)?;
                mean = dist
                    .gather_concat(&local)?
                    .mean_all()?
                    .to_scalar::<f64>()?;
            }
            out.insert(name.clone(), mean);
        }
        Ok(out)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Log the computed metrics sorted by key.
    pub fn log(metrics: &HashMap<String, f64>, epoch: usize) {
        let mut keys = metrics.keys().collect::<Vec<_>>();
        keys.sort();
        for key in keys {
            tracing::info!(epoch, "{key}: {:.4}", metrics[key]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn means_per_key() -> Result<()> {
        let mut metrics = Metrics::new();
        metrics.update("loss", 2.0);
        metrics.update("loss", 4.0);
        metrics.update("lr", 0.1);
        let out = metrics.compute(None)?;
        assert_eq!(out["loss"], 3.0);
        assert_eq!(out["lr"], 0.1);
        Ok(())
    }

    #[test]
    fn single_process_reduce_matches_local() -> Result<()> {
        let mut metrics = Metrics::new();
        metrics.update("nll", 1.5);
        let dist = Distributed::single();
        let out = metrics.compute(Some(&dist))?;
        assert!((out["nll"] - 1.5).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn clear_resets_state() {
        let mut metrics = Metrics::new();
        metrics.update("x", 1.0);
        metrics.clear();
        assert!(metrics.is_empty());
    }
}
