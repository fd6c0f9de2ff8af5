use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TerrainError};
use crate::utils::is_valid_dimension;

// Parameters of one Diamond–Square run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiamondSquareParams {
    pub dimension: usize, // must be 2^n + 1, e.g. 129, 257
    pub seed: u64,
    pub amplitude: f32,   // offset magnitude at the first level, in [0, 1]
    pub persistence: f32, // amplitude multiplier per level, in [0, 1]
    // Phases with fewer sub-steps than this run in the calling thread
    pub tile_threshold: usize,
    // Side length (in sub-steps) of one dispatched tile
    pub tile_size: usize,
    pub sync_timeout_ms: u64,
}

impl Default for DiamondSquareParams {
    fn default() -> Self {
        Self {
            dimension: 129,
            seed: 2025,
            amplitude: 1.0,
            persistence: 0.5,
            tile_threshold: 128,
            tile_size: 16,
            sync_timeout_ms: 30_000,
        }
    }
}

impl DiamondSquareParams {
    pub fn new(dimension: usize, seed: u64, amplitude: f32, persistence: f32) -> Self {
        Self {
            dimension,
            seed,
            amplitude,
            persistence,
            ..Default::default()
        }
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_dimension(self.dimension) {
            return Err(TerrainError::InvalidDimension(self.dimension));
        }
        unit_interval("amplitude", self.amplitude)?;
        unit_interval("persistence", self.persistence)?;
        if self.tile_size == 0 {
            return Err(TerrainError::InvalidParameter {
                name: "tile_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.sync_timeout_ms == 0 {
            return Err(TerrainError::InvalidParameter {
                name: "sync_timeout_ms",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

fn unit_interval(name: &'static str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(TerrainError::InvalidParameter {
            name,
            reason: format!("{value} is outside [0, 1]"),
        })
    }
}

// Worker pool sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub worker_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_defaults_are_valid() {
        assert!(DiamondSquareParams::default().validate().is_ok());
    }

    #[test]
    fn params_reject_bad_dimension() {
        let p = DiamondSquareParams::new(100, 0, 0.5, 0.5);
        assert!(matches!(
            p.validate(),
            Err(TerrainError::InvalidDimension(100))
        ));
    }

    #[test]
    fn params_reject_amplitude_out_of_range() {
        let p = DiamondSquareParams::new(33, 0, 1.5, 0.5);
        assert!(matches!(
            p.validate(),
            Err(TerrainError::InvalidParameter {
                name: "amplitude",
                ..
            })
        ));
        let p = DiamondSquareParams::new(33, 0, 0.5, -0.1);
        assert!(p.validate().is_err());
    }

    #[test]
    fn params_from_partial_json() {
        // Missing fields fall back to defaults
        let p: DiamondSquareParams =
            serde_json::from_str(r#"{ "dimension": 257, "seed": 7 }"#).unwrap();
        assert_eq!(p.dimension, 257);
        assert_eq!(p.seed, 7);
        assert_eq!(p.tile_size, 16);
        assert_eq!(p.sync_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn pool_config_has_at_least_one_worker() {
        assert!(PoolConfig::default().worker_count >= 1);
        let c: PoolConfig = serde_json::from_str(r#"{ "worker_count": 3 }"#).unwrap();
        assert_eq!(c.worker_count, 3);
    }
}
