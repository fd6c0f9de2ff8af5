// core holds the Diamond–Square engines and the worker pool that drives them
pub mod config;
pub mod diamond_square;
pub mod error;
pub mod grid;
pub mod parallel_grid;
pub mod utils;
pub mod work_unit;
pub mod worker;
pub mod worker_pool;

pub use config::{DiamondSquareParams, PoolConfig};
pub use diamond_square::DiamondSquareCpu;
pub use error::{Result, TerrainError};
pub use grid::{Grid, SeedMap};
pub use parallel_grid::{DiamondSquareParallel, ParallelBackend};
pub use utils::{HeightMap2D, flatten2};
pub use work_unit::{OffsetSource, SeededOffsets, StepKind, WorkUnit};
pub use worker::{BoxedJob, Job};
pub use worker_pool::WorkerPool;

// Height field generator sampled on integer grid coordinates.
// Finite generators (this crate) must run before they can be sampled;
// anything not generated yet or outside the grid reads as 0.
pub trait NoiseGenerator {
    // true for generators that fill a finite buffer up front
    fn requires_pre_generation(&self) -> bool;

    fn dimension(&self) -> usize;

    // Height at (x, y) in [0, 1]
    fn get2(&self, x: i64, y: i64) -> f32;

    // Horizontal height field: the vertical axis is ignored
    fn get3(&self, x: i64, _y: i64, z: i64) -> f32 {
        self.get2(x, z)
    }

    // Bilinear sample at normalized coordinates (u, v) in [0, 1]
    fn sample(&self, u: f64, v: f64) -> f32 {
        let max = self.dimension().saturating_sub(1) as f64;
        let fx = u.clamp(0.0, 1.0) * max;
        let fy = v.clamp(0.0, 1.0) * max;
        let xi = fx.floor() as i64;
        let yi = fy.floor() as i64;

        let tx = (fx - xi as f64) as f32;
        let ty = (fy - yi as f64) as f32;

        // On the far edge the +1 neighbour is out of range, reuse the edge
        let x1 = if tx > 0.0 { xi + 1 } else { xi };
        let y1 = if ty > 0.0 { yi + 1 } else { yi };

        let a = self.get2(xi, yi);
        let b = self.get2(x1, yi);
        let c = self.get2(xi, y1);
        let d = self.get2(x1, y1);

        let ab = a * (1.0 - tx) + b * tx;
        let cd = c * (1.0 - tx) + d * tx;
        ab * (1.0 - ty) + cd * ty
    }
}
