use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use image::DynamicImage;

use crate::NoiseGenerator;
use crate::config::DiamondSquareParams;
use crate::error::{Result, TerrainError};
use crate::grid::{Grid, SeedMap};
use crate::utils::{HeightMap2D, clamp01};
use crate::work_unit::{
    OffsetSource, SeededOffsets, SharedOffsets, StepKind, Tile, WorkUnit, lattice_side,
    shared_offsets,
};
use crate::worker::run_guarded;
use crate::worker_pool::WorkerPool;

// Diamond–Square on the CPU: the grid is refined level by level and each
// phase is either run inline or cut into tiles for a worker pool.
pub struct DiamondSquareCpu {
    params: DiamondSquareParams,
    seeds: Option<SeedMap>,
    // Replaces the seeded RNG when set (e.g. a deterministic stub)
    custom_offsets: Option<SharedOffsets>,
    grid: Option<Arc<Grid>>,
}

impl DiamondSquareCpu {
    pub fn new(params: DiamondSquareParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            seeds: None,
            custom_offsets: None,
            grid: None,
        })
    }

    pub fn with_offset_source(mut self, source: Box<dyn OffsetSource>) -> Self {
        self.custom_offsets = Some(shared_offsets(source));
        self
    }

    pub fn params(&self) -> &DiamondSquareParams {
        &self.params
    }

    // Replace the seed map; any previous output is discarded
    pub fn set_seed_heights(&mut self, seeds: SeedMap) -> Result<()> {
        seeds.spacing_for(self.params.dimension)?;
        self.seeds = Some(seeds);
        self.grid = None;
        Ok(())
    }

    pub fn set_height_seeds_from_image(&mut self, img: &DynamicImage) -> Result<()> {
        self.set_seed_heights(SeedMap::from_image(img)?)
    }

    // Run the full recurrence. Without a pool every phase runs in the
    // calling thread. A faulted unit is logged and its cells stay unset.
    //
    // On SyncTimeout the run's tiles may still be queued or running on
    // `pool`. They are marked abandoned and return without drawing offsets
    // or writing, but the pool's next sync still waits for them to drain.
    pub fn generate(&mut self, pool: Option<&WorkerPool<WorkUnit>>) -> Result<()> {
        let seeds = self.seeds.as_ref().ok_or(TerrainError::MissingSeedMap)?;
        let dimension = self.params.dimension;
        let grid = Arc::new(Grid::new(dimension)?);
        grid.apply_seeds(seeds)?;
        self.grid = None;

        let offsets = match &self.custom_offsets {
            Some(offsets) => Arc::clone(offsets),
            None => shared_offsets(Box::new(SeededOffsets::new(self.params.seed))),
        };

        let abandoned = Arc::new(AtomicBool::new(false));
        let start = Instant::now();
        let mut step = dimension / 2;
        let mut amplitude = self.params.amplitude;
        while step > 0 {
            let modifier = clamp01(amplitude);
            // Square centres read diamond centres of the same level,
            // so the two phases are separated by a barrier.
            for kind in [StepKind::Diamond, StepKind::Square] {
                let phase = Phase {
                    kind,
                    step,
                    modifier,
                    grid: &grid,
                    offsets: &offsets,
                    abandoned: &abandoned,
                };
                if let Err(err) = self.run_phase(&phase, pool) {
                    abandoned.store(true, Ordering::Release);
                    return Err(err);
                }
            }

            amplitude *= self.params.persistence;
            step /= 2;
        }

        let unset = grid.unset_count();
        if unset > 0 {
            log::warn!("{unset} cells were left unset by faulted work units");
        }
        log::info!(
            "diamond-square {dimension}x{dimension} generated in {:?}",
            start.elapsed()
        );
        self.grid = Some(grid);
        Ok(())
    }

    fn run_phase(&self, phase: &Phase<'_>, pool: Option<&WorkerPool<WorkUnit>>) -> Result<()> {
        let (kind, step) = (phase.kind, phase.step);
        let side = lattice_side(kind, phase.grid.dimension(), step);

        match pool {
            // Small levels are not worth the dispatch overhead
            Some(pool) if side * side >= self.params.tile_threshold => {
                let tile = self.params.tile_size;
                let mut dispatched = 0;
                for start_y in (0..side).step_by(tile) {
                    for start_x in (0..side).step_by(tile) {
                        pool.enqueue(phase.unit(start_x, start_y, tile))?;
                        dispatched += 1;
                    }
                }
                log::debug!("{kind:?} step {step}: {dispatched} tiles dispatched");

                let timeout = self.params.sync_timeout();
                if !pool.sync(timeout) {
                    return Err(TerrainError::SyncTimeout(timeout));
                }
                if pool.is_cancelled() {
                    return Err(TerrainError::PoolCancelled);
                }
            }
            _ => {
                log::trace!("{kind:?} step {step}: {side}x{side} lattice inline");
                if !run_guarded(phase.unit(0, 0, side)) {
                    log::warn!("{kind:?} step {step}: inline unit faulted");
                }
            }
        }
        Ok(())
    }

    pub fn is_generated(&self) -> bool {
        self.grid.is_some()
    }

    pub fn height_map(&self) -> Option<HeightMap2D> {
        self.grid.as_ref().map(|g| g.to_height_map())
    }

    // Cells left without a value (only non-zero after a job faulted)
    pub fn unset_cells(&self) -> Option<usize> {
        self.grid.as_ref().map(|g| g.unset_count())
    }
}

// Everything a tile of one phase needs from the running generation
struct Phase<'a> {
    kind: StepKind,
    step: usize,
    modifier: f32,
    grid: &'a Arc<Grid>,
    offsets: &'a SharedOffsets,
    abandoned: &'a Arc<AtomicBool>,
}

impl Phase<'_> {
    fn unit(&self, start_x: usize, start_y: usize, count: usize) -> WorkUnit {
        let tile = Tile::new(
            start_x,
            start_y,
            count,
            self.step,
            self.modifier,
            Arc::clone(self.grid),
            Arc::clone(self.offsets),
        )
        .with_abandon_flag(Arc::clone(self.abandoned));
        WorkUnit::new(self.kind, tile)
    }
}

impl NoiseGenerator for DiamondSquareCpu {
    fn requires_pre_generation(&self) -> bool {
        true
    }

    fn dimension(&self) -> usize {
        self.params.dimension
    }

    fn get2(&self, x: i64, y: i64) -> f32 {
        match &self.grid {
            Some(g) if g.in_bounds(x, y) => g.value(x as usize, y as usize),
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Zero;

    impl OffsetSource for Zero {
        fn next_offset(&mut self) -> f32 {
            0.0
        }
    }

    fn flat_corners() -> SeedMap {
        SeedMap::corners(0.5, 0.5, 0.5, 0.5).unwrap()
    }

    #[test]
    fn generate_without_seeds_fails() {
        let mut ds = DiamondSquareCpu::new(DiamondSquareParams::new(9, 1, 0.5, 0.5)).unwrap();
        assert!(matches!(
            ds.generate(None),
            Err(TerrainError::MissingSeedMap)
        ));
        assert!(!ds.is_generated());
    }

    #[test]
    fn params_are_kept_as_given() {
        let ds = DiamondSquareCpu::new(DiamondSquareParams::new(9, 7, 0.5, 0.25)).unwrap();
        assert_eq!(ds.params().dimension, 9);
        assert_eq!(ds.params().seed, 7);
        assert_eq!(ds.params().persistence, 0.25);
    }

    #[test]
    fn new_rejects_bad_params() {
        assert!(DiamondSquareCpu::new(DiamondSquareParams::new(10, 1, 0.5, 0.5)).is_err());
        assert!(DiamondSquareCpu::new(DiamondSquareParams::new(9, 1, 2.0, 0.5)).is_err());
    }

    #[test]
    fn seed_map_must_fit_dimension() {
        let mut ds = DiamondSquareCpu::new(DiamondSquareParams::new(9, 1, 0.5, 0.5)).unwrap();
        let seeds = SeedMap::new(4, vec![0.0; 16]).unwrap();
        assert!(ds.set_seed_heights(seeds).is_err());
    }

    #[test]
    fn edge_clamp_only_lowers_flat_seeds() {
        let mut ds = DiamondSquareCpu::new(DiamondSquareParams::new(17, 1, 0.0, 0.5))
            .unwrap()
            .with_offset_source(Box::new(Zero));
        ds.set_seed_heights(flat_corners()).unwrap();
        ds.generate(None).unwrap();
        // The centre averages four 0.5 corners; edge clamping can only pull
        // other cells down, never up
        assert!((ds.get2(8, 8) - 0.5).abs() < 1e-6);
        let map = ds.height_map().unwrap();
        assert!(map.iter().flatten().all(|&v| (0.0..=0.5 + 1e-6).contains(&v)));
        assert_eq!(ds.unset_cells(), Some(0));
    }

    struct FailAfter(usize);

    impl OffsetSource for FailAfter {
        fn next_offset(&mut self) -> f32 {
            if self.0 == 0 {
                panic!("offset source exhausted");
            }
            self.0 -= 1;
            0.0
        }
    }

    #[test]
    fn inline_fault_is_contained() {
        // Dimension 9 stays below the tile threshold, so every phase runs inline
        let mut ds = DiamondSquareCpu::new(DiamondSquareParams::new(9, 1, 0.5, 0.5))
            .unwrap()
            .with_offset_source(Box::new(FailAfter(3)));
        ds.set_seed_heights(flat_corners()).unwrap();
        ds.generate(None).unwrap();
        assert!(ds.is_generated());
        // The first diamond centre was written, the failing square phase was not
        assert!(ds.unset_cells().unwrap() > 0);
        assert!((ds.get2(4, 4) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn synchronous_runs_are_deterministic() {
        let params = DiamondSquareParams::new(33, 42, 0.8, 0.6);
        let mut a = DiamondSquareCpu::new(params.clone()).unwrap();
        let mut b = DiamondSquareCpu::new(params).unwrap();
        a.set_seed_heights(flat_corners()).unwrap();
        b.set_seed_heights(flat_corners()).unwrap();
        a.generate(None).unwrap();
        b.generate(None).unwrap();
        assert_eq!(a.height_map(), b.height_map());

        // Re-running the same instance reseeds and reproduces the grid
        let first = a.height_map();
        a.generate(None).unwrap();
        assert_eq!(a.height_map(), first);
    }

    #[test]
    fn different_seeds_differ() {
        let mut a = DiamondSquareCpu::new(DiamondSquareParams::new(33, 1, 0.8, 0.6)).unwrap();
        let mut b = DiamondSquareCpu::new(DiamondSquareParams::new(33, 2, 0.8, 0.6)).unwrap();
        a.set_seed_heights(flat_corners()).unwrap();
        b.set_seed_heights(flat_corners()).unwrap();
        a.generate(None).unwrap();
        b.generate(None).unwrap();
        assert_ne!(a.height_map(), b.height_map());
    }

    #[test]
    fn get2_is_zero_before_generation_and_out_of_range() {
        let mut ds = DiamondSquareCpu::new(DiamondSquareParams::new(9, 3, 1.0, 1.0)).unwrap();
        ds.set_seed_heights(SeedMap::corners(1.0, 1.0, 1.0, 1.0).unwrap())
            .unwrap();
        assert_eq!(ds.get2(0, 0), 0.0);
        ds.generate(None).unwrap();
        assert_eq!(ds.get2(0, 0), 1.0);
        assert_eq!(ds.get2(-1, 0), 0.0);
        assert_eq!(ds.get2(0, 9), 0.0);
        assert_eq!(ds.get3(3, 100, 5), ds.get2(3, 5));
    }

    #[test]
    fn replacing_seeds_discards_output() {
        let mut ds = DiamondSquareCpu::new(DiamondSquareParams::new(9, 3, 0.5, 0.5)).unwrap();
        ds.set_seed_heights(flat_corners()).unwrap();
        ds.generate(None).unwrap();
        assert!(ds.is_generated());
        ds.set_seed_heights(flat_corners()).unwrap();
        assert!(!ds.is_generated());
        assert_eq!(ds.get2(0, 0), 0.0);
    }
}
