use std::time::Instant;

use image::DynamicImage;
use rayon::prelude::*;

use crate::NoiseGenerator;
use crate::config::DiamondSquareParams;
use crate::error::{Result, TerrainError};
use crate::grid::{Grid, SeedMap};
use crate::utils::{HeightMap2D, clamp01};

const DIAGONAL: [(i64, i64); 4] = [(-1, -1), (1, -1), (-1, 1), (1, 1)];
const ORTHOGONAL: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];

// Dedicated thread pool standing in for a compute-dispatch device
pub struct ParallelBackend {
    pool: rayon::ThreadPool,
}

impl ParallelBackend {
    // threads == 0 lets rayon pick one thread per logical CPU
    pub fn acquire(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("ds-parallel-{i}"))
            .build()
            .map_err(|e| {
                log::error!("failed to acquire parallel backend: {e}");
                TerrainError::BackendUnavailable(e.to_string())
            })?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

// PCG-style integer hash, cheap enough to run once per cell
#[inline]
fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

// Per-level seed so every level gets an independent offset field
pub fn level_seed(seed: u64, step: usize) -> u32 {
    pcg_hash(seed as u32 ^ pcg_hash((seed >> 32) as u32 ^ pcg_hash(step as u32)))
}

// Offset in [-1, 1] as a pure function of the cell and the level seed
pub fn cell_offset(x: usize, y: usize, level_seed: u32) -> f32 {
    let h = pcg_hash(x as u32 ^ pcg_hash(y as u32 ^ pcg_hash(level_seed)));
    (h as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32
}

// Diamond centres sit at odd multiples of `step` on both axes
#[inline]
pub fn is_diamond_center(x: usize, y: usize, step: usize) -> bool {
    x % (2 * step) == step && y % (2 * step) == step
}

// Square centres sit on the `step` lattice with exactly one odd coordinate
#[inline]
pub fn is_square_center(x: usize, y: usize, step: usize) -> bool {
    x % step == 0 && y % step == 0 && (x / step + y / step) % 2 == 1
}

// Out-of-range neighbours contribute nothing and are left out of the divisor
fn safe_average(grid: &Grid, x: usize, y: usize, step: usize, dirs: &[(i64, i64); 4]) -> f32 {
    let (x, y, d) = (x as i64, y as i64, step as i64);
    let (sum, count) = dirs
        .iter()
        .filter_map(|&(dx, dy)| grid.sample_checked(x + dx * d, y + dy * d))
        .fold((0.0f32, 0u32), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f32 }
}

// One fully parallel pass: every cell decides for itself whether it takes part
fn pass(grid: &Grid, step: usize, level_seed: u32, modifier: f32, square: bool) {
    let d = grid.dimension();
    (0..d * d).into_par_iter().for_each(|i| {
        let (x, y) = (i % d, i / d);
        let (member, dirs) = if square {
            (is_square_center(x, y, step), &ORTHOGONAL)
        } else {
            (is_diamond_center(x, y, step), &DIAGONAL)
        };
        if !member || grid.is_set(x, y) {
            return;
        }
        let avg = safe_average(grid, x, y, step, dirs);
        grid.set_once(x, y, clamp01(avg + cell_offset(x, y, level_seed) * modifier));
    });
}

// Diamond–Square with per-cell parallel passes and hashed offsets. Output is
// independent of the thread count.
pub struct DiamondSquareParallel {
    params: DiamondSquareParams,
    seeds: Option<SeedMap>,
    grid: Option<Grid>,
}

impl DiamondSquareParallel {
    pub fn new(params: DiamondSquareParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            seeds: None,
            grid: None,
        })
    }

    pub fn params(&self) -> &DiamondSquareParams {
        &self.params
    }

    pub fn set_seed_heights(&mut self, seeds: SeedMap) -> Result<()> {
        seeds.spacing_for(self.params.dimension)?;
        self.seeds = Some(seeds);
        self.grid = None;
        Ok(())
    }

    pub fn set_height_seeds_from_image(&mut self, img: &DynamicImage) -> Result<()> {
        self.set_seed_heights(SeedMap::from_image(img)?)
    }

    // Fails with BackendUnavailable when no backend is supplied; callers are
    // expected to fall back to the CPU engine.
    pub fn generate(&mut self, backend: Option<&ParallelBackend>) -> Result<()> {
        let Some(backend) = backend else {
            log::error!("parallel diamond-square requested without a backend");
            return Err(TerrainError::BackendUnavailable(
                "no parallel backend supplied".into(),
            ));
        };
        let seeds = self.seeds.as_ref().ok_or(TerrainError::MissingSeedMap)?;
        let dimension = self.params.dimension;
        let grid = Grid::new(dimension)?;
        grid.apply_seeds(seeds)?;
        self.grid = None;

        let start = Instant::now();
        let (seed, persistence) = (self.params.seed, self.params.persistence);
        let mut amplitude = self.params.amplitude;
        backend.pool.install(|| {
            let mut step = dimension / 2;
            while step > 0 {
                let modifier = clamp01(amplitude);
                let level = level_seed(seed, step);
                // Each pass returns only when every cell is done, which is
                // the barrier between the two phases
                pass(&grid, step, level, modifier, false);
                pass(&grid, step, level ^ 0x9E37_79B9, modifier, true);
                amplitude *= persistence;
                step /= 2;
            }
        });

        log::info!(
            "parallel diamond-square {dimension}x{dimension} generated in {:?} on {} threads",
            start.elapsed(),
            backend.threads()
        );
        self.grid = Some(grid);
        Ok(())
    }

    pub fn is_generated(&self) -> bool {
        self.grid.is_some()
    }

    pub fn height_map(&self) -> Option<HeightMap2D> {
        self.grid.as_ref().map(Grid::to_height_map)
    }

    pub fn unset_cells(&self) -> Option<usize> {
        self.grid.as_ref().map(Grid::unset_count)
    }
}

impl NoiseGenerator for DiamondSquareParallel {
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

    fn engine(dimension: usize, seed: u64, amplitude: f32) -> DiamondSquareParallel {
        let mut ds =
            DiamondSquareParallel::new(DiamondSquareParams::new(dimension, seed, amplitude, 0.5))
                .unwrap();
        ds.set_seed_heights(SeedMap::corners(0.2, 0.4, 0.6, 0.8).unwrap())
            .unwrap();
        ds
    }

    #[test]
    fn center_predicates() {
        assert!(is_diamond_center(2, 2, 2));
        assert!(is_diamond_center(6, 2, 2));
        assert!(!is_diamond_center(4, 2, 2));
        assert!(is_square_center(2, 0, 2));
        assert!(is_square_center(4, 2, 2));
        assert!(!is_square_center(2, 2, 2));
        assert!(!is_square_center(4, 4, 2));
        assert!(!is_square_center(3, 0, 2));
    }

    #[test]
    fn offsets_are_pure_and_bounded() {
        let s = level_seed(77, 4);
        assert_eq!(cell_offset(3, 9, s), cell_offset(3, 9, s));
        assert_ne!(level_seed(77, 4), level_seed(77, 2));
        for y in 0..64 {
            for x in 0..64 {
                assert!((-1.0..=1.0).contains(&cell_offset(x, y, s)));
            }
        }
    }

    #[test]
    fn missing_backend_is_reported() {
        let mut ds = engine(9, 1, 0.5);
        assert!(matches!(
            ds.generate(None),
            Err(TerrainError::BackendUnavailable(_))
        ));
        assert!(!ds.is_generated());
    }

    #[test]
    fn output_independent_of_thread_count() {
        let one = ParallelBackend::acquire(1).unwrap();
        let four = ParallelBackend::acquire(4).unwrap();
        let mut a = engine(65, 11, 0.7);
        let mut b = engine(65, 11, 0.7);
        a.generate(Some(&one)).unwrap();
        b.generate(Some(&four)).unwrap();
        assert_eq!(a.height_map(), b.height_map());
        assert_eq!(a.unset_cells(), Some(0));
    }

    #[test]
    fn safe_sample_excludes_out_of_range() {
        // Without noise an edge midpoint averages only its in-range neighbours
        let backend = ParallelBackend::acquire(2).unwrap();
        let mut ds = engine(3, 5, 0.0);
        ds.generate(Some(&backend)).unwrap();
        let centre = (0.2 + 0.4 + 0.6 + 0.8) / 4.0;
        assert!((ds.get2(1, 1) - centre).abs() < 1e-6);
        // (1, 0): left 0.2, right 0.4, down centre; up is outside
        let top = (0.2 + 0.4 + centre) / 3.0;
        assert!((ds.get2(1, 0) - top).abs() < 1e-6);
    }

    #[test]
    fn values_stay_in_unit_range() {
        let backend = ParallelBackend::acquire(0).unwrap();
        let mut ds = engine(129, 3, 1.0);
        ds.generate(Some(&backend)).unwrap();
        let map = ds.height_map().unwrap();
        assert!(map.iter().flatten().all(|v| (0.0..=1.0).contains(v)));
        // Seeds survive
        assert_eq!(ds.get2(0, 0), 0.2);
        assert_eq!(ds.get2(128, 128), 0.8);
    }
}
