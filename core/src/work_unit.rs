use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::grid::Grid;
use crate::utils::clamp01;
use crate::worker::{Job, lock};

// Source of the random displacement added to every computed cell
pub trait OffsetSource: Send {
    // Next sample, uniform in [-1, 1]
    fn next_offset(&mut self) -> f32;
}

// Sequential ChaCha stream seeded once per run
pub struct SeededOffsets {
    rng: ChaCha8Rng,
}

impl SeededOffsets {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl OffsetSource for SeededOffsets {
    fn next_offset(&mut self) -> f32 {
        self.rng.random_range(-1.0..=1.0)
    }
}

// One RNG shared by every tile of a run; each tile takes the mutex once
// and draws all of its offsets under that guard
pub type SharedOffsets = Arc<Mutex<Box<dyn OffsetSource>>>;

pub fn shared_offsets(source: Box<dyn OffsetSource>) -> SharedOffsets {
    Arc::new(Mutex::new(source))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Diamond,
    Square,
}

// Diamond centres of one level form an n×n lattice:
// lattice (i, j) is cell ((2i + 1)·step, (2j + 1)·step)
pub fn diamond_lattice_side(dimension: usize, step: usize) -> usize {
    (dimension - 1) / (2 * step)
}

// Square centres live on the m×m lattice of spacing `step`,
// at the points whose lattice coordinates have odd sum
pub fn square_lattice_side(dimension: usize, step: usize) -> usize {
    (dimension - 1) / step + 1
}

pub fn lattice_side(kind: StepKind, dimension: usize, step: usize) -> usize {
    match kind {
        StepKind::Diamond => diamond_lattice_side(dimension, step),
        StepKind::Square => square_lattice_side(dimension, step),
    }
}

// A rectangular block of a phase's lattice, clipped to the lattice edge
#[derive(Clone)]
pub struct Tile {
    pub start_x: usize,
    pub start_y: usize,
    pub step_count: usize, // lattice points per side
    pub step_size: usize,
    pub offset_modifier: f32,
    grid: Arc<Grid>,
    offsets: SharedOffsets,
    // Set when the run that produced this tile gave up on it
    abandoned: Arc<AtomicBool>,
}

impl Tile {
    pub fn new(
        start_x: usize,
        start_y: usize,
        step_count: usize,
        step_size: usize,
        offset_modifier: f32,
        grid: Arc<Grid>,
        offsets: SharedOffsets,
    ) -> Self {
        Self {
            start_x,
            start_y,
            step_count,
            step_size,
            offset_modifier,
            grid,
            offsets,
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    // Share a run-wide flag; once it is set the tile neither draws nor writes
    pub fn with_abandon_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abandoned = flag;
        self
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    // Lattice ranges covered by this tile on a lattice of `side` points
    fn ranges(&self, side: usize) -> (std::ops::Range<usize>, std::ops::Range<usize>) {
        let xs = self.start_x.min(side)..(self.start_x + self.step_count).min(side);
        let ys = self.start_y.min(side)..(self.start_y + self.step_count).min(side);
        (xs, ys)
    }

    // Cells of the diamond phase inside this tile that still need a value
    fn diamond_cells(&self) -> Vec<(usize, usize)> {
        let s = self.step_size;
        let (xs, ys) = self.ranges(diamond_lattice_side(self.grid.dimension(), s));
        ys.flat_map(|j| xs.clone().map(move |i| ((2 * i + 1) * s, (2 * j + 1) * s)))
            .filter(|&(x, y)| !self.grid.is_set(x, y))
            .collect()
    }

    fn square_cells(&self) -> Vec<(usize, usize)> {
        let s = self.step_size;
        let (xs, ys) = self.ranges(square_lattice_side(self.grid.dimension(), s));
        ys.flat_map(|b| xs.clone().map(move |a| (a, b)))
            .filter(|&(a, b)| (a + b) % 2 == 1) // skip corners and diamond centres
            .map(|(a, b)| (a * s, b * s))
            .filter(|&(x, y)| !self.grid.is_set(x, y))
            .collect()
    }

    fn run_diamond(&self) {
        self.fill(self.diamond_cells(), |g, cx, cy, d| {
            (g.sample_clamped(cx - d, cy - d)
                + g.sample_clamped(cx + d, cy - d)
                + g.sample_clamped(cx - d, cy + d)
                + g.sample_clamped(cx + d, cy + d))
                * 0.25
        });
    }

    fn run_square(&self) {
        self.fill(self.square_cells(), |g, cx, cy, d| {
            (g.sample_clamped(cx - d, cy)
                + g.sample_clamped(cx + d, cy)
                + g.sample_clamped(cx, cy - d)
                + g.sample_clamped(cx, cy + d))
                * 0.25
        });
    }

    // Average, displace, clamp and store every cell. Offsets are drawn up
    // front so a fault in the source leaves the whole tile unset.
    fn fill(&self, cells: Vec<(usize, usize)>, average: impl Fn(&Grid, i64, i64, i64) -> f32) {
        if cells.is_empty() || self.is_abandoned() {
            return;
        }
        let draws: Vec<f32> = {
            let mut source = lock(&self.offsets);
            cells.iter().map(|_| source.next_offset()).collect()
        };
        let d = self.step_size as i64;
        for ((x, y), r) in cells.into_iter().zip(draws) {
            let avg = average(&self.grid, x as i64, y as i64, d);
            self.grid.set_once(x, y, clamp01(avg + r * self.offset_modifier));
        }
    }
}

// What a pool worker receives: one tile of one phase
#[derive(Clone)]
pub enum WorkUnit {
    Diamond(Tile),
    Square(Tile),
}

impl WorkUnit {
    pub fn new(kind: StepKind, tile: Tile) -> Self {
        match kind {
            StepKind::Diamond => WorkUnit::Diamond(tile),
            StepKind::Square => WorkUnit::Square(tile),
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            WorkUnit::Diamond(_) => StepKind::Diamond,
            WorkUnit::Square(_) => StepKind::Square,
        }
    }

    pub fn tile(&self) -> &Tile {
        match self {
            WorkUnit::Diamond(t) | WorkUnit::Square(t) => t,
        }
    }
}

impl Job for WorkUnit {
    fn execute(self) {
        match self {
            WorkUnit::Diamond(tile) => tile.run_diamond(),
            WorkUnit::Square(tile) => tile.run_square(),
        }
    }
}
