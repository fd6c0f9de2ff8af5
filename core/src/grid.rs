use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use image::DynamicImage;

use crate::error::{Result, TerrainError};
use crate::utils::{HeightMap2D, is_valid_dimension};

// Square height buffer shared by every job of a phase.
//
// Cells are atomics so the buffer can be read and written from several
// threads without locks. Within one phase the set of written cells of any
// two jobs is disjoint, and no job reads a cell written in the same phase
// (diamond centres read only corners, square centres read only corners and
// diamond centres). The pool barrier between phases orders the relaxed
// stores before the next phase's loads.
pub struct Grid {
    dimension: usize,
    values: Vec<AtomicU32>, // f32 bit patterns, row-major
    is_set: Vec<AtomicBool>,
}

impl Grid {
    pub fn new(dimension: usize) -> Result<Self> {
        if !is_valid_dimension(dimension) {
            return Err(TerrainError::InvalidDimension(dimension));
        }
        let cells = dimension * dimension;
        Ok(Self {
            dimension,
            values: (0..cells).map(|_| AtomicU32::new(0.0f32.to_bits())).collect(),
            is_set: (0..cells).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        y * self.dimension + x
    }

    #[inline]
    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        let d = self.dimension as i64;
        (0..d).contains(&x) && (0..d).contains(&y)
    }

    #[inline]
    pub fn value(&self, x: usize, y: usize) -> f32 {
        f32::from_bits(self.values[self.index(x, y)].load(Ordering::Relaxed))
    }

    #[inline]
    pub fn is_set(&self, x: usize, y: usize) -> bool {
        self.is_set[self.index(x, y)].load(Ordering::Relaxed)
    }

    // Write-once store. Returns false (and leaves the cell alone) if the
    // cell already holds an authoritative value.
    #[inline]
    pub fn set_once(&self, x: usize, y: usize, v: f32) -> bool {
        let i = self.index(x, y);
        if self.is_set[i].load(Ordering::Relaxed) {
            return false;
        }
        self.values[i].store(v.to_bits(), Ordering::Relaxed);
        self.is_set[i].store(true, Ordering::Relaxed);
        true
    }

    // Sample with coordinates clamped to the grid edge (CPU rule)
    #[inline]
    pub fn sample_clamped(&self, x: i64, y: i64) -> f32 {
        let max = self.dimension as i64 - 1;
        self.value(x.clamp(0, max) as usize, y.clamp(0, max) as usize)
    }

    // Sample that reports out-of-range neighbours as missing (parallel rule)
    #[inline]
    pub fn sample_checked(&self, x: i64, y: i64) -> Option<f32> {
        self.in_bounds(x, y)
            .then(|| self.value(x as usize, y as usize))
    }

    // Copy a seed map onto the lattice at spacing (dimension - 1) / (side - 1)
    pub fn apply_seeds(&self, seeds: &SeedMap) -> Result<()> {
        let step = seeds.spacing_for(self.dimension)?;
        for sy in 0..seeds.side() {
            for sx in 0..seeds.side() {
                self.set_once(sx * step, sy * step, seeds.get(sx, sy));
            }
        }
        Ok(())
    }

    // Cells that never received a value; non-zero means incomplete output
    pub fn unset_count(&self) -> usize {
        self.is_set
            .iter()
            .filter(|s| !s.load(Ordering::Relaxed))
            .count()
    }

    pub fn to_height_map(&self) -> HeightMap2D {
        (0..self.dimension)
            .map(|y| (0..self.dimension).map(|x| self.value(x, y)).collect())
            .collect()
    }
}

// Small square of authoritative heights the full grid is expanded from
#[derive(Debug, Clone, PartialEq)]
pub struct SeedMap {
    side: usize,
    values: Vec<f32>, // row-major, side × side
}

impl SeedMap {
    pub fn new(side: usize, values: Vec<f32>) -> Result<Self> {
        if side < 2 {
            return Err(TerrainError::InvalidSeedMap(format!(
                "side must be at least 2, got {side}"
            )));
        }
        if values.len() != side * side {
            return Err(TerrainError::InvalidSeedMap(format!(
                "expected {} values for side {side}, got {}",
                side * side,
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(TerrainError::InvalidSeedMap(format!(
                "value {bad} is outside [0, 1]"
            )));
        }
        Ok(Self { side, values })
    }

    // 2×2 seed map holding only the four corners
    pub fn corners(top_left: f32, top_right: f32, bottom_left: f32, bottom_right: f32) -> Result<Self> {
        Self::new(2, vec![top_left, top_right, bottom_left, bottom_right])
    }

    // Heights from the red channel of a square image
    pub fn from_image(img: &DynamicImage) -> Result<Self> {
        let (width, height) = (img.width(), img.height());
        if width != height {
            return Err(TerrainError::Image { width, height });
        }
        let rgb = img.to_rgb8();
        let values = rgb.pixels().map(|p| p.0[0] as f32 / 255.0).collect();
        Self::new(width as usize, values)
    }

    pub fn side(&self) -> usize {
        self.side
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.values[y * self.side + x]
    }

    // Grid spacing between neighbouring seeds for a target dimension
    pub fn spacing_for(&self, dimension: usize) -> Result<usize> {
        let span = self.side - 1;
        if dimension < self.side || (dimension - 1) % span != 0 {
            return Err(TerrainError::InvalidSeedMap(format!(
                "side {} does not divide dimension {dimension} evenly",
                self.side
            )));
        }
        Ok((dimension - 1) / span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn grid_starts_unset_and_zero() {
        let g = Grid::new(5).unwrap();
        assert_eq!(g.unset_count(), 25);
        assert_eq!(g.value(4, 4), 0.0);
        assert!(!g.is_set(2, 2));
    }

    #[test]
    fn grid_rejects_bad_dimension() {
        assert!(matches!(Grid::new(6), Err(TerrainError::InvalidDimension(6))));
    }

    #[test]
    fn set_once_never_overwrites() {
        let g = Grid::new(3).unwrap();
        assert!(g.set_once(1, 1, 0.25));
        assert!(!g.set_once(1, 1, 0.75));
        assert_eq!(g.value(1, 1), 0.25);
    }

    #[test]
    fn samplers_handle_edges() {
        let g = Grid::new(3).unwrap();
        g.set_once(0, 0, 0.5);
        // Clamped rule reads the edge cell
        assert_eq!(g.sample_clamped(-1, -3), 0.5);
        // Checked rule reports it missing
        assert_eq!(g.sample_checked(-1, 0), None);
        assert_eq!(g.sample_checked(0, 0), Some(0.5));
    }

    #[test]
    fn seeds_land_on_lattice() {
        let g = Grid::new(5).unwrap();
        let seeds = SeedMap::new(3, vec![0.0, 0.5, 0.0, 0.5, 1.0, 0.5, 0.0, 0.5, 0.0]).unwrap();
        g.apply_seeds(&seeds).unwrap();
        assert_eq!(g.value(2, 2), 1.0);
        assert_eq!(g.value(4, 2), 0.5);
        assert!(g.is_set(4, 4));
        assert!(!g.is_set(1, 1));
        assert_eq!(g.unset_count(), 25 - 9);
    }

    #[test]
    fn seed_map_validation() {
        assert!(SeedMap::new(1, vec![0.0]).is_err());
        assert!(SeedMap::new(2, vec![0.0; 3]).is_err());
        assert!(SeedMap::new(2, vec![0.0, 0.0, 0.0, 1.5]).is_err());
        assert!(SeedMap::new(2, vec![0.0, 0.0, 0.0, f32::NAN]).is_err());
        // Side 4 → span 3 does not divide 8
        let s = SeedMap::new(4, vec![0.0; 16]).unwrap();
        assert!(s.spacing_for(9).is_err());
        assert_eq!(SeedMap::corners(0.0, 0.0, 0.0, 0.0).unwrap().spacing_for(9).unwrap(), 8);
    }

    #[test]
    fn seed_map_from_red_channel() {
        let mut img = RgbImage::new(3, 3);
        img.put_pixel(2, 1, Rgb([255, 10, 10]));
        img.put_pixel(0, 0, Rgb([51, 200, 200]));
        let seeds = SeedMap::from_image(&DynamicImage::ImageRgb8(img)).unwrap();
        assert_eq!(seeds.side(), 3);
        assert_eq!(seeds.get(2, 1), 1.0);
        assert!((seeds.get(0, 0) - 0.2).abs() < 1e-6);
        assert_eq!(seeds.get(1, 1), 0.0);
    }

    #[test]
    fn seed_map_rejects_non_square_image() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(3, 2));
        assert!(matches!(
            SeedMap::from_image(&img),
            Err(TerrainError::Image { width: 3, height: 2 })
        ));
    }
}
