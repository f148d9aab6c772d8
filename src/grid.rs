//! Fixed-resolution geographic grid.
//!
//! Space is cut into 0.01° × 0.01° cells addressed by their lower-left corner.
//! Callers describe query areas with a compact range grammar:
//!
//! ```text
//! RANGE := lat_lo "-" lat_hi ":" lng_lo "-" lng_hi
//! SPEC  := RANGE ("," RANGE)*
//! ```
//!
//! Each range expands to the unit cells it covers, half-open on both axes.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Cells per degree on both axes.
pub const CELLS_PER_DEGREE: i64 = 100;

// Absorbs binary representation error so that "0.29" lands in cell 29, not 28.
const EPSILON: f64 = 1e-9;

fn cell_index(degrees: f64) -> i64 {
    (degrees * CELLS_PER_DEGREE as f64 + EPSILON).floor() as i64
}

fn cell_degrees(index: i64) -> f64 {
    index as f64 / CELLS_PER_DEGREE as f64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    Malformed(String),
    Empty,
    TooManyCells { requested: u64, max: usize },
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridError::Malformed(s) => write!(f, "malformed grid range: {s:?}"),
            GridError::Empty => write!(f, "grid spec covers no cells"),
            GridError::TooManyCells { requested, max } => {
                write!(f, "grid spec covers {requested} cells, limit is {max}")
            }
        }
    }
}

impl std::error::Error for GridError {}

/// Axis-aligned box, half-open `[lo, hi)` on both axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lat_lo: f64,
    pub lat_hi: f64,
    pub lng_lo: f64,
    pub lng_hi: f64,
}

impl BoundingBox {
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        self.lat_lo <= latitude
            && latitude < self.lat_hi
            && self.lng_lo <= longitude
            && longitude < self.lng_hi
    }
}

/// A single grid cell, identified by its lower-left corner in cell units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cell {
    lat: i64,
    lng: i64,
}

impl Cell {
    /// The cell a point falls in (rounded down to the lower-left corner).
    pub fn containing(latitude: f64, longitude: f64) -> Self {
        Self {
            lat: cell_index(latitude),
            lng: cell_index(longitude),
        }
    }

    pub fn bounds(&self) -> BoundingBox {
        BoundingBox {
            lat_lo: cell_degrees(self.lat),
            lat_hi: cell_degrees(self.lat + 1),
            lng_lo: cell_degrees(self.lng),
            lng_hi: cell_degrees(self.lng + 1),
        }
    }

    /// This cell plus every cell within `radius` cells on both axes.
    pub fn neighborhood(&self, radius: i64) -> Vec<Cell> {
        let mut cells = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
        cells.push(*self);
        for dlat in -radius..=radius {
            for dlng in -radius..=radius {
                if dlat == 0 && dlng == 0 {
                    continue;
                }
                cells.push(Cell {
                    lat: self.lat + dlat,
                    lng: self.lng + dlng,
                });
            }
        }
        cells
    }

    /// Canonical `"lat:lng"` topic key, two decimals.
    pub fn id(&self) -> String {
        self.to_string()
    }

    /// Parse a `"lat:lng"` point and return its containing cell.
    pub fn parse_point(s: &str) -> Option<Self> {
        let (lat, lng) = s.trim().split_once(':')?;
        let lat: f64 = lat.trim().parse().ok()?;
        let lng: f64 = lng.trim().parse().ok()?;
        if !lat.is_finite() || !lng.is_finite() {
            return None;
        }
        Some(Self::containing(lat, lng))
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}:{:.2}", cell_degrees(self.lat), cell_degrees(self.lng))
    }
}

/// One contiguous rectangle of cells, `[lo, hi)` in cell units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridRange {
    lat_lo: i64,
    lat_hi: i64,
    lng_lo: i64,
    lng_hi: i64,
}

impl GridRange {
    pub fn cell_count(&self) -> u64 {
        let lat = (self.lat_hi - self.lat_lo).max(0) as u64;
        let lng = (self.lng_hi - self.lng_lo).max(0) as u64;
        lat.saturating_mul(lng)
    }

    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (self.lat_lo..self.lat_hi)
            .flat_map(move |lat| (self.lng_lo..self.lng_hi).map(move |lng| Cell { lat, lng }))
    }
}

impl fmt::Display for GridRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}-{:.2}:{:.2}-{:.2}",
            cell_degrees(self.lat_lo),
            cell_degrees(self.lat_hi),
            cell_degrees(self.lng_lo),
            cell_degrees(self.lng_hi)
        )
    }
}

/// Split `"lo-hi"` at the separating dash; a leading minus belongs to `lo`.
fn parse_axis(s: &str, min: f64, max: f64) -> Option<(i64, i64)> {
    let s = s.trim();
    let sep = s.get(1..)?.find('-')? + 1;
    let lo: f64 = s[..sep].trim().parse().ok()?;
    let hi: f64 = s[sep + 1..].trim().parse().ok()?;
    if !lo.is_finite() || !hi.is_finite() || lo < min || hi > max || lo > hi {
        return None;
    }
    Some((cell_index(lo), cell_index(hi)))
}

impl FromStr for GridRange {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || GridError::Malformed(s.to_string());
        let (lat, lng) = s.split_once(':').ok_or_else(malformed)?;
        let (lat_lo, lat_hi) = parse_axis(lat, -90.0, 90.0).ok_or_else(malformed)?;
        let (lng_lo, lng_hi) = parse_axis(lng, -180.0, 180.0).ok_or_else(malformed)?;
        Ok(Self { lat_lo, lat_hi, lng_lo, lng_hi })
    }
}

/// One or more possibly overlapping ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridSpec {
    ranges: Vec<GridRange>,
}

impl GridSpec {
    pub fn ranges(&self) -> &[GridRange] {
        &self.ranges
    }

    /// Upper bound on the cells covered (overlaps counted twice). Computed
    /// without enumerating, so oversized specs are cheap to reject.
    pub fn cell_count(&self) -> u64 {
        self.ranges
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.cell_count()))
    }

    /// Distinct cells, in first-seen order.
    pub fn cells(&self) -> Vec<Cell> {
        let mut seen = HashSet::new();
        self.ranges
            .iter()
            .flat_map(|r| r.cells())
            .filter(|c| seen.insert(*c))
            .collect()
    }
}

impl FromStr for GridSpec {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(GridError::Malformed(s.to_string()));
        }
        let ranges = s
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<GridRange>, _>>()?;
        Ok(Self { ranges })
    }
}

impl fmt::Display for GridSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

/// Translates grid specs into query cells, enforcing the fan-out cap.
#[derive(Debug, Clone, Copy)]
pub struct GridIndexer {
    max_cells: usize,
}

impl GridIndexer {
    pub fn new(max_cells: usize) -> Self {
        Self { max_cells }
    }

    pub fn max_cells(&self) -> usize {
        self.max_cells
    }

    /// Parse `spec` and expand it to its cells. Oversized, empty or malformed
    /// specs are rejected, never truncated.
    pub fn cells_covering(&self, spec: &str) -> Result<Vec<Cell>, GridError> {
        let spec: GridSpec = spec.parse()?;
        let requested = spec.cell_count();
        if requested > self.max_cells as u64 {
            return Err(GridError::TooManyCells {
                requested,
                max: self.max_cells,
            });
        }
        let cells = spec.cells();
        if cells.is_empty() {
            return Err(GridError::Empty);
        }
        Ok(cells)
    }

    pub fn cell_containing(&self, latitude: f64, longitude: f64) -> Cell {
        Cell::containing(latitude, longitude)
    }
}

impl Default for GridIndexer {
    fn default() -> Self {
        Self::new(crate::limits::MAX_GRID_CELLS)
    }
}
