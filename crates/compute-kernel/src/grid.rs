//! Launch index spaces.

use std::fmt;
use std::ops::Range;

/// One dimension of a launch grid.
///
/// Iteration yields `start..start + padded_extent`. Padding is only ever
/// added through [`GridRange::padded_to`]; the logical [`GridRange::extent`]
/// is what compute functions see, so padded indices can be skipped with
/// `if i >= n { return; }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridRange {
    start: u32,
    extent: u32,
    padded: u32,
}

impl GridRange {
    pub fn new(start: u32, extent: u32) -> Self {
        Self {
            start,
            extent,
            padded: extent,
        }
    }

    pub fn from_extent(extent: u32) -> Self {
        Self::new(0, extent)
    }

    /// Round the iterated extent up to a multiple of `block`.
    pub fn padded_to(self, block: u32) -> Self {
        if block <= 1 {
            return self;
        }
        Self {
            padded: self.extent.div_ceil(block).saturating_mul(block),
            ..self
        }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn extent(&self) -> u32 {
        self.extent
    }

    pub fn padded_extent(&self) -> u32 {
        self.padded
    }

    pub fn is_padded(&self) -> bool {
        self.padded != self.extent
    }

    pub fn is_empty(&self) -> bool {
        self.extent == 0
    }

    /// One past the last iterated index, or `None` when the padded range
    /// does not fit in `u32`.
    pub fn end(&self) -> Option<u32> {
        self.start.checked_add(self.padded)
    }

    /// Iterated indices, including padding.
    pub fn indices(&self) -> Range<u32> {
        self.start..self.start.saturating_add(self.padded)
    }

    /// Whether `index` lies in the logical (unpadded) range.
    pub fn contains(&self, index: u32) -> bool {
        index >= self.start && index - self.start < self.extent
    }
}

impl IntoIterator for GridRange {
    type Item = u32;
    type IntoIter = Range<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.indices()
    }
}

impl IntoIterator for &GridRange {
    type Item = u32;
    type IntoIter = Range<u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.indices()
    }
}

impl fmt::Display for GridRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.start.saturating_add(self.extent))?;
        if self.is_padded() {
            write!(f, " padded to {}", self.padded)?;
        }
        Ok(())
    }
}

/// Total number of iterated points across `grid`.
pub fn grid_points(grid: &[GridRange]) -> u64 {
    grid.iter().map(|r| r.padded_extent() as u64).product()
}

/// True when any dimension is empty, so a launch has nothing to do.
pub fn is_trivially_empty(grid: &[GridRange]) -> bool {
    grid.iter().any(GridRange::is_empty)
}
