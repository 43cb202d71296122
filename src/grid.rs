//! Packed boolean grids.
//!
//! Cells are stored row-major, eight to a byte, with cell `x` of a row living
//! in byte `x / 8` at bit `x % 8`. A set bit is a live cell. Widths must be a
//! multiple of eight; the accessors do not check this, [`BitGrid::validate`]
//! does and is run wherever a grid enters the system.

use rand::Rng;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of cells packed into one byte of a row.
pub const CELLS_PER_BYTE: usize = 8;

/// Returns the state of cell `x` in a packed row.
#[inline]
pub fn get_bit(row: &[u8], x: usize) -> bool {
    row[x / CELLS_PER_BYTE] & (1 << (x % CELLS_PER_BYTE)) != 0
}

/// Sets the state of cell `x` in a packed row.
#[inline]
pub fn set_bit(row: &mut [u8], x: usize, alive: bool) {
    let mask = 1 << (x % CELLS_PER_BYTE);
    if alive {
        row[x / CELLS_PER_BYTE] |= mask;
    } else {
        row[x / CELLS_PER_BYTE] &= !mask;
    }
}

/// Number of cells a packed row holds.
#[inline]
pub fn width_in_bits(row: &[u8]) -> usize {
    row.len() * CELLS_PER_BYTE
}

/// Maps a possibly out-of-range coordinate onto `[0, modulus)`.
#[inline]
pub fn wrap(value: isize, modulus: usize) -> usize {
    value.rem_euclid(modulus as isize) as usize
}

/// A toroidal grid of cells packed into bytes.
#[derive(Archive, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct BitGrid {
    width: u32,
    height: u32,
    bits: Vec<u8>,
}

impl BitGrid {
    /// Creates a grid with every cell dead. Fails for widths that are not a
    /// whole number of bytes or dimensions that do not fit a `u32`.
    pub fn new(width: usize, height: usize) -> Result<Self> {
        let stride = width / CELLS_PER_BYTE;
        Self::from_bytes(width, height, vec![0; stride.saturating_mul(height)])
    }

    /// Wraps already packed rows, rejecting anything [`validate`] would.
    ///
    /// [`validate`]: BitGrid::validate
    pub fn from_bytes(width: usize, height: usize, bits: Vec<u8>) -> Result<Self> {
        let grid = Self {
            width: u32::try_from(width)
                .map_err(|_| Error::invalid_grid(format!("width {width} is too large")))?,
            height: u32::try_from(height)
                .map_err(|_| Error::invalid_grid(format!("height {height} is too large")))?,
            bits,
        };
        grid.validate()?;
        Ok(grid)
    }

    /// Builds a grid by asking `alive` about every `(x, y)`.
    pub fn from_fn(
        width: usize,
        height: usize,
        mut alive: impl FnMut(usize, usize) -> bool,
    ) -> Result<Self> {
        let mut grid = Self::new(width, height)?;
        for y in 0..height {
            for x in 0..width {
                if alive(x, y) {
                    grid.set(x, y, true);
                }
            }
        }
        Ok(grid)
    }

    /// Fills a grid at random, each cell alive with probability `density`.
    pub fn random<R: Rng + ?Sized>(
        width: usize,
        height: usize,
        density: f64,
        rng: &mut R,
    ) -> Result<Self> {
        Self::from_fn(width, height, |_, _| rng.gen_bool(density))
    }

    /// Builds a grid without checking it, the way a hostile peer could.
    #[cfg(test)]
    pub(crate) fn from_raw_parts(width: u32, height: u32, bits: Vec<u8>) -> Self {
        Self {
            width,
            height,
            bits,
        }
    }

    /// Checks the packing invariants: the width is a whole number of bytes
    /// and the storage holds exactly `height` rows of that width.
    pub fn validate(&self) -> Result<()> {
        let width = self.width();
        if width % CELLS_PER_BYTE != 0 {
            return Err(Error::invalid_grid(format!(
                "width {width} is not a multiple of {CELLS_PER_BYTE}"
            )));
        }
        let expected = self.stride() * self.height();
        if self.bits.len() != expected {
            return Err(Error::invalid_grid(format!(
                "{}x{} grid needs {expected} bytes, got {}",
                width,
                self.height(),
                self.bits.len()
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }

    pub fn height(&self) -> usize {
        self.height as usize
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width() / CELLS_PER_BYTE
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        get_bit(self.row(y), x)
    }

    pub fn set(&mut self, x: usize, y: usize, alive: bool) {
        set_bit(self.row_mut(y), x, alive)
    }

    /// Reads a cell with both coordinates wrapped around the torus.
    pub fn get_wrapped(&self, x: isize, y: isize) -> bool {
        self.get(wrap(x, self.width()), wrap(y, self.height()))
    }

    pub fn row(&self, y: usize) -> &[u8] {
        let stride = self.stride();
        &self.bits[y * stride..(y + 1) * stride]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [u8] {
        let stride = self.stride();
        &mut self.bits[y * stride..(y + 1) * stride]
    }

    /// The packed bytes of rows `[start, end)`.
    pub fn rows(&self, start: usize, end: usize) -> &[u8] {
        let stride = self.stride();
        &self.bits[start * stride..end * stride]
    }

    /// Overwrites rows starting at `start` with already packed rows.
    pub fn replace_rows(&mut self, start: usize, rows: &[u8]) {
        let offset = start * self.stride();
        self.bits[offset..offset + rows.len()].copy_from_slice(rows);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bits
    }

    pub fn alive_count(&self) -> u64 {
        self.bits.iter().map(|byte| byte.count_ones() as u64).sum()
    }

    /// Coordinates of every live cell, row by row.
    pub fn alive_cells(&self) -> Vec<(usize, usize)> {
        let mut cells = Vec::new();
        for y in 0..self.height() {
            let row = self.row(y);
            for x in 0..width_in_bits(row) {
                if get_bit(row, x) {
                    cells.push((x, y));
                }
            }
        }
        cells
    }
}

impl std::fmt::Debug for BitGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "BitGrid {}x{}", self.width, self.height)?;
        if self.validate().is_err() {
            return write!(f, "  <{} bytes, malformed>", self.bits.len());
        }
        for y in 0..self.height() {
            let row: String = (0..self.width())
                .map(|x| if self.get(x, y) { '#' } else { '.' })
                .collect();
            writeln!(f, "  {row}")?;
        }
        Ok(())
    }
}
