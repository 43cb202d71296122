//! The Life rule and the two ways of applying it.
//!
//! [`step_torus`] advances a whole grid on one thread and is the reference
//! every distributed result has to match. [`step_band`] advances the interior
//! of a band whose vertical neighbours have already been resolved by its
//! halo rows; it optionally splits the band again across local execution
//! units using the same plan the broker uses across workers.

use rayon::prelude::*;

use crate::{
    error::{Error, Result},
    grid::{get_bit, set_bit, BitGrid, CELLS_PER_BYTE},
    partition::plan,
};

const NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// B3/S23.
#[inline]
pub fn next_state(alive: bool, live_neighbours: u8) -> bool {
    matches!((alive, live_neighbours), (true, 2) | (true, 3) | (false, 3))
}

/// Advances a whole toroidal grid by one generation on the calling thread.
pub fn step_torus(grid: &BitGrid) -> BitGrid {
    let mut next = grid.clone();
    for y in 0..grid.height() {
        for x in 0..grid.width() {
            let live = NEIGHBOURS
                .iter()
                .filter(|(dx, dy)| grid.get_wrapped(x as isize + dx, y as isize + dy))
                .count() as u8;
            next.set(x, y, next_state(grid.get(x, y), live));
        }
    }
    next
}

/// Advances the interior rows of a packed band.
///
/// `band` holds `interior + 2` rows of `width` cells: one halo row, the
/// interior, then another halo row. Columns wrap; rows do not. Returns the
/// `interior` updated rows packed the same way. With `units > 1` the interior
/// is re-planned into that many sub-bands which are stepped in parallel and
/// reassembled in plan order; the result is identical either way.
pub fn step_band(band: &[u8], width: usize, units: usize) -> Vec<u8> {
    let stride = width / CELLS_PER_BYTE;
    if stride == 0 || band.len() < 2 * stride {
        return Vec::new();
    }
    let interior = band.len() / stride - 2;
    if units <= 1 || interior < 2 {
        return step_band_once(band, width);
    }

    let parts = plan(interior, units.min(interior));
    let stepped: Vec<Vec<u8>> = parts
        .par_iter()
        // sub-band rows [start, end + 2) are interior [start, end) plus halos
        .map(|part| step_band(&band[part.start * stride..(part.end + 2) * stride], width, 1))
        .collect();
    stepped.concat()
}

fn step_band_once(band: &[u8], width: usize) -> Vec<u8> {
    let stride = width / CELLS_PER_BYTE;
    let interior = band.len() / stride - 2;
    let row = |y: usize| &band[y * stride..(y + 1) * stride];

    let mut out = vec![0u8; interior * stride];
    for y in 1..=interior {
        let out_row = &mut out[(y - 1) * stride..y * stride];
        for x in 0..width {
            let mut live = 0u8;
            for (dx, dy) in NEIGHBOURS {
                let nx = (x as isize + dx + width as isize) as usize % width;
                let ny = (y as isize + dy) as usize;
                if get_bit(row(ny), nx) {
                    live += 1;
                }
            }
            if next_state(get_bit(row(y), x), live) {
                set_bit(out_row, x, true);
            }
        }
    }
    out
}

/// Checks a band's shape and steps it, returning the interior as a grid.
pub fn apply(band: &BitGrid, interior_rows: usize, units: usize) -> Result<BitGrid> {
    band.validate()?;
    if band.height() != interior_rows + 2 {
        return Err(Error::invalid_grid(format!(
            "band of {} rows cannot carry {interior_rows} interior rows",
            band.height()
        )));
    }
    let rows = step_band(band.as_bytes(), band.width(), units);
    BitGrid::from_bytes(band.width(), interior_rows, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn glider(width: usize, height: usize) -> BitGrid {
        BitGrid::from_fn(width, height, |x, y| {
            matches!((x, y), (1, 0) | (2, 1) | (0, 2) | (1, 2) | (2, 2))
        })
        .unwrap()
    }

    /// Steps a grid by cutting it into `workers` bands the way the broker
    /// does and stitching the results back together.
    fn step_partitioned(grid: &BitGrid, workers: usize, units: usize) -> BitGrid {
        let mut next = grid.clone();
        for part in plan(grid.height(), workers) {
            let band = part.band(grid).unwrap();
            let rows = apply(&band, part.len(), units).unwrap();
            next.replace_rows(part.start, rows.as_bytes());
        }
        next
    }

    #[test]
    fn rule_table() {
        for live in 0..=8 {
            assert_eq!(next_state(true, live), live == 2 || live == 3);
            assert_eq!(next_state(false, live), live == 3);
        }
    }

    #[test]
    fn blinker_oscillates() {
        let horizontal =
            BitGrid::from_fn(8, 5, |x, y| y == 2 && (1..=3).contains(&x)).unwrap();
        let vertical = BitGrid::from_fn(8, 5, |x, y| x == 2 && (1..=3).contains(&y)).unwrap();
        assert_eq!(step_torus(&horizontal), vertical);
        assert_eq!(step_torus(&vertical), horizontal);
    }

    #[test]
    fn glider_returns_after_a_full_lap() {
        // a glider moves one cell diagonally every four generations
        let start = glider(8, 8);
        let mut grid = start.clone();
        for _ in 0..32 {
            grid = step_torus(&grid);
            assert_eq!(grid.alive_count(), 5);
        }
        assert_eq!(grid, start);
    }

    #[test]
    fn vertical_neighbours_wrap_between_first_and_last_row() {
        // a blinker straddling the top edge
        let grid =
            BitGrid::from_fn(8, 6, |x, y| x == 3 && (y == 5 || y == 0 || y == 1)).unwrap();
        let next = step_torus(&grid);
        let expected = BitGrid::from_fn(8, 6, |x, y| y == 0 && (2..=4).contains(&x)).unwrap();
        assert_eq!(next, expected);
        assert_eq!(step_partitioned(&grid, 3, 1), expected);
    }

    #[test]
    fn horizontal_neighbours_wrap_between_first_and_last_column() {
        let grid =
            BitGrid::from_fn(16, 5, |x, y| y == 2 && (x == 15 || x == 0 || x == 1)).unwrap();
        let expected =
            BitGrid::from_fn(16, 5, |x, y| x == 0 && (1..=3).contains(&y)).unwrap();
        assert_eq!(step_torus(&grid), expected);
        assert_eq!(step_partitioned(&grid, 2, 2), expected);
    }

    #[test]
    fn partitioning_never_changes_the_result() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for (width, height) in [(8, 1), (8, 3), (16, 10), (24, 17), (64, 64)] {
            let grid = BitGrid::random(width, height, 0.35, &mut rng).unwrap();
            let expected = step_torus(&grid);
            for workers in 1..=7 {
                for units in [1, 2, 3, 8] {
                    assert_eq!(
                        step_partitioned(&grid, workers, units),
                        expected,
                        "{width}x{height} over {workers} workers x {units} units"
                    );
                }
            }
        }
    }

    #[test]
    fn empty_and_degenerate_bands() {
        assert!(step_band(&[0, 0], 8, 4).is_empty());
        assert!(step_band(&[], 0, 1).is_empty());
        let band = BitGrid::new(8, 3).unwrap();
        assert!(apply(&band, 2, 1).is_err());
        assert_eq!(apply(&band, 1, 1).unwrap().height(), 1);
    }
}
