//! Splitting a grid's rows into near-equal bands.

use crate::{error::Result, grid::BitGrid};

/// A contiguous half-open row range `[start, end)` handed to one executor for
/// one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// Position of this partition in the plan.
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Indices of the rows directly above and below this partition on a
    /// torus of `height` rows.
    pub fn halo(&self, height: usize) -> (usize, usize) {
        ((self.start + height - 1) % height, self.end % height)
    }

    /// Copies out this partition's band: the row above, the interior rows,
    /// then the row below, so the result is `len() + 2` rows tall.
    pub fn band(&self, grid: &BitGrid) -> Result<BitGrid> {
        let (above, below) = self.halo(grid.height());
        let mut bits = Vec::with_capacity((self.len() + 2) * grid.stride());
        bits.extend_from_slice(grid.row(above));
        bits.extend_from_slice(grid.rows(self.start, self.end));
        bits.extend_from_slice(grid.row(below));
        BitGrid::from_bytes(grid.width(), self.len() + 2, bits)
    }
}

/// Row counts for `count` partitions of `height` rows: the first
/// `height % count` get one extra row.
pub fn sizes(height: usize, count: usize) -> Vec<usize> {
    if count == 0 {
        return Vec::new();
    }
    let (base, remainder) = (height / count, height % count);
    (0..count)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Tiles `[0, height)` with `count` partitions whose sizes differ by at most
/// one row.
pub fn plan(height: usize, count: usize) -> Vec<Partition> {
    let mut start = 0;
    sizes(height, count)
        .into_iter()
        .enumerate()
        .map(|(index, size)| {
            let partition = Partition {
                index,
                start,
                end: start + size,
            };
            start += size;
            partition
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_rows_over_four_partitions() {
        assert_eq!(sizes(10, 4), vec![3, 3, 2, 2]);
        let ranges: Vec<_> = plan(10, 4).iter().map(|p| (p.start, p.end)).collect();
        assert_eq!(ranges, vec![(0, 3), (3, 6), (6, 8), (8, 10)]);
    }

    #[test]
    fn plans_tile_the_height_evenly() {
        for height in 1..60 {
            for count in 1..12 {
                let parts = plan(height, count);
                assert_eq!(parts.len(), count);
                assert_eq!(parts.iter().map(Partition::len).sum::<usize>(), height);
                let mut next = 0;
                for (i, part) in parts.iter().enumerate() {
                    assert_eq!(part.index, i);
                    assert_eq!(part.start, next);
                    next = part.end;
                }
                let max = parts.iter().map(Partition::len).max().unwrap();
                let min = parts.iter().map(Partition::len).min().unwrap();
                assert!(max - min <= 1, "{height} rows over {count}");
            }
        }
    }

    #[test]
    fn more_partitions_than_rows_leaves_trailing_ones_empty() {
        let parts = plan(2, 4);
        assert_eq!(sizes(2, 4), vec![1, 1, 0, 0]);
        assert!(parts[3].is_empty());
        assert_eq!(parts[3].start, 2);
    }

    #[test]
    fn halo_rows_wrap_at_the_edges() {
        let parts = plan(10, 4);
        assert_eq!(parts[0].halo(10), (9, 3));
        assert_eq!(parts[1].halo(10), (2, 6));
        assert_eq!(parts[3].halo(10), (7, 0));
        assert_eq!(plan(1, 1)[0].halo(1), (0, 0));
    }

    #[test]
    fn band_is_halo_above_interior_halo_below() {
        let grid = BitGrid::from_fn(8, 6, |x, y| x == y).unwrap();
        let part = plan(6, 2)[0];
        let band = part.band(&grid).unwrap();
        assert_eq!(band.height(), 5);
        assert_eq!(band.row(0), grid.row(5));
        assert_eq!(band.rows(1, 4), grid.rows(0, 3));
        assert_eq!(band.row(4), grid.row(3));
    }
}
