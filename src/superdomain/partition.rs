//! Block decomposition of an array over a number of parts.

use crate::slab::Region;

/// Block partitioning of an array over `parts` pieces.
///
/// Only the leading `split_axes` axes are divided; the rest stay whole on
/// every part. Part indices at or beyond `parts` own empty regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    dims: Vec<usize>,
    grid: Vec<usize>,
    parts: usize,
}

impl Partition {
    /// Partition `dims` over `parts` pieces, splitting every axis.
    pub fn new(dims: &[usize], parts: usize) -> Self {
        Self::with_split_axes(dims, dims.len(), parts)
    }

    /// Partition `dims` over `parts` pieces, splitting only the leading
    /// `split_axes` axes.
    pub fn with_split_axes(dims: &[usize], split_axes: usize, parts: usize) -> Self {
        let parts = parts.max(1);
        Self {
            dims: dims.to_vec(),
            grid: process_grid(dims, split_axes.min(dims.len()), parts),
            parts,
        }
    }

    /// Number of pieces.
    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Global extents.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of blocks along each axis.
    pub fn grid(&self) -> &[usize] {
        &self.grid
    }

    /// Region owned by part `index`.
    pub fn region(&self, index: usize) -> Region {
        let blocks: usize = self.grid.iter().product();
        if index >= self.parts || index >= blocks {
            return Region::empty(self.dims.len());
        }

        // Row-major coordinates of the block; the last axis varies fastest.
        let mut coords = vec![0; self.grid.len()];
        let mut rest = index;
        for axis in (0..self.grid.len()).rev() {
            coords[axis] = rest % self.grid[axis];
            rest /= self.grid[axis];
        }

        let mut start = Vec::with_capacity(self.dims.len());
        let mut count = Vec::with_capacity(self.dims.len());
        for (axis, &len) in self.dims.iter().enumerate() {
            let (s, c) = block(len, self.grid[axis], coords[axis]);
            start.push(s);
            count.push(c);
        }
        Region::new(start, count)
    }
}

/// Blocks per axis whose product is `parts`.
///
/// Prime factors of `parts`, largest first, go to the axis whose blocks are
/// currently largest. Ties favour the lower axis. Without splittable axes
/// the whole array stays on one block.
pub fn process_grid(dims: &[usize], split_axes: usize, parts: usize) -> Vec<usize> {
    let mut grid = vec![1; dims.len()];
    if split_axes == 0 {
        return grid;
    }
    for factor in prime_factors(parts).into_iter().rev() {
        let mut best = 0;
        for axis in 1..split_axes {
            // dims[axis] / grid[axis] > dims[best] / grid[best]
            if dims[axis] * grid[best] > dims[best] * grid[axis] {
                best = axis;
            }
        }
        grid[best] *= factor;
    }
    grid
}

fn prime_factors(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Start and length of block `index` when `len` items are split into
/// `blocks` nearly equal pieces.
fn block(len: usize, blocks: usize, index: usize) -> (usize, usize) {
    let base = len / blocks;
    let extra = len % blocks;
    let count = base + usize::from(index < extra);
    let start = index * base + index.min(extra);
    (start, count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factors_go_to_the_longest_axes() {
        assert_eq!(process_grid(&[16, 15, 13], 3, 4), vec![2, 2, 1]);
        assert_eq!(process_grid(&[3, 4, 5], 3, 2), vec![1, 1, 2]);
        assert_eq!(process_grid(&[100, 2], 2, 6), vec![6, 1]);
        assert_eq!(process_grid(&[8, 8, 3], 2, 4), vec![2, 2, 1]);
    }

    #[test]
    fn unsplit_axes_stay_whole() {
        let partition = Partition::with_split_axes(&[4, 6, 3], 2, 6);
        for part in 0..6 {
            assert_eq!(partition.region(part).count[2], 3);
        }
    }

    #[test]
    fn regions_tile_the_array() {
        let dims = [7, 5, 3];
        let partition = Partition::new(&dims, 6);
        let mut seen = vec![0u8; 7 * 5 * 3];
        for part in 0..6 {
            let region = partition.region(part);
            for i in region.start[0]..region.start[0] + region.count[0] {
                for j in region.start[1]..region.start[1] + region.count[1] {
                    for k in region.start[2]..region.start[2] + region.count[2] {
                        seen[(i * 5 + j) * 3 + k] += 1;
                    }
                }
            }
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn surplus_parts_are_empty() {
        let partition = Partition::new(&[3, 4, 5], 2);
        assert!(partition.region(2).is_empty());
        assert_eq!(partition.region(2).rank(), 3);
        assert_eq!(partition.region(0).len() + partition.region(1).len(), 60);
    }

    #[test]
    fn single_part_is_the_whole_array() {
        let partition = Partition::new(&[3, 4, 5], 1);
        assert_eq!(partition.region(0), Region::whole(&[3, 4, 5]));
    }
}
