//! Hyperslab geometry.
//!
//! Regions are rectangular boxes in global index space. Buffers are raw
//! row-major bytes; element width is passed alongside so one code path
//! serves every [`TypeTag`](crate::TypeTag).

use crate::error::{IoError, Result};
use ndarray::{ArrayView, ArrayViewMut, IxDyn, Slice};

/// Rectangular sub-range of an array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    /// First index per axis.
    pub start: Vec<usize>,
    /// Extent per axis.
    pub count: Vec<usize>,
}

impl Region {
    /// Region at `start` with extents `count`.
    pub fn new(start: Vec<usize>, count: Vec<usize>) -> Self {
        Self { start, count }
    }

    /// Region covering a whole array of shape `dims`.
    pub fn whole(dims: &[usize]) -> Self {
        Self::new(vec![0; dims.len()], dims.to_vec())
    }

    /// Zero-volume region of the given rank.
    pub fn empty(rank: usize) -> Self {
        Self::new(vec![0; rank], vec![0; rank])
    }

    /// Number of axes.
    pub fn rank(&self) -> usize {
        self.count.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.count.iter().product()
    }

    /// Whether the region holds no elements.
    pub fn is_empty(&self) -> bool {
        self.count.iter().any(|&c| c == 0)
    }

    /// Overlap of two regions, `None` when they do not intersect.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        if self.rank() != other.rank() || self.is_empty() || other.is_empty() {
            return None;
        }
        let mut start = Vec::with_capacity(self.rank());
        let mut count = Vec::with_capacity(self.rank());
        for axis in 0..self.rank() {
            let lo = self.start[axis].max(other.start[axis]);
            let hi = (self.start[axis] + self.count[axis])
                .min(other.start[axis] + other.count[axis]);
            if hi <= lo {
                return None;
            }
            start.push(lo);
            count.push(hi - lo);
        }
        Some(Region::new(start, count))
    }

    /// This region expressed relative to `origin`.
    pub fn relative_to(&self, origin: &Region) -> Region {
        let start = self
            .start
            .iter()
            .zip(&origin.start)
            .map(|(s, o)| s - o)
            .collect();
        Region::new(start, self.count.clone())
    }

    /// Whether the region lies inside an array of shape `dims`.
    pub fn fits(&self, dims: &[usize]) -> bool {
        self.rank() == dims.len()
            && self
                .start
                .iter()
                .zip(&self.count)
                .zip(dims)
                .all(|((s, c), d)| s + c <= *d)
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.rank() as u64).to_le_bytes());
        for value in self.start.iter().chain(&self.count) {
            out.extend_from_slice(&(*value as u64).to_le_bytes());
        }
    }

    /// Decode a region written by `encode` at the front of `bytes`,
    /// returning it with the remaining bytes.
    pub(crate) fn decode_prefix(bytes: &[u8]) -> Result<(Region, &[u8])> {
        let rank = bytes
            .get(..8)
            .and_then(|w| <[u8; 8]>::try_from(w).ok())
            .map(|w| u64::from_le_bytes(w) as usize)
            .ok_or_else(|| IoError::Comm("empty region message".into()))?;
        let len = rank
            .checked_mul(16)
            .and_then(|n| n.checked_add(8))
            .filter(|&n| n <= bytes.len())
            .ok_or_else(|| IoError::Comm(format!("truncated region message of rank {rank}")))?;
        let (head, rest) = bytes.split_at(len);
        Ok((Region::decode(head)?, rest))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Region> {
        let words = bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                u64::from_le_bytes(word) as usize
            })
            .collect::<Vec<_>>();
        let rank = *words
            .first()
            .ok_or_else(|| IoError::Comm("empty region message".into()))?;
        if words.len() != 1 + 2 * rank {
            return Err(IoError::Comm(format!(
                "region message of {} words for rank {rank}",
                words.len()
            )));
        }
        Ok(Region::new(
            words[1..1 + rank].to_vec(),
            words[1 + rank..].to_vec(),
        ))
    }
}

fn byte_shape(dims: &[usize], elem: usize) -> IxDyn {
    let mut shape = dims.to_vec();
    shape.push(elem);
    IxDyn(&shape)
}

/// Copy `count` elements starting at `src_start` of a `src_dims` array into
/// `dst_dims` at `dst_start`.
#[allow(clippy::too_many_arguments)]
pub fn copy_region(
    src: &[u8],
    src_dims: &[usize],
    src_start: &[usize],
    dst: &mut [u8],
    dst_dims: &[usize],
    dst_start: &[usize],
    count: &[usize],
    elem: usize,
) -> Result<()> {
    let src_region = Region::new(src_start.to_vec(), count.to_vec());
    let dst_region = Region::new(dst_start.to_vec(), count.to_vec());
    if !src_region.fits(src_dims) || !dst_region.fits(dst_dims) {
        return Err(IoError::InvalidShape(format!(
            "region {count:?} at {src_start:?} of {src_dims:?} -> {dst_start:?} of {dst_dims:?}"
        )));
    }
    let src_view = ArrayView::from_shape(byte_shape(src_dims, elem), src)
        .map_err(|e| IoError::InvalidShape(format!("source buffer: {e}")))?;
    let mut dst_view = ArrayViewMut::from_shape(byte_shape(dst_dims, elem), dst)
        .map_err(|e| IoError::InvalidShape(format!("target buffer: {e}")))?;

    let rank = count.len();
    let src_slab = src_view.slice_each_axis(|ax| {
        let axis = ax.axis.index();
        if axis < rank {
            Slice::from(src_start[axis]..src_start[axis] + count[axis])
        } else {
            Slice::from(..)
        }
    });
    let mut dst_slab = dst_view.slice_each_axis_mut(|ax| {
        let axis = ax.axis.index();
        if axis < rank {
            Slice::from(dst_start[axis]..dst_start[axis] + count[axis])
        } else {
            Slice::from(..)
        }
    });
    dst_slab.assign(&src_slab);
    Ok(())
}

/// Extract `region` of a `dims` array into a compact buffer.
pub fn extract(src: &[u8], dims: &[usize], region: &Region, elem: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; region.len() * elem];
    copy_region(
        src,
        dims,
        &region.start,
        &mut out,
        &region.count,
        &vec![0; region.rank()],
        &region.count,
        elem,
    )?;
    Ok(out)
}

/// Place a compact buffer holding `region` into a `dims` array.
pub fn place(dst: &mut [u8], dims: &[usize], region: &Region, src: &[u8], elem: usize) -> Result<()> {
    copy_region(
        src,
        &region.count,
        &vec![0; region.rank()],
        dst,
        dims,
        &region.start,
        &region.count,
        elem,
    )
}
