//! Array shape descriptor.

use crate::error::{IoError, Result};
use crate::types::TypeTag;
use std::fmt;

/// Maximum number of axes a shape descriptor carries.
pub const MAX_ARRAY_DIMENSION: usize = 6;

/// Shape of one process's slice of a distributed array.
///
/// Constructed per I/O call and never persisted itself. Entries at index
/// `n_dims` and above are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayInfo {
    /// True rank of the array.
    pub n_dims: usize,
    /// Extents of the whole array.
    pub global_dims: [usize; MAX_ARRAY_DIMENSION],
    /// Extents of this process's slice.
    pub local_dims: [usize; MAX_ARRAY_DIMENSION],
    /// Start of the slice within the whole array.
    pub offset: [usize; MAX_ARRAY_DIMENSION],
    /// Index origin per axis.
    pub base: [i32; MAX_ARRAY_DIMENSION],
    /// Number of stacked fields.
    pub n_vars: usize,
    /// Number of attributes attached to the stored variable.
    pub n_attr: usize,
    /// Local size in bytes.
    pub bytes: usize,
    /// Element type.
    pub data_type: TypeTag,
}

impl Default for ArrayInfo {
    fn default() -> Self {
        Self::new(TypeTag::Unknown)
    }
}

impl ArrayInfo {
    /// Empty descriptor of the given element type.
    pub fn new(data_type: TypeTag) -> Self {
        Self {
            n_dims: 0,
            global_dims: [0; MAX_ARRAY_DIMENSION],
            local_dims: [0; MAX_ARRAY_DIMENSION],
            offset: [0; MAX_ARRAY_DIMENSION],
            base: [0; MAX_ARRAY_DIMENSION],
            n_vars: 1,
            n_attr: 0,
            bytes: 0,
            data_type,
        }
    }

    /// Descriptor for an array held entirely by one process.
    pub fn serial(data_type: TypeTag, dims: &[usize]) -> Result<Self> {
        Self::slab(data_type, dims, dims, &vec![0; dims.len()])
    }

    /// Descriptor for the slice `local` at `offset` of an array sized `global`.
    pub fn slab(
        data_type: TypeTag,
        global: &[usize],
        local: &[usize],
        offset: &[usize],
    ) -> Result<Self> {
        check_rank(global.len())?;
        if local.len() != global.len() || offset.len() != global.len() {
            return Err(IoError::InvalidShape(format!(
                "global rank {} with local rank {} and offset rank {}",
                global.len(),
                local.len(),
                offset.len()
            )));
        }
        let mut info = Self::new(data_type);
        info.n_dims = global.len();
        info.global_dims[..global.len()].copy_from_slice(global);
        info.local_dims[..local.len()].copy_from_slice(local);
        info.offset[..offset.len()].copy_from_slice(offset);
        info.update_bytes();
        info.validate()?;
        Ok(info)
    }

    /// Replace the index origins.
    pub fn with_base(mut self, base: &[i32]) -> Result<Self> {
        if base.len() != self.n_dims {
            return Err(IoError::InvalidShape(format!(
                "{} base entries for rank {}",
                base.len(),
                self.n_dims
            )));
        }
        self.base = [0; MAX_ARRAY_DIMENSION];
        self.base[..base.len()].copy_from_slice(base);
        Ok(self)
    }

    /// Global extents of the used axes.
    pub fn global(&self) -> &[usize] {
        &self.global_dims[..self.n_dims]
    }

    /// Local extents of the used axes.
    pub fn local(&self) -> &[usize] {
        &self.local_dims[..self.n_dims]
    }

    /// Offsets of the used axes.
    pub fn offsets(&self) -> &[usize] {
        &self.offset[..self.n_dims]
    }

    /// Index origins of the used axes.
    pub fn bases(&self) -> &[i32] {
        &self.base[..self.n_dims]
    }

    /// Number of local elements.
    pub fn local_len(&self) -> usize {
        if self.n_dims == 0 {
            0
        } else {
            self.local().iter().product()
        }
    }

    /// Number of elements in the whole array.
    pub fn global_len(&self) -> usize {
        if self.n_dims == 0 {
            0
        } else {
            self.global().iter().product()
        }
    }

    /// Recompute `bytes` from the local extents and element type.
    pub fn update_bytes(&mut self) {
        self.bytes = self.local_len() * self.data_type.size_of();
    }

    /// Whether the slice covers the whole array.
    pub fn is_whole(&self) -> bool {
        self.local() == self.global() && self.offsets().iter().all(|&o| o == 0)
    }

    /// Check the descriptor invariants.
    pub fn validate(&self) -> Result<()> {
        check_rank(self.n_dims)?;
        for axis in 0..self.n_dims {
            let (global, local, offset) = (
                self.global_dims[axis],
                self.local_dims[axis],
                self.offset[axis],
            );
            if local > global || offset + local > global {
                return Err(IoError::InvalidShape(format!(
                    "axis {axis}: local {local} at offset {offset} exceeds global {global}"
                )));
            }
        }
        for axis in self.n_dims..MAX_ARRAY_DIMENSION {
            if self.global_dims[axis] != 0
                || self.local_dims[axis] != 0
                || self.offset[axis] != 0
                || self.base[axis] != 0
            {
                return Err(IoError::InvalidShape(format!(
                    "axis {axis} is beyond rank {} but not zero",
                    self.n_dims
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ArrayInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} dims={} global={:?} local={:?} offset={:?} base={:?} nVars={} nAttr={} bytes={}",
            self.data_type,
            self.n_dims,
            self.global(),
            self.local(),
            self.offsets(),
            self.bases(),
            self.n_vars,
            self.n_attr,
            self.bytes
        )
    }
}

pub(crate) fn check_rank(dims: usize) -> Result<()> {
    if dims > MAX_ARRAY_DIMENSION {
        Err(IoError::TooManyDimensions {
            dims,
            max: MAX_ARRAY_DIMENSION,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slab_fills_used_axes_only() {
        let info = ArrayInfo::slab(TypeTag::Float, &[8, 4], &[4, 4], &[4, 0]).unwrap();
        assert_eq!(info.n_dims, 2);
        assert_eq!(info.global(), &[8, 4]);
        assert_eq!(info.local_dims, [4, 4, 0, 0, 0, 0]);
        assert_eq!(info.offset, [4, 0, 0, 0, 0, 0]);
        assert_eq!(info.bytes, 64);
        assert!(!info.is_whole());
    }

    #[test]
    fn rejects_slices_outside_the_array() {
        let err = ArrayInfo::slab(TypeTag::Int, &[4], &[3], &[2]).unwrap_err();
        assert!(matches!(err, IoError::InvalidShape(_)));
    }

    #[test]
    fn rejects_seven_axes() {
        let err = ArrayInfo::serial(TypeTag::Int, &[1; 7]).unwrap_err();
        assert!(matches!(err, IoError::TooManyDimensions { dims: 7, .. }));
    }

    #[test]
    fn trailing_entries_must_be_zero() {
        let mut info = ArrayInfo::serial(TypeTag::Double, &[3, 4, 5]).unwrap();
        assert!(info.validate().is_ok());
        info.base[4] = 1;
        assert!(info.validate().is_err());
    }

    #[test]
    fn base_length_must_match_rank() {
        let info = ArrayInfo::serial(TypeTag::Double, &[3, 4]).unwrap();
        assert!(info.with_base(&[1]).is_err());
        assert_eq!(info.with_base(&[1, 1]).unwrap().bases(), &[1, 1]);
    }
}
