//! Shape metadata stored next to every variable.

use super::attr::AttrValue;
use super::store::Store;
use super::{BASE, GLOBAL_DIMS, N_VARS, OFFSET, SUPER_SIZE};
use crate::error::{IoError, Result};
use crate::info::{check_rank, ArrayInfo};
use std::fmt::Write as _;

/// Attach `globalDims`, `offset` and `base` to `owner`.
pub(crate) fn put_array_info<S: Store>(store: &mut S, owner: &str, info: &ArrayInfo) -> Result<()> {
    store.put_attribute(owner, BASE, &AttrValue::Int(info.bases().to_vec()))?;
    store.put_attribute(owner, GLOBAL_DIMS, &AttrValue::from_extents(info.global())?)?;
    store.put_attribute(owner, OFFSET, &AttrValue::from_extents(info.offsets())?)?;
    Ok(())
}

/// Global extents and index origins recorded on `owner`.
pub(crate) fn read_global_shape<S: Store>(store: &S, owner: &str) -> Result<(Vec<usize>, Vec<i32>)> {
    let global = store
        .attribute(owner, GLOBAL_DIMS)?
        .ok_or_else(|| IoError::attribute_not_found(owner, GLOBAL_DIMS))?
        .to_extents(GLOBAL_DIMS)?;
    check_rank(global.len())?;
    let base = match store.attribute(owner, BASE)? {
        Some(value) => value.to_i32s(BASE)?,
        None => vec![0; global.len()],
    };
    if base.len() != global.len() {
        return Err(IoError::InvalidShape(format!(
            "{owner} has {} base entries for {} dims",
            base.len(),
            global.len()
        )));
    }
    Ok((global, base))
}

/// Everything this process can learn about variable `path` on its own.
pub(crate) fn read_local_info<S: Store>(store: &S, path: &str) -> Result<ArrayInfo> {
    let shape = store
        .variable_shape(path)?
        .ok_or_else(|| IoError::variable_not_found(path))?;
    let rank = shape.dims.len();
    check_rank(rank)?;

    let global = match store.attribute(path, GLOBAL_DIMS)? {
        Some(value) => value.to_extents(GLOBAL_DIMS)?,
        None => shape.dims.clone(),
    };
    let offset = match store.attribute(path, OFFSET)? {
        Some(value) => value.to_extents(OFFSET)?,
        None => vec![0; rank],
    };
    if global.len() != rank || offset.len() != rank {
        return Err(IoError::ShapeMismatch {
            path: path.to_string(),
            detail: format!(
                "stored rank {rank} but sidecar attributes describe {} and {} axes",
                global.len(),
                offset.len()
            ),
        });
    }

    let mut info = ArrayInfo::slab(shape.data_type, &global, &shape.dims, &offset)?;
    if let Some(base) = store.attribute(path, BASE)? {
        info = info.with_base(&base.to_i32s(BASE)?)?;
    }
    if let Some(n_vars) = store.attribute(path, N_VARS)?.and_then(|v| v.first_i64()) {
        info.n_vars = usize::try_from(n_vars).unwrap_or(1).max(1);
    }
    info.n_attr = shape.n_attr;
    Ok(info)
}

/// Check the stored extents of `path` against `expected`.
///
/// The rank is compared first; extents are only compared when it agrees.
pub(crate) fn verify_stored_shape<S: Store>(
    store: &S,
    path: &str,
    expected: &[usize],
    process: usize,
) -> Result<()> {
    let shape = store
        .variable_shape(path)?
        .ok_or_else(|| IoError::variable_not_found(path))?;

    if shape.dims.len() != expected.len() {
        return Err(IoError::ShapeMismatch {
            path: path.to_string(),
            detail: format!(
                "process {process}: stored rank {} but descriptor rank {}",
                shape.dims.len(),
                expected.len()
            ),
        });
    }

    if let Some(axis) = (0..expected.len()).find(|&i| shape.dims[i] != expected[i]) {
        let mut detail = format!("process {process}: axis {axis} differs, dims for rank {}", expected.len());
        for (i, (stored, wanted)) in shape.dims.iter().zip(expected).enumerate() {
            let _ = write!(detail, "\nDim {i}: expect {stored} have {wanted}");
        }
        return Err(IoError::ShapeMismatch {
            path: path.to_string(),
            detail,
        });
    }
    Ok(())
}

/// Superdomain size recorded at the file root, 1 when absent.
pub(crate) fn stored_super_size<S: Store>(store: &S) -> Result<usize> {
    let Some(value) = store.attribute("", SUPER_SIZE)? else {
        return Ok(1);
    };
    value
        .first_i64()
        .and_then(|n| usize::try_from(n).ok())
        .filter(|&n| n > 0)
        .ok_or_else(|| IoError::InvalidShape(format!("stored {SUPER_SIZE} {value} is not a positive integer")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tagfile::TagStore;
    use crate::types::TypeTag;

    fn store_with_var(dir: &std::path::Path) -> TagStore {
        let mut store = TagStore::create(&dir.join("shape.hdf4")).unwrap();
        store
            .define_variable("testData", "testVar", TypeTag::Float, &[3, 4, 5])
            .unwrap();
        store
    }

    #[test]
    fn rank_is_compared_before_extents() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_var(dir.path());

        let err = verify_stored_shape(&store, "testData/testVar", &[3, 4], 0).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("stored rank 3"), "{message}");
        assert!(message.contains("descriptor rank 2"), "{message}");

        let err = verify_stored_shape(&store, "testData/testVar", &[3, 9, 5], 1).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("axis 1"), "{message}");
        assert!(message.contains("Dim 1: expect 4 have 9"), "{message}");

        verify_stored_shape(&store, "testData/testVar", &[3, 4, 5], 0).unwrap();
    }

    #[test]
    fn local_info_reads_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_var(dir.path());
        let info = ArrayInfo::slab(TypeTag::Float, &[6, 4, 5], &[3, 4, 5], &[3, 0, 0])
            .unwrap()
            .with_base(&[1, 1, 0])
            .unwrap();
        put_array_info(&mut store, "testData/testVar", &info).unwrap();

        let read = read_local_info(&store, "testData/testVar").unwrap();
        assert_eq!(read.global(), &[6, 4, 5]);
        assert_eq!(read.local(), &[3, 4, 5]);
        assert_eq!(read.offsets(), &[3, 0, 0]);
        assert_eq!(read.bases(), &[1, 1, 0]);
        assert_eq!(read.n_vars, 1);
        assert_eq!(read.n_attr, 3);
        assert_eq!(read.bytes, 60 * 4);
        assert_eq!(read.data_type, TypeTag::Float);
    }

    #[test]
    fn super_size_defaults_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_with_var(dir.path());
        assert_eq!(stored_super_size(&store).unwrap(), 1);
        store.put_attribute("", SUPER_SIZE, &AttrValue::from(3i32)).unwrap();
        assert_eq!(stored_super_size(&store).unwrap(), 3);
    }
}
