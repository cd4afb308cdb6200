//! netCDF-4 store.
//!
//! netCDF-4 files are HDF5 files, so this is how the HDF v2 and parallel
//! HDF formats reach disk. Without the `netcdf` cargo feature the store
//! still exists but every call fails with a disabled-backend error.

use super::attr::AttrValue;
use super::store::{Store, VarShape};
#[cfg(all(feature = "netcdf", feature = "mpi"))]
use crate::comm::Communicator;
use crate::error::{IoError, Result};
use crate::types::TypeTag;
use std::path::{Path, PathBuf};

/// Open netCDF-4 file.
#[derive(Debug)]
pub(crate) struct NcStore {
    path: PathBuf,
    #[cfg(feature = "netcdf")]
    handle: enabled::Handle,
}

#[cfg(feature = "netcdf")]
mod enabled {
    use super::*;
    use crate::backend::store::join_path;
    use ::netcdf::types::{FloatType, IntType, NcVariableType};
    use ::netcdf::AttributeValue;
    use std::ops::Range;

    #[derive(Debug)]
    pub(super) enum Handle {
        Read(::netcdf::File),
        Write(::netcdf::FileMut),
    }

    macro_rules! with_element {
        ($tag:expr, $context:expr, |$t:ident| $body:expr) => {
            match $tag {
                TypeTag::Byte => {
                    type $t = u8;
                    $body
                }
                TypeTag::Char => {
                    type $t = i8;
                    $body
                }
                TypeTag::Short => {
                    type $t = i16;
                    $body
                }
                TypeTag::Int => {
                    type $t = i32;
                    $body
                }
                TypeTag::Long => {
                    type $t = i64;
                    $body
                }
                TypeTag::Float => {
                    type $t = f32;
                    $body
                }
                TypeTag::Double => {
                    type $t = f64;
                    $body
                }
                other => Err(IoError::unmappable(other, $context)),
            }
        };
    }

    fn tag_of(vartype: &NcVariableType) -> TypeTag {
        match vartype {
            NcVariableType::Int(IntType::U8) => TypeTag::Byte,
            NcVariableType::Int(IntType::I8) | NcVariableType::Char => TypeTag::Char,
            NcVariableType::Int(IntType::I16) => TypeTag::Short,
            NcVariableType::Int(IntType::I32) => TypeTag::Int,
            NcVariableType::Int(IntType::I64) => TypeTag::Long,
            NcVariableType::Float(FloatType::F32) => TypeTag::Float,
            NcVariableType::Float(FloatType::F64) => TypeTag::Double,
            NcVariableType::String => TypeTag::String,
            _ => TypeTag::Unknown,
        }
    }

    fn to_nc(value: &AttrValue) -> AttributeValue {
        match value.clone() {
            AttrValue::Byte(v) => AttributeValue::Uchars(v),
            AttrValue::Char(v) => AttributeValue::Schars(v),
            AttrValue::Str(v) => AttributeValue::Str(v),
            AttrValue::Short(v) => AttributeValue::Shorts(v),
            AttrValue::Int(v) => AttributeValue::Ints(v),
            AttrValue::Long(v) => AttributeValue::Longlongs(v),
            AttrValue::Float(v) => AttributeValue::Floats(v),
            AttrValue::Double(v) => AttributeValue::Doubles(v),
        }
    }

    fn from_nc(value: AttributeValue) -> AttrValue {
        match value {
            AttributeValue::Uchar(v) => AttrValue::Byte(vec![v]),
            AttributeValue::Uchars(v) => AttrValue::Byte(v),
            AttributeValue::Schar(v) => AttrValue::Char(vec![v]),
            AttributeValue::Schars(v) => AttrValue::Char(v),
            AttributeValue::Short(v) => AttrValue::Short(vec![v]),
            AttributeValue::Shorts(v) => AttrValue::Short(v),
            AttributeValue::Ushort(v) => AttrValue::Int(vec![i32::from(v)]),
            AttributeValue::Ushorts(v) => AttrValue::Int(v.into_iter().map(i32::from).collect()),
            AttributeValue::Int(v) => AttrValue::Int(vec![v]),
            AttributeValue::Ints(v) => AttrValue::Int(v),
            AttributeValue::Uint(v) => AttrValue::Long(vec![i64::from(v)]),
            AttributeValue::Uints(v) => AttrValue::Long(v.into_iter().map(i64::from).collect()),
            AttributeValue::Longlong(v) => AttrValue::Long(vec![v]),
            AttributeValue::Longlongs(v) => AttrValue::Long(v),
            AttributeValue::Ulonglong(v) => AttrValue::Long(vec![v as i64]),
            AttributeValue::Ulonglongs(v) => AttrValue::Long(v.into_iter().map(|x| x as i64).collect()),
            AttributeValue::Float(v) => AttrValue::Float(vec![v]),
            AttributeValue::Floats(v) => AttrValue::Float(v),
            AttributeValue::Double(v) => AttrValue::Double(vec![v]),
            AttributeValue::Doubles(v) => AttrValue::Double(v),
            AttributeValue::Str(v) => AttrValue::Str(v),
            AttributeValue::Strs(v) => AttrValue::Str(v.join("\n")),
        }
    }

    #[cfg(feature = "mpi")]
    #[allow(unsafe_code)]
    fn info_null() -> mpi::ffi::MPI_Info {
        // Link-time constant exported by the MPI shim.
        unsafe { mpi::ffi::RSMPI_INFO_NULL }
    }

    fn extents(start: &[usize], count: &[usize]) -> Vec<Range<usize>> {
        start.iter().zip(count).map(|(&s, &c)| s..s + c).collect()
    }

    fn collect_paths(group: &::netcdf::Group<'_>, prefix: &str, out: &mut Vec<String>) {
        let path = join_path(prefix, &group.name());
        for var in group.variables() {
            out.push(join_path(&path, &var.name()));
        }
        for child in group.groups() {
            collect_paths(&child, &path, out);
        }
    }

    impl NcStore {
        fn variable(&self, path: &str) -> Option<::netcdf::Variable<'_>> {
            let path = path.trim_matches('/');
            if path.is_empty() {
                return None;
            }
            self.file().variable(path)
        }

        fn file(&self) -> &::netcdf::File {
            match &self.handle {
                Handle::Read(file) => file,
                Handle::Write(file) => file,
            }
        }

        fn file_mut(&mut self) -> Result<&mut ::netcdf::FileMut> {
            match &mut self.handle {
                Handle::Write(file) => Ok(file),
                Handle::Read(_) => Err(IoError::NotOpen {
                    mode: crate::error::AccessMode::Write,
                }),
            }
        }

        pub(super) fn create_impl(path: &Path) -> Result<Self> {
            let file = ::netcdf::create_with(path, ::netcdf::Options::NETCDF4).map_err(|e| {
                IoError::file_open(path, crate::error::AccessMode::Write, e)
            })?;
            Ok(Self {
                path: path.to_path_buf(),
                handle: Handle::Write(file),
            })
        }

        pub(super) fn open_impl(path: &Path) -> Result<Self> {
            let file = ::netcdf::open(path)
                .map_err(|e| IoError::file_open(path, crate::error::AccessMode::Read, e))?;
            Ok(Self {
                path: path.to_path_buf(),
                handle: Handle::Read(file),
            })
        }

        #[cfg(feature = "mpi")]
        pub(super) fn create_shared_impl(path: &Path, comm: &crate::comm::MpiComm) -> Result<Self> {
            use mpi::raw::AsRaw;
            let file = ::netcdf::create_par_with(
                path,
                comm.raw().as_raw(),
                info_null(),
                ::netcdf::Options::NETCDF4,
            )
            .map_err(|e| IoError::file_open(path, crate::error::AccessMode::Write, e))?;
            Ok(Self {
                path: path.to_path_buf(),
                handle: Handle::Write(file),
            })
        }

        #[cfg(feature = "mpi")]
        pub(super) fn open_shared_impl(path: &Path, comm: &crate::comm::MpiComm) -> Result<Self> {
            use mpi::raw::AsRaw;
            let file = ::netcdf::open_par_with(
                path,
                comm.raw().as_raw(),
                info_null(),
                ::netcdf::Options::empty(),
            )
            .map_err(|e| IoError::file_open(path, crate::error::AccessMode::Read, e))?;
            Ok(Self {
                path: path.to_path_buf(),
                handle: Handle::Read(file),
            })
        }

        #[cfg(feature = "mpi")]
        pub(super) fn set_transfer_impl(&mut self, path: &str, collective: bool) -> Result<()> {
            let mut var = self
                .file_mut()?
                .variable_mut(path)
                .ok_or_else(|| IoError::variable_not_found(path))?;
            if collective {
                var.access_collective()?;
            } else {
                var.access_independent()?;
            }
            Ok(())
        }

        pub(super) fn close_impl(self) -> Result<()> {
            match self.handle {
                Handle::Read(file) => file.close()?,
                Handle::Write(file) => file.close()?,
            }
            Ok(())
        }

        pub(super) fn has_group_impl(&self, group: &str) -> bool {
            let group = group.trim_matches('/');
            group.is_empty() || matches!(self.file().group(group), Ok(Some(_)))
        }

        pub(super) fn create_group_impl(&mut self, group: &str) -> Result<()> {
            let group = group.trim_matches('/').to_string();
            if self.has_group_impl(&group) {
                return Ok(());
            }
            self.file_mut()?.add_group(&group)?;
            Ok(())
        }

        pub(super) fn define_variable_impl(
            &mut self,
            group: &str,
            name: &str,
            tag: TypeTag,
            dims: &[usize],
        ) -> Result<()> {
            let path = join_path(group, name);
            if self.variable(&path).is_some() {
                return Err(IoError::VariableExists { path });
            }
            self.create_group_impl(group)?;
            let file = self.file_mut()?;
            let mut dim_names = Vec::with_capacity(dims.len());
            for (axis, &len) in dims.iter().enumerate() {
                let dim = format!("{name}_dim{axis}");
                file.add_dimension(&join_path(group, &dim), len)?;
                dim_names.push(dim);
            }
            let dim_refs: Vec<&str> = dim_names.iter().map(String::as_str).collect();
            with_element!(tag, path.clone(), |T| {
                file.add_variable::<T>(&path, &dim_refs)?;
                Ok(())
            })
        }

        pub(super) fn write_slab_impl(
            &mut self,
            path: &str,
            start: &[usize],
            count: &[usize],
            data: &[u8],
        ) -> Result<()> {
            let shape = self
                .variable_shape_impl(path)?
                .ok_or_else(|| IoError::variable_not_found(path))?;
            let file = self.file_mut()?;
            let mut var = file
                .variable_mut(path)
                .ok_or_else(|| IoError::variable_not_found(path))?;
            let len: usize = count.iter().product();
            with_element!(shape.data_type, path, |T| {
                let expected = len * std::mem::size_of::<T>();
                if data.len() != expected {
                    return Err(IoError::BufferSize {
                        path: path.to_string(),
                        expected,
                        actual: data.len(),
                    });
                }
                let mut values = vec![<T as bytemuck::Zeroable>::zeroed(); len];
                bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(data);
                var.put_values(&values, extents(start, count))?;
                Ok(())
            })
        }

        pub(super) fn read_slab_impl(
            &self,
            path: &str,
            start: &[usize],
            count: &[usize],
            out: &mut [u8],
        ) -> Result<()> {
            let var = self
                .variable(path)
                .ok_or_else(|| IoError::variable_not_found(path))?;
            let tag = tag_of(&var.vartype());
            with_element!(tag, path, |T| {
                let values: Vec<T> = var.get_values::<T, _>(extents(start, count))?;
                let bytes: &[u8] = bytemuck::cast_slice(&values);
                if bytes.len() != out.len() {
                    return Err(IoError::BufferSize {
                        path: path.to_string(),
                        expected: bytes.len(),
                        actual: out.len(),
                    });
                }
                out.copy_from_slice(bytes);
                Ok(())
            })
        }

        pub(super) fn variable_shape_impl(&self, path: &str) -> Result<Option<VarShape>> {
            Ok(self.variable(path).map(|var| VarShape {
                dims: var.dimensions().iter().map(|d| d.len()).collect(),
                data_type: tag_of(&var.vartype()),
                n_attr: var.attributes().count(),
            }))
        }

        pub(super) fn attribute_impl(&self, owner: &str, name: &str) -> Result<Option<AttrValue>> {
            let owner = owner.trim_matches('/');
            if let Some(var) = self.variable(owner) {
                return match var.attribute(name) {
                    Some(attr) => Ok(Some(from_nc(attr.value()?))),
                    None => Ok(None),
                };
            }
            if !self.has_group_impl(owner) {
                return Err(IoError::group_not_found(owner));
            }
            match self.file().attribute(&join_path(owner, name)) {
                Some(attr) => Ok(Some(from_nc(attr.value()?))),
                None => Ok(None),
            }
        }

        pub(super) fn put_attribute_impl(
            &mut self,
            owner: &str,
            name: &str,
            value: &AttrValue,
        ) -> Result<()> {
            let owner = owner.trim_matches('/').to_string();
            if self.variable(&owner).is_some() {
                let mut var = self
                    .file_mut()?
                    .variable_mut(&owner)
                    .ok_or_else(|| IoError::variable_not_found(owner.as_str()))?;
                var.put_attribute(name, to_nc(value))?;
                return Ok(());
            }
            self.create_group_impl(&owner)?;
            self.file_mut()?
                .add_attribute(&join_path(&owner, name), to_nc(value))?;
            Ok(())
        }

        pub(super) fn variable_paths_impl(&self) -> Result<Vec<String>> {
            let file = self.file();
            let mut out: Vec<String> = file.variables().map(|v| v.name()).collect();
            for group in file.groups()? {
                collect_paths(&group, "", &mut out);
            }
            Ok(out)
        }

        pub(super) fn root_attribute_names_impl(&self) -> Result<Vec<String>> {
            Ok(self
                .file()
                .attributes()
                .map(|a| a.name().to_string())
                .collect())
        }
    }

}

#[cfg(feature = "netcdf")]
impl Store for NcStore {
    const ENABLED: bool = true;

    fn create(path: &Path) -> Result<Self> {
        Self::create_impl(path)
    }

    fn open(path: &Path) -> Result<Self> {
        Self::open_impl(path)
    }

    #[cfg(feature = "mpi")]
    fn create_shared(path: &Path, comm: &dyn Communicator) -> Option<Result<Self>> {
        comm.as_mpi().map(|mpi| Self::create_shared_impl(path, mpi))
    }

    #[cfg(feature = "mpi")]
    fn open_shared(path: &Path, comm: &dyn Communicator) -> Option<Result<Self>> {
        comm.as_mpi().map(|mpi| Self::open_shared_impl(path, mpi))
    }

    #[cfg(feature = "mpi")]
    fn set_transfer(&mut self, path: &str, collective: bool) -> Result<()> {
        self.set_transfer_impl(path, collective)
    }

    fn close(self) -> Result<()> {
        tracing::debug!("Closing {}", self.path.display());
        self.close_impl()
    }

    fn has_group(&self, group: &str) -> bool {
        self.has_group_impl(group)
    }

    fn create_group(&mut self, group: &str) -> Result<()> {
        self.create_group_impl(group)
    }

    fn define_variable(
        &mut self,
        group: &str,
        name: &str,
        tag: TypeTag,
        dims: &[usize],
    ) -> Result<()> {
        self.define_variable_impl(group, name, tag, dims)
    }

    fn write_slab(
        &mut self,
        path: &str,
        start: &[usize],
        count: &[usize],
        data: &[u8],
    ) -> Result<()> {
        self.write_slab_impl(path, start, count, data)
    }

    fn read_slab(&self, path: &str, start: &[usize], count: &[usize], out: &mut [u8]) -> Result<()> {
        self.read_slab_impl(path, start, count, out)
    }

    fn variable_shape(&self, path: &str) -> Result<Option<VarShape>> {
        self.variable_shape_impl(path)
    }

    fn attribute(&self, owner: &str, name: &str) -> Result<Option<AttrValue>> {
        self.attribute_impl(owner, name)
    }

    fn put_attribute(&mut self, owner: &str, name: &str, value: &AttrValue) -> Result<()> {
        self.put_attribute_impl(owner, name, value)
    }

    fn variable_paths(&self) -> Result<Vec<String>> {
        self.variable_paths_impl()
    }

    fn root_attribute_names(&self) -> Result<Vec<String>> {
        self.root_attribute_names_impl()
    }
}

#[cfg(not(feature = "netcdf"))]
fn disabled<T>() -> Result<T> {
    Err(IoError::backend_disabled("netcdf"))
}

#[cfg(not(feature = "netcdf"))]
impl Store for NcStore {
    const ENABLED: bool = false;

    fn create(_path: &Path) -> Result<Self> {
        disabled()
    }

    fn open(_path: &Path) -> Result<Self> {
        disabled()
    }

    fn close(self) -> Result<()> {
        tracing::debug!("Closing disabled store {}", self.path.display());
        disabled()
    }

    fn has_group(&self, _group: &str) -> bool {
        false
    }

    fn create_group(&mut self, _group: &str) -> Result<()> {
        disabled()
    }

    fn define_variable(&mut self, _: &str, _: &str, _: TypeTag, _: &[usize]) -> Result<()> {
        disabled()
    }

    fn write_slab(&mut self, _: &str, _: &[usize], _: &[usize], _: &[u8]) -> Result<()> {
        disabled()
    }

    fn read_slab(&self, _: &str, _: &[usize], _: &[usize], _: &mut [u8]) -> Result<()> {
        disabled()
    }

    fn variable_shape(&self, _path: &str) -> Result<Option<VarShape>> {
        disabled()
    }

    fn attribute(&self, _owner: &str, _name: &str) -> Result<Option<AttrValue>> {
        disabled()
    }

    fn put_attribute(&mut self, _: &str, _: &str, _: &AttrValue) -> Result<()> {
        disabled()
    }

    fn variable_paths(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn root_attribute_names(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[cfg(all(test, feature = "netcdf"))]
mod tests {
    use super::*;

    #[test]
    fn slabs_and_attributes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_0.hdf5");

        let mut store = NcStore::create(&path).unwrap();
        store
            .define_variable("testData", "testVar", TypeTag::Double, &[2, 2])
            .unwrap();
        let values = [1.0f64, 2.0, 3.0, 4.0];
        store
            .write_slab("testData/testVar", &[0, 0], &[2, 2], bytemuck::cast_slice(&values))
            .unwrap();
        store
            .put_attribute("testData/testVar", "globalDims", &AttrValue::Int(vec![2, 2]))
            .unwrap();
        store.put_attribute("", "superSize", &AttrValue::from(1i32)).unwrap();
        store.close().unwrap();

        let store = NcStore::open(&path).unwrap();
        assert_eq!(store.variable_paths().unwrap(), vec!["testData/testVar"]);
        let mut out = vec![0u8; 16];
        store
            .read_slab("testData/testVar", &[1, 0], &[1, 2], &mut out)
            .unwrap();
        assert_eq!(out, bytemuck::cast_slice::<f64, u8>(&[3.0, 4.0]));
        assert_eq!(
            store.attribute("testData/testVar", "globalDims").unwrap(),
            Some(AttrValue::Int(vec![2, 2]))
        );
        assert_eq!(
            store.attribute("", "superSize").unwrap(),
            Some(AttrValue::Int(vec![1]))
        );
    }
}
