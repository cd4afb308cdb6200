//! Typed distributed arrays and the calls that move them through a backend.
//!
//! A [`DistArray`] is block-partitioned over the live ranks. Before a write
//! its data is regathered onto the partitioning of the backend's
//! superdomain; after a read it is scattered back onto the live ranks.
//!
//! # Example
//!
//! ```no_run
//! use superio::{factory, ArrayIo, DistArray, SelfComm};
//! use std::path::Path;
//!
//! let comm = SelfComm::shared();
//! let mut backend = factory::select_by_extension("hdf4", None, comm.clone()).unwrap();
//! let mut array = DistArray::<f32>::new(comm, &[3, 4, 5])?;
//! array.fill_with(|index| index.iter().sum::<usize>() as f32);
//!
//! backend.open_write(Path::new("run"));
//! ArrayIo::new(backend.as_mut()).write_var_units("testVar", "testData", &array, "megaTests")?;
//! backend.close();
//! # Ok::<(), superio::IoError>(())
//! ```

use crate::backend::{
    join_path, AttrValue, Backend, BackendKind, FromAttr, BASE, GLOBAL_DIMS, N_VARS, OFFSET, UNITS,
};
use crate::comm::{broadcast_i64, Communicator};
use crate::error::{AccessMode, IoError, Result};
use crate::info::{check_rank, ArrayInfo};
use crate::slab::Region;
use crate::superdomain::{repartition, Partition};
use crate::types::Element;
use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Axis, IxDyn};
use std::sync::Arc;

/// An array partitioned over the ranks of a communicator.
///
/// Each rank holds the block of the global index space given by a
/// [`Partition`] of the global extents over the live ranks. Arrays of
/// stacked fields keep the fields on a trailing axis that is never split.
#[derive(Debug, Clone)]
pub struct DistArray<T: Element> {
    comm: Arc<dyn Communicator>,
    global: Vec<usize>,
    base: Vec<i32>,
    split_axes: usize,
    region: Region,
    data: ArrayD<T>,
}

impl<T: Element> DistArray<T> {
    /// Zero-filled array of extents `global`, split on every axis.
    pub fn new(comm: Arc<dyn Communicator>, global: &[usize]) -> Result<Self> {
        Self::build(comm, global, global.len())
    }

    /// Zero-filled array of `n_vars` fields of extents `dims`.
    ///
    /// The fields form a trailing axis of length `n_vars`.
    pub fn with_vars(comm: Arc<dyn Communicator>, dims: &[usize], n_vars: usize) -> Result<Self> {
        if n_vars == 0 {
            return Err(IoError::InvalidShape("an array needs at least one field".into()));
        }
        let mut global = dims.to_vec();
        global.push(n_vars);
        Self::build(comm, &global, dims.len())
    }

    fn build(comm: Arc<dyn Communicator>, global: &[usize], split_axes: usize) -> Result<Self> {
        check_rank(global.len())?;
        let region =
            Partition::with_split_axes(global, split_axes, comm.size()).region(comm.rank());
        let data = ArrayD::from_elem(IxDyn(&region.count), T::default());
        Ok(Self {
            comm,
            global: global.to_vec(),
            base: vec![0; global.len()],
            split_axes,
            region,
            data,
        })
    }

    /// Communicator the array is partitioned over.
    pub fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Global extents.
    pub fn global(&self) -> &[usize] {
        &self.global
    }

    /// Index origin per axis.
    pub fn base(&self) -> &[i32] {
        &self.base
    }

    /// Replace the index origins.
    pub fn set_base(&mut self, base: &[i32]) -> Result<()> {
        if base.len() != self.global.len() {
            return Err(IoError::InvalidShape(format!(
                "{} base entries for rank {}",
                base.len(),
                self.global.len()
            )));
        }
        self.base = base.to_vec();
        Ok(())
    }

    /// Block of the global index space held by this rank.
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Number of stacked fields, 1 for a plain array.
    pub fn n_vars(&self) -> usize {
        match self.field_axis() {
            Some(axis) => self.global[axis],
            None => 1,
        }
    }

    /// Trailing axis holding stacked fields.
    pub fn field_axis(&self) -> Option<usize> {
        (self.split_axes < self.global.len()).then_some(self.split_axes)
    }

    /// This rank's block.
    pub fn local(&self) -> ArrayViewD<'_, T> {
        self.data.view()
    }

    /// This rank's block, mutably.
    pub fn local_mut(&mut self) -> ArrayViewMutD<'_, T> {
        self.data.view_mut()
    }

    /// Set every local element from its global index.
    pub fn fill_with(&mut self, f: impl Fn(&[usize]) -> T) {
        let start = &self.region.start;
        let mut index = vec![0; start.len()];
        for (local, value) in self.data.indexed_iter_mut() {
            for (axis, slot) in index.iter_mut().enumerate() {
                *slot = start[axis] + local[axis];
            }
            *value = f(&index);
        }
    }

    /// Element at global `index`, `None` when another rank holds it.
    pub fn get(&self, index: &[usize]) -> Option<T> {
        if index.len() != self.global.len() {
            return None;
        }
        let local = index
            .iter()
            .zip(&self.region.start)
            .zip(&self.region.count)
            .map(|((&i, &s), &c)| (i >= s && i < s + c).then(|| i - s))
            .collect::<Option<Vec<_>>>()?;
        self.data.get(local.as_slice()).copied()
    }

    /// Block this rank holds in a file written by `super_size` ranks.
    fn file_region(&self, super_size: usize) -> Region {
        Partition::with_split_axes(&self.global, self.split_axes, super_size)
            .region(self.comm.rank())
    }

    fn local_bytes(&self) -> Result<&[u8]> {
        contiguous_bytes(&self.data)
    }

    fn store_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let values = self
            .data
            .as_slice_mut()
            .ok_or_else(|| IoError::InvalidShape("local block is not contiguous".into()))?;
        let target: &mut [u8] = bytemuck::cast_slice_mut(values);
        if target.len() != bytes.len() {
            return Err(IoError::InvalidShape(format!(
                "{} bytes for a local block of {}",
                bytes.len(),
                target.len()
            )));
        }
        target.copy_from_slice(bytes);
        Ok(())
    }
}

fn contiguous_bytes<T: Element>(data: &ArrayD<T>) -> Result<&[u8]> {
    data.as_slice()
        .map(bytemuck::cast_slice)
        .ok_or_else(|| IoError::InvalidShape("local block is not contiguous".into()))
}

fn elements<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    let width = std::mem::size_of::<T>();
    if bytes.len() % width != 0 {
        return Err(IoError::InvalidShape(format!(
            "{} bytes do not hold whole {} elements",
            bytes.len(),
            T::TAG
        )));
    }
    let mut values = vec![T::default(); bytes.len() / width];
    bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(bytes);
    Ok(values)
}

fn slab_info<T: Element>(global: &[usize], region: &Region, base: &[i32]) -> Result<ArrayInfo> {
    ArrayInfo::slab(T::TAG, global, &region.count, &region.start)?.with_base(base)
}

/// Leading `axes` axes of `region`.
fn leading(region: &Region, axes: usize) -> Region {
    Region::new(region.start[..axes].to_vec(), region.count[..axes].to_vec())
}

/// Stored name of field `index` of a stacked array.
pub fn field_name(name: &str, index: usize) -> String {
    if index == 0 {
        name.to_string()
    } else {
        format!("{name}.{index}")
    }
}

/// Typed, repartitioning I/O over any backend.
///
/// Writes and attribute calls report backend failures as
/// [`IoError::Backend`]; the details stay in the backend's error queue.
/// A failed variable read aborts the whole group, since ranks that read
/// successfully would otherwise continue with inconsistent data.
#[derive(Debug)]
pub struct ArrayIo<'a> {
    backend: &'a mut dyn Backend,
}

impl<'a> ArrayIo<'a> {
    /// Typed I/O through `backend`, which must already be open.
    pub fn new(backend: &'a mut dyn Backend) -> Self {
        Self { backend }
    }

    /// The wrapped backend.
    pub fn backend(&mut self) -> &mut dyn Backend {
        &mut *self.backend
    }

    fn super_size(&self, mode: AccessMode) -> Result<usize> {
        self.backend.super_size().ok_or(IoError::NotOpen { mode })
    }

    fn abort(&mut self, what: &str) -> ! {
        let detail = self.backend.errors().drain();
        let reason = format!("Failed to {what}\n{}", detail.trim_end());
        tracing::error!("{}", reason);
        self.backend.comm().abort(-1, &reason)
    }

    fn put(&mut self, name: &str, group: &str, info: &ArrayInfo, bytes: &[u8]) -> Result<()> {
        if self.backend.write_variable(name, group, info, bytes) {
            Ok(())
        } else {
            Err(IoError::backend("write", join_path(group, name)))
        }
    }

    /// Regather `array` onto the file layout of a superdomain of `size`.
    fn to_file_layout<T: Element>(
        &self,
        array: &DistArray<T>,
        size: usize,
    ) -> Result<(Region, Vec<u8>)> {
        let dst = array.file_region(size);
        let bytes = repartition(
            array.comm.as_ref(),
            std::mem::size_of::<T>(),
            &array.global,
            &array.region,
            array.local_bytes()?,
            &dst,
        )?;
        Ok((dst, bytes))
    }

    /// Write `array` as variable `name` in `group`.
    pub fn write_variable<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &DistArray<T>,
    ) -> Result<()> {
        let size = self.super_size(AccessMode::Write)?;
        let (dst, bytes) = self.to_file_layout(array, size)?;
        let info = slab_info::<T>(&array.global, &dst, &array.base)?;
        self.put(name, group, &info, &bytes)
    }

    /// Write `array` and tag it with a `units` attribute.
    pub fn write_var_units<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &DistArray<T>,
        units: &str,
    ) -> Result<()> {
        self.write_variable(name, group, array)?;
        self.write_attribute(UNITS, &join_path(group, name), units)
    }

    /// Write each field of a stacked array as its own variable.
    ///
    /// Field 0 is stored as `name`, field `i` as `name.i`; `name` carries
    /// the field count in `nVars`.
    pub fn write_multi_var<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &DistArray<T>,
    ) -> Result<()> {
        let axis = stacked_axis(name, array)?;
        let size = self.super_size(AccessMode::Write)?;
        let (dst, bytes) = self.to_file_layout(array, size)?;
        let block = ArrayD::from_shape_vec(IxDyn(&dst.count), elements::<T>(&bytes)?)
            .map_err(|e| IoError::InvalidShape(format!("{name}: {e}")))?;

        let info = slab_info::<T>(
            &array.global[..axis],
            &leading(&dst, axis),
            &array.base[..axis],
        )?;
        for index in 0..array.n_vars() {
            let field: Vec<T> = if dst.is_empty() {
                Vec::new()
            } else {
                block.index_axis(Axis(axis), index).iter().copied().collect()
            };
            self.put(&field_name(name, index), group, &info, bytemuck::cast_slice(&field))?;
        }
        let n_vars = i32::try_from(array.n_vars())
            .map_err(|_| IoError::InvalidShape(format!("{name}: too many fields")))?;
        self.write_attribute(N_VARS, &join_path(group, name), n_vars)
    }

    /// Write a stacked array and tag its base variable with `units`.
    pub fn write_multi_var_units<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &DistArray<T>,
        units: &str,
    ) -> Result<()> {
        self.write_multi_var(name, group, array)?;
        self.write_attribute(UNITS, &join_path(group, name), units)
    }

    /// Record the global extents and index origins of `array` on `group`.
    pub fn write_shape<T: Element>(&mut self, group: &str, array: &DistArray<T>) -> Result<()> {
        self.write_attribute(GLOBAL_DIMS, group, AttrValue::from_extents(&array.global)?)?;
        self.write_attribute(OFFSET, group, AttrValue::Int(vec![0; array.global.len()]))?;
        self.write_attribute(BASE, group, array.base.clone())
    }

    /// Global extents and index origins recorded on `group` (or on a
    /// variable), read by rank 0 and shared with every rank.
    pub fn read_shape(&mut self, group: &str) -> Result<ArrayInfo> {
        let mut info = ArrayInfo::default();
        if self.backend.get_bcast_array_info(group, &mut info) {
            Ok(info)
        } else {
            Err(IoError::backend("read the shape of", group))
        }
    }

    /// Whether the shape recorded on `group` matches `array`.
    pub fn check_conformity<T: Element>(
        &mut self,
        group: &str,
        array: &DistArray<T>,
    ) -> Result<bool> {
        let stored = self.read_shape(group)?;
        let conforms = stored.global() == array.global() && stored.bases() == array.base();
        if !conforms {
            tracing::warn!(
                "Shape of '{}' is {:?} based at {:?}, array is {:?} based at {:?}",
                group,
                stored.global(),
                stored.bases(),
                array.global(),
                array.base()
            );
        }
        Ok(conforms)
    }

    /// Read variable `name` in `group` into `array`.
    ///
    /// Aborts the group if any rank's stored block does not match the
    /// shape of `array` or cannot be read.
    pub fn read_variable<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &mut DistArray<T>,
    ) -> Result<()> {
        let size = self.super_size(AccessMode::Read)?;
        let src = array.file_region(size);
        let info = slab_info::<T>(&array.global, &src, &array.base)?;
        let mut bytes = vec![0u8; info.bytes];
        if !self.backend.read_variable(name, group, &info, &mut bytes) {
            self.abort(&format!("read {}", join_path(group, name)));
        }
        let local = repartition(
            array.comm.as_ref(),
            std::mem::size_of::<T>(),
            &array.global,
            &src,
            &bytes,
            &array.region,
        )?;
        array.store_bytes(&local)
    }

    /// Read variable `name` and its `units` attribute.
    pub fn read_var_units<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &mut DistArray<T>,
    ) -> Result<Option<String>> {
        self.read_variable(name, group, array)?;
        self.read_attribute(UNITS, &join_path(group, name))
    }

    /// Read a stacked array written by [`write_multi_var`](Self::write_multi_var).
    ///
    /// Fields beyond the stored count are left at zero. A stored count
    /// larger than `array` holds aborts the group.
    pub fn read_multi_var<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &mut DistArray<T>,
    ) -> Result<()> {
        let axis = stacked_axis(name, array)?;
        let size = self.super_size(AccessMode::Read)?;
        let path = join_path(group, name);
        let stored = self.stored_n_vars(&path)?;
        if stored > array.n_vars() {
            self.abort(&format!(
                "read {path}: nVars {stored} exceeds the {} fields of the array",
                array.n_vars()
            ));
        }

        let src = array.file_region(size);
        let field_region = leading(&src, axis);
        let info = slab_info::<T>(&array.global[..axis], &field_region, &array.base[..axis])?;
        let mut block = ArrayD::from_elem(IxDyn(&src.count), T::default());
        for index in 0..stored {
            let field = field_name(name, index);
            let mut bytes = vec![0u8; info.bytes];
            if !self.backend.read_variable(&field, group, &info, &mut bytes) {
                self.abort(&format!("read {}", join_path(group, &field)));
            }
            if src.is_empty() {
                continue;
            }
            let values = elements::<T>(&bytes)?;
            let view = ArrayViewD::from_shape(IxDyn(&field_region.count), &values)
                .map_err(|e| IoError::InvalidShape(format!("{field}: {e}")))?;
            block.index_axis_mut(Axis(axis), index).assign(&view);
        }

        let local = repartition(
            array.comm.as_ref(),
            std::mem::size_of::<T>(),
            &array.global,
            &src,
            contiguous_bytes(&block)?,
            &array.region,
        )?;
        array.store_bytes(&local)
    }

    /// Read a stacked array and the `units` of its base variable.
    pub fn read_multi_var_units<T: Element>(
        &mut self,
        name: &str,
        group: &str,
        array: &mut DistArray<T>,
    ) -> Result<Option<String>> {
        self.read_multi_var(name, group, array)?;
        self.read_attribute(UNITS, &join_path(group, name))
    }

    /// Field count of `path` as seen by rank 0, on every rank.
    fn stored_n_vars(&mut self, path: &str) -> Result<usize> {
        let comm = self.backend.comm();
        let local = if comm.rank() == 0 {
            let mut info = ArrayInfo::default();
            if self.backend.get_local_array_info(path, &mut info) {
                info.n_vars as i64
            } else {
                -1
            }
        } else {
            0
        };
        match usize::try_from(broadcast_i64(comm.as_ref(), 0, local)?) {
            Ok(n_vars) => Ok(n_vars),
            Err(_) => self.abort(&format!("read the field count of {path}")),
        }
    }

    /// Set attribute `name` on `group` on every rank of the superdomain.
    pub fn write_attribute(
        &mut self,
        name: &str,
        group: &str,
        value: impl Into<AttrValue>,
    ) -> Result<()> {
        if self.backend.write_attribute(name, group, &value.into()) {
            Ok(())
        } else {
            Err(IoError::backend("write attribute", join_path(group, name)))
        }
    }

    /// Set attribute `name` on `group` from rank 0 only.
    ///
    /// The parallel backend takes the call on every rank, since a shared
    /// file defines attributes collectively. It still writes the value once.
    pub fn write_attribute0(
        &mut self,
        name: &str,
        group: &str,
        value: impl Into<AttrValue>,
    ) -> Result<()> {
        if self.backend.rank() == 0 || self.backend.kind() == BackendKind::Parallel {
            self.write_attribute(name, group, value)
        } else {
            Ok(())
        }
    }

    /// Attribute `name` on `group`, read by rank 0 and shared with every
    /// rank. Collective; `None` when the attribute does not exist.
    pub fn read_attribute<V: FromAttr>(&mut self, name: &str, group: &str) -> Result<Option<V>> {
        let comm = self.backend.comm();
        let mut message = Vec::new();
        if comm.rank() == 0 {
            if let Some(value) = self.backend.read_attribute(name, group) {
                value.encode(&mut message);
            }
        }
        comm.broadcast(0, &mut message)?;
        if message.is_empty() {
            return Ok(None);
        }
        let (value, _) = AttrValue::decode(&message).map_err(IoError::Comm)?;
        convert(name, &value).map(Some)
    }

    /// Attribute `name` on `group` as read by rank 0. Other ranks get `None`.
    pub fn read_attribute0<V: FromAttr>(&mut self, name: &str, group: &str) -> Result<Option<V>> {
        if self.backend.rank() != 0 {
            return Ok(None);
        }
        match self.backend.read_attribute(name, group) {
            Some(value) => convert(name, &value).map(Some),
            None => Ok(None),
        }
    }
}

fn stacked_axis<T: Element>(name: &str, array: &DistArray<T>) -> Result<usize> {
    array.field_axis().ok_or_else(|| {
        IoError::InvalidShape(format!("{name}: array has no field axis"))
    })
}

fn convert<V: FromAttr>(name: &str, value: &AttrValue) -> Result<V> {
    V::from_attr(value).ok_or_else(|| IoError::AttributeType {
        name: name.to_string(),
        expected: std::any::type_name::<V>(),
        found: value.type_tag(),
    })
}
