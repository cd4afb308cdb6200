//! Storage backends.
//!
//! Every format implements [`Backend`]. Operations never return native
//! errors: a failure yields `false` or `None` and leaves a diagnostic in
//! the backend's [`ErrorQueue`].

mod attr;
mod ncstore;
mod parallel;
mod sequential;
mod session;
mod sidecar;
mod store;
mod tagfile;

pub use attr::{AttrValue, FromAttr};

pub(crate) use ncstore::NcStore;
pub(crate) use parallel::ParallelBackend;
pub(crate) use sequential::SequentialBackend;
pub(crate) use store::join_path;
pub(crate) use tagfile::TagStore;

use crate::comm::Communicator;
use crate::error_queue::ErrorQueue;
use crate::info::ArrayInfo;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Variable attribute holding the global extents.
pub const GLOBAL_DIMS: &str = "globalDims";
/// Variable attribute holding the slice offset.
pub const OFFSET: &str = "offset";
/// Variable attribute holding the index origins.
pub const BASE: &str = "base";
/// Variable attribute holding the number of stacked fields.
pub const N_VARS: &str = "nVars";
/// Variable attribute holding the physical units.
pub const UNITS: &str = "units";
/// Root attribute holding the superdomain size.
pub const SUPER_SIZE: &str = "superSize";
/// Root attribute holding the writer's rank.
pub const RANK: &str = "rank";

/// Storage format family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Single tag-container file (`hdf`, `dmp`).
    Legacy,
    /// Tag-container shard per rank (`hdf4`).
    SequentialV1,
    /// netCDF-4 shard per rank (`hdf5`).
    SequentialV2,
    /// One shared netCDF-4 file (`phdf5`).
    Parallel,
}

impl BackendKind {
    /// Human readable name.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Legacy => "legacy",
            BackendKind::SequentialV1 => "sequential v1",
            BackendKind::SequentialV2 => "sequential v2",
            BackendKind::Parallel => "parallel",
        }
    }

    /// Whether each rank writes its own file.
    pub fn is_sharded(self) -> bool {
        matches!(self, BackendKind::SequentialV1 | BackendKind::SequentialV2)
    }

    /// File that `rank` uses for `base` with extension `ext`.
    ///
    /// Sharded formats append `_<rank>`; the others share `base.<ext>`.
    pub fn file_name(self, base: &Path, ext: &str, rank: usize) -> PathBuf {
        let mut name = base.as_os_str().to_owned();
        if self.is_sharded() {
            name.push(format!("_{rank}"));
        }
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Uniform array I/O over one storage format.
///
/// A backend is either closed or open in exactly one access mode. Only
/// ranks inside the superdomain touch the file; on the other ranks data
/// operations succeed without doing anything.
pub trait Backend: fmt::Debug + Send {
    /// Format family.
    fn kind(&self) -> BackendKind;

    /// File extension this backend was selected for.
    fn extension(&self) -> &str;

    /// Whether the storage technology was compiled in.
    fn is_enabled(&self) -> bool;

    /// Injected communicator.
    fn comm(&self) -> Arc<dyn Communicator>;

    /// This process's rank.
    fn rank(&self) -> usize {
        self.comm().rank()
    }

    /// Superdomain size of the open file, `None` while closed.
    fn super_size(&self) -> Option<usize>;

    /// Queued diagnostics.
    fn errors(&mut self) -> &mut ErrorQueue;

    /// Open `base` for reading. Collective over every live rank.
    fn open_read(&mut self, base: &Path) -> bool;

    /// Create `base` for writing, truncating existing files. Collective
    /// over every live rank.
    fn open_write(&mut self, base: &Path) -> bool;

    /// Release cached groups, then the file.
    fn close(&mut self) -> bool;

    /// Read variable `name` in `group` into `buffer`.
    ///
    /// The stored shape is verified first; on mismatch `buffer` is left
    /// untouched.
    fn read_variable(&mut self, name: &str, group: &str, info: &ArrayInfo, buffer: &mut [u8])
        -> bool;

    /// Create variable `name` in `group` and write `buffer`, then record its
    /// `globalDims`, `offset` and `base`.
    fn write_variable(&mut self, name: &str, group: &str, info: &ArrayInfo, buffer: &[u8]) -> bool;

    /// Attribute `name` on the group or variable at `group`.
    fn read_attribute(&mut self, name: &str, group: &str) -> Option<AttrValue>;

    /// Set attribute `name` on `group`, creating the group if needed.
    fn write_attribute(&mut self, name: &str, group: &str, value: &AttrValue) -> bool;

    /// Global extents and index origins of `path`, read on rank 0 and
    /// broadcast to every live rank.
    fn get_bcast_array_info(&mut self, path: &str, info: &mut ArrayInfo) -> bool;

    /// Full descriptor of variable `path` as stored by this rank.
    fn get_local_array_info(&mut self, path: &str, info: &mut ArrayInfo) -> bool;

    /// Compare the stored shape of `name` in `group` against `info`.
    fn verify_shape(&mut self, name: &str, group: &str, info: &ArrayInfo) -> bool;

    /// Paths of all variables in storage order.
    fn variable_names(&mut self) -> Vec<String>;

    /// Names of the root attributes in storage order.
    fn attribute_names(&mut self) -> Vec<String>;
}

/// Groups resolved since the file was opened.
#[derive(Debug, Default)]
pub(crate) struct GroupCache {
    resolved: std::collections::BTreeSet<String>,
}

impl GroupCache {
    /// Make sure `group` exists, creating it in writable stores.
    pub(crate) fn create<S: store::Store>(&mut self, store: &mut S, group: &str) -> crate::Result<()> {
        let group = group.trim_matches('/');
        if group.is_empty() || self.resolved.contains(group) {
            return Ok(());
        }
        store.create_group(group)?;
        self.resolved.insert(group.to_string());
        Ok(())
    }

    /// Make sure `group` exists without creating it.
    pub(crate) fn lookup<S: store::Store>(&mut self, store: &S, group: &str) -> crate::Result<()> {
        let group = group.trim_matches('/');
        if group.is_empty() || self.resolved.contains(group) {
            return Ok(());
        }
        if !store.has_group(group) {
            return Err(crate::IoError::group_not_found(group));
        }
        self.resolved.insert(group.to_string());
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        if !self.resolved.is_empty() {
            tracing::debug!("Releasing {} cached groups", self.resolved.len());
        }
        self.resolved.clear();
    }
}
