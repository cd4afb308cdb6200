//! Storage primitives shared by the sequential and parallel engines.
//!
//! A store is one open file. Paths address objects in its group tree:
//! `""` is the root, `"a/b"` is group `b` inside `a`, and a variable path
//! is its group path joined with the variable name.

use super::attr::AttrValue;
use crate::comm::Communicator;
use crate::error::Result;
use crate::types::TypeTag;
use std::fmt;
use std::path::Path;

/// On-disk description of a variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VarShape {
    pub(crate) dims: Vec<usize>,
    pub(crate) data_type: TypeTag,
    pub(crate) n_attr: usize,
}

/// One open file of some storage technology.
pub(crate) trait Store: Sized + fmt::Debug + Send {
    /// Whether the technology was compiled in.
    const ENABLED: bool;

    /// Create or truncate `path` for writing.
    fn create(path: &Path) -> Result<Self>;

    /// Open an existing `path` for reading.
    fn open(path: &Path) -> Result<Self>;

    /// Create `path` with every rank of `comm` holding a handle on it.
    /// Collective over `comm`.
    ///
    /// `None` when the store cannot share a file between ranks of `comm`;
    /// callers then route all data through one rank.
    fn create_shared(_path: &Path, _comm: &dyn Communicator) -> Option<Result<Self>> {
        None
    }

    /// Open an existing `path` on every rank of `comm`. Collective over
    /// `comm`; `None` as for [`Store::create_shared`].
    fn open_shared(_path: &Path, _comm: &dyn Communicator) -> Option<Result<Self>> {
        None
    }

    /// Choose collective or independent transfers for variable `path` of
    /// a shared file.
    fn set_transfer(&mut self, _path: &str, _collective: bool) -> Result<()> {
        Ok(())
    }

    /// Flush and release the file.
    fn close(self) -> Result<()>;

    /// Whether `group` exists.
    fn has_group(&self, group: &str) -> bool;

    /// Create `group` and any missing parents; existing groups are left alone.
    fn create_group(&mut self, group: &str) -> Result<()>;

    /// Create variable `name` in `group` with extents `dims`.
    fn define_variable(&mut self, group: &str, name: &str, tag: TypeTag, dims: &[usize])
        -> Result<()>;

    /// Write `count` elements at `start` of variable `path`.
    fn write_slab(&mut self, path: &str, start: &[usize], count: &[usize], data: &[u8])
        -> Result<()>;

    /// Read `count` elements at `start` of variable `path`.
    fn read_slab(&self, path: &str, start: &[usize], count: &[usize], out: &mut [u8])
        -> Result<()>;

    /// Shape of variable `path`, `None` if it does not exist.
    fn variable_shape(&self, path: &str) -> Result<Option<VarShape>>;

    /// Attribute `name` on the group or variable at `owner`.
    ///
    /// A missing owner is an error; a missing attribute is `None`.
    fn attribute(&self, owner: &str, name: &str) -> Result<Option<AttrValue>>;

    /// Store attribute `name` on `owner`, replacing a previous value.
    /// A missing owner is created as a group.
    fn put_attribute(&mut self, owner: &str, name: &str, value: &AttrValue) -> Result<()>;

    /// Paths of every variable in storage order.
    fn variable_paths(&self) -> Result<Vec<String>>;

    /// Names of the root attributes in storage order.
    fn root_attribute_names(&self) -> Result<Vec<String>>;
}

/// Join a group path and a child name.
pub(crate) fn join_path(group: &str, name: &str) -> String {
    let group = group.trim_matches('/');
    if group.is_empty() {
        name.to_string()
    } else {
        format!("{group}/{name}")
    }
}

/// Split a path into its parent group and final component.
pub(crate) fn split_path(path: &str) -> (&str, &str) {
    let path = path.trim_matches('/');
    match path.rsplit_once('/') {
        Some((parent, leaf)) => (parent, leaf),
        None => ("", path),
    }
}
