//! Backends where every participating rank owns a whole file.
//!
//! The legacy format writes a single file from rank 0. The sequential
//! formats write one shard per rank, each holding that rank's slice at
//! its local extents.

use super::attr::AttrValue;
use super::session::Session;
use super::sidecar;
use super::store::{join_path, Store};
use super::{Backend, BackendKind, GroupCache, RANK, SUPER_SIZE};
use crate::comm::Communicator;
use crate::error::{AccessMode, IoError, Result};
use crate::error_queue::ErrorQueue;
use crate::info::ArrayInfo;
use std::path::Path;
use std::sync::Arc;

/// File-per-rank backend over store `S`.
#[derive(Debug)]
pub(crate) struct SequentialBackend<S: Store> {
    kind: BackendKind,
    extension: String,
    session: Session,
    store: Option<S>,
    groups: GroupCache,
}

impl<S: Store> SequentialBackend<S> {
    /// Backend of `kind` for files ending in `extension`.
    pub(crate) fn new(
        kind: BackendKind,
        extension: &str,
        super_size: Option<usize>,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        let requested = if kind.is_sharded() {
            super_size
        } else {
            if super_size.is_some_and(|n| n > 1) {
                tracing::debug!("The {} format is written by rank 0 alone", kind);
            }
            Some(1)
        };
        Self {
            kind,
            extension: extension.to_string(),
            session: Session::new(comm, requested),
            store: None,
            groups: GroupCache::default(),
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if S::ENABLED {
            Ok(())
        } else {
            Err(IoError::backend_disabled(self.extension.as_str()))
        }
    }

    fn ready(&self, mode: AccessMode) -> Result<()> {
        self.ensure_enabled()?;
        self.session.require(mode)
    }

    fn try_open_write(&mut self, base: &Path) -> Result<()> {
        self.ensure_enabled()?;
        self.session.ensure_closed()?;
        let rank = self.session.rank();
        let size = self.session.superdomain().write_size(self.session.live());
        if rank < size {
            let path = self.kind.file_name(base, &self.extension, rank);
            let mut store = S::create(&path)?;
            store.put_attribute("", SUPER_SIZE, &AttrValue::from(size as i32))?;
            store.put_attribute("", RANK, &AttrValue::from(rank as i32))?;
            self.store = Some(store);
        }
        self.session.start(AccessMode::Write, size);
        Ok(())
    }

    fn try_open_read(&mut self, base: &Path) -> Result<()> {
        self.ensure_enabled()?;
        self.session.ensure_closed()?;
        let rank = self.session.rank();
        let live = self.session.live();
        let (kind, ext) = (self.kind, self.extension.as_str());

        let mut store = None;
        let size = match self.session.superdomain().requested() {
            Some(size) if size > live => {
                return Err(IoError::SuperdomainTooLarge {
                    super_size: size,
                    live,
                });
            },
            Some(size) => size,
            None => self.session.discover_super_size(|| {
                let opened = S::open(&kind.file_name(base, ext, 0))?;
                let size = sidecar::stored_super_size(&opened)?;
                store = Some(opened);
                Ok(size)
            })?,
        };

        if rank < size && store.is_none() {
            store = Some(S::open(&kind.file_name(base, ext, rank))?);
        }
        self.store = store;
        self.session.start(AccessMode::Read, size);
        Ok(())
    }

    fn try_close(&mut self) -> Result<()> {
        self.groups.clear();
        let result = match self.store.take() {
            Some(store) => store.close(),
            None => Ok(()),
        };
        self.session.end();
        result
    }

    fn try_write_variable(
        &mut self,
        name: &str,
        group: &str,
        info: &ArrayInfo,
        buffer: &[u8],
    ) -> Result<()> {
        self.ready(AccessMode::Write)?;
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        info.validate()?;
        let path = join_path(group, name);
        let expected = info.local_len() * info.data_type.size_of();
        if buffer.len() != expected {
            return Err(IoError::BufferSize {
                path,
                expected,
                actual: buffer.len(),
            });
        }

        self.groups.create(store, group)?;
        store.define_variable(group, name, info.data_type, info.local())?;
        store.write_slab(&path, &vec![0; info.n_dims], info.local(), buffer)?;
        sidecar::put_array_info(store, &path, info)
    }

    fn try_verify(&mut self, name: &str, group: &str, info: &ArrayInfo) -> Result<()> {
        self.ensure_enabled()?;
        self.session.require_open()?;
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        self.groups.lookup(store, group)?;
        sidecar::verify_stored_shape(store, &join_path(group, name), info.local(), self.session.rank())
    }

    fn try_read_variable(
        &mut self,
        name: &str,
        group: &str,
        info: &ArrayInfo,
        buffer: &mut [u8],
    ) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let path = join_path(group, name);
        let expected = info.local_len() * info.data_type.size_of();
        if buffer.len() != expected {
            return Err(IoError::BufferSize {
                path,
                expected,
                actual: buffer.len(),
            });
        }
        store.read_slab(&path, &vec![0; info.n_dims], info.local(), buffer)
    }

    fn open_store(&self) -> Result<&S> {
        self.ensure_enabled()?;
        self.session.require_open()?;
        self.store.as_ref().ok_or_else(|| {
            IoError::Comm(format!(
                "rank {} is outside the superdomain of {}",
                self.session.rank(),
                self.session.superdomain().size().unwrap_or(0)
            ))
        })
    }
}

impl<S: Store> Backend for SequentialBackend<S> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn extension(&self) -> &str {
        &self.extension
    }

    fn is_enabled(&self) -> bool {
        S::ENABLED
    }

    fn comm(&self) -> Arc<dyn Communicator> {
        Arc::clone(self.session.comm())
    }

    fn super_size(&self) -> Option<usize> {
        self.session.superdomain().size()
    }

    fn errors(&mut self) -> &mut ErrorQueue {
        self.session.errors()
    }

    fn open_read(&mut self, base: &Path) -> bool {
        let result = self.try_open_read(base);
        let context = format!("open {} for read", base.display());
        self.session.report(context, result).is_some()
    }

    fn open_write(&mut self, base: &Path) -> bool {
        let result = self.try_open_write(base);
        let context = format!("open {} for write", base.display());
        self.session.report(context, result).is_some()
    }

    fn close(&mut self) -> bool {
        let result = self.try_close();
        self.session.report("close", result).is_some()
    }

    fn read_variable(
        &mut self,
        name: &str,
        group: &str,
        info: &ArrayInfo,
        buffer: &mut [u8],
    ) -> bool {
        if let Err(err) = self.ready(AccessMode::Read) {
            let context = format!("read {}", join_path(group, name));
            return self.session.report(context, Err::<(), _>(err)).is_some();
        }
        if !self.verify_shape(name, group, info) {
            return false;
        }
        let result = self.try_read_variable(name, group, info, buffer);
        let context = format!("read {}", join_path(group, name));
        self.session.report(context, result).is_some()
    }

    fn write_variable(&mut self, name: &str, group: &str, info: &ArrayInfo, buffer: &[u8]) -> bool {
        let result = self.try_write_variable(name, group, info, buffer);
        let context = format!("write {}", join_path(group, name));
        self.session.report(context, result).is_some()
    }

    fn read_attribute(&mut self, name: &str, group: &str) -> Option<AttrValue> {
        let result = self.open_store().and_then(|store| {
            store
                .attribute(group, name)?
                .ok_or_else(|| IoError::attribute_not_found(group, name))
        });
        self.session.report("read attribute", result)
    }

    fn write_attribute(&mut self, name: &str, group: &str, value: &AttrValue) -> bool {
        let result = self.ready(AccessMode::Write).and_then(|()| match self.store.as_mut() {
            Some(store) => store.put_attribute(group, name, value),
            None => Ok(()),
        });
        let context = format!("write attribute {name} on '{group}'");
        self.session.report(context, result).is_some()
    }

    fn get_bcast_array_info(&mut self, path: &str, info: &mut ArrayInfo) -> bool {
        let root = self.open_store().map(|_| ());
        let store = self.store.as_ref();
        let result = self.session.broadcast_shape(|| {
            root?;
            let store = store.ok_or_else(|| IoError::NotOpen {
                mode: AccessMode::Read,
            })?;
            sidecar::read_global_shape(store, path)
        });
        let result = result.and_then(|(global, base)| {
            let mut shared = ArrayInfo::new(info.data_type);
            shared.n_dims = global.len();
            shared.global_dims[..global.len()].copy_from_slice(&global);
            shared.base[..base.len()].copy_from_slice(&base);
            shared.validate()?;
            Ok(shared)
        });
        match self.session.report(format!("array info for {path}"), result) {
            Some(shared) => {
                *info = shared;
                true
            },
            None => false,
        }
    }

    fn get_local_array_info(&mut self, path: &str, info: &mut ArrayInfo) -> bool {
        let result = self
            .open_store()
            .and_then(|store| sidecar::read_local_info(store, path));
        match self.session.report(format!("array info for {path}"), result) {
            Some(local) => {
                *info = local;
                true
            },
            None => false,
        }
    }

    fn verify_shape(&mut self, name: &str, group: &str, info: &ArrayInfo) -> bool {
        let result = self.try_verify(name, group, info);
        let context = format!("verify {}", join_path(group, name));
        self.session.report(context, result).is_some()
    }

    fn variable_names(&mut self) -> Vec<String> {
        match self.store.as_ref() {
            Some(store) if S::ENABLED => {
                let result = store.variable_paths();
                self.session.report("list variables", result).unwrap_or_default()
            },
            _ => Vec::new(),
        }
    }

    fn attribute_names(&mut self) -> Vec<String> {
        match self.store.as_ref() {
            Some(store) if S::ENABLED => {
                let result = store.root_attribute_names();
                self.session.report("list attributes", result).unwrap_or_default()
            },
            _ => Vec::new(),
        }
    }
}

impl<S: Store> Drop for SequentialBackend<S> {
    fn drop(&mut self) {
        if self.store.is_some() {
            let _ = self.try_close();
        }
    }
}
