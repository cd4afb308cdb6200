//! Shared-file backend.
//!
//! The first `superSize` ranks form a subgroup. Every rank of the subgroup
//! owns a hyperslab of each dataset, which is sized to the global extents.
//!
//! When the store can open one file on every rank of the subgroup (netCDF
//! over MPI-IO), each rank writes its own hyperslab at its offset. Otherwise
//! the subgroup's rank 0 aggregates writes and holds the only writable
//! handle, while for reading every member opens the file itself.

use super::attr::AttrValue;
use super::session::Session;
use super::sidecar;
use super::store::{join_path, Store};
use super::{Backend, BackendKind, GroupCache, RANK, SUPER_SIZE};
use crate::comm::Communicator;
use crate::config::ParallelConfig;
use crate::error::{AccessMode, IoError, Result};
use crate::error_queue::ErrorQueue;
use crate::info::ArrayInfo;
use crate::slab::{self, Region};
use std::path::Path;
use std::sync::Arc;

const AGGREGATOR: usize = 0;

/// Shared-file backend over store `S`.
#[derive(Debug)]
pub(crate) struct ParallelBackend<S: Store> {
    extension: String,
    session: Session,
    config: ParallelConfig,
    sub: Option<Arc<dyn Communicator>>,
    store: Option<S>,
    /// Every subgroup rank holds a handle on the file.
    shared: bool,
    groups: GroupCache,
}

impl<S: Store> ParallelBackend<S> {
    pub(crate) fn new(
        extension: &str,
        super_size: Option<usize>,
        config: ParallelConfig,
        comm: Arc<dyn Communicator>,
    ) -> Self {
        let requested = if comm.is_distributed() {
            super_size
        } else {
            tracing::warn!(
                "No distributed communicator, {} files are handled by a single process",
                extension
            );
            Some(1)
        };
        Self {
            extension: extension.to_string(),
            session: Session::new(comm, requested),
            config,
            sub: None,
            store: None,
            shared: false,
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

    fn is_aggregator(&self) -> bool {
        self.sub.as_ref().is_some_and(|sub| sub.rank() == AGGREGATOR)
    }

    fn try_open_write(&mut self, base: &Path) -> Result<()> {
        self.ensure_enabled()?;
        self.session.ensure_closed()?;
        let size = self.session.superdomain().write_size(self.session.live());
        let sub = self.session.comm().split_first(size)?;
        let path = BackendKind::Parallel.file_name(base, &self.extension, 0);
        let stamp = |mut store: S| -> Result<S> {
            store.put_attribute("", SUPER_SIZE, &AttrValue::from(size as i32))?;
            store.put_attribute("", RANK, &AttrValue::from(0i32))?;
            Ok(store)
        };

        if let Some(sub) = &sub {
            match S::create_shared(&path, sub.as_ref()) {
                Some(created) => {
                    let created = agree(sub.as_ref(), created.and_then(stamp), "create the shared file")?;
                    tracing::debug!("Rank {} writes {} through a shared handle", sub.rank(), path.display());
                    self.store = Some(created);
                    self.shared = true;
                },
                None => {
                    let created = (sub.rank() == AGGREGATOR).then(|| S::create(&path).and_then(stamp));
                    self.store = settle(sub.as_ref(), created, "create the shared file")?;
                },
            }
        }

        self.sub = sub;
        self.session.start(AccessMode::Write, size);
        Ok(())
    }

    fn try_open_read(&mut self, base: &Path) -> Result<()> {
        self.ensure_enabled()?;
        self.session.ensure_closed()?;
        let live = self.session.live();
        let path = BackendKind::Parallel.file_name(base, &self.extension, 0);

        let size = match self.session.superdomain().requested() {
            Some(size) if size > live => {
                return Err(IoError::SuperdomainTooLarge {
                    super_size: size,
                    live,
                });
            },
            Some(size) => size,
            None => self.session.discover_super_size(|| {
                let store = S::open(&path)?;
                let size = sidecar::stored_super_size(&store);
                store.close()?;
                size
            })?,
        };

        let sub = self.session.comm().split_first(size)?;
        if let Some(sub) = &sub {
            let opened = match S::open_shared(&path, sub.as_ref()) {
                Some(opened) => {
                    self.shared = true;
                    opened
                },
                None => S::open(&path),
            };
            self.store = Some(agree(sub.as_ref(), opened, &format!("open {}", path.display()))?);
        }

        self.sub = sub;
        self.session.start(AccessMode::Read, size);
        Ok(())
    }

    fn try_close(&mut self) -> Result<()> {
        self.groups.clear();
        let result = match self.store.take() {
            Some(store) => store.close(),
            None => Ok(()),
        };
        self.sub = None;
        self.shared = false;
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
        let Some(sub) = self.sub.clone() else {
            return Ok(());
        };
        let path = join_path(group, name);
        let local = check_slab(&path, info, buffer.len());

        if self.shared {
            // Defining the variable is collective, so nobody starts unless every slab is sound.
            agree(sub.as_ref(), local, &format!("validate its slab of {path}"))?;
            let written = self.write_own_slab(name, group, info, buffer);
            return agree(sub.as_ref(), written, &format!("write its slab of {path}"));
        }

        // A rank with a bad slab still joins the gather so nobody waits on it.
        let mut message = Vec::new();
        if local.is_ok() {
            Region::new(info.offsets().to_vec(), info.local().to_vec()).encode(&mut message);
            message.extend_from_slice(buffer);
        }
        let gathered = sub.gather(AGGREGATOR, &message)?;

        let written = match (gathered, self.store.as_mut()) {
            (Some(parts), Some(store)) => {
                let result = write_gathered(
                    store,
                    &mut self.groups,
                    self.config.collective_write,
                    name,
                    group,
                    info,
                    &parts,
                );
                Some(result)
            },
            _ => None,
        };
        let settled = settle(sub.as_ref(), written, "write the dataset");
        local?;
        settled.map(|_| ())
    }

    /// Write this rank's hyperslab through its own handle on the shared file.
    fn write_own_slab(&mut self, name: &str, group: &str, info: &ArrayInfo, buffer: &[u8]) -> Result<()> {
        let store = self.store.as_mut().ok_or(IoError::NotOpen {
            mode: AccessMode::Write,
        })?;
        let path = join_path(group, name);
        let global = info.global();

        self.groups.create(store, group)?;
        store.define_variable(group, name, info.data_type, global)?;
        store.set_transfer(&path, self.config.collective_write)?;
        // Collective transfers need every rank, empty slabs included.
        if self.config.collective_write || info.local_len() > 0 {
            store.write_slab(&path, info.offsets(), info.local(), buffer)?;
        }

        let stored = ArrayInfo::slab(info.data_type, global, global, &vec![0; global.len()])?
            .with_base(info.bases())?;
        sidecar::put_array_info(store, &path, &stored)
    }

    fn local_verify(&mut self, name: &str, group: &str, info: &ArrayInfo) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        self.groups.lookup(store, group)?;
        sidecar::verify_stored_shape(store, &join_path(group, name), info.global(), self.session.rank())
    }

    fn try_verify(&mut self, name: &str, group: &str, info: &ArrayInfo) -> Result<()> {
        self.ensure_enabled()?;
        self.session.require_open()?;
        let Some(sub) = self.sub.clone() else {
            return Ok(());
        };
        let local = self.local_verify(name, group, info);
        let failed = sub.all_reduce_or(local.is_err())?;
        local?;
        if failed {
            return Err(IoError::ShapeMismatch {
                path: join_path(group, name),
                detail: format!("process {}: another rank saw a different shape", self.session.rank()),
            });
        }
        Ok(())
    }

    fn try_read_variable(
        &mut self,
        name: &str,
        group: &str,
        info: &ArrayInfo,
        buffer: &mut [u8],
    ) -> Result<()> {
        let Some(sub) = self.sub.clone() else {
            return Ok(());
        };
        let path = join_path(group, name);
        let local = check_slab(&path, info, buffer.len());
        let mine = Region::new(info.offsets().to_vec(), info.local().to_vec());

        if self.shared || !self.config.collective_read {
            local?;
            let store = self.store.as_ref().ok_or(IoError::NotOpen {
                mode: AccessMode::Read,
            })?;
            return store.read_slab(&path, &mine.start, &mine.count, buffer);
        }

        let mut request = Vec::new();
        if local.is_ok() {
            mine.encode(&mut request);
        }
        let requests = sub.gather(AGGREGATOR, &request)?;
        let parts = match (requests, self.store.as_ref()) {
            (Some(requests), Some(store)) => Some(read_for_all(store, &path, info, &requests)),
            _ => None,
        };
        // The aggregator keeps its own error; everyone else learns that it failed.
        let parts = settle(sub.as_ref(), parts, "read the dataset")?;
        let part = sub.scatter(AGGREGATOR, parts)?;
        local?;
        if part.len() != buffer.len() {
            return Err(IoError::Comm(format!(
                "received {} bytes of {path} for a {} byte slab",
                part.len(),
                buffer.len()
            )));
        }
        buffer.copy_from_slice(&part);
        Ok(())
    }

    fn open_store(&self) -> Result<&S> {
        self.ensure_enabled()?;
        self.session.require_open()?;
        self.store.as_ref().ok_or_else(|| {
            IoError::Comm(format!(
                "rank {} holds no handle to the shared file",
                self.session.rank()
            ))
        })
    }
}

/// Validate a rank's slab against its buffer.
fn check_slab(path: &str, info: &ArrayInfo, len: usize) -> Result<()> {
    info.validate()?;
    let expected = info.local_len() * info.data_type.size_of();
    if len != expected {
        return Err(IoError::BufferSize {
            path: path.to_string(),
            expected,
            actual: len,
        });
    }
    Ok(())
}

/// Fail on every rank when any rank's `local` result failed.
fn agree<T>(sub: &dyn Communicator, local: Result<T>, what: &str) -> Result<T> {
    let failed = sub.all_reduce_or(local.is_err())?;
    match local {
        Err(err) => Err(err),
        Ok(_) if failed => Err(IoError::Comm(format!("another rank failed to {what}"))),
        Ok(value) => Ok(value),
    }
}

/// Agree on the aggregator's outcome across the subgroup.
///
/// The aggregator passes `Some(result)`, the others `None`. Every rank
/// returns an error when the aggregator failed.
fn settle<T>(sub: &dyn Communicator, outcome: Option<Result<T>>, what: &str) -> Result<Option<T>> {
    let mut flag = match &outcome {
        Some(Ok(_)) => vec![1u8],
        Some(Err(_)) => vec![0u8],
        None => Vec::new(),
    };
    sub.broadcast(AGGREGATOR, &mut flag)?;
    match outcome {
        Some(result) => result.map(Some),
        None if flag.first() == Some(&1) => Ok(None),
        None => Err(IoError::Comm(format!("the aggregator failed to {what}"))),
    }
}

fn write_gathered<S: Store>(
    store: &mut S,
    groups: &mut GroupCache,
    collective: bool,
    name: &str,
    group: &str,
    info: &ArrayInfo,
    parts: &[Vec<u8>],
) -> Result<()> {
    let path = join_path(group, name);
    let elem = info.data_type.size_of();
    let global = info.global();

    let mut slabs = Vec::with_capacity(parts.len());
    for (rank, part) in parts.iter().enumerate() {
        if part.is_empty() {
            return Err(IoError::Comm(format!("rank {rank} sent no slab for {path}")));
        }
        let (region, data) = Region::decode_prefix(part)?;
        if !region.fits(global) || data.len() != region.len() * elem {
            return Err(IoError::ShapeMismatch {
                path,
                detail: format!(
                    "rank {rank} sent {} bytes for {:?} at {:?} of {global:?}",
                    data.len(),
                    region.count,
                    region.start
                ),
            });
        }
        slabs.push((region, data));
    }

    groups.create(store, group)?;
    store.define_variable(group, name, info.data_type, global)?;
    if collective {
        let mut whole = vec![0u8; info.global_len() * elem];
        for (region, data) in &slabs {
            if !region.is_empty() {
                slab::place(&mut whole, global, region, data, elem)?;
            }
        }
        store.write_slab(&path, &vec![0; global.len()], global, &whole)?;
    } else {
        for (region, data) in slabs.iter().filter(|(r, _)| !r.is_empty()) {
            store.write_slab(&path, &region.start, &region.count, data)?;
        }
    }

    let stored = ArrayInfo::slab(info.data_type, global, global, &vec![0; global.len()])?
        .with_base(info.bases())?;
    sidecar::put_array_info(store, &path, &stored)
}

fn read_for_all<S: Store>(
    store: &S,
    path: &str,
    info: &ArrayInfo,
    requests: &[Vec<u8>],
) -> Result<Vec<Vec<u8>>> {
    let elem = info.data_type.size_of();
    let global = info.global();
    let mut whole = vec![0u8; info.global_len() * elem];
    store.read_slab(path, &vec![0; global.len()], global, &mut whole)?;
    requests
        .iter()
        .map(|request| {
            if request.is_empty() {
                return Ok(Vec::new());
            }
            let region = Region::decode(request)?;
            slab::extract(&whole, global, &region, elem)
        })
        .collect()
}

impl<S: Store> Backend for ParallelBackend<S> {
    fn kind(&self) -> BackendKind {
        BackendKind::Parallel
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
            return self.session.report("read", Err::<(), _>(err)).is_some();
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
        let writer = self.shared || self.is_aggregator();
        let result = self.ready(AccessMode::Write).and_then(|()| match self.store.as_mut() {
            Some(store) if writer => store.put_attribute(group, name, value),
            _ => Ok(()),
        });
        let context = format!("write attribute {name} on '{group}'");
        self.session.report(context, result).is_some()
    }

    fn get_bcast_array_info(&mut self, path: &str, info: &mut ArrayInfo) -> bool {
        let root = self.open_store().map(|_| ());
        let store = self.store.as_ref();
        let result = self.session.broadcast_shape(|| {
            root?;
            let store = store.ok_or(IoError::NotOpen {
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

impl<S: Store> Drop for ParallelBackend<S> {
    fn drop(&mut self) {
        if self.store.is_some() {
            let _ = self.try_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::store::VarShape;
    use crate::backend::TagStore;
    use crate::comm::{LocalCluster, SelfComm};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use crate::superdomain::Partition;
    use crate::types::TypeTag;

    fn slab_info(global: &[usize], region: &Region) -> ArrayInfo {
        ArrayInfo::slab(TypeTag::Int, global, &region.count, &region.start).unwrap()
    }

    fn fill(global: &[usize], region: &Region) -> Vec<u8> {
        let mut values = Vec::new();
        for i in region.start[0]..region.start[0] + region.count[0] {
            for j in region.start[1]..region.start[1] + region.count[1] {
                values.push((i * global[1] + j) as i32);
            }
        }
        bytemuck::cast_slice(&values).to_vec()
    }

    fn round_trip(config: ParallelConfig) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("shared");
        let global = [6, 4];

        let results = LocalCluster::new(3)
            .run(|comm| {
                let rank = comm.rank();
                let mut io = ParallelBackend::<TagStore>::new("phdf5", Some(2), config, comm);

                assert!(io.open_write(&base));
                let region = Partition::new(&global, 2).region(rank);
                let data = if rank < 2 { fill(&global, &region) } else { Vec::new() };
                let info = slab_info(&global, &region);
                assert!(io.write_variable("ids", "grid", &info, &data));
                assert!(io.close());

                let mut io = ParallelBackend::<TagStore>::new("phdf5", None, config, io.comm());
                assert!(io.open_read(&base));
                assert_eq!(io.super_size(), Some(2));
                let mut out = vec![0u8; data.len()];
                assert!(io.read_variable("ids", "grid", &info, &mut out));
                assert!(io.close());
                out == data
            })
            .unwrap();
        assert_eq!(results, vec![true, true, true]);
        assert!(dir.path().join("shared.phdf5").exists());
    }

    #[test]
    fn collective_round_trip() {
        round_trip(ParallelConfig {
            collective_read: true,
            collective_write: true,
        });
    }

    #[test]
    fn independent_round_trip() {
        round_trip(ParallelConfig {
            collective_read: false,
            collective_write: false,
        });
    }

    #[test]
    fn shape_mismatch_fails_on_every_rank() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("shared");
        let global = [4, 4];

        let results = LocalCluster::new(2)
            .run(|comm| {
                let rank = comm.rank();
                let mut io =
                    ParallelBackend::<TagStore>::new("phdf5", None, ParallelConfig::default(), comm);
                assert!(io.open_write(&base));
                let region = Partition::new(&global, 2).region(rank);
                let info = slab_info(&global, &region);
                assert!(io.write_variable("ids", "", &info, &fill(&global, &region)));
                assert!(io.close());

                assert!(io.open_read(&base));
                // Only rank 1 asks for the wrong global extents.
                let wanted = if rank == 1 {
                    ArrayInfo::slab(TypeTag::Int, &[4, 5], &region.count, &region.start).unwrap()
                } else {
                    info
                };
                let mut out = vec![7u8; wanted.bytes];
                let ok = io.read_variable("ids", "", &wanted, &mut out);
                assert!(out.iter().all(|&b| b == 7));
                assert!(io.close());
                ok
            })
            .unwrap();
        assert_eq!(results, vec![false, false]);
    }

    #[test]
    fn aggregator_read_failure_reaches_every_rank() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("shared");
        let global = [4, 4];
        let config = ParallelConfig {
            collective_read: true,
            collective_write: true,
        };

        let queues = LocalCluster::new(2)
            .run(|comm| {
                let rank = comm.rank();
                let mut io = ParallelBackend::<TagStore>::new("phdf5", None, config, comm);
                assert!(io.open_write(&base));
                let region = Partition::new(&global, 2).region(rank);
                assert!(io.write_variable("ids", "", &slab_info(&global, &region), &fill(&global, &region)));
                assert!(io.close());

                assert!(io.open_read(&base));
                // Same extents, wider element type than stored.
                let wanted =
                    ArrayInfo::slab(TypeTag::Double, &global, &region.count, &region.start).unwrap();
                let mut out = vec![0u8; wanted.bytes];
                let ok = io.read_variable("ids", "", &wanted, &mut out);
                assert!(io.close());
                (ok, io.errors().drain())
            })
            .unwrap();

        assert!(!queues[0].0);
        assert!(queues[0].1.contains("holds 128 bytes, expected 64"), "{}", queues[0].1);
        assert!(!queues[1].0);
        assert!(
            queues[1].1.contains("the aggregator failed to read the dataset"),
            "{}",
            queues[1].1
        );
    }

    /// Tag store opened once and shared by every rank of a cluster,
    /// standing in for a file opened through MPI-IO.
    #[derive(Debug)]
    struct SharedTag {
        path: PathBuf,
        inner: Arc<Mutex<Option<TagStore>>>,
    }

    type Handles = HashMap<PathBuf, (Arc<Mutex<Option<TagStore>>>, usize)>;

    fn handles() -> &'static Mutex<Handles> {
        static HANDLES: OnceLock<Mutex<Handles>> = OnceLock::new();
        HANDLES.get_or_init(Default::default)
    }

    fn writes() -> &'static Mutex<HashMap<PathBuf, Vec<Region>>> {
        static WRITES: OnceLock<Mutex<HashMap<PathBuf, Vec<Region>>>> = OnceLock::new();
        WRITES.get_or_init(Default::default)
    }

    impl SharedTag {
        fn attach(path: &Path) -> Result<Self> {
            let mut handles = handles().lock();
            let (inner, count) = handles
                .get_mut(path)
                .ok_or_else(|| IoError::Comm(format!("{} is not shared", path.display())))?;
            *count += 1;
            Ok(Self {
                path: path.to_path_buf(),
                inner: Arc::clone(inner),
            })
        }

        fn join(
            path: &Path,
            comm: &dyn Communicator,
            make: impl FnOnce(&Path) -> Result<TagStore>,
        ) -> Option<Result<Self>> {
            let made = if comm.rank() == 0 {
                make(path).map(|store| {
                    let inner = Arc::new(Mutex::new(Some(store)));
                    handles().lock().insert(path.to_path_buf(), (inner, 0));
                })
            } else {
                Ok(())
            };
            let joined = comm.barrier();
            Some(made.and(joined).and_then(|()| Self::attach(path)))
        }

        fn with<R>(&self, f: impl FnOnce(&mut TagStore) -> Result<R>) -> Result<R> {
            let mut guard = self.inner.lock();
            let store = guard
                .as_mut()
                .ok_or_else(|| IoError::Comm(format!("{} is closed", self.path.display())))?;
            f(store)
        }
    }

    impl Store for SharedTag {
        const ENABLED: bool = true;

        fn create(path: &Path) -> Result<Self> {
            Self::join(path, &SelfComm, TagStore::create).unwrap()
        }

        fn open(path: &Path) -> Result<Self> {
            Self::join(path, &SelfComm, TagStore::open).unwrap()
        }

        fn create_shared(path: &Path, comm: &dyn Communicator) -> Option<Result<Self>> {
            Self::join(path, comm, TagStore::create)
        }

        fn open_shared(path: &Path, comm: &dyn Communicator) -> Option<Result<Self>> {
            Self::join(path, comm, TagStore::open)
        }

        fn close(self) -> Result<()> {
            let mut handles = handles().lock();
            let Some((_, count)) = handles.get_mut(&self.path) else {
                return Ok(());
            };
            *count -= 1;
            if *count > 0 {
                return Ok(());
            }
            handles.remove(&self.path);
            match self.inner.lock().take() {
                Some(store) => store.close(),
                None => Ok(()),
            }
        }

        fn has_group(&self, group: &str) -> bool {
            self.inner.lock().as_ref().is_some_and(|store| store.has_group(group))
        }

        fn create_group(&mut self, group: &str) -> Result<()> {
            self.with(|store| store.create_group(group))
        }

        fn define_variable(&mut self, group: &str, name: &str, tag: TypeTag, dims: &[usize]) -> Result<()> {
            // Every rank defines; the first one wins.
            self.with(|store| match store.variable_shape(&join_path(group, name))? {
                Some(_) => Ok(()),
                None => store.define_variable(group, name, tag, dims),
            })
        }

        fn write_slab(&mut self, path: &str, start: &[usize], count: &[usize], data: &[u8]) -> Result<()> {
            writes()
                .lock()
                .entry(self.path.clone())
                .or_default()
                .push(Region::new(start.to_vec(), count.to_vec()));
            self.with(|store| store.write_slab(path, start, count, data))
        }

        fn read_slab(&self, path: &str, start: &[usize], count: &[usize], out: &mut [u8]) -> Result<()> {
            self.with(|store| store.read_slab(path, start, count, out))
        }

        fn variable_shape(&self, path: &str) -> Result<Option<VarShape>> {
            self.with(|store| store.variable_shape(path))
        }

        fn attribute(&self, owner: &str, name: &str) -> Result<Option<AttrValue>> {
            self.with(|store| store.attribute(owner, name))
        }

        fn put_attribute(&mut self, owner: &str, name: &str, value: &AttrValue) -> Result<()> {
            self.with(|store| store.put_attribute(owner, name, value))
        }

        fn variable_paths(&self) -> Result<Vec<String>> {
            self.with(|store| store.variable_paths())
        }

        fn root_attribute_names(&self) -> Result<Vec<String>> {
            self.with(|store| store.root_attribute_names())
        }
    }

    #[test]
    fn shared_files_take_one_slab_per_rank() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("shared");
        let global = [6, 4];
        let partition = Partition::new(&global, 3);

        let results = LocalCluster::new(3)
            .run(|comm| {
                let rank = comm.rank();
                let config = ParallelConfig::default();
                let mut io = ParallelBackend::<SharedTag>::new("phdf5", Some(3), config, comm.clone());
                assert!(io.open_write(&base));
                assert!(io.shared);
                let region = partition.region(rank);
                let data = fill(&global, &region);
                let info = slab_info(&global, &region);
                assert!(io.write_variable("ids", "grid", &info, &data));
                assert!(io.write_attribute("units", "grid/ids", &AttrValue::from("count")));
                assert!(io.close());
                comm.barrier().unwrap();

                let mut io = ParallelBackend::<SharedTag>::new("phdf5", None, config, comm);
                assert!(io.open_read(&base));
                assert_eq!(io.super_size(), Some(3));
                let mut out = vec![0u8; data.len()];
                assert!(io.read_variable("ids", "grid", &info, &mut out));
                let units = io.read_attribute("units", "grid/ids");
                assert!(io.close());
                out == data && units == Some(AttrValue::from("count"))
            })
            .unwrap();
        assert_eq!(results, vec![true, true, true]);

        let file = dir.path().join("shared.phdf5");
        let mut logged = writes().lock().remove(&file).unwrap();
        logged.sort_by(|a, b| a.start.cmp(&b.start));
        let expected: Vec<Region> = (0..3).map(|rank| partition.region(rank)).collect();
        assert_eq!(logged, expected);
    }

    #[test]
    fn single_process_runs_with_one_rank() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = ParallelBackend::<TagStore>::new(
            "phdf5",
            Some(4),
            ParallelConfig::default(),
            SelfComm::shared(),
        );
        assert!(io.open_write(&dir.path().join("solo")));
        assert_eq!(io.super_size(), Some(1));
        assert!(io.close());
    }
}
