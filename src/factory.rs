//! Backend selection by file extension or by what is on disk.

use crate::backend::{
    Backend, BackendKind, NcStore, ParallelBackend, SequentialBackend, TagStore,
};
use crate::comm::Communicator;
use crate::config::IoConfig;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Extensions checked by [`select_by_directory_scan`], in order.
pub const SCAN_ORDER: [&str; 5] = ["hdf", "dmp", "hdf4", "hdf5", "phdf5"];

/// Format family serving `ext`, if any.
pub fn kind_for_extension(ext: &str) -> Option<BackendKind> {
    match ext {
        "hdf" | "dmp" => Some(BackendKind::Legacy),
        "hdf4" => Some(BackendKind::SequentialV1),
        "hdf5" => Some(BackendKind::SequentialV2),
        "phdf5" => Some(BackendKind::Parallel),
        _ => None,
    }
}

/// Backend for files ending in `ext`.
///
/// `super_size` of `None` uses the live rank count on write and the stored
/// size on read.
pub fn select_by_extension(
    ext: &str,
    super_size: Option<usize>,
    comm: Arc<dyn Communicator>,
) -> Option<Box<dyn Backend>> {
    select_with_config(ext, &IoConfig::with_super_size(super_size), comm)
}

/// Backend for files ending in `ext`, configured by `config`.
pub fn select_with_config(
    ext: &str,
    config: &IoConfig,
    comm: Arc<dyn Communicator>,
) -> Option<Box<dyn Backend>> {
    let Some(kind) = kind_for_extension(ext) else {
        tracing::debug!("No backend for extension '{}'", ext);
        return None;
    };
    let super_size = config.super_size;
    let backend: Box<dyn Backend> = match kind {
        BackendKind::Legacy | BackendKind::SequentialV1 => {
            Box::new(SequentialBackend::<TagStore>::new(kind, ext, super_size, comm))
        },
        BackendKind::SequentialV2 => {
            Box::new(SequentialBackend::<NcStore>::new(kind, ext, super_size, comm))
        },
        BackendKind::Parallel => Box::new(ParallelBackend::<NcStore>::new(
            ext,
            super_size,
            config.parallel,
            comm,
        )),
    };
    if !backend.is_enabled() {
        tracing::info!("Backend for '{}' is disabled in this build", ext);
    }
    Some(backend)
}

/// Backend for the first file of `base` found in `dir`.
///
/// Candidates are checked in [`SCAN_ORDER`]: `base.hdf`, `base.dmp`,
/// `base_0.hdf4`, `base_0.hdf5`, `base.phdf5`.
pub fn select_by_directory_scan(
    base: &str,
    dir: &Path,
    super_size: Option<usize>,
    comm: Arc<dyn Communicator>,
) -> Option<Box<dyn Backend>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("Unable to scan {}: {}", dir.display(), err);
            return None;
        },
    };
    let names: HashSet<String> = entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();

    for ext in SCAN_ORDER {
        let Some(kind) = kind_for_extension(ext) else {
            continue;
        };
        let expected = kind.file_name(Path::new(base), ext, 0);
        if names.contains(expected.to_string_lossy().as_ref()) {
            tracing::info!("Found {} in {}", expected.display(), dir.display());
            return select_by_extension(ext, super_size, comm);
        }
    }

    tracing::warn!("No file for '{}' in {}", base, dir.display());
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;

    #[test]
    fn extensions_map_to_kinds() {
        let comm = SelfComm::shared();
        for (ext, kind) in [
            ("hdf", BackendKind::Legacy),
            ("dmp", BackendKind::Legacy),
            ("hdf4", BackendKind::SequentialV1),
            ("hdf5", BackendKind::SequentialV2),
            ("phdf5", BackendKind::Parallel),
        ] {
            let backend = select_by_extension(ext, None, Arc::clone(&comm)).unwrap();
            assert_eq!(backend.kind(), kind);
            assert_eq!(backend.extension(), ext);
        }
        assert!(select_by_extension("nc", None, comm).is_none());
    }

    #[test]
    fn scan_prefers_earlier_formats() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run_0.hdf4"), b"").unwrap();
        fs::write(dir.path().join("run.phdf5"), b"").unwrap();
        let backend = select_by_directory_scan("run", dir.path(), None, SelfComm::shared()).unwrap();
        assert_eq!(backend.kind(), BackendKind::SequentialV1);

        fs::write(dir.path().join("run.dmp"), b"").unwrap();
        let backend = select_by_directory_scan("run", dir.path(), None, SelfComm::shared()).unwrap();
        assert_eq!(backend.extension(), "dmp");
    }

    #[test]
    fn scan_without_match_or_directory_is_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("other_0.hdf4"), b"").unwrap();
        assert!(select_by_directory_scan("run", dir.path(), None, SelfComm::shared()).is_none());
        let missing = dir.path().join("nowhere");
        assert!(select_by_directory_scan("run", &missing, None, SelfComm::shared()).is_none());
    }
}
