//! State every backend keeps between open and close.

use crate::comm::{broadcast_i64, Communicator};
use crate::error::{AccessMode, IoError, Result};
use crate::error_queue::ErrorQueue;
use crate::superdomain::SuperDomain;
use std::fmt;
use std::sync::Arc;

/// Communicator, superdomain, access mode and diagnostics of one backend.
#[derive(Debug)]
pub(crate) struct Session {
    comm: Arc<dyn Communicator>,
    superdomain: SuperDomain,
    mode: Option<AccessMode>,
    errors: ErrorQueue,
}

impl Session {
    pub(crate) fn new(comm: Arc<dyn Communicator>, requested: Option<usize>) -> Self {
        Self {
            comm,
            superdomain: SuperDomain::new(requested),
            mode: None,
            errors: ErrorQueue::new(),
        }
    }

    pub(crate) fn comm(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub(crate) fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub(crate) fn live(&self) -> usize {
        self.comm.size()
    }

    pub(crate) fn superdomain(&self) -> &SuperDomain {
        &self.superdomain
    }

    pub(crate) fn errors(&mut self) -> &mut ErrorQueue {
        &mut self.errors
    }

    /// Fail if a file is already open.
    pub(crate) fn ensure_closed(&self) -> Result<()> {
        match self.mode {
            Some(mode) => Err(IoError::AlreadyOpen { mode }),
            None => Ok(()),
        }
    }

    /// Fail unless open in `mode`.
    pub(crate) fn require(&self, mode: AccessMode) -> Result<()> {
        if self.mode == Some(mode) {
            Ok(())
        } else {
            Err(IoError::NotOpen { mode })
        }
    }

    /// Fail unless open in any mode.
    pub(crate) fn require_open(&self) -> Result<()> {
        if self.mode.is_some() {
            Ok(())
        } else {
            Err(IoError::NotOpen {
                mode: AccessMode::Read,
            })
        }
    }

    /// Enter `mode` with a superdomain of `size` ranks.
    pub(crate) fn start(&mut self, mode: AccessMode, size: usize) {
        self.superdomain.resolve(size);
        self.mode = Some(mode);
        tracing::debug!(
            "Rank {} of {} opened for {} with superdomain {}",
            self.rank(),
            self.live(),
            mode,
            size
        );
    }

    /// Leave the open state.
    pub(crate) fn end(&mut self) {
        self.mode = None;
        self.superdomain.reset();
    }

    /// Queue the error of a failed step. The step's value survives as `Some`.
    pub(crate) fn report<T>(&mut self, context: impl fmt::Display, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!("Rank {}: {}: {}", self.rank(), context, err);
                self.errors.push(format!("{context}: {err}"));
                None
            },
        }
    }

    /// Learn the superdomain size stored in a file.
    ///
    /// Rank 0 runs `read_stored` and broadcasts the result to every live
    /// rank. A stored size larger than the live group aborts the group.
    pub(crate) fn discover_super_size(
        &mut self,
        read_stored: impl FnOnce() -> Result<usize>,
    ) -> Result<usize> {
        let local = if self.rank() == 0 {
            match read_stored() {
                Ok(size) => size as i64,
                Err(err) => {
                    self.report("reading superdomain size", Err::<(), _>(err));
                    -1
                },
            }
        } else {
            0
        };

        let shared = broadcast_i64(self.comm.as_ref(), 0, local)?;
        let size = usize::try_from(shared)
            .map_err(|_| IoError::Comm("rank 0 could not read the superdomain size".into()))?;
        let live = self.live();
        if size > live {
            let err = IoError::SuperdomainTooLarge {
                super_size: size,
                live,
            };
            self.errors.push(err.to_string());
            self.comm.abort(-1, &err.to_string());
        }
        Ok(size)
    }

    /// Share rank 0's view of an array's global shape with every live rank.
    pub(crate) fn broadcast_shape(
        &mut self,
        read_root: impl FnOnce() -> Result<(Vec<usize>, Vec<i32>)>,
    ) -> Result<(Vec<usize>, Vec<i32>)> {
        let mut message = Vec::new();
        if self.rank() == 0 {
            match read_root() {
                Ok((global, base)) => {
                    message.push(1u8);
                    for value in &global {
                        message.extend_from_slice(&(*value as u64).to_le_bytes());
                    }
                    for value in &base {
                        message.extend_from_slice(&(i64::from(*value)).to_le_bytes());
                    }
                },
                Err(err) => {
                    self.report("reading array shape", Err::<(), _>(err));
                    message.push(0u8);
                },
            }
        }

        self.comm.broadcast(0, &mut message)?;
        match message.split_first() {
            Some((1, words)) if words.len() % 16 == 0 => {
                let n = words.len() / 16;
                let values: Vec<[u8; 8]> = words
                    .chunks_exact(8)
                    .map(|c| {
                        let mut word = [0u8; 8];
                        word.copy_from_slice(c);
                        word
                    })
                    .collect();
                let global = values[..n].iter().map(|w| u64::from_le_bytes(*w) as usize).collect();
                let base = values[n..]
                    .iter()
                    .map(|w| i64::from_le_bytes(*w) as i32)
                    .collect();
                Ok((global, base))
            },
            _ => Err(IoError::Comm("rank 0 could not read the array shape".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;

    #[test]
    fn report_keeps_the_context() {
        let mut session = Session::new(crate::comm::SelfComm::shared(), None);
        let value: Option<()> = session.report(
            "open run.hdf for read",
            Err(IoError::group_not_found("testData")),
        );
        assert!(value.is_none());
        let text = session.errors().drain();
        assert!(text.starts_with("open run.hdf for read: Group testData"));
    }

    #[test]
    fn shape_is_shared_from_rank_zero() {
        let shapes = LocalCluster::new(3)
            .run(|comm| {
                let mut session = Session::new(comm, None);
                session
                    .broadcast_shape(|| Ok((vec![3, 4, 5], vec![1, 0, -2])))
                    .unwrap()
            })
            .unwrap();
        for shape in shapes {
            assert_eq!(shape, (vec![3, 4, 5], vec![1, 0, -2]));
        }
    }

    #[test]
    fn oversized_superdomain_aborts_everyone() {
        let err = LocalCluster::new(2)
            .run(|comm| {
                let mut session = Session::new(comm, None);
                session.discover_super_size(|| Ok(4)).ok()
            })
            .unwrap_err();
        assert!(err.reason.contains("exceeds live process count 2"));
    }
}
