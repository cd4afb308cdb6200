//! Process-group communication.
//!
//! Backends receive their rank, process count and collectives through an
//! injected [`Communicator`] rather than a global runtime. Every collective
//! here is built on one primitive, [`Communicator::all_to_all`].

mod local;
#[cfg(feature = "mpi")]
mod mpi_comm;

pub use local::{LocalCluster, LocalComm};
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

use crate::error::{IoError, Result};
use std::fmt;
use std::sync::Arc;

/// Payload of a collective abort.
///
/// Aborting unwinds every rank of the group with this value as the panic
/// payload, so no rank is left waiting on a peer that already failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectiveAbort {
    /// Exit code requested by the aborting rank.
    pub code: i32,
    /// Rank that initiated the abort.
    pub rank: usize,
    /// Diagnostic supplied by the aborting rank.
    pub reason: String,
}

impl fmt::Display for CollectiveAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rank {} aborted the group (code {}): {}",
            self.rank, self.code, self.reason
        )
    }
}

/// A group of cooperating ranks.
pub trait Communicator: fmt::Debug + Send + Sync {
    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Whether ranks run as separate workers able to share one file.
    fn is_distributed(&self) -> bool;

    /// Send `outgoing[r]` to every rank `r` and receive one message from
    /// every rank, indexed by sender. Collective.
    fn all_to_all(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>>;

    /// Subgroup of the first `n` ranks. Collective over this group; ranks
    /// at or beyond `n` receive `None`.
    fn split_first(&self, n: usize) -> Result<Option<Arc<dyn Communicator>>>;

    /// Terminate every rank of the group.
    fn abort(&self, code: i32, reason: &str) -> !;

    /// The MPI group behind this communicator, if any.
    #[cfg(feature = "mpi")]
    fn as_mpi(&self) -> Option<&MpiComm> {
        None
    }

    /// Block until every rank has arrived.
    fn barrier(&self) -> Result<()> {
        self.all_to_all(vec![Vec::new(); self.size()]).map(|_| ())
    }

    /// Replace `data` on every rank with the value held by `root`.
    fn broadcast(&self, root: usize, data: &mut Vec<u8>) -> Result<()> {
        let outgoing = if self.rank() == root {
            vec![data.clone(); self.size()]
        } else {
            vec![Vec::new(); self.size()]
        };
        let mut incoming = self.all_to_all(outgoing)?;
        *data = take_from(&mut incoming, root)?;
        Ok(())
    }

    /// Collect one message from every rank on `root`.
    fn gather(&self, root: usize, data: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let mut outgoing = vec![Vec::new(); self.size()];
        *outgoing
            .get_mut(root)
            .ok_or_else(|| IoError::Comm(format!("gather root {root} out of range")))? =
            data.to_vec();
        let incoming = self.all_to_all(outgoing)?;
        Ok((self.rank() == root).then_some(incoming))
    }

    /// Deliver `parts[r]` from `root` to every rank `r`.
    fn scatter(&self, root: usize, parts: Option<Vec<Vec<u8>>>) -> Result<Vec<u8>> {
        let outgoing = match parts {
            Some(parts) if self.rank() == root => {
                if parts.len() != self.size() {
                    return Err(IoError::Comm(format!(
                        "scatter of {} parts over {} ranks",
                        parts.len(),
                        self.size()
                    )));
                }
                parts
            },
            _ => vec![Vec::new(); self.size()],
        };
        let mut incoming = self.all_to_all(outgoing)?;
        take_from(&mut incoming, root)
    }

    /// Every rank's message, on every rank.
    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.all_to_all(vec![data.to_vec(); self.size()])
    }

    /// Logical OR of `flag` across the group.
    fn all_reduce_or(&self, flag: bool) -> Result<bool> {
        let flags = self.all_gather(&[u8::from(flag)])?;
        Ok(flags.iter().any(|f| f.first() == Some(&1)))
    }
}

fn take_from(incoming: &mut [Vec<u8>], rank: usize) -> Result<Vec<u8>> {
    incoming
        .get_mut(rank)
        .map(std::mem::take)
        .ok_or_else(|| IoError::Comm(format!("no message from rank {rank}")))
}

/// Broadcast a signed integer from `root`.
pub fn broadcast_i64(comm: &dyn Communicator, root: usize, value: i64) -> Result<i64> {
    let mut bytes = value.to_le_bytes().to_vec();
    comm.broadcast(root, &mut bytes)?;
    let word: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| IoError::Comm(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(i64::from_le_bytes(word))
}

/// The group containing only this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl SelfComm {
    /// Shared handle to the single-process group.
    pub fn shared() -> Arc<dyn Communicator> {
        Arc::new(SelfComm)
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn is_distributed(&self) -> bool {
        false
    }

    fn all_to_all(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != 1 {
            return Err(IoError::Comm(format!(
                "{} messages for a group of 1",
                outgoing.len()
            )));
        }
        Ok(outgoing)
    }

    fn split_first(&self, n: usize) -> Result<Option<Arc<dyn Communicator>>> {
        Ok((n > 0).then(SelfComm::shared))
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        tracing::error!("Aborting (code {}): {}", code, reason);
        std::panic::panic_any(CollectiveAbort {
            code,
            rank: 0,
            reason: reason.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_comm_collectives_are_identities() {
        let comm = SelfComm;
        let mut data = vec![1, 2, 3];
        comm.broadcast(0, &mut data).unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(comm.gather(0, &[7]).unwrap(), Some(vec![vec![7]]));
        assert_eq!(comm.scatter(0, Some(vec![vec![9]])).unwrap(), vec![9]);
        assert!(comm.all_reduce_or(true).unwrap());
        assert!(!comm.all_reduce_or(false).unwrap());
        assert_eq!(broadcast_i64(&comm, 0, -1).unwrap(), -1);
        assert!(comm.split_first(0).unwrap().is_none());
        assert_eq!(comm.split_first(3).unwrap().map(|c| c.size()), Some(1));
    }

    #[test]
    fn self_comm_abort_unwinds_with_payload() {
        let result = std::panic::catch_unwind(|| {
            SelfComm.abort(3, "shape mismatch");
        });
        let payload = result.unwrap_err();
        let abort = payload.downcast_ref::<CollectiveAbort>().unwrap();
        assert_eq!(abort.code, 3);
        assert_eq!(abort.reason, "shape mismatch");
    }
}
