//! Ranks as MPI processes.
//!
//! Each rank is its own OS process started by `mpirun`. Messages travel
//! through MPI; nothing is shared in memory.

use super::Communicator;
use crate::error::{IoError, Result};
use mpi::datatype::{Partition, PartitionMut};
use mpi::environment::Universe;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::{Communicator as _, CommunicatorCollectives as _};
use mpi::Count;
use std::fmt;
use std::sync::Arc;

/// Communicator over an MPI process group.
pub struct MpiComm {
    comm: SimpleCommunicator,
    rank: usize,
    size: usize,
}

// MPI handles are driven only from the thread that initialized MPI.
#[allow(unsafe_code)]
unsafe impl Send for MpiComm {}
#[allow(unsafe_code)]
unsafe impl Sync for MpiComm {}

impl MpiComm {
    fn wrap(comm: SimpleCommunicator) -> Self {
        let rank = usize::try_from(comm.rank()).unwrap_or(0);
        let size = usize::try_from(comm.size()).unwrap_or(1);
        Self { comm, rank, size }
    }

    /// Private copy of the world group of `universe`.
    pub fn world(universe: &Universe) -> Arc<dyn Communicator> {
        Arc::new(Self::wrap(universe.world().duplicate()))
    }

    /// Underlying MPI communicator.
    pub fn raw(&self) -> &SimpleCommunicator {
        &self.comm
    }
}

impl fmt::Debug for MpiComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpiComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

fn to_count(len: usize) -> Result<Count> {
    Count::try_from(len).map_err(|_| IoError::Comm(format!("message of {len} bytes is too long for MPI")))
}

/// Offsets of consecutive blocks with lengths `counts`.
fn displacements(counts: &[Count]) -> Result<Vec<Count>> {
    let mut displs = Vec::with_capacity(counts.len());
    let mut next: Count = 0;
    for &count in counts {
        displs.push(next);
        next = next
            .checked_add(count)
            .ok_or_else(|| IoError::Comm("exchange exceeds the MPI count range".into()))?;
    }
    Ok(displs)
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_distributed(&self) -> bool {
        true
    }

    fn all_to_all(&self, outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        if outgoing.len() != self.size {
            return Err(IoError::Comm(format!(
                "{} messages for a group of {}",
                outgoing.len(),
                self.size
            )));
        }

        let send_counts = outgoing
            .iter()
            .map(|message| to_count(message.len()))
            .collect::<Result<Vec<Count>>>()?;
        let mut recv_counts = vec![0 as Count; self.size];
        self.comm.all_to_all_into(&send_counts[..], &mut recv_counts[..]);

        let send_displs = displacements(&send_counts)?;
        let recv_displs = displacements(&recv_counts)?;
        let send: Vec<u8> = outgoing.concat();
        let total: usize = recv_counts.iter().map(|&c| c as usize).sum();
        let mut recv = vec![0u8; total];
        {
            let partition = Partition::new(&send[..], &send_counts[..], &send_displs[..]);
            let mut received = PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
            self.comm.all_to_all_varcount_into(&partition, &mut received);
        }

        Ok(recv_counts
            .iter()
            .zip(&recv_displs)
            .map(|(&count, &displ)| recv[displ as usize..(displ + count) as usize].to_vec())
            .collect())
    }

    fn split_first(&self, n: usize) -> Result<Option<Arc<dyn Communicator>>> {
        let color = if self.rank < n {
            Color::with_value(0)
        } else {
            Color::undefined()
        };
        Ok(self
            .comm
            .split_by_color(color)
            .map(|sub| Arc::new(Self::wrap(sub)) as Arc<dyn Communicator>))
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        tracing::error!("Rank {} aborting MPI job (code {}): {}", self.rank, code, reason);
        self.comm.abort(code)
    }

    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }

    fn as_mpi(&self) -> Option<&MpiComm> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_laid_end_to_end() {
        assert_eq!(displacements(&[3, 0, 2, 5]).unwrap(), vec![0, 3, 3, 5]);
        assert!(displacements(&[Count::MAX, 1]).is_err());
        assert!(to_count(usize::MAX).is_err());
    }
}
