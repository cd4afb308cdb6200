//! In-process cluster: one thread per rank.

use super::{CollectiveAbort, Communicator};
use crate::error::{IoError, Result};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One exchange slot per communicator. Reused across rounds; a round's
/// results are only replaced once every rank has deposited again, which
/// cannot happen before each has collected the previous round.
#[derive(Debug)]
struct Round {
    generation: u64,
    handles: usize,
    arrived: usize,
    deposits: Vec<Option<Vec<Vec<u8>>>>,
    results: Vec<Vec<Vec<u8>>>,
}

impl Round {
    fn new(size: usize) -> Self {
        Self {
            generation: 0,
            handles: 0,
            arrived: 0,
            deposits: vec![None; size],
            results: vec![Vec::new(); size],
        }
    }

    fn complete(&mut self) {
        let size = self.deposits.len();
        let mut results = vec![vec![Vec::new(); size]; size];
        for (sender, deposit) in self.deposits.iter_mut().enumerate() {
            if let Some(messages) = deposit.take() {
                for (receiver, message) in messages.into_iter().enumerate() {
                    results[receiver][sender] = message;
                }
            }
        }
        self.results = results;
        self.arrived = 0;
        self.generation += 1;
    }
}

#[derive(Debug, Default)]
struct ClusterState {
    aborted: Option<CollectiveAbort>,
    rounds: HashMap<String, Round>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<ClusterState>,
    wake: Condvar,
}

impl Shared {
    fn mark_aborted(&self, abort: CollectiveAbort) {
        let mut state = self.state.lock();
        if state.aborted.is_none() {
            state.aborted = Some(abort);
        }
        self.wake.notify_all();
    }
}

/// Communicator handle of one rank in a [`LocalCluster`].
#[derive(Debug)]
pub struct LocalComm {
    shared: Arc<Shared>,
    key: String,
    rank: usize,
    size: usize,
    splits: AtomicU64,
}

impl LocalComm {
    fn world(shared: Arc<Shared>, rank: usize, size: usize) -> Self {
        Self::attach(shared, "world".to_string(), rank, size)
    }

    /// Handle on the exchange slot `key`, which lives while any handle does.
    fn attach(shared: Arc<Shared>, key: String, rank: usize, size: usize) -> Self {
        shared
            .state
            .lock()
            .rounds
            .entry(key.clone())
            .or_insert_with(|| Round::new(size))
            .handles += 1;
        Self {
            shared,
            key,
            rank,
            size,
            splits: AtomicU64::new(0),
        }
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        let released = match state.rounds.get_mut(&self.key) {
            Some(round) => {
                round.handles = round.handles.saturating_sub(1);
                round.handles == 0
            },
            None => false,
        };
        if released {
            state.rounds.remove(&self.key);
        }
    }
}

impl Communicator for LocalComm {
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

        let mut state = self.shared.state.lock();
        if let Some(abort) = state.aborted.clone() {
            drop(state);
            panic::panic_any(abort);
        }

        let size = self.size;
        let round = state
            .rounds
            .entry(self.key.clone())
            .or_insert_with(|| Round::new(size));
        let generation = round.generation;
        round.deposits[self.rank] = Some(outgoing);
        round.arrived += 1;

        if round.arrived == size {
            round.complete();
            self.shared.wake.notify_all();
        } else {
            loop {
                self.shared.wake.wait(&mut state);
                if let Some(abort) = state.aborted.clone() {
                    drop(state);
                    panic::panic_any(abort);
                }
                let done = state
                    .rounds
                    .get(&self.key)
                    .map_or(true, |r| r.generation != generation);
                if done {
                    break;
                }
            }
        }

        let round = state
            .rounds
            .get_mut(&self.key)
            .ok_or_else(|| IoError::Comm(format!("exchange {} vanished", self.key)))?;
        Ok(std::mem::take(&mut round.results[self.rank]))
    }

    fn split_first(&self, n: usize) -> Result<Option<Arc<dyn Communicator>>> {
        let seq = self.splits.fetch_add(1, Ordering::Relaxed);
        self.barrier()?;
        let size = n.min(self.size);
        if self.rank >= size {
            return Ok(None);
        }
        Ok(Some(Arc::new(LocalComm::attach(
            Arc::clone(&self.shared),
            format!("{}/{}:{}", self.key, seq, size),
            self.rank,
            size,
        ))))
    }

    fn abort(&self, code: i32, reason: &str) -> ! {
        let abort = CollectiveAbort {
            code,
            rank: self.rank,
            reason: reason.to_string(),
        };
        tracing::error!("{}", abort);
        self.shared.mark_aborted(abort.clone());
        panic::panic_any(abort)
    }
}

/// Runs a closure once per rank, each on its own thread.
#[derive(Debug, Clone, Copy)]
pub struct LocalCluster {
    size: usize,
}

impl LocalCluster {
    /// Cluster of `size` ranks (at least one).
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on every rank and collect the per-rank results in rank order.
    ///
    /// Returns the first [`CollectiveAbort`] if any rank aborted the group.
    /// Any other panic on a rank wakes its peers and is resumed here.
    pub fn run<T, F>(&self, f: F) -> std::result::Result<Vec<T>, CollectiveAbort>
    where
        F: Fn(Arc<dyn Communicator>) -> T + Sync,
        T: Send,
    {
        let shared = Arc::new(Shared::default());
        let size = self.size;

        let outcomes: Vec<std::thread::Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let shared = Arc::clone(&shared);
                    let f = &f;
                    scope.spawn(move || {
                        let comm: Arc<dyn Communicator> =
                            Arc::new(LocalComm::world(Arc::clone(&shared), rank, size));
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(comm)));
                        if let Err(payload) = &outcome {
                            if payload.downcast_ref::<CollectiveAbort>().is_none() {
                                shared.mark_aborted(CollectiveAbort {
                                    code: -1,
                                    rank,
                                    reason: panic_message(payload.as_ref()),
                                });
                            }
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().and_then(|outcome| outcome))
                .collect()
        });

        let mut results = Vec::with_capacity(size);
        let mut foreign_panic = None;
        for outcome in outcomes {
            match outcome {
                Ok(value) => results.push(value),
                Err(payload) => {
                    if payload.downcast_ref::<CollectiveAbort>().is_none() && foreign_panic.is_none()
                    {
                        foreign_panic = Some(payload);
                    }
                },
            }
        }
        if let Some(payload) = foreign_panic {
            panic::resume_unwind(payload);
        }

        let aborted = shared.state.lock().aborted.clone();
        match aborted {
            Some(abort) => Err(abort),
            None => Ok(results),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "rank panicked".to_string()
    }
}
