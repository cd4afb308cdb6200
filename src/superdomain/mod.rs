//! Superdomain coordination.
//!
//! The superdomain is the set of processes that actually touch a file. A
//! computation running on P ranks may write through S < P of them and be
//! read back later by a run of Q ranks; data is regathered onto the
//! superdomain partitioning before every write and scattered back to the
//! live partitioning after every read.

mod partition;
mod repartition;

pub use partition::{process_grid, Partition};
pub use repartition::repartition;

/// Superdomain size of one backend session.
///
/// A backend starts unresolved, resolves once when a file is opened and
/// returns to unresolved on close. It never re-resolves while open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperDomain {
    /// No file is open. `requested` is the caller's preference, if any.
    Unresolved {
        /// Size asked for at construction.
        requested: Option<usize>,
    },
    /// A file is open with this many participating ranks.
    Resolved {
        /// Number of ranks that touch the file.
        size: usize,
        /// Size asked for at construction.
        requested: Option<usize>,
    },
}

impl SuperDomain {
    /// Unresolved superdomain. A request of zero counts as no request.
    pub fn new(requested: Option<usize>) -> Self {
        Self::Unresolved {
            requested: requested.filter(|&n| n > 0),
        }
    }

    /// Size asked for at construction.
    pub fn requested(&self) -> Option<usize> {
        match *self {
            Self::Unresolved { requested } | Self::Resolved { requested, .. } => requested,
        }
    }

    /// Resolved size, if a file is open.
    pub fn size(&self) -> Option<usize> {
        match *self {
            Self::Resolved { size, .. } => Some(size),
            Self::Unresolved { .. } => None,
        }
    }

    /// Whether `rank` takes part in file access. Always false while unresolved.
    pub fn includes(&self, rank: usize) -> bool {
        self.size().is_some_and(|size| rank < size)
    }

    /// Size to use when writing with `live` ranks: the request when it is
    /// smaller than the live count, otherwise the live count.
    pub fn write_size(&self, live: usize) -> usize {
        match self.requested() {
            Some(requested) if requested < live => requested,
            Some(requested) => {
                if requested > live {
                    tracing::warn!(
                        "Requested superdomain of {} exceeds {} live ranks, using {}",
                        requested,
                        live,
                        live
                    );
                }
                live
            },
            None => live,
        }
    }

    /// Fix the size for the open session.
    pub fn resolve(&mut self, size: usize) {
        debug_assert!(self.size().is_none(), "superdomain resolved twice");
        *self = Self::Resolved {
            size,
            requested: self.requested(),
        };
    }

    /// Return to the unresolved state, keeping the request.
    pub fn reset(&mut self) {
        *self = Self::new(self.requested());
    }
}

impl Default for SuperDomain {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_size_is_capped_by_live_ranks() {
        assert_eq!(SuperDomain::new(Some(2)).write_size(4), 2);
        assert_eq!(SuperDomain::new(Some(8)).write_size(4), 4);
        assert_eq!(SuperDomain::new(None).write_size(4), 4);
        assert_eq!(SuperDomain::new(Some(0)).write_size(3), 3);
    }

    #[test]
    fn close_returns_to_the_request() {
        let mut state = SuperDomain::new(Some(3));
        assert!(!state.includes(0));
        state.resolve(2);
        assert_eq!(state.size(), Some(2));
        assert!(state.includes(1));
        assert!(!state.includes(2));
        state.reset();
        assert_eq!(state, SuperDomain::Unresolved { requested: Some(3) });
    }
}
