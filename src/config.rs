//! Backend configuration.

/// Transfer modes of the parallel backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Move a whole dataset in one store call when reading.
    pub collective_read: bool,
    /// Move a whole dataset in one store call when writing.
    pub collective_write: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            collective_read: false,
            collective_write: true,
        }
    }
}

/// Configuration applied when a backend is selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoConfig {
    /// Requested superdomain size. `None` uses the live process count on
    /// write and the stored size on read.
    pub super_size: Option<usize>,
    /// Parallel backend transfer modes.
    pub parallel: ParallelConfig,
}

impl IoConfig {
    /// Configuration with a requested superdomain size.
    pub fn with_super_size(super_size: Option<usize>) -> Self {
        Self {
            super_size,
            ..Self::default()
        }
    }
}
