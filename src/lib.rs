//! Superio - distributed array I/O with superdomain repartitioning.
//!
//! Superio writes block-partitioned arrays from a group of cooperating ranks
//! to self-describing files and reads them back, possibly with a different
//! number of ranks than wrote them.
//!
//! # Features
//!
//! - One [`Backend`] interface over four storage formats
//! - Format selection by extension or by scanning a directory
//! - Superdomains: checkpoint from M ranks onto N files, restart on Q ranks
//! - Collective shape verification and aborts
//! - In-process thread cluster for running collectives without MPI
//!
//! # Example
//!
//! ```ignore
//! use superio::{factory, ArrayIo, DistArray, LocalCluster};
//! use std::path::Path;
//!
//! // Four ranks write through a superdomain of two files
//! LocalCluster::new(4).run(|comm| {
//!     let mut io = factory::select_by_extension("hdf4", Some(2), comm.clone()).unwrap();
//!     let mut array = DistArray::<f64>::new(comm, &[16, 8])?;
//!     array.fill_with(|index| index[0] as f64);
//!
//!     io.open_write(Path::new("restart"));
//!     ArrayIo::new(io.as_mut()).write_variable("rho", "fluid", &array)?;
//!     io.close();
//!     Ok::<_, superio::IoError>(())
//! })?;
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]
#![deny(unsafe_code)]

pub mod array;
pub mod backend;
pub mod comm;
pub mod config;
pub mod error;
pub mod error_queue;
pub mod factory;
pub mod info;
pub mod slab;
pub mod superdomain;
pub mod types;

pub use array::{ArrayIo, DistArray};
pub use backend::{AttrValue, Backend, BackendKind, FromAttr};
pub use comm::{CollectiveAbort, Communicator, LocalCluster, SelfComm};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use config::{IoConfig, ParallelConfig};
pub use error::{AccessMode, IoError, Result};
pub use error_queue::ErrorQueue;
pub use info::{ArrayInfo, MAX_ARRAY_DIMENSION};
pub use types::{identify, size_of, Element, TypeTag};
