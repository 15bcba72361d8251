//! # ferrocoll
//!
//! A collective-communication process group over a pluggable, non-reentrant
//! communication substrate.
//!
//! The crate provides:
//! - A [`ProcessGroup`] engine that validates buffers and dispatches
//!   broadcast, reduce, all-reduce, all-gather, gather, scatter, all-to-all
//!   and barrier to the substrate
//! - [`Work`] handles for asynchronous completion, which keep the buffers
//!   involved alive until the substrate is done with them
//! - A buffer layout reconciler ([`layout::flatten`]) that detects per-rank
//!   buffers already laid out back to back and avoids staging copies
//! - An [`Environment`] that owns the substrate, serializes every call into
//!   it under one lock, and tears it down at process exit
//! - An in-process substrate ([`substrate::LocalFabric`]) running one rank
//!   per thread, and an MPI substrate behind the `mpi` feature
//!
//! ## Quick Start
//!
//! ```no_run
//! use ferrocoll::{AllreduceOptions, Buffer, ProcessGroup, ReduceOp, Rendezvous};
//!
//! fn main() -> Result<(), ferrocoll::Error> {
//!     let pg = ProcessGroup::from_global(Rendezvous::from_env())?;
//!     println!("Hello from rank {} of {}", pg.rank(), pg.size());
//!
//!     let grads = Buffer::from_slice(&[pg.rank() as f32; 8], &[8])?;
//!     let opts = AllreduceOptions { reduce_op: ReduceOp::Sum, ..Default::default() };
//!     pg.allreduce(&[grads.clone()], &opts)?.wait()?;
//!
//!     println!("Rank {}: {:?}", pg.rank(), grads.to_vec::<f32>()?);
//!     Ok(())
//! }
//! ```
//!
//! ## Emulating several ranks in one process
//!
//! ```
//! use ferrocoll::substrate::LocalFabric;
//! use ferrocoll::{BroadcastOptions, Buffer, EngineConfig, Environment, ProcessGroup};
//!
//! let handles: Vec<_> = LocalFabric::endpoints(2)
//!     .into_iter()
//!     .map(|endpoint| {
//!         std::thread::spawn(move || -> ferrocoll::Result<Vec<i32>> {
//!             let env = Environment::new(endpoint, EngineConfig::default());
//!             let pg = ProcessGroup::new(env, None, Some(2))?;
//!             let buf = Buffer::from_slice(&[pg.rank() as i32 + 7; 3], &[3])?;
//!             pg.broadcast(&[buf.clone()], &BroadcastOptions::default())?.wait()?;
//!             buf.to_vec::<i32>()
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     assert_eq!(handle.join().unwrap().unwrap(), vec![7, 7, 7]);
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `mpi`   | MPI substrate through a compiled C shim | system MPI |
//!
//! ## Configuration
//!
//! See [`EngineConfig`] for the `FERROCOLL_*` environment variables and
//! [`Rendezvous`] for the launcher variables used to cross-check rank and size.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

mod buffer;
mod config;
mod datatype;
mod env;
mod error;
#[cfg(feature = "mpi")]
mod ffi;
mod launch;
pub mod layout;
mod options;
mod process_group;
pub mod substrate;
mod work;

pub use buffer::{Buffer, Device, Layout};
pub use config::{AllgatherMode, EngineConfig};
pub use datatype::{DatatypeTag, Element, ElementType, ReduceOp, ReductionTag};
pub use env::Environment;
pub use error::{Error, Result};
pub use launch::Rendezvous;
pub use options::{
    AllToAllOptions, AllgatherOptions, AllreduceCoalescedOptions, AllreduceOptions,
    BarrierOptions, BroadcastOptions, GatherOptions, ReduceOptions, ReduceScatterOptions,
    ScatterOptions,
};
pub use process_group::ProcessGroup;
pub use work::Work;
