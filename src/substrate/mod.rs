//! The communication substrate seam.
//!
//! A substrate performs the actual data movement between ranks. The engine
//! talks to it only through the traits in this module, always while holding
//! the environment lock, so implementations may assume they are never entered
//! from two threads at once.
//!
//! All data-moving calls are `unsafe`: they receive raw pointers into caller
//! memory and may keep using them until the returned request reports
//! completion.

mod local;
#[cfg(feature = "mpi")]
mod mpi;

pub use local::{LocalFabric, LocalSubstrate};
#[cfg(feature = "mpi")]
pub use mpi::MpiSubstrate;

use crate::datatype::{DatatypeTag, ReductionTag};
use thiserror::Error;

/// Error raised by a substrate implementation.
///
/// The engine never exposes this type directly; it is wrapped into
/// [`Error::Substrate`](crate::Error::Substrate) with call-site context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SubstrateError {
    /// Human-readable description
    pub message: String,
}

impl SubstrateError {
    /// Build an error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        SubstrateError {
            message: message.into(),
        }
    }
}

/// Result type for substrate calls
pub type SubstrateResult<T> = std::result::Result<T, SubstrateError>;

/// Per-call collective attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollAttr {
    /// Let the substrate cache its plan for this call
    pub to_cache: bool,
    /// Identity under which the plan is cached
    pub match_id: Option<String>,
}

impl CollAttr {
    /// Cache key for this call, if caching applies.
    pub fn cache_key(&self) -> Option<&str> {
        if self.to_cache {
            self.match_id.as_deref().filter(|id| !id.is_empty())
        } else {
            None
        }
    }
}

/// Destination of a variable-count gather.
#[derive(Debug)]
pub enum RecvBuffers {
    /// One region; rank `i`'s block starts after the blocks of ranks `0..i`
    Flat(*mut u8),
    /// One pointer per rank
    PerRank(Vec<*mut u8>),
}

/// An outstanding asynchronous substrate operation.
pub trait SubstrateRequest: Send {
    /// Poll for completion without blocking.
    fn test(&mut self) -> SubstrateResult<bool>;

    /// Block until the operation completes.
    fn wait(&mut self) -> SubstrateResult<()>;
}

/// Boxed request returned by every asynchronous substrate call
pub type RequestBox = Box<dyn SubstrateRequest>;

/// A communicator: one rank's endpoint in a group of ranks.
///
/// Every method is collective. All ranks must issue the same sequence of
/// calls, with matching roots, counts and datatypes.
pub trait SubstrateComm: Send + Sync {
    /// Rank of this endpoint.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Whether [`allgatherv`](Self::allgatherv) accepts [`RecvBuffers::PerRank`].
    fn supports_vector_allgatherv(&self) -> bool {
        false
    }

    /// Broadcast `count` elements of `buf` from `root`, in place.
    ///
    /// # Safety
    ///
    /// `buf` must be valid for `count` elements until the request completes.
    unsafe fn bcast(
        &self,
        buf: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        root: usize,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox>;

    /// Reduce across all ranks; every rank receives the result.
    ///
    /// # Safety
    ///
    /// `send` and `recv` must be valid for `count` elements until completion.
    /// They may be equal.
    unsafe fn allreduce(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        op: ReductionTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox>;

    /// Reduce across all ranks; only `root` receives the result.
    ///
    /// # Safety
    ///
    /// As for [`allreduce`](Self::allreduce).
    #[allow(clippy::too_many_arguments)]
    unsafe fn reduce(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        op: ReductionTag,
        root: usize,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox>;

    /// Gather variable-sized blocks from every rank to every rank.
    ///
    /// # Safety
    ///
    /// `send` must be valid for `send_count` elements; each destination must
    /// be valid for its `recv_counts` entry (or their sum, for a flat region)
    /// until completion.
    unsafe fn allgatherv(
        &self,
        send: *const u8,
        send_count: usize,
        recv: RecvBuffers,
        recv_counts: &[usize],
        dtype: DatatypeTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox>;

    /// Exchange `count` elements with every rank.
    ///
    /// # Safety
    ///
    /// `send` and `recv` must be valid for `count * size()` elements until
    /// completion.
    unsafe fn alltoall(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox>;

    /// Exchange variable-sized blocks with every rank.
    ///
    /// # Safety
    ///
    /// `send` must be valid for the sum of `send_counts`, `recv` for the sum
    /// of `recv_counts`, until completion.
    unsafe fn alltoallv(
        &self,
        send: *const u8,
        send_counts: &[usize],
        recv: *mut u8,
        recv_counts: &[usize],
        dtype: DatatypeTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox>;

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> SubstrateResult<()>;
}

/// Factory for communicators; one instance per process.
pub trait Substrate: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Create a communicator spanning every rank. Collective.
    fn create_communicator(&self) -> SubstrateResult<Box<dyn SubstrateComm>>;

    /// Release process-wide substrate resources. Called once, at teardown.
    fn finalize(&self) {}
}

/// Exclusive prefix sums of `counts`.
pub(crate) fn displacements(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0usize, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect()
}
