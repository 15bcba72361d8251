//! Completion handles for dispatched collectives.

use crate::buffer::Buffer;
use crate::env::{substrate_error, Environment};
use crate::error::{Error, Result};
use crate::substrate::RequestBox;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// An outstanding substrate request and the environment that must be
/// locked to drive it.
struct Pending {
    request: RequestBox,
    env: Arc<Environment>,
}

/// A handle to one dispatched collective.
///
/// A handle is either *pending*, holding a substrate request together with
/// every buffer the substrate may still read or write, or *completed*. It
/// moves from pending to completed through [`is_completed`](Self::is_completed)
/// or [`wait`](Self::wait), which also release the buffers.
///
/// Dropping a pending handle aborts the process: the substrate keeps raw
/// pointers into the retained buffers until it reports completion.
///
/// # Example
///
/// ```no_run
/// use ferrocoll::{AllreduceOptions, Buffer, ProcessGroup, Rendezvous};
///
/// let pg = ProcessGroup::from_global(Rendezvous::from_env())?;
/// let grads = Buffer::from_slice(&[1.0f32, 2.0, 3.0], &[3])?;
///
/// let mut work = pg.allreduce(&[grads.clone()], &AllreduceOptions::default())?;
/// // Overlap other work here, but leave `grads` alone.
/// work.wait()?;
/// assert!(work.is_success()?);
/// # Ok::<(), ferrocoll::Error>(())
/// ```
pub struct Work {
    pending: Option<Pending>,
    buffers: Vec<Buffer>,
    op: &'static str,
}

impl Work {
    pub(crate) fn pending(
        env: Arc<Environment>,
        request: RequestBox,
        buffers: Vec<Buffer>,
        op: &'static str,
    ) -> Self {
        Work {
            pending: Some(Pending { request, env }),
            buffers,
            op,
        }
    }

    /// A handle with nothing outstanding.
    pub(crate) fn completed(op: &'static str) -> Self {
        Work {
            pending: None,
            buffers: Vec::new(),
            op,
        }
    }

    /// Name of the operation that produced this handle.
    pub fn op(&self) -> &'static str {
        self.op
    }

    /// True while a substrate request is outstanding.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of buffers kept alive for the substrate.
    pub fn retained(&self) -> usize {
        self.buffers.len()
    }

    /// Poll for completion without blocking.
    ///
    /// Returns `true` once the operation has finished, after which the
    /// retained buffers are released and may be read by the caller.
    ///
    /// # Errors
    ///
    /// A failure reported by the request itself is returned as
    /// [`Error::Substrate`] and finishes the handle. Any other error, such as
    /// [`Error::NotInitialized`] after the environment was finalized or a
    /// panic caught inside the substrate, leaves the handle pending with its
    /// buffers retained, since the substrate never reported completion.
    #[track_caller]
    pub fn is_completed(&mut self) -> Result<bool> {
        let site = Location::caller();
        let Some(Pending { request, env }) = self.pending.as_mut() else {
            return Ok(true);
        };
        match env.enter(|| Ok(request.test()))? {
            Ok(false) => Ok(false),
            Ok(true) => {
                self.finish();
                Ok(true)
            }
            Err(err) => {
                self.finish();
                Err(substrate_error(site, err))
            }
        }
    }

    /// Block until the operation completes. Always returns `true` on success.
    ///
    /// There is no way to interrupt a wait once it has started.
    ///
    /// # Errors
    ///
    /// As for [`is_completed`](Self::is_completed).
    #[track_caller]
    pub fn wait(&mut self) -> Result<bool> {
        let site = Location::caller();
        let Some(Pending { request, env }) = self.pending.as_mut() else {
            return Ok(true);
        };
        let outcome = env.enter(|| Ok(request.wait()))?;
        self.finish();
        outcome.map(|()| true).map_err(|err| substrate_error(site, err))
    }

    /// Whether the operation succeeded.
    ///
    /// The substrate reports failures from [`wait`](Self::wait) and
    /// [`is_completed`](Self::is_completed) rather than here, so a completed
    /// handle is always successful.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] while the request is still outstanding.
    pub fn is_success(&self) -> Result<bool> {
        if self.pending.is_some() {
            return Err(Error::InvalidState(format!(
                "cannot check success of {} before it has completed",
                self.op
            )));
        }
        Ok(true)
    }

    /// Always fails: the substrate cannot cancel an issued collective.
    pub fn abort(&mut self) -> Result<()> {
        Err(Error::NotImplemented(format!("abort of {}", self.op)))
    }

    fn finish(&mut self) {
        self.pending = None;
        let released = std::mem::take(&mut self.buffers).len();
        log::trace!("{} completed, released {released} buffer(s)", self.op);
    }
}

impl Drop for Work {
    fn drop(&mut self) {
        if self.pending.is_some() {
            log::error!(
                "{} handle dropped while its request is outstanding; aborting",
                self.op
            );
            eprintln!(
                "ferrocoll: fatal: {} handle dropped before completion; \
                 call wait() or poll is_completed() until it returns true",
                self.op
            );
            std::process::abort();
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("op", &self.op)
            .field("pending", &self.is_pending())
            .field("retained", &self.buffers.len())
            .finish()
    }
}
