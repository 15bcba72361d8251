//! MPI substrate, through the C shim in `csrc/`.
//!
//! MPI is initialized at `MPI_THREAD_SERIALIZED`: the environment lock
//! already guarantees no two threads enter MPI at the same time.

use super::{
    CollAttr, RecvBuffers, RequestBox, Substrate, SubstrateComm, SubstrateError,
    SubstrateRequest, SubstrateResult,
};
use crate::datatype::{DatatypeTag, ReductionTag};
use crate::error::{Error, Result};
use crate::ffi;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicBool, Ordering};

/// Set while MPI is initialized by this crate.
static MPI_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Turn a shim return code into a substrate result.
fn check(code: c_int) -> SubstrateResult<()> {
    if code == 0 {
        return Ok(());
    }
    let mut buf = [0u8; 512];
    let mut len: c_int = 0;
    let ret = unsafe { ffi::ferrocoll_error_string(code, buf.as_mut_ptr().cast(), &mut len) };
    let message = if ret == 0 {
        let len = (len.max(0) as usize).min(buf.len());
        String::from_utf8_lossy(&buf[..len]).into_owned()
    } else {
        format!("MPI error code {code}")
    };
    Err(SubstrateError::new(message))
}

/// bfloat16 crosses MPI as raw 16-bit words, which can be moved but not reduced.
fn check_reducible(dtype: DatatypeTag) -> SubstrateResult<()> {
    if dtype == DatatypeTag::Bfp16 {
        return Err(SubstrateError::new("MPI cannot reduce bfloat16 buffers"));
    }
    Ok(())
}

fn counts64(counts: &[usize]) -> Vec<i64> {
    counts.iter().map(|&c| c as i64).collect()
}

/// The MPI library, initialized once per process.
#[derive(Debug)]
pub struct MpiSubstrate {
    _private: (),
}

impl MpiSubstrate {
    /// Initialize MPI.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyInitialized`] if this crate already initialized MPI, or a
    /// substrate error if `MPI_Init_thread` fails or cannot provide serialized
    /// thread support.
    pub fn init() -> Result<Self> {
        if MPI_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }
        let mut provided: c_int = 0;
        let ret = unsafe { ffi::ferrocoll_init_thread(ffi::THREAD_SERIALIZED, &mut provided) };
        if let Err(err) = check(ret) {
            MPI_ACTIVE.store(false, Ordering::SeqCst);
            return Err(Error::Substrate {
                site: "MPI_Init_thread".into(),
                message: err.message,
            });
        }
        if provided < ffi::THREAD_SERIALIZED {
            log::warn!("MPI provides thread level {provided}, below MPI_THREAD_SERIALIZED");
        }
        log::info!(
            "MPI {} initialized (thread level {provided})",
            option_env!("FERROCOLL_MPI_VERSION").unwrap_or("(unknown version)")
        );
        Ok(MpiSubstrate { _private: () })
    }
}

impl Substrate for MpiSubstrate {
    fn name(&self) -> &str {
        "mpi"
    }

    fn create_communicator(&self) -> SubstrateResult<Box<dyn SubstrateComm>> {
        let mut handle: i32 = 0;
        check(unsafe { ffi::ferrocoll_comm_dup_world(&mut handle) })?;
        let (mut rank, mut size) = (0i32, 0i32);
        check(unsafe { ffi::ferrocoll_comm_rank(handle, &mut rank) })?;
        check(unsafe { ffi::ferrocoll_comm_size(handle, &mut size) })?;
        Ok(Box::new(MpiComm {
            handle,
            rank: rank as usize,
            size: size as usize,
        }))
    }

    fn finalize(&self) {
        if MPI_ACTIVE.swap(false, Ordering::SeqCst) {
            if let Err(err) = check(unsafe { ffi::ferrocoll_finalize() }) {
                log::error!("MPI_Finalize failed: {err}");
            }
        }
    }
}

/// A duplicate of `MPI_COMM_WORLD`.
struct MpiComm {
    handle: i32,
    rank: usize,
    size: usize,
}

impl MpiComm {
    fn request(&self, issue: impl FnOnce(*mut i64) -> c_int) -> SubstrateResult<RequestBox> {
        let mut handle: i64 = -1;
        check(issue(&mut handle))?;
        Ok(Box::new(MpiRequest { handle, done: false }))
    }
}

impl SubstrateComm for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    unsafe fn bcast(
        &self,
        buf: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        root: usize,
        _attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        self.request(|req| {
            ffi::ferrocoll_ibcast(
                buf.cast::<c_void>(),
                count as i64,
                dtype as i32,
                root as i32,
                self.handle,
                req,
            )
        })
    }

    unsafe fn allreduce(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        op: ReductionTag,
        _attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        check_reducible(dtype)?;
        self.request(|req| {
            ffi::ferrocoll_iallreduce(
                send.cast::<c_void>(),
                recv.cast::<c_void>(),
                count as i64,
                dtype as i32,
                op as i32,
                self.handle,
                req,
            )
        })
    }

    unsafe fn reduce(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        op: ReductionTag,
        root: usize,
        _attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        check_reducible(dtype)?;
        self.request(|req| {
            ffi::ferrocoll_ireduce(
                send.cast::<c_void>(),
                recv.cast::<c_void>(),
                count as i64,
                dtype as i32,
                op as i32,
                root as i32,
                self.handle,
                req,
            )
        })
    }

    unsafe fn allgatherv(
        &self,
        send: *const u8,
        send_count: usize,
        recv: RecvBuffers,
        recv_counts: &[usize],
        dtype: DatatypeTag,
        _attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        let RecvBuffers::Flat(recv) = recv else {
            return Err(SubstrateError::new(
                "MPI allgatherv needs a single receive region",
            ));
        };
        let counts = counts64(recv_counts);
        self.request(|req| {
            ffi::ferrocoll_iallgatherv(
                send.cast::<c_void>(),
                send_count as i64,
                recv.cast::<c_void>(),
                counts.as_ptr(),
                dtype as i32,
                self.handle,
                req,
            )
        })
    }

    unsafe fn alltoall(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        _attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        self.request(|req| {
            ffi::ferrocoll_ialltoall(
                send.cast::<c_void>(),
                recv.cast::<c_void>(),
                count as i64,
                dtype as i32,
                self.handle,
                req,
            )
        })
    }

    unsafe fn alltoallv(
        &self,
        send: *const u8,
        send_counts: &[usize],
        recv: *mut u8,
        recv_counts: &[usize],
        dtype: DatatypeTag,
        _attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        let (sc, rc) = (counts64(send_counts), counts64(recv_counts));
        self.request(|req| {
            ffi::ferrocoll_ialltoallv(
                send.cast::<c_void>(),
                sc.as_ptr(),
                recv.cast::<c_void>(),
                rc.as_ptr(),
                dtype as i32,
                self.handle,
                req,
            )
        })
    }

    fn barrier(&self) -> SubstrateResult<()> {
        check(unsafe { ffi::ferrocoll_barrier(self.handle) })
    }
}

impl Drop for MpiComm {
    fn drop(&mut self) {
        // Communicators still alive at finalize were freed by the shim.
        if MPI_ACTIVE.load(Ordering::SeqCst) {
            if let Err(err) = check(unsafe { ffi::ferrocoll_comm_free(self.handle) }) {
                log::warn!("failed to free communicator {}: {err}", self.handle);
            }
        }
    }
}

/// An outstanding MPI request.
struct MpiRequest {
    handle: i64,
    done: bool,
}

impl SubstrateRequest for MpiRequest {
    fn test(&mut self) -> SubstrateResult<bool> {
        if self.done {
            return Ok(true);
        }
        let mut flag: c_int = 0;
        let ret = unsafe { ffi::ferrocoll_test(self.handle, &mut flag) };
        if ret != 0 {
            self.done = true;
        }
        check(ret)?;
        if flag != 0 {
            self.done = true;
        }
        Ok(self.done)
    }

    fn wait(&mut self) -> SubstrateResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        check(unsafe { ffi::ferrocoll_wait(self.handle) })
    }
}
