//! Raw FFI bindings to the C shim in `csrc/ferrocoll.c`.
//!
//! These are low-level unsafe functions. Use [`MpiSubstrate`](crate::substrate::MpiSubstrate).

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int, c_void};

pub type int32_t = i32;
pub type int64_t = i64;

/// `MPI_THREAD_SERIALIZED`: calls come from many threads, never at once.
pub const THREAD_SERIALIZED: c_int = 2;

extern "C" {
    // ============================================================
    // Lifecycle
    // ============================================================

    pub fn ferrocoll_init_thread(required: c_int, provided: *mut c_int) -> c_int;
    pub fn ferrocoll_finalize() -> c_int;
    pub fn ferrocoll_error_string(code: c_int, buf: *mut c_char, len: *mut c_int) -> c_int;

    // ============================================================
    // Communicators
    // ============================================================

    pub fn ferrocoll_comm_dup_world(comm: *mut int32_t) -> c_int;
    pub fn ferrocoll_comm_free(comm: int32_t) -> c_int;
    pub fn ferrocoll_comm_rank(comm: int32_t, rank: *mut int32_t) -> c_int;
    pub fn ferrocoll_comm_size(comm: int32_t, size: *mut int32_t) -> c_int;

    pub fn ferrocoll_barrier(comm: int32_t) -> c_int;

    // ============================================================
    // Nonblocking Collectives
    // ============================================================

    pub fn ferrocoll_ibcast(
        buf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        root: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn ferrocoll_iallreduce(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        op: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn ferrocoll_ireduce(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        op: int32_t,
        root: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn ferrocoll_iallgatherv(
        sendbuf: *const c_void,
        sendcount: int64_t,
        recvbuf: *mut c_void,
        recvcounts: *const int64_t,
        datatype_tag: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn ferrocoll_ialltoall(
        sendbuf: *const c_void,
        recvbuf: *mut c_void,
        count: int64_t,
        datatype_tag: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    pub fn ferrocoll_ialltoallv(
        sendbuf: *const c_void,
        sendcounts: *const int64_t,
        recvbuf: *mut c_void,
        recvcounts: *const int64_t,
        datatype_tag: int32_t,
        comm: int32_t,
        request: *mut int64_t,
    ) -> c_int;

    // ============================================================
    // Requests
    // ============================================================

    pub fn ferrocoll_test(request: int64_t, flag: *mut c_int) -> c_int;
    pub fn ferrocoll_wait(request: int64_t) -> c_int;
}
