//! In-process substrate: every rank is a thread of the same process.
//!
//! Ranks rendezvous on a shared fabric. Each collective call deposits the
//! calling rank's pointers and counts into a slot keyed by communicator and
//! call sequence number; the last rank to arrive performs the data movement
//! for everyone and wakes the waiters. Until then the requests of the ranks
//! that arrived earlier stay pending, exactly like a network substrate whose
//! peers have not yet posted the matching operation.

use super::{
    displacements, CollAttr, RecvBuffers, RequestBox, Substrate, SubstrateComm, SubstrateError,
    SubstrateRequest, SubstrateResult,
};
use crate::datatype::{DatatypeTag, ReductionTag};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Raw pointer that may cross threads while its owner keeps it alive.
#[derive(Debug, Clone, Copy)]
struct SendPtr(*mut u8);

// The owning Work keeps the memory alive until the slot completes.
unsafe impl Send for SendPtr {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Bcast,
    Allreduce,
    Reduce,
    Allgatherv,
    Alltoall,
    Alltoallv,
    Barrier,
}

/// One rank's half of a collective call.
#[derive(Debug)]
struct Contribution {
    kind: Kind,
    dtype: DatatypeTag,
    send: SendPtr,
    recv: Vec<SendPtr>,
    send_counts: Vec<usize>,
    recv_counts: Vec<usize>,
    root: usize,
    op: Option<ReductionTag>,
}

impl Contribution {
    fn new(kind: Kind, dtype: DatatypeTag) -> Self {
        Contribution {
            kind,
            dtype,
            send: SendPtr(std::ptr::null_mut()),
            recv: Vec::new(),
            send_counts: Vec::new(),
            recv_counts: Vec::new(),
            root: 0,
            op: None,
        }
    }
}

type SlotKey = (u64, u64);

#[derive(Debug)]
struct Slot {
    contributions: Vec<Option<Contribution>>,
    arrived: usize,
    outcome: Option<Result<(), String>>,
    released: usize,
}

#[derive(Debug)]
struct Fabric {
    size: usize,
    slots: Mutex<HashMap<SlotKey, Slot>>,
    done: Condvar,
}

/// Constructor for a set of connected in-process endpoints.
pub struct LocalFabric;

impl LocalFabric {
    /// Create `size` connected endpoints; endpoint `i` is rank `i`.
    ///
    /// Each endpoint is meant to be driven by its own thread, through its own
    /// [`Environment`](crate::Environment).
    pub fn endpoints(size: usize) -> Vec<Arc<LocalSubstrate>> {
        let fabric = Arc::new(Fabric {
            size,
            slots: Mutex::new(HashMap::new()),
            done: Condvar::new(),
        });
        (0..size)
            .map(|rank| {
                Arc::new(LocalSubstrate {
                    rank,
                    fabric: Arc::clone(&fabric),
                    next_comm: AtomicU64::new(0),
                    plans: Arc::new(PlanCache::default()),
                })
            })
            .collect()
    }
}

/// Plan cache shared by all communicators of one endpoint.
#[derive(Debug, Default)]
struct PlanCache {
    plans: Mutex<HashMap<String, (Kind, DatatypeTag, Vec<usize>)>>,
    hits: AtomicU64,
}

impl PlanCache {
    fn lookup(&self, key: &str, plan: (Kind, DatatypeTag, Vec<usize>)) {
        let mut plans = self.plans.lock();
        if plans.get(key) == Some(&plan) {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            plans.insert(key.to_string(), plan);
        }
    }
}

/// One rank's endpoint on an in-process fabric.
#[derive(Debug)]
pub struct LocalSubstrate {
    rank: usize,
    fabric: Arc<Fabric>,
    next_comm: AtomicU64,
    plans: Arc<PlanCache>,
}

impl LocalSubstrate {
    /// A one-rank fabric, used as the default process-wide substrate.
    pub fn single() -> Arc<LocalSubstrate> {
        let mut endpoints = LocalFabric::endpoints(1);
        endpoints.remove(0)
    }

    /// Rank of this endpoint.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of endpoints on the fabric.
    pub fn size(&self) -> usize {
        self.fabric.size
    }

    /// Number of cached collective calls that reused a stored plan.
    pub fn plan_cache_hits(&self) -> u64 {
        self.plans.hits.load(Ordering::Relaxed)
    }
}

impl Substrate for LocalSubstrate {
    fn name(&self) -> &str {
        "local"
    }

    fn create_communicator(&self) -> SubstrateResult<Box<dyn SubstrateComm>> {
        let id = self.next_comm.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalComm {
            rank: self.rank,
            id,
            seq: AtomicU64::new(0),
            fabric: Arc::clone(&self.fabric),
            plans: Arc::clone(&self.plans),
        }))
    }
}

struct LocalComm {
    rank: usize,
    id: u64,
    seq: AtomicU64,
    fabric: Arc<Fabric>,
    plans: Arc<PlanCache>,
}

impl LocalComm {
    fn check_counts(&self, what: &str, counts: &[usize]) -> SubstrateResult<()> {
        if counts.len() != self.fabric.size {
            return Err(SubstrateError::new(format!(
                "{what} has {} entries for {} ranks",
                counts.len(),
                self.fabric.size
            )));
        }
        Ok(())
    }

    fn check_root(&self, root: usize) -> SubstrateResult<()> {
        if root >= self.fabric.size {
            return Err(SubstrateError::new(format!(
                "root {root} out of range for {} ranks",
                self.fabric.size
            )));
        }
        Ok(())
    }

    fn submit(&self, contribution: Contribution, attr: &CollAttr) -> SubstrateResult<LocalRequest> {
        if let Some(key) = attr.cache_key() {
            let mut counts = contribution.send_counts.clone();
            counts.extend_from_slice(&contribution.recv_counts);
            self.plans
                .lookup(key, (contribution.kind, contribution.dtype, counts));
        }

        let key = (self.id, self.seq.fetch_add(1, Ordering::SeqCst));
        let size = self.fabric.size;
        let mut slots = self.fabric.slots.lock();
        let slot = slots.entry(key).or_insert_with(|| Slot {
            contributions: (0..size).map(|_| None).collect(),
            arrived: 0,
            outcome: None,
            released: 0,
        });
        if slot.contributions[self.rank].is_some() {
            return Err(SubstrateError::new(format!(
                "rank {} issued call {} twice",
                self.rank, key.1
            )));
        }
        slot.contributions[self.rank] = Some(contribution);
        slot.arrived += 1;
        if slot.arrived == size {
            let contributions: Vec<&Contribution> = slot.contributions.iter().flatten().collect();
            // SAFETY: every rank's Work keeps its memory alive until the slot completes.
            let outcome = unsafe { execute(&contributions) };
            if let Err(msg) = &outcome {
                log::warn!("local fabric call {key:?} failed: {msg}");
            }
            slot.outcome = Some(outcome);
            self.fabric.done.notify_all();
        }
        Ok(LocalRequest {
            fabric: Arc::clone(&self.fabric),
            key,
            finished: None,
        })
    }
}

impl SubstrateComm for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.fabric.size
    }

    fn supports_vector_allgatherv(&self) -> bool {
        true
    }

    unsafe fn bcast(
        &self,
        buf: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        root: usize,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        self.check_root(root)?;
        let mut c = Contribution::new(Kind::Bcast, dtype);
        c.send = SendPtr(buf);
        c.recv = vec![SendPtr(buf)];
        c.send_counts = vec![count];
        c.root = root;
        Ok(Box::new(self.submit(c, attr)?))
    }

    unsafe fn allreduce(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        op: ReductionTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        let mut c = Contribution::new(Kind::Allreduce, dtype);
        c.send = SendPtr(send.cast_mut());
        c.recv = vec![SendPtr(recv)];
        c.send_counts = vec![count];
        c.op = Some(op);
        Ok(Box::new(self.submit(c, attr)?))
    }

    unsafe fn reduce(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        op: ReductionTag,
        root: usize,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        self.check_root(root)?;
        let mut c = Contribution::new(Kind::Reduce, dtype);
        c.send = SendPtr(send.cast_mut());
        c.recv = vec![SendPtr(recv)];
        c.send_counts = vec![count];
        c.op = Some(op);
        c.root = root;
        Ok(Box::new(self.submit(c, attr)?))
    }

    unsafe fn allgatherv(
        &self,
        send: *const u8,
        send_count: usize,
        recv: RecvBuffers,
        recv_counts: &[usize],
        dtype: DatatypeTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        self.check_counts("recv_counts", recv_counts)?;
        let mut c = Contribution::new(Kind::Allgatherv, dtype);
        c.send = SendPtr(send.cast_mut());
        c.send_counts = vec![send_count];
        c.recv_counts = recv_counts.to_vec();
        c.recv = match recv {
            RecvBuffers::Flat(ptr) => {
                let displs = displacements(recv_counts);
                let width = dtype.size_of();
                displs
                    .iter()
                    .map(|&d| SendPtr(ptr.wrapping_add(d * width)))
                    .collect()
            }
            RecvBuffers::PerRank(ptrs) => {
                if ptrs.len() != self.fabric.size {
                    return Err(SubstrateError::new(format!(
                        "{} receive buffers for {} ranks",
                        ptrs.len(),
                        self.fabric.size
                    )));
                }
                ptrs.into_iter().map(SendPtr).collect()
            }
        };
        Ok(Box::new(self.submit(c, attr)?))
    }

    unsafe fn alltoall(
        &self,
        send: *const u8,
        recv: *mut u8,
        count: usize,
        dtype: DatatypeTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        let size = self.fabric.size;
        let mut c = Contribution::new(Kind::Alltoall, dtype);
        c.send = SendPtr(send.cast_mut());
        c.recv = vec![SendPtr(recv)];
        c.send_counts = vec![count; size];
        c.recv_counts = vec![count; size];
        Ok(Box::new(self.submit(c, attr)?))
    }

    unsafe fn alltoallv(
        &self,
        send: *const u8,
        send_counts: &[usize],
        recv: *mut u8,
        recv_counts: &[usize],
        dtype: DatatypeTag,
        attr: &CollAttr,
    ) -> SubstrateResult<RequestBox> {
        self.check_counts("send_counts", send_counts)?;
        self.check_counts("recv_counts", recv_counts)?;
        let mut c = Contribution::new(Kind::Alltoallv, dtype);
        c.send = SendPtr(send.cast_mut());
        c.recv = vec![SendPtr(recv)];
        c.send_counts = send_counts.to_vec();
        c.recv_counts = recv_counts.to_vec();
        Ok(Box::new(self.submit(c, attr)?))
    }

    fn barrier(&self) -> SubstrateResult<()> {
        let c = Contribution::new(Kind::Barrier, DatatypeTag::Char);
        let mut req = self.submit(c, &CollAttr::default())?;
        req.wait()
    }
}

/// Pending call on the in-process fabric.
struct LocalRequest {
    fabric: Arc<Fabric>,
    key: SlotKey,
    finished: Option<Result<(), String>>,
}

impl LocalRequest {
    /// Take this rank's copy of the outcome and free the slot once every
    /// rank has done the same.
    fn release(&mut self, slots: &mut HashMap<SlotKey, Slot>) -> SubstrateResult<bool> {
        let size = self.fabric.size;
        let Some(slot) = slots.get_mut(&self.key) else {
            return Err(SubstrateError::new(format!("unknown request {:?}", self.key)));
        };
        let Some(outcome) = slot.outcome.clone() else {
            return Ok(false);
        };
        slot.released += 1;
        if slot.released == size {
            slots.remove(&self.key);
        }
        self.finished = Some(outcome.clone());
        outcome.map(|()| true).map_err(SubstrateError::new)
    }
}

impl SubstrateRequest for LocalRequest {
    fn test(&mut self) -> SubstrateResult<bool> {
        if let Some(outcome) = &self.finished {
            return outcome.clone().map(|()| true).map_err(SubstrateError::new);
        }
        let fabric = Arc::clone(&self.fabric);
        let mut slots = fabric.slots.lock();
        self.release(&mut slots)
    }

    fn wait(&mut self) -> SubstrateResult<()> {
        if let Some(outcome) = &self.finished {
            return outcome.clone().map_err(SubstrateError::new);
        }
        let fabric = Arc::clone(&self.fabric);
        let mut slots = fabric.slots.lock();
        loop {
            if self.release(&mut slots)? {
                return Ok(());
            }
            fabric.done.wait(&mut slots);
        }
    }
}

/// Read `len` bytes starting at `ptr`.
unsafe fn read(ptr: SendPtr, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    std::slice::from_raw_parts(ptr.0.cast_const(), len).to_vec()
}

/// Write `data` starting at `ptr`.
unsafe fn write(ptr: SendPtr, data: &[u8]) {
    if !data.is_empty() {
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.0, data.len());
    }
}

fn mismatch(
    what: &str,
    rank: usize,
    got: impl std::fmt::Debug,
    want: impl std::fmt::Debug,
) -> String {
    format!("collective mismatch: rank {rank} has {what} {got:?}, rank 0 has {want:?}")
}

/// Perform one collective for every rank. Reads every source before writing
/// any destination, so in-place calls are safe.
unsafe fn execute(cs: &[&Contribution]) -> Result<(), String> {
    let first = cs[0];
    for (rank, c) in cs.iter().enumerate() {
        if c.kind != first.kind {
            return Err(mismatch("call", rank, c.kind, first.kind));
        }
        if c.dtype != first.dtype {
            return Err(mismatch("datatype", rank, c.dtype, first.dtype));
        }
    }
    let width = first.dtype.size_of();

    match first.kind {
        Kind::Barrier => Ok(()),
        Kind::Bcast => {
            for (rank, c) in cs.iter().enumerate() {
                if c.root != first.root || c.send_counts != first.send_counts {
                    return Err(mismatch(
                        "root/count",
                        rank,
                        (c.root, &c.send_counts),
                        (first.root, &first.send_counts),
                    ));
                }
            }
            let root = cs[first.root];
            let data = read(root.send, root.send_counts[0] * width);
            for (rank, c) in cs.iter().enumerate() {
                if rank != first.root {
                    write(c.recv[0], &data);
                }
            }
            Ok(())
        }
        Kind::Allreduce | Kind::Reduce => {
            for (rank, c) in cs.iter().enumerate() {
                if c.op != first.op || c.send_counts != first.send_counts || c.root != first.root
                {
                    return Err(mismatch(
                        "op/count/root",
                        rank,
                        (c.op, &c.send_counts, c.root),
                        (first.op, &first.send_counts, first.root),
                    ));
                }
            }
            let len = first.send_counts[0] * width;
            let op = first.op.ok_or_else(|| "reduction without operator".to_string())?;
            let mut acc = read(first.send, len);
            for c in &cs[1..] {
                combine(&mut acc, &read(c.send, len), first.dtype, op);
            }
            if first.kind == Kind::Allreduce {
                for c in cs {
                    write(c.recv[0], &acc);
                }
            } else {
                write(cs[first.root].recv[0], &acc);
            }
            Ok(())
        }
        Kind::Allgatherv => {
            for (i, c) in cs.iter().enumerate() {
                for (j, src) in cs.iter().enumerate() {
                    if c.recv_counts[j] != src.send_counts[0] {
                        return Err(format!(
                            "collective mismatch: rank {i} expects {} elements from rank {j}, \
                             which sends {}",
                            c.recv_counts[j],
                            src.send_counts[0]
                        ));
                    }
                }
            }
            let blocks: Vec<Vec<u8>> = cs
                .iter()
                .map(|c| read(c.send, c.send_counts[0] * width))
                .collect();
            for c in cs {
                for (j, block) in blocks.iter().enumerate() {
                    write(c.recv[j], block);
                }
            }
            Ok(())
        }
        Kind::Alltoall | Kind::Alltoallv => {
            for (i, c) in cs.iter().enumerate() {
                for (j, peer) in cs.iter().enumerate() {
                    if c.send_counts[j] != peer.recv_counts[i] {
                        return Err(format!(
                            "collective mismatch: rank {i} sends {} elements to rank {j}, \
                             which expects {}",
                            c.send_counts[j],
                            peer.recv_counts[i]
                        ));
                    }
                }
            }
            let sends: Vec<Vec<u8>> = cs
                .iter()
                .map(|c| read(c.send, c.send_counts.iter().sum::<usize>() * width))
                .collect();
            for (j, dst) in cs.iter().enumerate() {
                let recv_displs = displacements(&dst.recv_counts);
                for (i, src) in cs.iter().enumerate() {
                    let send_displs = displacements(&src.send_counts);
                    let start = send_displs[j] * width;
                    let block = &sends[i][start..start + src.send_counts[j] * width];
                    write(SendPtr(dst.recv[0].0.wrapping_add(recv_displs[i] * width)), block);
                }
            }
            Ok(())
        }
    }
}

fn combine_as<T: bytemuck::Pod>(acc: &mut [u8], other: &[u8], f: impl Fn(T, T) -> T) {
    let width = std::mem::size_of::<T>();
    for (a, b) in acc.chunks_exact_mut(width).zip(other.chunks_exact(width)) {
        let x: T = bytemuck::pod_read_unaligned(a);
        let y: T = bytemuck::pod_read_unaligned(b);
        a.copy_from_slice(bytemuck::bytes_of(&f(x, y)));
    }
}

macro_rules! combine_int {
    ($ty:ty, $acc:expr, $other:expr, $op:expr) => {
        match $op {
            ReductionTag::Sum => combine_as::<$ty>($acc, $other, |a, b| a.wrapping_add(b)),
            ReductionTag::Prod => combine_as::<$ty>($acc, $other, |a, b| a.wrapping_mul(b)),
            ReductionTag::Min => combine_as::<$ty>($acc, $other, |a, b| a.min(b)),
            ReductionTag::Max => combine_as::<$ty>($acc, $other, |a, b| a.max(b)),
        }
    };
}

macro_rules! combine_float {
    ($ty:ty, $acc:expr, $other:expr, $op:expr) => {
        match $op {
            ReductionTag::Sum => combine_as::<$ty>($acc, $other, |a, b| a + b),
            ReductionTag::Prod => combine_as::<$ty>($acc, $other, |a, b| a * b),
            ReductionTag::Min => combine_as::<$ty>($acc, $other, |a, b| a.min(b)),
            ReductionTag::Max => combine_as::<$ty>($acc, $other, |a, b| a.max(b)),
        }
    };
}

/// Fold `other` into `acc` elementwise. `Char` is a signed byte.
fn combine(acc: &mut [u8], other: &[u8], dtype: DatatypeTag, op: ReductionTag) {
    match dtype {
        DatatypeTag::Char => combine_int!(i8, acc, other, op),
        DatatypeTag::Int => combine_int!(i32, acc, other, op),
        DatatypeTag::Int64 => combine_int!(i64, acc, other, op),
        DatatypeTag::Float => combine_float!(f32, acc, other, op),
        DatatypeTag::Double => combine_float!(f64, acc, other, op),
        DatatypeTag::Bfp16 => {
            use half::bf16;
            let via_f32 = |f: fn(f32, f32) -> f32| {
                move |a: bf16, b: bf16| bf16::from_f32(f(a.to_f32(), b.to_f32()))
            };
            match op {
                ReductionTag::Sum => combine_as(acc, other, via_f32(|a, b| a + b)),
                ReductionTag::Prod => combine_as(acc, other, via_f32(|a, b| a * b)),
                ReductionTag::Min => combine_as(acc, other, via_f32(f32::min)),
                ReductionTag::Max => combine_as(acc, other, via_f32(f32::max)),
            }
        }
    }
}
