//! The process group: validation and dispatch of every collective.

use crate::buffer::{Buffer, Device, Layout};
use crate::config::{AllgatherMode, EngineConfig};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::launch::Rendezvous;
use crate::layout::{self, FlatLayout};
use crate::options::{
    AllToAllOptions, AllgatherOptions, AllreduceCoalescedOptions, AllreduceOptions,
    BarrierOptions, BroadcastOptions, GatherOptions, ReduceOptions, ReduceScatterOptions,
    ScatterOptions,
};
use crate::substrate::{CollAttr, RecvBuffers, RequestBox, SubstrateComm};
use crate::work::Work;
use std::fmt;
use std::sync::Arc;

/// A group of ranks issuing collectives together.
///
/// Each process group owns one substrate communicator, created under the
/// environment lock at construction and released under it on drop. Every
/// operation validates its buffers first, then enters the substrate under
/// the lock and returns a [`Work`] handle.
///
/// All ranks of the group must issue the same operations in the same order.
///
/// # Example
///
/// ```no_run
/// use ferrocoll::{BroadcastOptions, Buffer, ProcessGroup, Rendezvous};
///
/// let pg = ProcessGroup::from_global(Rendezvous::from_env())?;
/// let weights = Buffer::zeros(ferrocoll::ElementType::F32, &[1024]);
///
/// let opts = BroadcastOptions { root_rank: 0, ..Default::default() };
/// pg.broadcast(&[weights.clone()], &opts)?.wait()?;
/// # Ok::<(), ferrocoll::Error>(())
/// ```
pub struct ProcessGroup {
    env: Arc<Environment>,
    comm: Option<Box<dyn SubstrateComm>>,
    rank: usize,
    size: usize,
    allgather_mode: AllgatherMode,
}

impl ProcessGroup {
    /// Create a process group on `env`.
    ///
    /// `rank` and `size`, when given, must match what the substrate reports
    /// for this process.
    ///
    /// # Errors
    ///
    /// A validation error on rank/size mismatch, or a substrate error if
    /// the communicator cannot be created.
    pub fn new(env: Arc<Environment>, rank: Option<usize>, size: Option<usize>) -> Result<Self> {
        Self::with_rendezvous(env, Rendezvous::new(rank, size))
    }

    /// Create a process group on the process-wide environment.
    pub fn from_global(rendezvous: Rendezvous) -> Result<Self> {
        Self::with_rendezvous(Environment::global()?, rendezvous)
    }

    fn with_rendezvous(env: Arc<Environment>, rendezvous: Rendezvous) -> Result<Self> {
        let (world_rank, world_size) = env.init_once()?;
        rendezvous.check(world_rank, world_size)?;

        let comm = env.create_communicator()?;
        let (rank, size) = (comm.rank(), comm.size());

        let mut allgather_mode = env.config().allgather_mode;
        if allgather_mode == AllgatherMode::Vector && !comm.supports_vector_allgatherv() {
            log::warn!(
                "{} substrate cannot gather into per-rank buffers; using flat all-gather",
                env.substrate_name()
            );
            allgather_mode = AllgatherMode::Flat;
        }

        log::debug!("process group ready: rank {rank} of {size}, all-gather {allgather_mode}");
        Ok(ProcessGroup {
            env,
            comm: Some(comm),
            rank,
            size,
            allgather_mode,
        })
    }

    /// Rank of this process in the group.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Settings inherited from the environment.
    pub fn config(&self) -> &EngineConfig {
        self.env.config()
    }

    /// All-gather strategy in effect, after any fallback.
    pub fn allgather_mode(&self) -> AllgatherMode {
        self.allgather_mode
    }

    // ========================================================================
    // Single-buffer collectives
    // ========================================================================

    /// Broadcast the root's buffer into every rank's buffer, in place.
    #[track_caller]
    pub fn broadcast(&self, buffers: &[Buffer], opts: &BroadcastOptions) -> Result<Work> {
        let buf = check_single(buffers)?;
        check_root(opts.root_rank, self.size)?;
        let dtype = buf.dtype().to_substrate()?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;

        log::debug!(
            "rank {}: broadcast {} elements from root {}",
            self.rank,
            buf.numel(),
            opts.root_rank
        );
        let request = self.env.enter(|| unsafe {
            comm.bcast(buf.as_mut_ptr(), buf.numel(), dtype, opts.root_rank, &attr)
        })?;
        Ok(Work::pending(Arc::clone(&self.env), request, buffers.to_vec(), "broadcast"))
    }

    /// Reduce every rank's buffer in place; all ranks receive the result.
    #[track_caller]
    pub fn allreduce(&self, buffers: &[Buffer], opts: &AllreduceOptions) -> Result<Work> {
        let buf = check_single(buffers)?;
        let dtype = buf.dtype().to_substrate()?;
        let op = opts.reduce_op.to_substrate()?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;

        log::debug!("rank {}: allreduce {} elements ({:?})", self.rank, buf.numel(), op);
        let request = self.env.enter(|| unsafe {
            comm.allreduce(buf.as_ptr(), buf.as_mut_ptr(), buf.numel(), dtype, op, &attr)
        })?;
        Ok(Work::pending(Arc::clone(&self.env), request, buffers.to_vec(), "allreduce"))
    }

    /// Reduce every rank's buffer in place into the root's buffer.
    #[track_caller]
    pub fn reduce(&self, buffers: &[Buffer], opts: &ReduceOptions) -> Result<Work> {
        let buf = check_single(buffers)?;
        check_root(opts.root_rank, self.size)?;
        let dtype = buf.dtype().to_substrate()?;
        let op = opts.reduce_op.to_substrate()?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;

        log::debug!(
            "rank {}: reduce {} elements ({:?}) to root {}",
            self.rank,
            buf.numel(),
            op,
            opts.root_rank
        );
        let request = self.env.enter(|| unsafe {
            comm.reduce(
                buf.as_ptr(),
                buf.as_mut_ptr(),
                buf.numel(),
                dtype,
                op,
                opts.root_rank,
                &attr,
            )
        })?;
        Ok(Work::pending(Arc::clone(&self.env), request, buffers.to_vec(), "reduce"))
    }

    // ========================================================================
    // Gathering collectives
    // ========================================================================

    /// Gather every rank's input into `outputs[0][i]` on every rank.
    ///
    /// In [`AllgatherMode::Flat`] the call waits for the substrate and copies
    /// the result out before returning, so the handle is already complete.
    #[track_caller]
    pub fn allgather(
        &self,
        outputs: &[Vec<Buffer>],
        inputs: &[Buffer],
        opts: &AllgatherOptions,
    ) -> Result<Work> {
        let input = check_single(inputs)?;
        if outputs.len() != 1 {
            return Err(Error::Unsupported(format!(
                "all-gather with {} output lists",
                outputs.len()
            )));
        }
        let outputs = &outputs[0];
        Error::check(outputs.len() == self.size, || {
            format!(
                "all-gather: number of output buffers ({}) should equal the group size ({})",
                outputs.len(),
                self.size
            )
        })?;
        check_same_size_and_type(input, outputs)?;

        let dtype = input.dtype().to_substrate()?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;
        let recv_counts = vec![input.numel(); self.size];

        log::debug!(
            "rank {}: allgather {} elements per rank ({} mode)",
            self.rank,
            input.numel(),
            self.allgather_mode
        );

        match self.allgather_mode {
            AllgatherMode::Vector => {
                let recv = RecvBuffers::PerRank(outputs.iter().map(Buffer::as_mut_ptr).collect());
                let request = self.env.enter(|| unsafe {
                    comm.allgatherv(input.as_ptr(), input.numel(), recv, &recv_counts, dtype, &attr)
                })?;
                let mut retained = outputs.clone();
                retained.push(input.clone());
                Ok(Work::pending(Arc::clone(&self.env), request, retained, "allgather"))
            }
            AllgatherMode::Flat => {
                let flat = Buffer::new_flat_like(outputs)?;
                let recv = RecvBuffers::Flat(flat.as_mut_ptr());
                let request = self.env.enter(|| unsafe {
                    comm.allgatherv(input.as_ptr(), input.numel(), recv, &recv_counts, dtype, &attr)
                })?;
                self.complete_now(request, vec![flat.clone(), input.clone()], "allgather")?;

                for (i, out) in outputs.iter().enumerate() {
                    out.copy_from(&flat.narrow(i, 1)?)?;
                }
                Ok(Work::completed("allgather"))
            }
        }
    }

    /// Gather every rank's input into `outputs[0]` on the root.
    ///
    /// Non-root ranks pass no output list. Every rank issues the same
    /// variable all-to-all in which only the root's slot carries data.
    #[track_caller]
    pub fn gather(
        &self,
        outputs: &[Vec<Buffer>],
        inputs: &[Buffer],
        opts: &GatherOptions,
    ) -> Result<Work> {
        let input = check_single(inputs)?;
        check_root(opts.root_rank, self.size)?;
        let root = opts.root_rank;
        let is_root = self.rank == root;

        if is_root {
            check_root_list(outputs, self.size, "gather", "output")?;
            check_same_size_and_type(input, &outputs[0])?;
        } else {
            Error::check(outputs.is_empty(), || {
                "gather: non-root ranks must pass no output buffers".to_string()
            })?;
        }

        let mut send_counts = vec![0usize; self.size];
        send_counts[root] = input.numel();

        let reconciled = if is_root {
            let flat = layout::flatten(&outputs[0])?;
            Error::check(flat.lengths[self.rank] == send_counts[self.rank], || {
                "gather: send and receive counts don't match".to_string()
            })?;
            Some(flat)
        } else {
            None
        };
        let (recv_counts, recv) = match &reconciled {
            Some(flat) => (flat.lengths.clone(), flat.flat.clone()),
            None => (vec![0usize; self.size], Buffer::empty(input.dtype())),
        };

        let dtype = recv.dtype().to_substrate()?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;

        log::debug!(
            "rank {}: gather {} elements to root {root}{}",
            self.rank,
            input.numel(),
            match &reconciled {
                Some(flat) if !flat.is_flat => ", staging",
                _ => "",
            }
        );
        let request = self.env.enter(|| unsafe {
            comm.alltoallv(
                input.as_ptr(),
                &send_counts,
                recv.as_mut_ptr(),
                &recv_counts,
                dtype,
                &attr,
            )
        })?;

        let retained = match reconciled {
            Some(flat) if !flat.is_flat => {
                self.complete_now(request, vec![flat.flat.clone(), input.clone()], "gather")?;
                flat.unpack(&outputs[0])?;
                return Ok(Work::completed("gather"));
            }
            Some(flat) => vec![flat.flat, input.clone()],
            None => vec![input.clone()],
        };
        Ok(Work::pending(Arc::clone(&self.env), request, retained, "gather"))
    }

    /// Scatter `inputs[0][i]` from the root into rank `i`'s output.
    ///
    /// Non-root ranks pass no input list.
    #[track_caller]
    pub fn scatter(
        &self,
        outputs: &[Buffer],
        inputs: &[Vec<Buffer>],
        opts: &ScatterOptions,
    ) -> Result<Work> {
        let output = check_single(outputs)?;
        check_root(opts.root_rank, self.size)?;
        let root = opts.root_rank;
        let is_root = self.rank == root;

        if is_root {
            check_root_list(inputs, self.size, "scatter", "input")?;
            check_same_size_and_type(output, &inputs[0])?;
        } else {
            Error::check(inputs.is_empty(), || {
                "scatter: non-root ranks must pass no input buffers".to_string()
            })?;
        }

        let mut recv_counts = vec![0usize; self.size];
        recv_counts[root] = output.numel();

        let (send_counts, send) = if is_root {
            let flat = layout::flatten(&inputs[0])?;
            flat.pack(&inputs[0])?;
            Error::check(flat.lengths[self.rank] == recv_counts[self.rank], || {
                "scatter: send and receive counts don't match".to_string()
            })?;
            (flat.lengths, flat.flat)
        } else {
            (vec![0usize; self.size], Buffer::empty(output.dtype()))
        };

        let dtype = send.dtype().to_substrate()?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;

        log::debug!(
            "rank {}: scatter {} elements from root {root}",
            self.rank,
            output.numel()
        );
        let request = self.env.enter(|| unsafe {
            comm.alltoallv(
                send.as_ptr(),
                &send_counts,
                output.as_mut_ptr(),
                &recv_counts,
                dtype,
                &attr,
            )
        })?;

        let mut retained = vec![output.clone()];
        if is_root {
            retained.push(send);
        }
        Ok(Work::pending(Arc::clone(&self.env), request, retained, "scatter"))
    }

    // ========================================================================
    // All-to-all
    // ========================================================================

    /// Exchange slices of `input` along dimension 0 with every rank.
    ///
    /// With no split sizes in `opts` each rank receives an equal share.
    /// Otherwise each side's split list gives the number of rows sent to
    /// (or received from) every rank; an empty list on one side still means
    /// an equal share on that side.
    #[track_caller]
    pub fn alltoall_base(
        &self,
        output: &Buffer,
        input: &Buffer,
        opts: &AllToAllOptions,
    ) -> Result<Work> {
        check_buffer(input)?;
        check_buffer(output)?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;

        let request = if opts.is_even() {
            Error::check(
                output.numel() == input.numel() && output.dtype() == input.dtype(),
                || "buffers are not equal in size or element type".to_string(),
            )?;
            let rows = output.leading_dim()?;
            Error::check(rows % self.size == 0, || {
                format!(
                    "dimension 0 of size {rows} does not divide equally across group size {}",
                    self.size
                )
            })?;
            let dtype = output.dtype().to_substrate()?;
            let count = output.numel() / self.size;

            log::debug!("rank {}: alltoall {count} elements per rank", self.rank);
            self.env.enter(|| unsafe {
                comm.alltoall(input.as_ptr(), output.as_mut_ptr(), count, dtype, &attr)
            })?
        } else {
            Error::check(output.dtype() == input.dtype(), || {
                format!(
                    "all-to-all between {:?} input and {:?} output",
                    input.dtype(),
                    output.dtype()
                )
            })?;
            let send_counts = layout::split_counts(input, &opts.input_split_sizes, self.size)?;
            let recv_counts = layout::split_counts(output, &opts.output_split_sizes, self.size)?;
            let dtype = output.dtype().to_substrate()?;

            log::debug!(
                "rank {}: alltoallv send {send_counts:?} recv {recv_counts:?}",
                self.rank
            );
            self.env.enter(|| unsafe {
                comm.alltoallv(
                    input.as_ptr(),
                    &send_counts,
                    output.as_mut_ptr(),
                    &recv_counts,
                    dtype,
                    &attr,
                )
            })?
        };

        let retained = vec![input.clone(), output.clone()];
        Ok(Work::pending(Arc::clone(&self.env), request, retained, "alltoall_base"))
    }

    /// Send `inputs[i]` to rank `i` and receive rank `i`'s block into
    /// `outputs[i]`.
    ///
    /// If the outputs do not already sit back to back in one allocation, the
    /// call waits for the substrate and copies the result out before
    /// returning.
    #[track_caller]
    pub fn alltoall(
        &self,
        outputs: &[Buffer],
        inputs: &[Buffer],
        opts: &AllToAllOptions,
    ) -> Result<Work> {
        Error::check(inputs.len() == self.size, || {
            format!(
                "number of input buffers ({}) not equal to group size ({})",
                inputs.len(),
                self.size
            )
        })?;
        Error::check(outputs.len() == self.size, || {
            format!(
                "number of output buffers ({}) not equal to group size ({})",
                outputs.len(),
                self.size
            )
        })?;
        check_same_type(&outputs[0], inputs)?;
        check_same_type(&inputs[0], outputs)?;

        let send: FlatLayout = layout::flatten(inputs)?;
        let recv: FlatLayout = layout::flatten(outputs)?;
        send.pack(inputs)?;

        let dtype = recv.flat.dtype().to_substrate()?;
        let attr = self.attr(&opts.tensor_name);
        let comm = self.comm()?;

        log::debug!(
            "rank {}: alltoall list send {:?} (flat={}) recv {:?} (flat={})",
            self.rank,
            send.lengths,
            send.is_flat,
            recv.lengths,
            recv.is_flat
        );
        let request = self.env.enter(|| unsafe {
            comm.alltoallv(
                send.flat.as_ptr(),
                &send.lengths,
                recv.flat.as_mut_ptr(),
                &recv.lengths,
                dtype,
                &attr,
            )
        })?;

        if !recv.is_flat {
            self.complete_now(request, vec![recv.flat.clone(), send.flat.clone()], "alltoall")?;
            recv.unpack(outputs)?;
            return Ok(Work::completed("alltoall"));
        }
        let retained = vec![recv.flat, send.flat];
        Ok(Work::pending(Arc::clone(&self.env), request, retained, "alltoall"))
    }

    /// Block until every rank has reached the barrier.
    ///
    /// The returned handle is already complete.
    #[track_caller]
    pub fn barrier(&self, _opts: &BarrierOptions) -> Result<Work> {
        let comm = self.comm()?;
        log::debug!("rank {}: barrier", self.rank);
        self.env.enter(|| comm.barrier())?;
        Ok(Work::completed("barrier"))
    }

    // ========================================================================
    // Unsupported operations
    // ========================================================================

    /// Not supported.
    pub fn allreduce_coalesced(
        &self,
        _buffers: &[Buffer],
        _opts: &AllreduceCoalescedOptions,
    ) -> Result<Work> {
        Err(Error::Unsupported("allreduce_coalesced".into()))
    }

    /// Not supported.
    pub fn allgather_coalesced(
        &self,
        _outputs: &[Vec<Buffer>],
        _inputs: &[Buffer],
        _opts: &AllgatherOptions,
    ) -> Result<Work> {
        Err(Error::Unsupported("allgather_coalesced".into()))
    }

    /// Not supported.
    pub fn allgather_base(
        &self,
        _output: &Buffer,
        _input: &Buffer,
        _opts: &AllgatherOptions,
    ) -> Result<Work> {
        Err(Error::Unsupported("allgather_base".into()))
    }

    /// Not supported.
    pub fn reduce_scatter(
        &self,
        _outputs: &[Buffer],
        _inputs: &[Vec<Buffer>],
        _opts: &ReduceScatterOptions,
    ) -> Result<Work> {
        Err(Error::Unsupported("reduce_scatter".into()))
    }

    /// Not supported.
    pub fn send(&self, _buffers: &[Buffer], _dst_rank: usize, _tag: i32) -> Result<Work> {
        Err(Error::Unsupported("send".into()))
    }

    /// Not supported.
    pub fn recv(&self, _buffers: &[Buffer], _src_rank: usize, _tag: i32) -> Result<Work> {
        Err(Error::Unsupported("recv".into()))
    }

    /// Not supported.
    pub fn recv_anysource(&self, _buffers: &[Buffer], _tag: i32) -> Result<Work> {
        Err(Error::Unsupported("recv_anysource".into()))
    }

    fn comm(&self) -> Result<&dyn SubstrateComm> {
        self.comm
            .as_deref()
            .ok_or_else(|| Error::Internal("process group communicator already released".into()))
    }

    /// Wait for a request issued by a staged call before copying results out.
    ///
    /// `retained` stays owned by a pending handle until the substrate reports
    /// completion. If the wait fails without that report, the handle is
    /// dropped while pending and the process aborts.
    #[track_caller]
    fn complete_now(
        &self,
        request: RequestBox,
        retained: Vec<Buffer>,
        op: &'static str,
    ) -> Result<()> {
        let mut work = Work::pending(Arc::clone(&self.env), request, retained, op);
        work.wait().map(|_| ())
    }

    fn attr(&self, tensor_name: &str) -> CollAttr {
        CollAttr {
            to_cache: self.env.config().cache_collectives,
            match_id: Some(tensor_name.to_owned()),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(comm) = self.comm.take() {
            self.env.release_communicator(comm);
        }
    }
}

impl fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("substrate", &self.env.substrate_name())
            .field("allgather_mode", &self.allgather_mode)
            .finish()
    }
}

// ============================================================================
// Validation
// ============================================================================

fn check_buffer(buf: &Buffer) -> Result<()> {
    Error::check(buf.layout() != Layout::Sparse, || {
        "buffer has to be dense".to_string()
    })?;
    Error::check(buf.device() == Device::Host, || {
        format!("{:?} buffer detected; only host memory is supported", buf.device())
    })?;
    Error::check(buf.is_contiguous(), || {
        "buffer has to be contiguous".to_string()
    })
}

fn check_single(buffers: &[Buffer]) -> Result<&Buffer> {
    match buffers {
        [buf] => {
            check_buffer(buf)?;
            Ok(buf)
        }
        _ => Err(Error::Unsupported(format!("buffer count {}", buffers.len()))),
    }
}

fn check_root(root: usize, size: usize) -> Result<()> {
    if root < size {
        Ok(())
    } else {
        Err(Error::InvalidRank { rank: root, size })
    }
}

/// The root's list-of-lists argument to gather or scatter.
fn check_root_list(lists: &[Vec<Buffer>], size: usize, op: &str, side: &str) -> Result<()> {
    if lists.len() != 1 {
        return Err(Error::Unsupported(format!(
            "{op} with {} {side} lists",
            lists.len()
        )));
    }
    Error::check(lists[0].len() == size, || {
        format!(
            "{op}: number of {side} buffers ({}) should equal the group size ({size})",
            lists[0].len()
        )
    })
}

fn check_same_size_and_type(reference: &Buffer, buffers: &[Buffer]) -> Result<()> {
    for buf in buffers {
        Error::check(
            buf.numel() == reference.numel() && buf.dtype() == reference.dtype(),
            || "buffers are not equal in size or element type".to_string(),
        )?;
        check_buffer(buf)?;
    }
    Ok(())
}

fn check_same_type(reference: &Buffer, buffers: &[Buffer]) -> Result<()> {
    for buf in buffers {
        Error::check(buf.dtype() == reference.dtype(), || {
            "buffers are not equal in element type".to_string()
        })?;
        check_buffer(buf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatype::{ElementType, ReduceOp};
    use crate::substrate::LocalSubstrate;

    fn single() -> ProcessGroup {
        let env = Environment::new(LocalSubstrate::single(), EngineConfig::default());
        ProcessGroup::new(env, Some(0), Some(1)).unwrap()
    }

    #[test]
    fn rendezvous_mismatch_is_rejected() {
        let env = Environment::new(LocalSubstrate::single(), EngineConfig::default());
        let err = ProcessGroup::new(env, Some(3), None).unwrap_err();
        assert!(err.is_validation(), "{err:?}");
        assert!(err.to_string().contains("unexpected rank 3"));
    }

    #[test]
    fn single_buffer_ops_reject_other_counts() {
        let pg = single();
        let a = Buffer::zeros(ElementType::F32, &[2]);
        let err = pg
            .allreduce(&[a.clone(), a], &AllreduceOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(ref m) if m == "buffer count 2"));
        assert!(matches!(
            pg.broadcast(&[], &BroadcastOptions::default()),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn root_must_be_in_range() {
        let pg = single();
        let buf = Buffer::zeros(ElementType::I32, &[4]);
        let opts = ReduceOptions {
            root_rank: 1,
            ..Default::default()
        };
        assert!(matches!(
            pg.reduce(&[buf], &opts),
            Err(Error::InvalidRank { rank: 1, size: 1 })
        ));
    }

    #[test]
    fn rejects_sparse_accelerator_and_strided_buffers() {
        let pg = single();
        let opts = AllreduceOptions::default();
        let sparse = Buffer::zeros(ElementType::F32, &[4]).with_layout(Layout::Sparse);
        let device = Buffer::zeros(ElementType::F32, &[4]).on_device(Device::Accelerator(0));
        let strided = Buffer::zeros(ElementType::F32, &[2, 3]).transpose(0, 1).unwrap();
        for buf in [sparse, device, strided] {
            let err = pg.allreduce(&[buf], &opts).unwrap_err();
            assert!(err.is_validation(), "{err:?}");
        }
    }

    #[test]
    fn unmapped_types_and_ops_fail_before_dispatch() {
        let pg = single();
        let halfs = Buffer::zeros(ElementType::F16, &[4]);
        assert!(matches!(
            pg.allreduce(&[halfs], &AllreduceOptions::default()),
            Err(Error::UnsupportedType(ElementType::F16))
        ));
        let opts = AllreduceOptions {
            reduce_op: ReduceOp::Average,
            ..Default::default()
        };
        let floats = Buffer::zeros(ElementType::F32, &[4]);
        assert!(matches!(
            pg.allreduce(&[floats], &opts),
            Err(Error::UnsupportedReduction(ReduceOp::Average))
        ));
    }

    #[test]
    fn single_rank_allreduce_is_identity() {
        let pg = single();
        let buf = Buffer::from_slice(&[1.5f64, -2.0, 4.0], &[3]).unwrap();
        let mut work = pg.allreduce(&[buf.clone()], &AllreduceOptions::default()).unwrap();
        assert_eq!(work.retained(), 1);
        assert!(work.wait().unwrap());
        assert_eq!(buf.to_vec::<f64>().unwrap(), vec![1.5, -2.0, 4.0]);
    }

    #[test]
    fn root_gather_needs_one_output_per_rank() {
        let env = Environment::new(LocalSubstrate::single(), EngineConfig::default());
        let pg = ProcessGroup::new(env, None, None).unwrap();
        let input = Buffer::zeros(ElementType::I32, &[2]);
        let outputs = vec![vec![Buffer::zeros(ElementType::I32, &[2]); 2]];
        let err = pg
            .gather(&outputs, &[input], &GatherOptions::default())
            .unwrap_err();
        assert!(err.is_validation(), "{err:?}");
    }

    #[test]
    fn even_alltoall_requires_divisible_rows() {
        let pg = single();
        let a = Buffer::zeros(ElementType::F32, &[3]);
        let b = Buffer::zeros(ElementType::F32, &[4]);
        let err = pg
            .alltoall_base(&a, &b, &AllToAllOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("not equal in size"), "{err}");
    }

    #[test]
    fn unsupported_operations_never_dispatch() {
        let pg = single();
        let buf = Buffer::zeros(ElementType::F32, &[1]);
        let names = [
            pg.allreduce_coalesced(&[buf.clone()], &AllreduceOptions::default()),
            pg.allgather_coalesced(&[], &[buf.clone()], &AllgatherOptions::default()),
            pg.allgather_base(&buf, &buf, &AllgatherOptions::default()),
            pg.reduce_scatter(&[buf.clone()], &[], &ReduceScatterOptions::default()),
            pg.send(&[buf.clone()], 0, 0),
            pg.recv(&[buf.clone()], 0, 0),
            pg.recv_anysource(&[buf], 0),
        ];
        for result in names {
            let err = result.unwrap_err();
            assert!(matches!(err, Error::Unsupported(_)));
            assert!(!err.is_retryable());
        }
    }
}
