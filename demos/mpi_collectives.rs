//! Process-group collectives over MPI.
//!
//! Uses the process-wide environment, which initializes MPI on first use
//! and finalizes it at exit. Rank and size are cross-checked against the
//! launcher's environment variables.
//!
//! Run with: mpiexec -n 4 cargo run --features mpi --example mpi_collectives

use ferrocoll::{
    AllgatherOptions, AllreduceOptions, Buffer, ElementType, ProcessGroup, ReduceOp,
    Rendezvous, Result,
};

fn main() -> Result<()> {
    env_logger::init();

    let pg = ProcessGroup::from_global(Rendezvous::from_env())?;
    let rank = pg.rank();
    let size = pg.size();

    println!("Rank {}/{}: Starting MPI collective tests", rank, size);

    // ============================================================
    // All-reduce (min)
    // ============================================================
    {
        let data = Buffer::from_slice(&[rank as f64 + 3.0; 4], &[4])?;
        let opts = AllreduceOptions {
            reduce_op: ReduceOp::Min,
            ..Default::default()
        };
        pg.allreduce(&[data.clone()], &opts)?.wait()?;
        assert_eq!(data.to_vec::<f64>()?, vec![3.0; 4]);
        if rank == 0 {
            println!("✓ Allreduce Min test passed");
        }
    }

    // ============================================================
    // All-gather
    // ============================================================
    {
        let input = Buffer::from_slice(&[rank as i32; 3], &[3])?;
        let outputs = vec![(0..size).map(|_| Buffer::zeros(ElementType::I32, &[3])).collect::<Vec<_>>()];
        pg.allgather(&outputs, &[input], &AllgatherOptions::default())?
            .wait()?;
        for (r, out) in outputs[0].iter().enumerate() {
            assert_eq!(out.to_vec::<i32>()?, vec![r as i32; 3]);
        }
        if rank == 0 {
            println!("✓ Allgather test passed");
        }
    }

    pg.barrier(&Default::default())?;
    if rank == 0 {
        println!("All MPI collective tests passed!");
    }
    Ok(())
}
