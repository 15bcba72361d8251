//! All-reduce example - reducing collectives on the in-process substrate.
//!
//! Emulates a 4-rank job with one thread per rank, each thread owning its
//! own environment, and runs broadcast, reduce and all-reduce.
//!
//! Run with: RUST_LOG=debug cargo run --example allreduce

use ferrocoll::substrate::LocalFabric;
use ferrocoll::{
    AllreduceOptions, BroadcastOptions, Buffer, EngineConfig, Environment, ProcessGroup,
    ReduceOp, ReduceOptions, Result,
};
use std::thread;

const WORLD: usize = 4;

fn run_rank(pg: &ProcessGroup) -> Result<()> {
    let rank = pg.rank();
    let size = pg.size();

    println!("Rank {}/{}: Starting collective tests", rank, size);

    // ============================================================
    // Test 1: Broadcast
    // ============================================================
    {
        let data = if rank == 0 {
            Buffer::from_slice(&[1.0f64, 2.0, 3.0, 4.0, 5.0], &[5])?
        } else {
            Buffer::zeros(ferrocoll::ElementType::F64, &[5])
        };

        pg.broadcast(&[data.clone()], &BroadcastOptions::default())?
            .wait()?;

        assert_eq!(data.to_vec::<f64>()?, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        if rank == 0 {
            println!("✓ Broadcast test passed");
        }
    }

    // ============================================================
    // Test 2: Reduce (max) to the last rank
    // ============================================================
    {
        let data = Buffer::from_slice(&[rank as i64 * 10], &[1])?;
        let opts = ReduceOptions {
            reduce_op: ReduceOp::Max,
            root_rank: size - 1,
            ..Default::default()
        };

        pg.reduce(&[data.clone()], &opts)?.wait()?;

        if rank == size - 1 {
            assert_eq!(data.to_vec::<i64>()?, vec![(size as i64 - 1) * 10]);
            println!("✓ Reduce Max test passed");
        }
    }

    // ============================================================
    // Test 3: All-reduce (sum), polled
    // ============================================================
    {
        let data = Buffer::from_slice(&[rank as f32 + 1.0; 4], &[2, 2])?;
        let opts = AllreduceOptions {
            reduce_op: ReduceOp::Sum,
            tensor_name: "demo.grad".into(),
        };

        let mut work = pg.allreduce(&[data.clone()], &opts)?;
        let mut polls = 0;
        while !work.is_completed()? {
            polls += 1;
            thread::yield_now();
        }

        let expected: f32 = (1..=size).map(|x| x as f32).sum();
        assert_eq!(data.to_vec::<f32>()?, vec![expected; 4]);
        if rank == 0 {
            println!("✓ Allreduce Sum test passed after {polls} polls");
        }
    }

    pg.barrier(&Default::default())?;
    Ok(())
}

fn main() {
    env_logger::init();

    let handles: Vec<_> = LocalFabric::endpoints(WORLD)
        .into_iter()
        .map(|endpoint| {
            thread::spawn(move || -> Result<()> {
                let env = Environment::new(endpoint, EngineConfig::from_env()?);
                let pg = ProcessGroup::new(env, None, Some(WORLD))?;
                run_rank(&pg)
            })
        })
        .collect();

    for (rank, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                eprintln!("rank {rank} failed: {err}");
                std::process::exit(1);
            }
            Err(_) => {
                eprintln!("rank {rank} panicked");
                std::process::exit(1);
            }
        }
    }

    println!("\n========================================");
    println!("All collective tests passed!");
    println!("========================================");
}
