//! Gather, scatter and all-to-all on the in-process substrate.
//!
//! Rank `i` contributes `i + 1` rows to an uneven all-to-all and gathers
//! a 2-element block to rank 0 both through separate buffers (staged copy)
//! and through views of one allocation (zero-copy).
//!
//! Run with: RUST_LOG=debug cargo run --example gather_scatter

use ferrocoll::substrate::LocalFabric;
use ferrocoll::{
    AllToAllOptions, Buffer, ElementType, EngineConfig, Environment, GatherOptions,
    ProcessGroup, Result, ScatterOptions,
};
use std::thread;

const WORLD: usize = 3;

fn run_rank(pg: &ProcessGroup) -> Result<()> {
    let rank = pg.rank();
    let size = pg.size();
    let root = 0;

    // ============================================================
    // Gather into separate buffers
    // ============================================================
    {
        let input = Buffer::from_slice(&[rank as i32 * 10, rank as i32 * 10 + 1], &[2])?;
        let outputs = if rank == root {
            vec![(0..size).map(|_| Buffer::zeros(ElementType::I32, &[2])).collect()]
        } else {
            Vec::new()
        };

        let mut work = pg.gather(&outputs, &[input], &GatherOptions::default())?;
        work.wait()?;

        if rank == root {
            for (r, out) in outputs[0].iter().enumerate() {
                assert_eq!(out.to_vec::<i32>()?, vec![r as i32 * 10, r as i32 * 10 + 1]);
            }
            println!("✓ Gather (staged) test passed");
        }
    }

    // ============================================================
    // Gather into views of one allocation
    // ============================================================
    {
        let input = Buffer::from_slice(&[rank as f64; 2], &[2])?;
        let flat = Buffer::zeros(ElementType::F64, &[size * 2]);
        let outputs = if rank == root {
            vec![flat.split_with_sizes(&vec![2; size])?]
        } else {
            Vec::new()
        };

        let mut work = pg.gather(&outputs, &[input], &GatherOptions::default())?;
        if rank == root {
            println!("zero-copy gather retains {} buffers", work.retained());
        }
        work.wait()?;

        if rank == root {
            let expected: Vec<f64> = (0..size).flat_map(|r| [r as f64; 2]).collect();
            assert_eq!(flat.to_vec::<f64>()?, expected);
            println!("✓ Gather (zero-copy) test passed");
        }
    }

    // ============================================================
    // Scatter
    // ============================================================
    {
        let output = Buffer::zeros(ElementType::F32, &[3]);
        let inputs = if rank == root {
            vec![(0..size)
                .map(|r| Buffer::from_slice(&[r as f32; 3], &[3]))
                .collect::<Result<Vec<_>>>()?]
        } else {
            Vec::new()
        };

        pg.scatter(&[output.clone()], &inputs, &ScatterOptions::default())?
            .wait()?;
        assert_eq!(output.to_vec::<f32>()?, vec![rank as f32; 3]);
        if rank == root {
            println!("✓ Scatter test passed");
        }
    }

    // ============================================================
    // Uneven all-to-all: rank i sends (j + 1) rows to rank j
    // ============================================================
    {
        let send_rows: Vec<usize> = (0..size).map(|j| j + 1).collect();
        let recv_rows = vec![rank + 1; size];
        let input_data: Vec<i64> = (0..send_rows.iter().sum::<usize>())
            .map(|k| (rank * 100 + k) as i64)
            .collect();
        let input = Buffer::from_slice(&input_data, &[input_data.len()])?;
        let output = Buffer::zeros(ElementType::I64, &[recv_rows.iter().sum()]);

        let opts = AllToAllOptions::with_splits(recv_rows, send_rows);
        pg.alltoall_base(&output, &input, &opts)?.wait()?;

        println!("Rank {rank}: received {:?}", output.to_vec::<i64>()?);
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
                let pg = ProcessGroup::new(env, None, None)?;
                run_rank(&pg)
            })
        })
        .collect();

    let failed = handles
        .into_iter()
        .map(|h| matches!(h.join(), Ok(Ok(()))))
        .filter(|ok| !ok)
        .count();
    if failed > 0 {
        eprintln!("{failed} rank(s) failed");
        std::process::exit(1);
    }
    println!("All gather/scatter tests passed!");
}
