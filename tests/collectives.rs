//! Multi-rank collectives over the in-process fabric.

mod common;

use common::{run, run_ranks};
use ferrocoll::layout;
use ferrocoll::{
    AllToAllOptions, AllgatherMode, AllgatherOptions, AllreduceOptions, BroadcastOptions,
    Buffer, ElementType, EngineConfig, GatherOptions, ReduceOp, ReduceOptions,
    ScatterOptions,
};

#[test]
fn broadcast_from_root_reaches_every_rank() {
    let results = run(4, |pg| {
        let data = if pg.rank() == 0 {
            Buffer::from_slice(&[1.5f32, -2.0, 3.25, 4.0], &[4]).unwrap()
        } else {
            Buffer::zeros(ElementType::F32, &[4])
        };
        let mut work = pg
            .broadcast(&[data.clone()], &BroadcastOptions::default())
            .unwrap();
        assert!(work.wait().unwrap());
        assert!(work.is_success().unwrap());
        data.to_vec::<f32>().unwrap()
    });
    for got in results {
        assert_eq!(got, vec![1.5, -2.0, 3.25, 4.0]);
    }
}

#[test]
fn broadcast_from_non_zero_root() {
    let results = run(3, |pg| {
        let data = Buffer::from_slice(&[pg.rank() as i64; 2], &[2]).unwrap();
        let opts = BroadcastOptions {
            root_rank: 2,
            ..Default::default()
        };
        pg.broadcast(&[data.clone()], &opts).unwrap().wait().unwrap();
        data.to_vec::<i64>().unwrap()
    });
    assert!(results.iter().all(|v| v == &vec![2, 2]));
}

#[test]
fn allreduce_sum_and_max() {
    let results = run(4, |pg| {
        let sum = Buffer::from_slice(&[pg.rank() as f64 + 1.0; 3], &[3]).unwrap();
        pg.allreduce(&[sum.clone()], &AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();

        let max = Buffer::from_slice(&[pg.rank() as i32 * 7 - 5], &[1]).unwrap();
        let opts = AllreduceOptions {
            reduce_op: ReduceOp::Max,
            ..Default::default()
        };
        pg.allreduce(&[max.clone()], &opts).unwrap().wait().unwrap();

        (sum.to_vec::<f64>().unwrap(), max.to_vec::<i32>().unwrap())
    });
    for (sum, max) in results {
        assert_eq!(sum, vec![10.0; 3]);
        assert_eq!(max, vec![16]);
    }
}

#[test]
fn allreduce_bf16_product() {
    use half::bf16;
    let results = run(2, |pg| {
        let v = bf16::from_f32(if pg.rank() == 0 { 1.5 } else { 4.0 });
        let data = Buffer::from_slice(&[v, v], &[2]).unwrap();
        let opts = AllreduceOptions {
            reduce_op: ReduceOp::Product,
            ..Default::default()
        };
        pg.allreduce(&[data.clone()], &opts).unwrap().wait().unwrap();
        data.to_vec::<bf16>().unwrap()
    });
    for got in results {
        assert_eq!(got, vec![bf16::from_f32(6.0); 2]);
    }
}

#[test]
fn reduce_only_root_receives_result() {
    let results = run(4, |pg| {
        let data = Buffer::from_slice(&[pg.rank() as i32 + 1], &[1]).unwrap();
        let opts = ReduceOptions {
            reduce_op: ReduceOp::Product,
            root_rank: 1,
            ..Default::default()
        };
        pg.reduce(&[data.clone()], &opts).unwrap().wait().unwrap();
        data.to_vec::<i32>().unwrap()[0]
    });
    assert_eq!(results[1], 24);
    assert_eq!(results[0], 1);
    assert_eq!(results[3], 4);
}

#[test]
fn allgather_into_separate_outputs() {
    let results = run(4, |pg| {
        let r = pg.rank() as i32;
        let input = Buffer::from_slice(&[r * 3, r * 3 + 1, r * 3 + 2], &[3]).unwrap();
        let outputs = vec![(0..4)
            .map(|_| Buffer::zeros(ElementType::I32, &[3]))
            .collect::<Vec<_>>()];
        let mut work = pg
            .allgather(&outputs, &[input], &AllgatherOptions::default())
            .unwrap();
        // Flat mode copies before returning.
        assert!(!work.is_pending());
        assert!(work.is_completed().unwrap());
        outputs[0]
            .iter()
            .map(|b| b.to_vec::<i32>().unwrap())
            .collect::<Vec<_>>()
    });
    for per_rank in results {
        for (i, got) in per_rank.iter().enumerate() {
            let i = i as i32;
            assert_eq!(got, &vec![i * 3, i * 3 + 1, i * 3 + 2]);
        }
    }
}

#[test]
fn allgather_vector_mode_keeps_outputs_alive() {
    let config = EngineConfig::default().with_allgather_mode(AllgatherMode::Vector);
    let results = run_ranks(3, config, |pg, _| {
        assert_eq!(pg.allgather_mode(), AllgatherMode::Vector);
        let input = Buffer::from_slice(&[pg.rank() as f32; 2], &[2]).unwrap();
        let outputs = vec![(0..3)
            .map(|_| Buffer::zeros(ElementType::F32, &[1, 2]))
            .collect::<Vec<_>>()];
        let mut work = pg
            .allgather(&outputs, &[input], &AllgatherOptions::default())
            .unwrap();
        assert_eq!(work.retained(), 4);
        work.wait().unwrap();
        assert_eq!(work.retained(), 0);
        outputs[0]
            .iter()
            .map(|b| b.to_vec::<f32>().unwrap())
            .collect::<Vec<_>>()
    });
    for per_rank in results {
        assert_eq!(per_rank, vec![vec![0.0; 2], vec![1.0; 2], vec![2.0; 2]]);
    }
}

#[test]
fn allgather_rejects_wrong_output_count() {
    let results = run(1, |pg| {
        let input = Buffer::zeros(ElementType::F32, &[2]);
        let outputs = vec![vec![Buffer::zeros(ElementType::F32, &[2]); 2]];
        pg.allgather(&outputs, &[input], &AllgatherOptions::default())
            .unwrap_err()
            .is_validation()
    });
    assert!(results[0]);
}

#[test]
fn gather_into_staged_outputs() {
    let results = run(4, |pg| {
        let input = Buffer::from_slice(&[pg.rank() as u8, 100 + pg.rank() as u8], &[2]).unwrap();
        let outputs = if pg.rank() == 2 {
            vec![(0..4).map(|_| Buffer::zeros(ElementType::U8, &[2])).collect()]
        } else {
            Vec::new()
        };
        let opts = GatherOptions {
            root_rank: 2,
            ..Default::default()
        };
        let mut work = pg.gather(&outputs, &[input], &opts).unwrap();
        let pending_on_return = work.is_pending();
        work.wait().unwrap();
        let gathered: Vec<Vec<u8>> = outputs
            .first()
            .map(|outs| outs.iter().map(|b| b.to_vec::<u8>().unwrap()).collect())
            .unwrap_or_default();
        (pending_on_return, gathered)
    });
    for (rank, (pending, gathered)) in results.into_iter().enumerate() {
        if rank == 2 {
            assert!(!pending, "staged root copies before returning");
            let expected: Vec<Vec<u8>> = (0..4u8).map(|r| vec![r, 100 + r]).collect();
            assert_eq!(gathered, expected);
        } else {
            assert!(gathered.is_empty());
        }
    }
}

#[test]
fn gather_into_contiguous_views_is_zero_copy() {
    let results = run(4, |pg| {
        let input = Buffer::from_slice(&[pg.rank() as f64 * 2.0, pg.rank() as f64 * 2.0 + 1.0], &[2])
            .unwrap();
        let flat = Buffer::zeros(ElementType::F64, &[8]);
        let outputs = if pg.rank() == 0 {
            vec![flat.split_with_sizes(&[2, 2, 2, 2]).unwrap()]
        } else {
            Vec::new()
        };
        let mut work = pg
            .gather(&outputs, &[input], &GatherOptions::default())
            .unwrap();
        let retained = work.retained();
        work.wait().unwrap();
        (retained, flat.to_vec::<f64>().unwrap())
    });
    let (root_retained, root_data) = &results[0];
    assert_eq!(*root_retained, 2, "flat output and input stay referenced");
    assert_eq!(root_data, &(0..8).map(f64::from).collect::<Vec<_>>());
    for (retained, _) in &results[1..] {
        assert_eq!(*retained, 1);
    }
}

#[test]
fn scatter_from_root() {
    let results = run(3, |pg| {
        let output = Buffer::zeros(ElementType::I64, &[2, 2]);
        let inputs = if pg.rank() == 1 {
            vec![(0..3)
                .map(|r| Buffer::from_slice(&[r as i64 * 10; 4], &[4]).unwrap())
                .collect()]
        } else {
            Vec::new()
        };
        let opts = ScatterOptions {
            root_rank: 1,
            ..Default::default()
        };
        let mut work = pg.scatter(&[output.clone()], &inputs, &opts).unwrap();
        let retained = work.retained();
        work.wait().unwrap();
        (retained, output.to_vec::<i64>().unwrap())
    });
    for (rank, (retained, got)) in results.into_iter().enumerate() {
        assert_eq!(retained, if rank == 1 { 2 } else { 1 });
        assert_eq!(got, vec![rank as i64 * 10; 4]);
    }
}

#[test]
fn non_root_ranks_reject_buffer_lists() {
    let results = run(2, |pg| {
        let other = 1 - pg.rank();
        let list = vec![vec![Buffer::zeros(ElementType::I32, &[2]); 2]];
        let single = Buffer::zeros(ElementType::I32, &[2]);
        let gather = pg.gather(
            &list,
            &[single.clone()],
            &GatherOptions {
                root_rank: other,
                ..Default::default()
            },
        );
        let scatter = pg.scatter(
            &[single],
            &list,
            &ScatterOptions {
                root_rank: other,
                ..Default::default()
            },
        );
        (gather.unwrap_err(), scatter.unwrap_err())
    });
    for (gather, scatter) in results {
        assert!(gather.is_validation(), "{gather}");
        assert!(gather.to_string().contains("no output buffers"), "{gather}");
        assert!(scatter.is_validation(), "{scatter}");
        assert!(scatter.to_string().contains("no input buffers"), "{scatter}");
    }
}

#[test]
fn scatter_from_contiguous_views_is_zero_copy() {
    let results = run(3, |pg| {
        let output = Buffer::zeros(ElementType::F32, &[2]);
        let inputs = if pg.rank() == 0 {
            let backing = Buffer::from_slice(&[0.0f32, 1.0, 10.0, 11.0, 20.0, 21.0], &[6]).unwrap();
            let views = backing.split_with_sizes(&[2, 2, 2]).unwrap();
            assert!(layout::flatten(&views).unwrap().is_flat);
            vec![views]
        } else {
            Vec::new()
        };
        let mut work = pg
            .scatter(&[output.clone()], &inputs, &ScatterOptions::default())
            .unwrap();
        let retained = work.retained();
        // The root's views are the only references left to the send region.
        drop(inputs);
        work.wait().unwrap();
        (retained, output.to_vec::<f32>().unwrap())
    });
    for (rank, (retained, got)) in results.into_iter().enumerate() {
        assert_eq!(retained, if rank == 0 { 2 } else { 1 });
        let base = rank as f32 * 10.0;
        assert_eq!(got, vec![base, base + 1.0]);
    }
}

#[test]
fn alltoall_list_form_keeps_staged_inputs_alive() {
    let results = run(3, |pg| {
        let r = pg.rank() as i32;
        let inputs: Vec<Buffer> = (0..3)
            .map(|j| Buffer::from_slice(&[r * 10 + j; 2], &[2]).unwrap())
            .collect();
        let backing = Buffer::zeros(ElementType::I32, &[6]);
        let outputs = backing.split_with_sizes(&[2, 2, 2]).unwrap();
        let mut work = pg
            .alltoall(&outputs, &inputs, &AllToAllOptions::default())
            .unwrap();
        let pending = work.is_pending();
        let retained = work.retained();
        // Only the staged copy of the inputs is left for the substrate to read.
        drop(inputs);
        work.wait().unwrap();
        (pending, retained, backing.to_vec::<i32>().unwrap())
    });
    for (j, (pending, retained, got)) in results.into_iter().enumerate() {
        assert!(pending, "flat outputs need no synchronous copy-back");
        assert_eq!(retained, 2, "flat outputs plus staged inputs");
        let expected: Vec<i32> = (0..3).flat_map(|i| [i * 10 + j as i32; 2]).collect();
        assert_eq!(got, expected);
    }
}

#[test]
fn alltoall_even_split() {
    let results = run(4, |pg| {
        let r = pg.rank() as i32;
        let input = Buffer::from_slice(&(0..8).map(|k| r * 100 + k).collect::<Vec<_>>(), &[8])
            .unwrap();
        let output = Buffer::zeros(ElementType::I32, &[8]);
        pg.alltoall_base(&output, &input, &AllToAllOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        output.to_vec::<i32>().unwrap()
    });
    for (j, got) in results.into_iter().enumerate() {
        let j = j as i32;
        let expected: Vec<i32> = (0..4).flat_map(|i| [i * 100 + 2 * j, i * 100 + 2 * j + 1]).collect();
        assert_eq!(got, expected);
    }
}

/// Uneven exchange with input splits `[1, 2, 3, 4]` and output splits
/// `[4, 3, 2, 1]` on every rank. Row widths make the element counts agree:
/// rank `i` sends rows of `4 - i` elements and receives rows of `i + 1`.
#[test]
fn alltoall_uneven_splits_match_reference_transpose() {
    const N: usize = 4;
    let in_splits = [1usize, 2, 3, 4];
    let out_splits = [4usize, 3, 2, 1];

    let input_of = |i: usize| -> Vec<i32> {
        (0..10 * (N - i)).map(|k| (i * 1000 + k) as i32).collect()
    };

    let results = run(N, move |pg| {
        let i = pg.rank();
        let input = Buffer::from_slice(&input_of(i), &[10, N - i]).unwrap();
        let output = Buffer::zeros(ElementType::I32, &[10, i + 1]);
        let opts = AllToAllOptions::with_splits(out_splits.to_vec(), in_splits.to_vec());
        let mut work = pg.alltoall_base(&output, &input, &opts).unwrap();
        assert_eq!(work.retained(), 2);
        work.wait().unwrap();
        output.to_vec::<i32>().unwrap()
    });

    // Reference: rank j's output is, for each source i in order, the block of
    // rank i's input destined to j.
    for (j, got) in results.iter().enumerate() {
        let mut expected = Vec::new();
        for i in 0..N {
            let width = N - i;
            let start: usize = in_splits[..j].iter().sum::<usize>() * width;
            let len = in_splits[j] * width;
            expected.extend_from_slice(&input_of(i)[start..start + len]);
        }
        assert_eq!(got, &expected, "rank {j}");
    }
}

#[test]
fn alltoall_split_validation() {
    let results = run(1, |pg| {
        let a = Buffer::zeros(ElementType::F32, &[4]);
        let b = Buffer::zeros(ElementType::F32, &[4]);
        let wrong_len = AllToAllOptions::with_splits(vec![2, 2], vec![4]);
        let wrong_sum = AllToAllOptions::with_splits(vec![3], vec![4]);
        (
            pg.alltoall_base(&a, &b, &wrong_len).unwrap_err().to_string(),
            pg.alltoall_base(&a, &b, &wrong_sum).unwrap_err().to_string(),
        )
    });
    let (len_err, sum_err) = &results[0];
    assert!(len_err.contains("not equal to group size"), "{len_err}");
    assert!(sum_err.contains("sum to 3"), "{sum_err}");
}

#[test]
fn alltoall_list_form_with_staging_and_zero_copy() {
    let results = run(3, |pg| {
        let r = pg.rank() as f32;
        // Separate allocations on the input side force staging.
        let inputs: Vec<Buffer> = (0..3)
            .map(|j| Buffer::from_slice(&vec![r * 10.0 + j as f32; j + 1], &[j + 1]).unwrap())
            .collect();
        // Receive rank+1 elements from every rank.
        let n = pg.rank() + 1;
        let staged: Vec<Buffer> = (0..3).map(|_| Buffer::zeros(ElementType::F32, &[n])).collect();
        let mut work = pg
            .alltoall(&staged, &inputs, &AllToAllOptions::default())
            .unwrap();
        assert!(!work.is_pending());
        work.wait().unwrap();

        let backing = Buffer::zeros(ElementType::F32, &[3 * n]);
        let views = backing.split_with_sizes(&[n, n, n]).unwrap();
        let mut work = pg
            .alltoall(&views, &inputs, &AllToAllOptions::default())
            .unwrap();
        assert_eq!(work.retained(), 2);
        work.wait().unwrap();

        (
            staged
                .iter()
                .map(|b| b.to_vec::<f32>().unwrap())
                .collect::<Vec<_>>(),
            backing.to_vec::<f32>().unwrap(),
        )
    });
    for (j, (staged, flat)) in results.into_iter().enumerate() {
        let expected: Vec<Vec<f32>> = (0..3)
            .map(|i| vec![i as f32 * 10.0 + j as f32; j + 1])
            .collect();
        assert_eq!(staged, expected);
        assert_eq!(flat, expected.concat());
    }
}

#[test]
fn barrier_returns_completed_handle() {
    let results = run(4, |pg| {
        let mut work = pg.barrier(&Default::default()).unwrap();
        (work.is_pending(), work.is_completed().unwrap(), work.wait().unwrap())
    });
    assert!(results.iter().all(|r| *r == (false, true, true)));
}

#[test]
fn polling_completes_without_blocking() {
    let results = run(2, |pg| {
        let data = Buffer::from_slice(&[1u8, 2, 3], &[3]).unwrap();
        let mut work = pg
            .allreduce(&[data.clone()], &AllreduceOptions::default())
            .unwrap();
        while !work.is_completed().unwrap() {
            std::thread::yield_now();
        }
        assert_eq!(work.retained(), 0);
        data.to_vec::<u8>().unwrap()
    });
    assert!(results.iter().all(|v| v == &vec![2, 4, 6]));
}

#[test]
fn collective_caching_reuses_plans() {
    let config = EngineConfig::default().with_cache(true);
    let hits = run_ranks(2, config, |pg, endpoint| {
        let opts = AllreduceOptions {
            tensor_name: "layer0.weight".into(),
            ..Default::default()
        };
        for _ in 0..3 {
            let data = Buffer::zeros(ElementType::F32, &[16]);
            pg.allreduce(&[data], &opts).unwrap().wait().unwrap();
        }
        // Unnamed calls are never cached.
        let data = Buffer::zeros(ElementType::F32, &[16]);
        pg.allreduce(&[data], &AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        endpoint.plan_cache_hits()
    });
    assert_eq!(hits, vec![2, 2]);
}

#[test]
fn mismatched_counts_surface_from_wait() {
    let results = run(2, |pg| {
        let data = Buffer::zeros(ElementType::F32, &[pg.rank() + 1]);
        let mut work = pg
            .allreduce(&[data], &AllreduceOptions::default())
            .unwrap();
        work.wait().unwrap_err()
    });
    for err in results {
        assert!(
            matches!(&err, ferrocoll::Error::Substrate { message, .. } if message.contains("mismatch")),
            "{err:?}"
        );
        assert!(!err.is_validation());
    }
}
