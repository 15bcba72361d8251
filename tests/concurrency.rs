//! Several caller threads inside one emulated process, all going through the
//! same environment lock.
//!
//! A blocked `wait()` holds the environment lock until the peers arrive, so
//! threads that share an environment drive their handles by polling.

mod common;

use ferrocoll::substrate::{LocalFabric, LocalSubstrate};
use ferrocoll::{
    AllreduceOptions, BroadcastOptions, Buffer, EngineConfig, Environment, ProcessGroup, Work,
};
use std::sync::Arc;
use std::thread;

const ROUNDS: usize = 40;

fn poll(mut work: Work) {
    while !work.is_completed().expect("poll") {
        thread::yield_now();
    }
    assert!(work.is_success().expect("completed"));
}

/// One emulated process: three groups on one environment, driven by four
/// threads. Two of the threads share the same group.
fn emulated_process(endpoint: Arc<LocalSubstrate>, size: usize) -> Arc<Environment> {
    let rank = endpoint.rank();
    let env = Environment::new(endpoint, EngineConfig::default());
    let group = || ProcessGroup::new(Arc::clone(&env), Some(rank), Some(size)).expect("group");
    let reducer = group();
    let broadcaster = group();
    let shared = group();
    let total = (1..=size).sum::<usize>() as f32;

    thread::scope(|s| {
        s.spawn(|| {
            for round in 0..ROUNDS {
                let buf = Buffer::from_slice(&[(rank + 1) as f32; 8], &[8]).unwrap();
                poll(reducer.allreduce(&[buf.clone()], &AllreduceOptions::default()).unwrap());
                assert_eq!(buf.to_vec::<f32>().unwrap(), vec![total; 8], "round {round}");
            }
        });
        s.spawn(|| {
            for round in 0..ROUNDS {
                let root = round % size;
                let value = if rank == root { (round * 10 + root) as i64 } else { -1 };
                let buf = Buffer::from_slice(&[value; 3], &[3]).unwrap();
                let opts = BroadcastOptions {
                    root_rank: root,
                    ..Default::default()
                };
                poll(broadcaster.broadcast(&[buf.clone()], &opts).unwrap());
                assert_eq!(buf.to_vec::<i64>().unwrap(), vec![(round * 10 + root) as i64; 3]);
            }
        });
        // Calls from these two threads pair up with the peers' calls in
        // whatever order they reach the group; the sums agree regardless.
        for _ in 0..2 {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    let buf = Buffer::from_slice(&[(rank + 1) as f64; 4], &[4]).unwrap();
                    poll(shared.allreduce(&[buf.clone()], &AllreduceOptions::default()).unwrap());
                    assert_eq!(buf.to_vec::<f64>().unwrap(), vec![f64::from(total); 4]);
                }
            });
        }
    });
    env
}

#[test]
fn threads_sharing_an_environment_complete_every_collective() {
    common::init_logging();
    let size = 2;
    let handles: Vec<_> = LocalFabric::endpoints(size)
        .into_iter()
        .map(|endpoint| thread::spawn(move || emulated_process(endpoint, size)))
        .collect();
    for handle in handles {
        let env = handle.join().expect("emulated process panicked");
        assert!(!env.is_finalized());
        assert!(env.enter(|| Ok(())).is_ok(), "lock left poisoned or held");
    }
}
