//! Helpers for driving several ranks as threads over the in-process fabric.

#![allow(dead_code)]

use ferrocoll::substrate::{LocalFabric, LocalSubstrate};
use ferrocoll::{EngineConfig, Environment, ProcessGroup};
use std::sync::Arc;
use std::thread;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Run `body` once per rank, each on its own thread with its own environment,
/// and collect the results in rank order.
pub fn run_ranks<T, F>(size: usize, config: EngineConfig, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&ProcessGroup, &LocalSubstrate) -> T + Send + Sync + 'static,
{
    init_logging();
    let body = Arc::new(body);
    let handles: Vec<_> = LocalFabric::endpoints(size)
        .into_iter()
        .map(|endpoint| {
            let body = Arc::clone(&body);
            let config = config.clone();
            thread::spawn(move || {
                let env = Environment::new(endpoint.clone(), config);
                let pg = ProcessGroup::new(env, Some(endpoint.rank()), Some(size))
                    .expect("process group");
                body(&pg, &endpoint)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect()
}

/// `run_ranks` with the default configuration and no access to the endpoint.
pub fn run<T, F>(size: usize, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(&ProcessGroup) -> T + Send + Sync + 'static,
{
    run_ranks(size, EngineConfig::default(), move |pg, _| body(pg))
}
