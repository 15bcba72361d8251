//! Process-wide substrate state and the lock that serializes it.
//!
//! The substrate is not safe to enter from several threads at once, so every
//! entry point (communicator creation and release, every dispatch, every
//! completion poll or wait) goes through [`Environment::enter`], which holds a
//! single mutex for the duration of the substrate call and nothing more.
//!
//! One environment stands for one process. Normal programs use the
//! process-wide instance from [`Environment::global`] or
//! [`Environment::install_global`]; the first process group built on it
//! creates the shared world communicator, and teardown runs at process exit.
//! Tests that emulate several ranks inside one process build one environment
//! per emulated process with [`Environment::new`].

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::substrate::{Substrate, SubstrateComm, SubstrateError, SubstrateResult};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::Arc;

/// The process-wide environment, once installed.
static GLOBAL: OnceCell<Arc<Environment>> = OnceCell::new();

/// State guarded by the environment lock.
struct Guarded {
    /// Shared world communicator, created on first use.
    world: Option<Box<dyn SubstrateComm>>,
    finalized: bool,
}

/// An initialized substrate plus the lock serializing every call into it.
pub struct Environment {
    substrate: Arc<dyn Substrate>,
    config: EngineConfig,
    guarded: Mutex<Guarded>,
    /// `(rank, size)` of the world communicator.
    world: OnceCell<(usize, usize)>,
}

impl Environment {
    /// Build an environment over `substrate`. Nothing is created on the
    /// substrate until the first process group asks for it.
    pub fn new(substrate: Arc<dyn Substrate>, config: EngineConfig) -> Arc<Environment> {
        Arc::new(Environment {
            substrate,
            config,
            guarded: Mutex::new(Guarded {
                world: None,
                finalized: false,
            }),
            world: OnceCell::new(),
        })
    }

    /// Install the process-wide environment and register its teardown at
    /// process exit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyInitialized`] if a global environment exists.
    pub fn install_global(
        substrate: Arc<dyn Substrate>,
        config: EngineConfig,
    ) -> Result<Arc<Environment>> {
        let env = Environment::new(substrate, config);
        GLOBAL
            .set(Arc::clone(&env))
            .map_err(|_| Error::AlreadyInitialized)?;
        register_exit_teardown()?;
        log::info!("installed global {} environment", env.substrate.name());
        Ok(env)
    }

    /// The process-wide environment, installing the default substrate with
    /// [`EngineConfig::from_env`] on first use.
    ///
    /// The default substrate is MPI when built with the `mpi` feature, and a
    /// single-rank in-process fabric otherwise.
    pub fn global() -> Result<Arc<Environment>> {
        GLOBAL
            .get_or_try_init(|| {
                let config = EngineConfig::from_env()?;
                let env = Environment::new(default_substrate()?, config);
                register_exit_teardown()?;
                log::info!("initialized global {} environment", env.substrate.name());
                Ok(env)
            })
            .map(Arc::clone)
    }

    /// Settings every process group under this environment uses.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Name of the underlying substrate.
    pub fn substrate_name(&self) -> &str {
        self.substrate.name()
    }

    /// Create the shared world communicator if this is the first call, and
    /// return its `(rank, size)`.
    pub fn init_once(&self) -> Result<(usize, usize)> {
        self.world
            .get_or_try_init(|| {
                let (rank, size) = self.locked(Location::caller(), |guarded| {
                    let comm = self.substrate.create_communicator()?;
                    let view = (comm.rank(), comm.size());
                    guarded.world = Some(comm);
                    Ok(view)
                })?;
                log::info!(
                    "{} world communicator ready: rank {rank} of {size}",
                    self.substrate.name()
                );
                Ok((rank, size))
            })
            .copied()
    }

    /// Run one substrate call under the environment lock.
    ///
    /// Any [`SubstrateError`](crate::substrate::SubstrateError) or panic
    /// raised by the call is turned into [`Error::Substrate`] naming the
    /// caller's source location.
    #[track_caller]
    pub fn enter<T>(&self, call: impl FnOnce() -> SubstrateResult<T>) -> Result<T> {
        self.locked(Location::caller(), |_| call())
    }

    /// Create a communicator for a new process group.
    #[track_caller]
    pub(crate) fn create_communicator(&self) -> Result<Box<dyn SubstrateComm>> {
        self.enter(|| self.substrate.create_communicator())
    }

    /// Release a process group's communicator under the lock.
    pub(crate) fn release_communicator(&self, comm: Box<dyn SubstrateComm>) {
        let _guard = self.guarded.lock();
        drop(comm);
    }

    /// Release the world communicator and the substrate. Idempotent.
    pub fn finalize(&self) {
        let mut guarded = self.guarded.lock();
        if guarded.finalized {
            return;
        }
        guarded.world.take();
        self.substrate.finalize();
        guarded.finalized = true;
        log::info!("{} environment finalized", self.substrate.name());
    }

    /// True once [`finalize`](Self::finalize) has run.
    pub fn is_finalized(&self) -> bool {
        self.guarded.lock().finalized
    }

    fn locked<T>(
        &self,
        site: &Location<'_>,
        call: impl FnOnce(&mut Guarded) -> SubstrateResult<T>,
    ) -> Result<T> {
        let mut guarded = self.guarded.lock();
        if guarded.finalized {
            return Err(Error::NotInitialized);
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(&mut guarded)));
        drop(guarded);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(substrate_error(site, err)),
            Err(payload) => Err(Error::Substrate {
                site: site_name(site),
                message: format!("unknown error: {}", panic_message(payload.as_ref())),
            }),
        }
    }
}

/// Wrap an error reported by the substrate with the call site it surfaced at.
pub(crate) fn substrate_error(site: &Location<'_>, err: SubstrateError) -> Error {
    Error::Substrate {
        site: site_name(site),
        message: err.message,
    }
}

fn site_name(site: &Location<'_>) -> String {
    format!("{}:{}", site.file(), site.line())
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("substrate", &self.substrate.name())
            .field("config", &self.config)
            .field("world", &self.world.get())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[cfg(feature = "mpi")]
fn default_substrate() -> Result<Arc<dyn Substrate>> {
    Ok(Arc::new(crate::substrate::MpiSubstrate::init()?))
}

#[cfg(not(feature = "mpi"))]
fn default_substrate() -> Result<Arc<dyn Substrate>> {
    Ok(crate::substrate::LocalSubstrate::single())
}

extern "C" fn teardown_global() {
    if let Some(env) = GLOBAL.get() {
        env.finalize();
    }
}

fn register_exit_teardown() -> Result<()> {
    // SAFETY: `teardown_global` is a plain extern "C" fn with no arguments.
    if unsafe { libc::atexit(teardown_global) } != 0 {
        return Err(Error::Internal(
            "failed to register the substrate exit handler".into(),
        ));
    }
    Ok(())
}
