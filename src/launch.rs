//! Launcher-provided rank and size.
//!
//! Process launchers publish each process's rank and the job size through
//! environment variables. The engine never trusts these for its own rank: it
//! only cross-checks them against what the substrate reports when a process
//! group is constructed.
//!
//! # Environment Variables
//!
//! Checked in this order; the first pair with a parsable rank wins.
//!
//! | Launcher | Rank | Size |
//! |----------|------|------|
//! | torchrun-style | `RANK` | `WORLD_SIZE` |
//! | Hydra / PMI | `PMI_RANK` | `PMI_SIZE` |
//! | Open MPI | `OMPI_COMM_WORLD_RANK` | `OMPI_COMM_WORLD_SIZE` |
//! | SLURM | `SLURM_PROCID` | `SLURM_NTASKS` |

use crate::error::{Error, Result};
use std::env;

const LAUNCHER_VARS: [(&str, &str); 4] = [
    ("RANK", "WORLD_SIZE"),
    ("PMI_RANK", "PMI_SIZE"),
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("SLURM_PROCID", "SLURM_NTASKS"),
];

/// Expected rank and size of this process, if known.
///
/// `None` means "accept whatever the substrate reports".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rendezvous {
    /// Expected rank
    pub rank: Option<usize>,
    /// Expected group size
    pub size: Option<usize>,
}

impl Rendezvous {
    /// Explicit expectations.
    pub fn new(rank: Option<usize>, size: Option<usize>) -> Self {
        Rendezvous { rank, size }
    }

    /// Read expectations from the launcher's environment variables.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Read expectations through an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).and_then(|v| v.trim().parse::<usize>().ok());
        for (rank_var, size_var) in LAUNCHER_VARS {
            if let Some(rank) = parse(rank_var) {
                return Rendezvous {
                    rank: Some(rank),
                    size: parse(size_var),
                };
            }
        }
        Rendezvous::default()
    }

    /// True if a launcher published at least a rank.
    pub fn is_launched(&self) -> bool {
        self.rank.is_some()
    }

    /// Fail if the substrate's view disagrees with the expectations.
    pub fn check(&self, rank: usize, size: usize) -> Result<()> {
        if let Some(expected) = self.rank {
            Error::check(expected == rank, || {
                format!("unexpected rank {expected}, substrate rank {rank}")
            })?;
        }
        if let Some(expected) = self.size {
            Error::check(expected == size, || {
                format!("unexpected size {expected}, substrate size {size}")
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn first_launcher_wins() {
        let r = Rendezvous::from_vars(lookup(&[
            ("SLURM_PROCID", "3"),
            ("SLURM_NTASKS", "8"),
            ("RANK", "1"),
            ("WORLD_SIZE", "4"),
        ]));
        assert_eq!(r, Rendezvous::new(Some(1), Some(4)));
    }

    #[test]
    fn falls_back_through_launchers() {
        let r = Rendezvous::from_vars(lookup(&[("SLURM_PROCID", "3"), ("SLURM_NTASKS", "8")]));
        assert_eq!(r, Rendezvous::new(Some(3), Some(8)));
        let r = Rendezvous::from_vars(lookup(&[("PMI_RANK", "2")]));
        assert_eq!(r, Rendezvous::new(Some(2), None));
    }

    #[test]
    fn unparsable_rank_is_ignored() {
        let r = Rendezvous::from_vars(lookup(&[("RANK", "zero")]));
        assert!(!r.is_launched());
    }

    #[test]
    fn check_reports_mismatch() {
        let r = Rendezvous::new(Some(1), Some(4));
        assert!(r.check(1, 4).is_ok());
        assert!(r.check(0, 4).unwrap_err().is_validation());
        assert!(r.check(1, 2).is_err());
        assert!(Rendezvous::default().check(7, 9).is_ok());
    }
}
