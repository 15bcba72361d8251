//! Engine configuration.
//!
//! Resolved once, when an [`Environment`](crate::Environment) is built, and
//! shared by every process group created under it.
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `FERROCOLL_CACHE` | `1/true/yes/on`, `0/false/no/off` | off |
//! | `FERROCOLL_ALLGATHER` | `flat`, `vector` | `flat` |

use crate::error::{Error, Result};
use std::env;
use std::fmt;
use std::str::FromStr;

/// How all-gather hands its destination to the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllgatherMode {
    /// Gather into one staging region, then copy each block out before
    /// returning. The call is effectively synchronous.
    #[default]
    Flat,
    /// Pass one destination pointer per rank; no staging, no early wait.
    Vector,
}

impl FromStr for AllgatherMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(AllgatherMode::Flat),
            "vector" => Ok(AllgatherMode::Vector),
            other => Err(Error::Config(format!(
                "FERROCOLL_ALLGATHER must be 'flat' or 'vector', got '{other}'"
            ))),
        }
    }
}

impl fmt::Display for AllgatherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllgatherMode::Flat => f.write_str("flat"),
            AllgatherMode::Vector => f.write_str("vector"),
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pass the caller's tensor name to the substrate so it can reuse plans
    pub cache_collectives: bool,
    /// Destination strategy for all-gather
    pub allgather_mode: AllgatherMode,
}

impl EngineConfig {
    /// Read settings from `FERROCOLL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Read settings through an arbitrary variable lookup.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = EngineConfig::default();
        if let Some(v) = lookup("FERROCOLL_CACHE") {
            config.cache_collectives = parse_flag("FERROCOLL_CACHE", &v)?;
        }
        if let Some(v) = lookup("FERROCOLL_ALLGATHER") {
            config.allgather_mode = v.parse()?;
        }
        Ok(config)
    }

    /// Enable or disable collective caching.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_collectives = enabled;
        self
    }

    /// Select the all-gather strategy.
    pub fn with_allgather_mode(mut self, mode: AllgatherMode) -> Self {
        self.allgather_mode = mode;
        self
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!("{name} must be a boolean, got '{other}'"))),
    }
}
