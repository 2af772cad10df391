//! Environment lookups behind a swappable source.
//!
//! The gateway reads a handful of `ZEO_GATEWAY_*` overrides at startup.
//! Tests hand [`Env::mock`] a fixed table instead of mutating the process
//! environment, which would race with other tests.

use std::collections::HashMap;
use std::env::VarError;
use std::str::FromStr;

#[derive(Clone, Debug)]
enum Source {
    Process,
    Fixed(HashMap<String, String>),
}

/// Where configuration overrides come from.
#[derive(Clone, Debug)]
pub struct Env {
    source: Source,
}

impl Env {
    /// Read from the process environment.
    pub fn real() -> Self {
        Self {
            source: Source::Process,
        }
    }

    /// Read from a fixed table; anything not listed is absent.
    pub fn mock(vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        let table = vars
            .into_iter()
            .map(|(name, value)| (name.into(), value.into()))
            .collect();
        Self {
            source: Source::Fixed(table),
        }
    }

    pub fn var(&self, name: &str) -> Result<String, VarError> {
        match &self.source {
            Source::Process => std::env::var(name),
            Source::Fixed(table) => table.get(name).cloned().ok_or(VarError::NotPresent),
        }
    }

    /// Look up and parse a variable, returning `None` when it is absent.
    ///
    /// A present but unparsable value comes back as `Err` holding the raw
    /// text so the caller can report it.
    pub fn parsed<T: FromStr>(&self, name: &str) -> Option<Result<T, String>> {
        let raw = self.var(name).ok()?;
        Some(raw.trim().parse::<T>().map_err(|_| raw))
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::real()
    }
}
