//! Command execution errors

use std::fmt;

use thiserror::Error;

/// Set of accepted exit codes; empty accepts anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitCodes(Vec<i32>);

impl ExitCodes {
    #[must_use]
    pub fn new(codes: impl Into<Vec<i32>>) -> Self {
        Self(codes.into())
    }

    /// Accept every exit code
    #[must_use]
    pub fn any() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn accepts(&self, code: i32) -> bool {
        self.0.is_empty() || self.0.contains(&code)
    }

    #[must_use]
    pub fn codes(&self) -> &[i32] {
        &self.0
    }
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self(vec![0])
    }
}

impl fmt::Display for ExitCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("any");
        }
        let codes: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&codes.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {code} (accepted: {accepts})")]
    Exit {
        command: String,
        code: i32,
        accepts: ExitCodes,
    },

    #[error("i/o error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}
