//! SSH targets using the system ssh command
//!
//! Uses system SSH for reliability and to leverage the user's existing SSH
//! config. Remote commands are passed as one shell-quoted string.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::shell::CmdLine;

/// `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    user: Option<String>,
    host: String,
    port: Option<u16>,
    config: Option<PathBuf>,
}

impl SshTarget {
    #[must_use]
    pub fn new(host: &str) -> Self {
        Self {
            user: None,
            host: host.to_string(),
            port: None,
            config: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use a custom ssh config file (`ssh -F`)
    #[must_use]
    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// SSH destination string
    #[must_use]
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Full argv that runs `command` on the remote host
    #[must_use]
    pub fn wrap(&self, command: &CmdLine) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        if let Some(config) = &self.config {
            argv.push("-F".to_string());
            argv.push(config.display().to_string());
        }
        if let Some(port) = self.port {
            argv.push("-p".to_string());
            argv.push(port.to_string());
        }
        argv.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            self.destination(),
            command.to_shell(),
        ]);
        argv
    }
}

/// Invalid `[user@]host[:port]` string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ssh target '{0}', expected [user@]host[:port]")]
pub struct SshTargetError(String);

impl FromStr for SshTarget {
    type Err = SshTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SshTargetError(s.to_string());

        let (user, rest) = match s.split_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user), rest),
            Some(_) => return Err(invalid()),
            None => (None, s),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            None => (rest, None),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }

        let mut target = Self::new(host);
        target.user = user.map(str::to_string);
        target.port = port;
        Ok(target)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination())?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}
