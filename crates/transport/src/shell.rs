//! Command lines and POSIX shell quoting

use std::borrow::Cow;
use std::fmt;

/// One element of a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Ordinary argument, always quoted when rendered for a shell
    Plain(String),
    /// The shell pipe operator, rendered unquoted
    Pipe,
}

/// Quote `arg` for a POSIX shell, leaving harmless words alone
#[must_use]
pub fn quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// A command with its arguments, possibly containing shell pipes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdLine {
    args: Vec<Arg>,
}

impl CmdLine {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(|a| Arg::Plain(a.into())).collect(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(Arg::Plain(arg.into()));
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|a| Arg::Plain(a.into())));
        self
    }

    /// Append a shell pipe; the command then needs a shell to run
    #[must_use]
    pub fn pipe(mut self) -> Self {
        self.args.push(Arg::Pipe);
        self
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.args.push(Arg::Plain(arg.into()));
    }

    #[must_use]
    pub fn has_pipe(&self) -> bool {
        self.args.contains(&Arg::Pipe)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Plain arguments, for spawning without a shell
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        self.args
            .iter()
            .filter_map(|arg| match arg {
                Arg::Plain(s) => Some(s.clone()),
                Arg::Pipe => None,
            })
            .collect()
    }

    /// Render for a shell: every plain argument quoted, pipes bare
    #[must_use]
    pub fn to_shell(&self) -> String {
        let parts: Vec<Cow<'_, str>> = self
            .args
            .iter()
            .map(|arg| match arg {
                Arg::Plain(s) => quote(s),
                Arg::Pipe => Cow::Borrowed("|"),
            })
            .collect();
        parts.join(" ")
    }
}

impl fmt::Display for CmdLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote() {
        assert_eq!(quote("pool/fs@snap-1"), "pool/fs@snap-1");
        assert_eq!(quote("pool/fs#bm"), "'pool/fs#bm'");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_pipe_marker_stays_bare() {
        let cmd = CmdLine::new(["zfs", "send", "pool/a b@x"])
            .pipe()
            .args(["mbuffer", "-m", "1G"]);
        assert!(cmd.has_pipe());
        assert_eq!(cmd.to_shell(), "zfs send 'pool/a b@x' | mbuffer -m 1G");
        assert_eq!(cmd.argv().len(), 6);

        let quoted_pipe = CmdLine::new(["echo", "|"]);
        assert!(!quoted_pipe.has_pipe());
        assert_eq!(quoted_pipe.to_shell(), "echo '|'");
    }
}
