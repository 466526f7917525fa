//! Execution node: runs commands locally or over ssh
//!
//! Commands that carry a shell pipe run through `sh -c` locally and through
//! the login shell remotely. Everything else is spawned directly, or passed
//! to ssh as a single quoted string.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ExecuteError, ExitCodes};
use crate::pipeline::{CmdItem, CmdPipe, PipeOutcome};
use crate::shell::CmdLine;
use crate::ssh::SshTarget;

/// What the first stage of a command reads
pub enum Input {
    Text(String),
    /// An unfinished pipeline whose last stage feeds this command
    Pipe(CmdPipe),
}

/// Per-call options for [`Runner::run`] and [`Runner::pipe`]
pub struct RunOptions {
    input: Option<Input>,
    valid_exit_codes: ExitCodes,
    readonly: bool,
    hide_errors: bool,
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self {
            input: None,
            valid_exit_codes: ExitCodes::default(),
            readonly: false,
            hide_errors: false,
        }
    }

    #[must_use]
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(Input::Text(input.into()));
        self
    }

    /// Read from the stdout of an unfinished pipeline
    #[must_use]
    pub fn input_pipe(mut self, pipe: CmdPipe) -> Self {
        self.input = Some(Input::Pipe(pipe));
        self
    }

    #[must_use]
    pub fn valid_exit_codes(mut self, codes: ExitCodes) -> Self {
        self.valid_exit_codes = codes;
        self
    }

    /// The command doesn't change anything and may run in readonly mode
    #[must_use]
    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// Log stderr at debug level only
    #[must_use]
    pub fn hide_errors(mut self) -> Self {
        self.hide_errors = true;
        self
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    #[must_use]
    pub fn exit_codes(&self) -> &ExitCodes {
        &self.valid_exit_codes
    }

    /// Take the input out, leaving none
    pub fn take_input(&mut self) -> Option<Input> {
        self.input.take()
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Output of a command that ran
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Exit code of the last stage
    pub exit_code: i32,
}

impl RunOutput {
    /// Stdout lines with trailing whitespace removed
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.iter().map(|line| line.trim_end())
    }

    /// Stdout lines split into tab separated columns
    #[must_use]
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.stdout
            .iter()
            .filter(|line| !line.is_empty())
            .map(|line| line.split('\t').map(str::to_string).collect())
            .collect()
    }
}

/// Something that runs command lines; [`ExecuteNode`] is the real one
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short name used as log prefix
    fn label(&self) -> &str;

    fn is_readonly(&self) -> bool;

    /// Add `cmd` to a pipeline without running it
    fn pipe(&self, cmd: &CmdLine, options: RunOptions) -> CmdPipe;

    /// Run `cmd`; `None` when skipped in readonly mode
    ///
    /// # Errors
    /// Returns an error if the command can't run or exits unacceptably
    async fn run(&self, cmd: &CmdLine, options: RunOptions) -> Result<Option<RunOutput>, ExecuteError>;
}

/// Where commands run
#[derive(Debug, Clone)]
pub struct ExecuteNode {
    label: String,
    ssh: Option<SshTarget>,
    readonly: bool,
}

impl ExecuteNode {
    /// Node on this machine
    #[must_use]
    pub fn local(label: &str, readonly: bool) -> Self {
        Self {
            label: label.to_string(),
            ssh: None,
            readonly,
        }
    }

    /// Node reached over ssh
    #[must_use]
    pub fn remote(label: &str, ssh: SshTarget, readonly: bool) -> Self {
        Self {
            label: label.to_string(),
            ssh: Some(ssh),
            readonly,
        }
    }

    /// Local if `ssh` is `None`
    #[must_use]
    pub fn new(label: &str, ssh: Option<SshTarget>, readonly: bool) -> Self {
        Self {
            label: label.to_string(),
            ssh,
            readonly,
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.ssh.is_none()
    }

    /// Host description for logs
    #[must_use]
    pub fn description(&self) -> String {
        match &self.ssh {
            Some(ssh) => ssh.to_string(),
            None => "(local)".to_string(),
        }
    }

    /// The argv that runs `cmd` on this node
    #[must_use]
    pub fn argv(&self, cmd: &CmdLine) -> Vec<String> {
        match &self.ssh {
            Some(ssh) => ssh.wrap(cmd),
            None if cmd.has_pipe() => vec!["sh".to_string(), "-c".to_string(), cmd.to_shell()],
            None => cmd.argv(),
        }
    }

    fn item(&self, cmd: &CmdLine, codes: ExitCodes, readonly: bool, hide_errors: bool) -> CmdItem {
        let label = self.label.clone();
        CmdItem::new(self.argv(cmd))
            .readonly(readonly)
            .accepts(codes)
            .on_stderr(move |line| {
                if hide_errors {
                    debug!("[{label}] STDERR > {line}");
                } else {
                    warn!("[{label}] STDERR > {line}");
                }
            })
    }
}

#[async_trait]
impl Runner for ExecuteNode {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Add `cmd` to a pipeline without running it.
    ///
    /// Continues the pipeline given as input, or starts a new one.
    fn pipe(&self, cmd: &CmdLine, options: RunOptions) -> CmdPipe {
        let RunOptions {
            input,
            valid_exit_codes,
            readonly,
            hide_errors,
        } = options;

        let mut pipe = match input {
            Some(Input::Pipe(pipe)) => pipe,
            Some(Input::Text(text)) => CmdPipe::new(self.readonly).with_input(text),
            None => CmdPipe::new(self.readonly),
        };
        debug!("[{}] {cmd}", self.label);
        pipe.add(self.item(cmd, valid_exit_codes, readonly, hide_errors));
        pipe
    }

    /// Run `cmd` and collect its output.
    ///
    /// Returns `None` when the node is readonly and the command isn't.
    ///
    /// # Errors
    /// Returns an error if any stage can't be started or exits with a code
    /// that isn't accepted
    async fn run(&self, cmd: &CmdLine, options: RunOptions) -> Result<Option<RunOutput>, ExecuteError> {
        let pipe = self.pipe(cmd, options);
        let report = match pipe.execute().await? {
            PipeOutcome::Skipped => return Ok(None),
            PipeOutcome::Finished(report) => report,
        };

        if let Some(failed) = report.first_failure() {
            return Err(ExecuteError::Exit {
                command: failed.command.clone(),
                code: failed.exit_code,
                accepts: failed.accepts.clone(),
            });
        }

        let exit_code = report.stages.last().map_or(0, |stage| stage.exit_code);
        let stderr = report.stderr();
        Ok(Some(RunOutput {
            stdout: report.stdout,
            stderr,
            exit_code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> ExecuteNode {
        ExecuteNode::local("test", false)
    }

    #[tokio::test]
    async fn test_run_lines_and_rows() {
        let output = local()
            .run(&CmdLine::new(["printf", "a\\tb\\nc\\td  \\n"]), RunOptions::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.lines().collect::<Vec<_>>(), vec!["a\tb", "c\td"]);
        assert_eq!(output.rows(), vec![vec!["a", "b"], vec!["c", "d  "]]);
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn test_valid_exit_codes() {
        let cmd = CmdLine::new(["sh", "-c", "echo out; echo err >&2; exit 2"]);

        match local().run(&cmd, RunOptions::new().hide_errors()).await {
            Err(ExecuteError::Exit { code, accepts, .. }) => {
                assert_eq!(code, 2);
                assert_eq!(accepts, ExitCodes::default());
            }
            other => panic!("expected exit error, got {other:?}"),
        }

        let output = local()
            .run(&cmd, RunOptions::new().valid_exit_codes(ExitCodes::new([0, 2])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.stdout, vec!["out"]);
        assert_eq!(output.stderr, vec!["err"]);
        assert_eq!(output.exit_code, 2);

        let output = local()
            .run(&cmd, RunOptions::new().valid_exit_codes(ExitCodes::any()))
            .await
            .unwrap();
        assert!(output.is_some());
    }

    #[tokio::test]
    async fn test_readonly_node_skips_mutations() {
        let node = ExecuteNode::local("test", true);
        let skipped = node
            .run(&CmdLine::new(["echo", "destroy"]), RunOptions::new())
            .await
            .unwrap();
        assert!(skipped.is_none());

        let listed = node
            .run(&CmdLine::new(["echo", "list"]), RunOptions::new().readonly())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listed.stdout, vec!["list"]);
    }

    #[tokio::test]
    async fn test_literal_input() {
        let output = local()
            .run(&CmdLine::new(["tr", "a-z", "A-Z"]), RunOptions::new().input("shout\n"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.stdout, vec!["SHOUT"]);
    }

    #[tokio::test]
    async fn test_shell_pipe_marker() {
        let cmd = CmdLine::new(["echo", "hello world; exit 1"])
            .pipe()
            .args(["tr", "a-z", "A-Z"]);
        let output = local().run(&cmd, RunOptions::new()).await.unwrap().unwrap();
        assert_eq!(output.stdout, vec!["HELLO WORLD; EXIT 1"]);
    }

    #[tokio::test]
    async fn test_chain_through_pipe_handle() {
        let node = local();
        let pipe = node.pipe(&CmdLine::new(["echo", "chained"]), RunOptions::new());
        let output = node
            .run(
                &CmdLine::new(["tr", "a-z", "A-Z"]),
                RunOptions::new().input_pipe(pipe),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.stdout, vec!["CHAINED"]);
    }

    #[test]
    fn test_remote_argv() {
        let node = ExecuteNode::remote("source", "root@nas".parse().unwrap(), false);
        assert!(!node.is_local());
        assert_eq!(node.description(), "root@nas");
        let argv = node.argv(&CmdLine::new(["zfs", "list", "-H", "pool/a b"]));
        assert_eq!(
            argv,
            vec!["ssh", "-o", "BatchMode=yes", "root@nas", "zfs list -H 'pool/a b'"]
        );

        let local = local();
        assert_eq!(local.argv(&CmdLine::new(["zfs", "list"])), vec!["zfs", "list"]);
        assert_eq!(
            local.argv(&CmdLine::new(["zfs", "send", "x"]).pipe().arg("cat")),
            vec!["sh", "-c", "zfs send x | cat"]
        );
    }
}
