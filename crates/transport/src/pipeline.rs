//! Process pipelines
//!
//! A [`CmdPipe`] is a chain of [`CmdItem`] stages where every stage reads the
//! previous stage's stdout. All output that is not fed into another stage
//! (the last stdout and every stderr) is read through one [`StreamMap`] and
//! dispatched line by line as it arrives.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdout, Command};
use tokio_stream::wrappers::SplitStream;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, warn};

use crate::error::{ExecuteError, ExitCodes};
use crate::shell::quote;

pub type LineHandler = Box<dyn FnMut(&str) + Send>;
pub type ExitHandler = Box<dyn FnMut(i32) -> bool + Send>;

type LineStream = Pin<Box<dyn Stream<Item = io::Result<String>> + Send>>;

/// Newline separated output; bytes that aren't UTF-8 become U+FFFD
fn line_stream(reader: impl AsyncRead + Send + Unpin + 'static) -> LineStream {
    let chunks = SplitStream::new(BufReader::new(reader).split(b'\n'));
    Box::pin(chunks.map(|chunk| {
        chunk.map(|mut bytes| {
            if bytes.last() == Some(&b'\r') {
                bytes.pop();
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Output {
    Stdout,
    Stderr,
}

/// One process in a pipeline
pub struct CmdItem {
    argv: Vec<String>,
    readonly: bool,
    accepts: ExitCodes,
    on_stdout: Option<LineHandler>,
    on_stderr: Option<LineHandler>,
    on_exit: Option<ExitHandler>,
}

impl CmdItem {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            readonly: false,
            accepts: ExitCodes::default(),
            on_stdout: None,
            on_stderr: None,
            on_exit: None,
        }
    }

    /// Mark as safe to run in readonly mode
    #[must_use]
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    #[must_use]
    pub fn accepts(mut self, codes: ExitCodes) -> Self {
        self.accepts = codes;
        self
    }

    #[must_use]
    pub fn on_stdout(mut self, handler: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stdout = Some(Box::new(handler));
        self
    }

    #[must_use]
    pub fn on_stderr(mut self, handler: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_stderr = Some(Box::new(handler));
        self
    }

    /// Decide acceptance of the exit code instead of the accepted set
    #[must_use]
    pub fn on_exit(mut self, handler: impl FnMut(i32) -> bool + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(handler));
        self
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Shell-quoted form for logs and errors
    #[must_use]
    pub fn command_line(&self) -> String {
        let parts: Vec<_> = self.argv.iter().map(|a| quote(a)).collect();
        parts.join(" ")
    }
}

impl fmt::Debug for CmdItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdItem")
            .field("argv", &self.argv)
            .field("readonly", &self.readonly)
            .field("accepts", &self.accepts)
            .finish_non_exhaustive()
    }
}

/// How one stage ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub command: String,
    pub exit_code: i32,
    pub accepted: bool,
    pub accepts: ExitCodes,
    pub stderr: Vec<String>,
}

/// Output of a finished pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipeReport {
    /// Lines of the last stage's stdout
    pub stdout: Vec<String>,
    pub stages: Vec<StageReport>,
}

impl PipeReport {
    /// Every stage exited acceptably
    #[must_use]
    pub fn success(&self) -> bool {
        self.stages.iter().all(|stage| stage.accepted)
    }

    #[must_use]
    pub fn first_failure(&self) -> Option<&StageReport> {
        self.stages.iter().find(|stage| !stage.accepted)
    }

    /// Stderr lines of all stages, in stage order
    #[must_use]
    pub fn stderr(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|stage| stage.stderr.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeOutcome {
    /// Not run because a stage would change something in readonly mode
    Skipped,
    Finished(PipeReport),
}

impl PipeOutcome {
    /// Skipped pipelines count as successful
    #[must_use]
    pub fn success(&self) -> bool {
        match self {
            Self::Skipped => true,
            Self::Finished(report) => report.success(),
        }
    }

    #[must_use]
    pub fn into_report(self) -> Option<PipeReport> {
        match self {
            Self::Skipped => None,
            Self::Finished(report) => Some(report),
        }
    }
}

/// A chain of processes, built stage by stage and run once
pub struct CmdPipe {
    items: Vec<CmdItem>,
    readonly: bool,
    should_execute: bool,
    input: Option<String>,
}

impl CmdPipe {
    /// New empty pipeline; `readonly` pipelines refuse to run mutating stages
    #[must_use]
    pub fn new(readonly: bool) -> Self {
        Self {
            items: Vec::new(),
            readonly,
            should_execute: true,
            input: None,
        }
    }

    /// Feed `input` to the first stage
    #[must_use]
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Append a stage. A mutating stage on a readonly pipeline is still
    /// added, but the pipeline won't run.
    pub fn add(&mut self, item: CmdItem) {
        if self.readonly && !item.readonly {
            self.should_execute = false;
        }
        self.items.push(item);
    }

    #[must_use]
    pub fn should_execute(&self) -> bool {
        self.should_execute
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &CmdItem> {
        self.items.iter()
    }

    /// `a | b | c`, for logs
    #[must_use]
    pub fn command_line(&self) -> String {
        let stages: Vec<String> = self.items.iter().map(CmdItem::command_line).collect();
        stages.join(" | ")
    }

    /// Run every stage and wait until all output is read and all processes
    /// exited.
    ///
    /// Unacceptable exit codes are reported in the [`PipeReport`], not as an
    /// error.
    ///
    /// # Errors
    /// Returns an error if a process can't be started or waited on
    pub async fn execute(mut self) -> Result<PipeOutcome, ExecuteError> {
        let command_line = self.command_line();
        if !self.should_execute {
            debug!("Skipped in readonly mode: {command_line}");
            return Ok(PipeOutcome::Skipped);
        }
        if self.items.is_empty() {
            return Ok(PipeOutcome::Finished(PipeReport::default()));
        }
        debug!("Running: {command_line}");

        let last = self.items.len() - 1;
        let mut children = Vec::with_capacity(self.items.len());
        let mut streams: StreamMap<(usize, Output), LineStream> = StreamMap::new();
        let mut upstream: Option<ChildStdout> = None;
        let mut feeder = None;

        for (index, item) in self.items.iter().enumerate() {
            let stage = item.command_line();
            let Some((program, args)) = item.argv.split_first() else {
                return Err(ExecuteError::Spawn {
                    command: stage,
                    source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
                });
            };

            let mut command = Command::new(program);
            command
                .args(args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match upstream.take() {
                Some(stdout) => {
                    let stdin: Stdio = stdout.try_into().map_err(|source| ExecuteError::Io {
                        command: stage.clone(),
                        source,
                    })?;
                    command.stdin(stdin);
                }
                None if self.input.is_some() => {
                    command.stdin(Stdio::piped());
                }
                None => {
                    command.stdin(Stdio::null());
                }
            }

            let mut child = command.spawn().map_err(|source| ExecuteError::Spawn {
                command: stage.clone(),
                source,
            })?;

            if let Some(input) = self.input.take()
                && let Some(mut stdin) = child.stdin.take()
            {
                feeder = Some(tokio::spawn(async move {
                    stdin.write_all(input.as_bytes()).await?;
                    stdin.shutdown().await
                }));
            }

            if let Some(stderr) = child.stderr.take() {
                streams.insert((index, Output::Stderr), line_stream(stderr));
            }
            if let Some(stdout) = child.stdout.take() {
                if index == last {
                    streams.insert((index, Output::Stdout), line_stream(stdout));
                } else {
                    upstream = Some(stdout);
                }
            }

            children.push(child);
        }

        let mut stdout = Vec::new();
        let mut stderr: Vec<Vec<String>> = vec![Vec::new(); self.items.len()];

        while let Some(((index, output), line)) = streams.next().await {
            let item = &mut self.items[index];
            match line {
                Ok(line) => match output {
                    Output::Stdout => {
                        if let Some(handler) = item.on_stdout.as_mut() {
                            handler(&line);
                        }
                        stdout.push(line);
                    }
                    Output::Stderr => {
                        if let Some(handler) = item.on_stderr.as_mut() {
                            handler(&line);
                        }
                        stderr[index].push(line);
                    }
                },
                Err(e) => {
                    warn!("Error reading {output:?} of '{}': {e}", item.command_line());
                    streams.remove(&(index, output));
                }
            }
        }

        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Input not fully consumed: {e}"),
                Err(e) => warn!("Input writer failed: {e}"),
            }
        }

        let mut stages = Vec::with_capacity(children.len());
        for ((mut child, item), stderr) in children.into_iter().zip(self.items.iter_mut()).zip(stderr) {
            let command = item.command_line();
            let status = child.wait().await.map_err(|source| ExecuteError::Io {
                command: command.clone(),
                source,
            })?;
            let exit_code = status.code().unwrap_or(-1);
            let accepted = match item.on_exit.as_mut() {
                Some(handler) => handler(exit_code),
                None => item.accepts.accepts(exit_code),
            };
            if !accepted {
                debug!("'{command}' exited with {exit_code}");
            }
            stages.push(StageReport {
                command,
                exit_code,
                accepted,
                accepts: item.accepts.clone(),
                stderr,
            });
        }

        Ok(PipeOutcome::Finished(PipeReport { stdout, stages }))
    }

    /// Like [`execute`](Self::execute), but an unacceptable exit code of any
    /// stage is an error.
    ///
    /// # Errors
    /// Returns [`ExecuteError::Exit`] for the first failed stage
    pub async fn execute_checked(self) -> Result<PipeOutcome, ExecuteError> {
        let outcome = self.execute().await?;
        if let PipeOutcome::Finished(report) = &outcome
            && let Some(failed) = report.first_failure()
        {
            return Err(ExecuteError::Exit {
                command: failed.command.clone(),
                code: failed.exit_code,
                accepts: failed.accepts.clone(),
            });
        }
        Ok(outcome)
    }
}

impl fmt::Debug for CmdPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdPipe")
            .field("items", &self.items)
            .field("readonly", &self.readonly)
            .field("should_execute", &self.should_execute)
            .finish_non_exhaustive()
    }
}
