//! Command execution capability and the job handler built on it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::schema::CommandSpec;
use crate::jobs::executor::{Artifact, JobContext, JobError, JobHandler, JobOutput};
use crate::jobs::types::JobKind;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no command configured for job kind {0}")]
    NotConfigured(JobKind),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external tools on behalf of jobs.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: CommandInvocation, cancel: CancellationToken) -> Result<CommandOutput, CommandError>;
}

/// Spawns real processes. The child is killed if the job is cancelled.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: CommandInvocation, cancel: CancellationToken) -> Result<CommandOutput, CommandError> {
        let program = invocation.program.clone();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(&invocation.env)
            .stdin(if invocation.stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;
        tracing::debug!(program = %program, pid = ?child.id(), "Process spawned");

        // Feed stdin while the output pipes drain, so neither side can stall
        // the other. A child that exits without reading its input is not an
        // error.
        let stdin = child.stdin.take();
        let feed = async move {
            let (Some(input), Some(mut stdin)) = (invocation.stdin, stdin) else {
                return Ok::<(), std::io::Error>(());
            };
            match stdin.write_all(&input).await {
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!("Process closed stdin before reading all input");
                    Ok(())
                }
                result => result,
            }
        };

        tokio::select! {
            (fed, output) = async { tokio::join!(feed, child.wait_with_output()) } => {
                let output = output.map_err(|source| CommandError::Io { program: program.clone(), source })?;
                fed.map_err(|source| CommandError::Io { program, source })?;
                Ok(CommandOutput {
                    exit_code: output.status.code(),
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            _ = cancel.cancelled() => Err(CommandError::Cancelled),
        }
    }
}

/// Maps a job onto its configured command line.
pub struct CommandHandler {
    commands: HashMap<JobKind, CommandSpec>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandHandler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            commands: HashMap::new(),
            runner,
        }
    }

    /// Keys that are not job kinds are ignored; config validation reports them.
    pub fn from_config(commands: &HashMap<String, CommandSpec>, runner: Arc<dyn CommandRunner>) -> Self {
        let commands = commands
            .iter()
            .filter_map(|(kind, spec)| kind.parse::<JobKind>().ok().map(|kind| (kind, spec.clone())))
            .collect();
        Self { commands, runner }
    }

    pub fn with_command(mut self, kind: JobKind, spec: CommandSpec) -> Self {
        self.commands.insert(kind, spec);
        self
    }

    /// Configured args followed by any string `args` from the payload.
    pub fn invocation(&self, ctx: &JobContext) -> Result<CommandInvocation, CommandError> {
        let spec = self.commands.get(&ctx.kind).ok_or(CommandError::NotConfigured(ctx.kind))?;

        let mut args = spec.args.clone();
        if let Some(extra) = ctx.payload.get("args") {
            let extra = extra
                .as_array()
                .ok_or_else(|| CommandError::InvalidPayload("`args` must be an array".into()))?;
            for arg in extra {
                let arg = arg
                    .as_str()
                    .ok_or_else(|| CommandError::InvalidPayload("`args` entries must be strings".into()))?;
                args.push(arg.to_string());
            }
        }

        let env = HashMap::from([
            ("KB_JOB_ID".to_string(), ctx.job_id.to_string()),
            ("KB_RUN_ID".to_string(), ctx.run_id.to_string()),
            ("KB_JOB_KIND".to_string(), ctx.kind.to_string()),
        ]);
        let stdin = serde_json::to_vec(&ctx.payload).map_err(|e| CommandError::InvalidPayload(e.to_string()))?;

        Ok(CommandInvocation {
            program: spec.program.clone(),
            args,
            cwd: Some(ctx.execution_root.clone()),
            env,
            stdin: Some(stdin),
        })
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn run(&self, ctx: JobContext) -> Result<JobOutput, JobError> {
        if ctx.mock {
            tracing::debug!(job_id = %ctx.job_id, kind = %ctx.kind, "Mock job, skipping command");
            ctx.progress.report(100, Some("mock"));
            return Ok(JobOutput::default());
        }

        let invocation = self.invocation(&ctx)?;
        ctx.progress.report(10, Some("started"));
        let output = match self.runner.run(invocation, ctx.cancel.clone()).await {
            Ok(output) => output,
            Err(CommandError::Cancelled) => return Err(JobError::Cancelled),
            Err(e) => return Err(e.into()),
        };

        if !output.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim().lines().last().unwrap_or("no output");
            return Err(JobError::reported(match output.exit_code {
                Some(code) => format!("{} exited with code {code}: {detail}", ctx.kind),
                None => format!("{} terminated by signal: {detail}", ctx.kind),
            }));
        }

        let mut result = JobOutput::default();
        if !output.stdout.is_empty() {
            result = result.with_artifact(Artifact::new(format!("{}.log", ctx.kind), output.stdout));
        }
        if !output.stderr.is_empty() {
            result = result.with_artifact(Artifact::new(format!("{}.stderr.log", ctx.kind), output.stderr));
        }
        Ok(result)
    }
}
