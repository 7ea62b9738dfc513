use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::scheduler::job::{modified_at, JobId, JobOutcome, JobRecord};

/// Result of running one job
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub outcome: JobOutcome,
    /// The stdout or stderr artifact that was written for the job.
    pub artifact: PathBuf,
    /// Input files deleted because the command left them untouched.
    pub removed_inputs: Vec<PathBuf>,
}

impl ExecutionResult {
    pub fn message(&self) -> String {
        format!("job {} {}", self.job_id, self.outcome)
    }
}

/// Runs a job's command with `sh -c` inside the job's working directory.
///
/// Stdout of a successful command goes to the job's stdout artifact; anything
/// else (non-zero exit, spawn error, timeout) leaves a stderr artifact instead.
/// Command failure is reported through the outcome, never as an error.
#[derive(Debug, Clone, Default)]
pub struct JobExecutor {
    timeout: Option<Duration>,
}

impl JobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub async fn execute(&self, job: &JobRecord) -> ExecutionResult {
        tracing::info!(
            job_id = job.id,
            command = %job.command,
            work_dir = %job.work_dir.display(),
            "Executing job"
        );

        let (outcome, artifact, contents) = self.run_command(job).await;

        if let Err(e) = tokio::fs::write(&artifact, &contents).await {
            tracing::error!(
                job_id = job.id,
                artifact = %artifact.display(),
                error = %e,
                "Failed to write result artifact"
            );
        }

        let removed_inputs = remove_consumed_inputs(job).await;

        tracing::info!(
            job_id = job.id,
            outcome = %outcome,
            removed_inputs = removed_inputs.len(),
            "Job finished"
        );

        ExecutionResult {
            job_id: job.id,
            outcome,
            artifact,
            removed_inputs,
        }
    }

    async fn run_command(&self, job: &JobRecord) -> (JobOutcome, PathBuf, Vec<u8>) {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&job.command)
            .current_dir(&job.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a timeout can take down pipelines and subshells too.
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failed(job, e),
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        };

        let (status, stdout, stderr) = match self.timeout {
            Some(limit) => {
                let collected = tokio::time::timeout(limit, collect).await;
                let Ok(collected) = collected else {
                    tracing::warn!(job_id = job.id, timeout = ?limit, "Job timed out, killing its process group");
                    kill_process_group(job.id, &mut child).await;
                    let message = format!("command timed out after {:?}\n", limit);
                    return (
                        JobOutcome::TimedOut {
                            after_secs: limit.as_secs(),
                        },
                        job.stderr_path(),
                        message.into_bytes(),
                    );
                };
                collected
            }
            None => collect.await,
        };

        match status {
            Ok(status) if status.success() => (JobOutcome::Succeeded, job.stdout_path(), stdout),
            Ok(status) => {
                let exit_code = status.code();
                let stderr = if stderr.is_empty() {
                    match exit_code {
                        Some(code) => format!("exit code {}\n", code).into_bytes(),
                        None => b"terminated by signal\n".to_vec(),
                    }
                } else {
                    stderr
                };
                (
                    JobOutcome::Failed { exit_code },
                    job.stderr_path(),
                    stderr,
                )
            }
            Err(e) => spawn_failed(job, e),
        }
    }
}

fn spawn_failed(job: &JobRecord, e: std::io::Error) -> (JobOutcome, PathBuf, Vec<u8>) {
    tracing::error!(job_id = job.id, error = %e, "Failed to spawn job command");
    (
        JobOutcome::SpawnFailed {
            message: e.to_string(),
        },
        job.stderr_path(),
        format!("failed to start command: {}\n", e).into_bytes(),
    )
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "Failed to read command output");
        }
    }
    buf
}

/// SIGKILL the whole process group led by `child`, then reap the child.
async fn kill_process_group(job_id: JobId, child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::warn!(job_id, pid, error = %e, "Failed to kill process group");
            let _ = child.start_kill();
        }
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(job_id, error = %e, "Failed to reap timed out command");
    }
}

/// Delete every recorded input whose modification time is unchanged.
///
/// A changed timestamp means the command rewrote the file in place as an
/// output, so it is kept. Missing files are skipped.
pub async fn remove_consumed_inputs(job: &JobRecord) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    for (path, recorded) in &job.input_file_timestamps {
        let path = Path::new(path);
        match modified_at(path).await {
            Ok(current) if current == *recorded => match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    tracing::debug!(job_id = job.id, path = %path.display(), "Removed consumed input");
                    removed.push(path.to_path_buf());
                }
                Err(e) => {
                    tracing::warn!(job_id = job.id, path = %path.display(), error = %e, "Failed to remove input");
                }
            },
            Ok(_) => {
                tracing::debug!(job_id = job.id, path = %path.display(), "Input was rewritten, keeping it");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(job_id = job.id, path = %path.display(), error = %e, "Failed to stat input");
            }
        }
    }

    removed
}
