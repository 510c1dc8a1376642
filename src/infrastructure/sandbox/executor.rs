//! Container-isolated strategy execution.
//!
//! Every execution spawns a fresh worker process in its own session
//! with resource caps applied between fork and exec: address-space,
//! CPU-time, file-size, and open-file rlimits, a private scratch
//! directory as working directory, and a scrubbed environment. Workers
//! are reclaimed on every exit path through a three-tier strategy
//! (SIGTERM, grace, SIGKILL, reap), and a registry of live pids backs a
//! periodic reaper sweep so the steady state is zero orphans.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::domain::error::SandboxError;
use crate::domain::models::artifact::StrategyArtifact;
use crate::domain::models::config::{BacktestConfig, DataConfig, SandboxConfig};
use crate::domain::models::execution::{ExecutionResult, ExecutionStage, ResourceKind};

use super::protocol::{run_pipeline, WorkerJob, WorkerLine};

/// Registry of live worker process groups, shared with the reaper.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    pids: Arc<Mutex<HashSet<i32>>>,
}

impl WorkerRegistry {
    fn track(&self, pid: i32) {
        self.pids.lock().expect("registry lock").insert(pid);
    }

    fn release(&self, pid: i32) {
        self.pids.lock().expect("registry lock").remove(&pid);
    }

    /// Force-kill every tracked process group. Returns how many were
    /// reclaimed; at steady state this is zero.
    pub fn reap_orphans(&self) -> u64 {
        let pids: Vec<i32> = {
            let mut guard = self.pids.lock().expect("registry lock");
            let pids = guard.iter().copied().collect();
            guard.clear();
            pids
        };
        let mut reaped = 0;
        for pid in pids {
            if killpg(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
                reaped += 1;
                tracing::warn!(pid, "Reaper force-killed an orphaned worker");
            }
        }
        reaped
    }

    pub fn live_count(&self) -> usize {
        self.pids.lock().expect("registry lock").len()
    }
}

/// Sandboxed backtest executor.
pub struct SandboxExecutor {
    config: SandboxConfig,
    backtest: BacktestConfig,
    data: DataConfig,
    worker_binary: Option<PathBuf>,
    semaphore: Arc<Semaphore>,
    registry: WorkerRegistry,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, backtest: BacktestConfig, data: DataConfig) -> Self {
        let worker_binary = resolve_worker_binary(config.worker_binary.as_deref());
        if worker_binary.is_none() {
            tracing::warn!(
                "Sandbox worker binary not found; executions will fail unless the \
                 in-process fallback is enabled"
            );
        }
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            config,
            backtest,
            data,
            worker_binary,
            semaphore,
            registry: WorkerRegistry::default(),
        }
    }

    /// The registry handle, for reaper sweeps and orphan assertions.
    pub fn registry(&self) -> WorkerRegistry {
        self.registry.clone()
    }

    fn job_for(&self, artifact: &StrategyArtifact) -> WorkerJob {
        WorkerJob {
            artifact: artifact.clone(),
            manifest_path: self.data.manifest_path.clone(),
            data_dir: self.data.data_dir.clone(),
            start_date: self.backtest.start_date,
            end_date: self.backtest.end_date,
            commission: self.backtest.commission,
            tax: self.backtest.tax,
            rebalance: self.backtest.rebalance,
        }
    }

    /// Execute one already-validated artifact under the given timeout.
    ///
    /// Strategy-level failures come back as `ExecutionResult` variants;
    /// the error channel is reserved for the isolation machinery
    /// itself.
    pub async fn execute(
        &self,
        artifact: &StrategyArtifact,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("executor semaphore never closes");

        match &self.worker_binary {
            Some(binary) => self.execute_in_worker(binary.clone(), artifact, timeout).await,
            None if self.config.allow_in_process_fallback => {
                tracing::warn!(
                    "ISOLATION DISABLED: running strategy in-process; enable the worker \
                     binary for production runs"
                );
                self.execute_in_process(artifact, timeout).await
            }
            None => Err(SandboxError::RuntimeUnavailable(
                "worker binary missing and in-process fallback disabled".to_string(),
            )),
        }
    }

    /// Execute a batch, bounded by the configured concurrency cap.
    pub async fn execute_batch(
        &self,
        artifacts: &[StrategyArtifact],
        timeout: Duration,
    ) -> Vec<Result<ExecutionResult, SandboxError>> {
        let futures = artifacts.iter().map(|a| self.execute(a, timeout));
        futures::future::join_all(futures).await
    }

    async fn execute_in_worker(
        &self,
        binary: PathBuf,
        artifact: &StrategyArtifact,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let job = self.job_for(artifact);
        let payload = serde_json::to_string(&job)
            .map_err(|e| SandboxError::Protocol(e.to_string()))?;

        let scratch = tempfile::Builder::new()
            .prefix("alphaloop-worker-")
            .tempdir()
            .map_err(|e| SandboxError::Scratch(e.to_string()))?;

        let mut command = Command::new(&binary);
        command
            .current_dir(scratch.path())
            .env_clear()
            .env("ALPHALOOP_WORKER", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_isolation(&mut command, &self.config);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        let pid = i32::try_from(child.id().unwrap_or_default())
            .map_err(|_| SandboxError::SpawnFailed("pid out of range".to_string()))?;
        self.registry.track(pid);

        let result = self
            .drive_worker(&mut child, &payload, timeout, started)
            .await;

        // Reclamation runs on every exit path, success included.
        self.reclaim(&mut child, pid).await;
        self.registry.release(pid);
        drop(scratch);

        result
    }

    /// Feed the job and collect stdout lines until a terminal line,
    /// EOF, or the deadline.
    async fn drive_worker(
        &self,
        child: &mut tokio::process::Child,
        payload: &str,
        timeout: Duration,
        started: Instant,
    ) -> Result<ExecutionResult, SandboxError> {
        let deadline = tokio::time::Instant::now() + timeout;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            SandboxError::SpawnFailed("worker stdin unavailable".to_string())
        })?;
        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await?;
            drop(stdin);
            std::io::Result::Ok(())
        };
        if tokio::time::timeout_at(deadline, write).await.is_err() {
            return Ok(ExecutionResult::Timeout {
                execution_time: started.elapsed().as_secs_f64(),
                stage: ExecutionStage::Setup,
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            SandboxError::SpawnFailed("worker stdout unavailable".to_string())
        })?;
        let mut stderr_reader = child.stderr.take().map(BufReader::new);
        let mut lines = BufReader::new(stdout).lines();
        let mut last_stage = ExecutionStage::Setup;

        loop {
            let next = tokio::time::timeout_at(deadline, lines.next_line()).await;
            match next {
                Err(_) => {
                    return Ok(ExecutionResult::Timeout {
                        execution_time: started.elapsed().as_secs_f64(),
                        stage: last_stage,
                    });
                }
                Ok(Err(e)) => {
                    return Err(SandboxError::Protocol(format!("stdout read: {e}")));
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(line))) => {
                    match serde_json::from_str::<WorkerLine>(&line) {
                        Ok(WorkerLine::Stage { stage }) => last_stage = stage,
                        Ok(WorkerLine::Done { report }) => {
                            return Ok(ExecutionResult::Success {
                                report,
                                execution_time: started.elapsed().as_secs_f64(),
                            });
                        }
                        Ok(WorkerLine::Failed {
                            error_kind,
                            message,
                            stack_text,
                        }) => {
                            return Ok(ExecutionResult::RuntimeError {
                                error_kind,
                                message,
                                stack_text,
                            });
                        }
                        Err(e) => {
                            tracing::debug!(line = %line, error = %e, "Ignoring undecodable worker line");
                        }
                    }
                }
            }
        }

        // EOF without a terminal line: the worker died. Classify from
        // the exit status and whatever stderr it left behind.
        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(SandboxError::Protocol(format!("wait: {e}"))),
            Err(_) => {
                return Ok(ExecutionResult::Timeout {
                    execution_time: started.elapsed().as_secs_f64(),
                    stage: last_stage,
                })
            }
        };
        let stack_text = match stderr_reader.as_mut() {
            Some(reader) => {
                let mut buf = String::new();
                let _ = tokio::time::timeout(
                    Duration::from_millis(200),
                    tokio::io::AsyncReadExt::read_to_string(reader, &mut buf),
                )
                .await;
                buf.truncate(4096);
                (!buf.is_empty()).then_some(buf)
            }
            None => None,
        };
        Ok(classify_exit(status, stack_text))
    }

    /// Graceful stop, then terminate, then kill and reap.
    async fn reclaim(&self, child: &mut tokio::process::Child, pid: i32) {
        if child.try_wait().ok().flatten().is_some() {
            return;
        }
        let group = Pid::from_raw(pid);
        let _ = killpg(group, Signal::SIGTERM);
        let grace = Duration::from_secs(self.config.kill_grace_secs.max(1));
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
        let _ = killpg(group, Signal::SIGKILL);
        let _ = child.wait().await;
    }

    async fn execute_in_process(
        &self,
        artifact: &StrategyArtifact,
        timeout: Duration,
    ) -> Result<ExecutionResult, SandboxError> {
        let job = self.job_for(artifact);
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || {
            let data = crate::infrastructure::data::CsvDataAccessor::load(
                &job.manifest_path,
                &job.data_dir,
            )
            .map_err(|e| e.to_string())?;
            let mut terminal = None;
            run_pipeline(&job, &data, |line| {
                if !matches!(line, WorkerLine::Stage { .. }) {
                    terminal = Some(line.clone());
                }
            });
            Ok::<Option<WorkerLine>, String>(terminal)
        });

        match tokio::time::timeout(timeout, task).await {
            Err(_) => Ok(ExecutionResult::Timeout {
                execution_time: started.elapsed().as_secs_f64(),
                stage: ExecutionStage::Evaluation,
            }),
            Ok(Err(join)) => Ok(ExecutionResult::RuntimeError {
                error_kind: "panic".to_string(),
                message: join.to_string(),
                stack_text: None,
            }),
            Ok(Ok(Err(message))) => Ok(ExecutionResult::RuntimeError {
                error_kind: "data".to_string(),
                message,
                stack_text: None,
            }),
            Ok(Ok(Ok(Some(WorkerLine::Done { report })))) => Ok(ExecutionResult::Success {
                report,
                execution_time: started.elapsed().as_secs_f64(),
            }),
            Ok(Ok(Ok(Some(WorkerLine::Failed {
                error_kind,
                message,
                stack_text,
            })))) => Ok(ExecutionResult::RuntimeError {
                error_kind,
                message,
                stack_text,
            }),
            Ok(Ok(Ok(_))) => Err(SandboxError::Protocol(
                "pipeline produced no terminal line".to_string(),
            )),
        }
    }
}

// Linux signal numbers raised by rlimit breaches.
const SIGKILL_NUM: i32 = 9;
const SIGXCPU_NUM: i32 = 24;
const SIGXFSZ_NUM: i32 = 25;

/// Map an abnormal worker exit to an execution result.
fn classify_exit(status: std::process::ExitStatus, stack_text: Option<String>) -> ExecutionResult {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        return match signal {
            SIGXCPU_NUM => ExecutionResult::ResourceExceeded {
                resource: ResourceKind::Cpu,
            },
            SIGKILL_NUM => ExecutionResult::ResourceExceeded {
                resource: ResourceKind::Memory,
            },
            SIGXFSZ_NUM => ExecutionResult::ResourceExceeded {
                resource: ResourceKind::Scratch,
            },
            other => ExecutionResult::RuntimeError {
                error_kind: "signal".to_string(),
                message: format!("worker killed by signal {other}"),
                stack_text,
            },
        };
    }
    ExecutionResult::RuntimeError {
        error_kind: "exit".to_string(),
        message: format!("worker exited with {status} before reporting"),
        stack_text,
    }
}

/// Apply setsid and rlimits between fork and exec.
#[allow(unsafe_code)]
fn apply_isolation(command: &mut Command, config: &SandboxConfig) {
    use nix::sys::resource::{setrlimit, Resource};

    let memory_bytes = config.memory_limit_mb.saturating_mul(1024 * 1024);
    let cpu_secs = config.cpu_time_secs.max(1);
    let scratch_bytes = config.scratch_limit_mb.saturating_mul(1024 * 1024);

    // SAFETY: the closure runs in the forked child before exec and only
    // calls async-signal-safe syscall wrappers.
    unsafe {
        command.pre_exec(move || {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            setrlimit(Resource::RLIMIT_AS, memory_bytes, memory_bytes)
                .map_err(std::io::Error::from)?;
            setrlimit(Resource::RLIMIT_CPU, cpu_secs, cpu_secs)
                .map_err(std::io::Error::from)?;
            setrlimit(Resource::RLIMIT_FSIZE, scratch_bytes, scratch_bytes)
                .map_err(std::io::Error::from)?;
            setrlimit(Resource::RLIMIT_NOFILE, 64, 64).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

/// The configured worker path, or the sibling binary next to the
/// current executable.
fn resolve_worker_binary(configured: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        return path.exists().then_some(path);
    }
    let sibling = std::env::current_exe()
        .ok()?
        .parent()?
        .join("alphaloop-worker");
    sibling.exists().then_some(sibling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_classify_exit_signals() {
        let sigkill = std::process::ExitStatus::from_raw(9);
        assert!(matches!(
            classify_exit(sigkill, None),
            ExecutionResult::ResourceExceeded {
                resource: ResourceKind::Memory
            }
        ));
        let sigxcpu = std::process::ExitStatus::from_raw(24);
        assert!(matches!(
            classify_exit(sigxcpu, None),
            ExecutionResult::ResourceExceeded {
                resource: ResourceKind::Cpu
            }
        ));
        let plain_exit = std::process::ExitStatus::from_raw(2 << 8);
        assert!(matches!(
            classify_exit(plain_exit, None),
            ExecutionResult::RuntimeError { .. }
        ));
    }

    #[test]
    fn test_registry_tracks_and_reaps() {
        let registry = WorkerRegistry::default();
        assert_eq!(registry.live_count(), 0);
        // A pid that certainly does not exist: reap attempts the kill,
        // fails silently, and clears the registry either way.
        registry.track(-999_999);
        assert_eq!(registry.live_count(), 1);
        registry.reap_orphans();
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_worker_without_fallback_is_unavailable() {
        let config = SandboxConfig {
            worker_binary: Some("/nonexistent/alphaloop-worker".to_string()),
            allow_in_process_fallback: false,
            ..SandboxConfig::default()
        };
        let executor = SandboxExecutor::new(
            config,
            BacktestConfig::default(),
            DataConfig::default(),
        );
        let err = executor
            .execute(&crate::testutil::seed_artifact(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::RuntimeUnavailable(_)));
    }
}
