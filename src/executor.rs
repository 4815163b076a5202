//! Bounded-concurrency command executor (component G).
//!
//! Grounded on the teacher's child-process invocation in `router.rs`
//! (`Command::new(&hook.command)...spawn()`), replacing its fire-and-forget
//! `fork()`/`setsid()` detachment — which cannot be cancelled or time-bounded
//! once forked — with `tokio::process::Command` under a counting semaphore,
//! so the spec's deadline propagation and temp-file lifecycle guarantees
//! (§4.7, §5, §9) are actually enforceable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::argument::{ExtractedCommand, FileArg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Stream,
    Capture,
    Async,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("too many concurrent invocations")]
    TooManyConcurrent,
    #[error("command deadline exceeded")]
    DeadlineExceeded,
    #[error("command invocation cancelled")]
    Cancelled,
    #[error("command path not permitted: {0}")]
    PathNotAllowed(String),
    #[error("command not executable: {0}")]
    NotExecutable(String),
    #[error("failed to spawn command: {0}")]
    Spawn(#[from] std::io::Error),
}

pub struct ExecutorConfig {
    pub max_concurrent_hooks: usize,
    pub slot_acquisition_timeout: Duration,
    pub hook_timeout: Duration,
    pub allowed_command_paths: Vec<PathBuf>,
    pub allow_auto_chmod: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_concurrent_hooks: 10,
            slot_acquisition_timeout: Duration::from_secs(5),
            hook_timeout: Duration::from_secs(30),
            allowed_command_paths: Vec::new(),
            allow_auto_chmod: false,
        }
    }
}

/// The bounded-concurrency executor: a single semaphore shared by every
/// invocation, sized once at construction (spec §4.7, §5).
pub struct Executor {
    semaphore: Arc<Semaphore>,
    config: ExecutorConfig,
    in_flight: Arc<AtomicUsize>,
    async_children: Arc<tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

pub enum ExecOutcome {
    /// Async mode: the child was launched and detached; no output is
    /// available to the caller.
    Detached,
    /// Capture mode: combined stdout/stderr and the exit status.
    Captured { output: Vec<u8>, success: bool },
    /// Stream mode: bytes have already been written to `sink`; `had_output`
    /// tells the dispatcher whether the status code can still be changed.
    Streamed { had_output: bool, success: bool },
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Self {
        Executor {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_hooks)),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            async_children: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Wait (within the shutdown grace period) for every outstanding async
    /// child to finish, per spec §5.
    pub async fn wait_for_async_children(&self, grace: Duration) {
        let handles = {
            let mut guard = self.async_children.lock().await;
            std::mem::take(&mut *guard)
        };
        let _ = tokio::time::timeout(grace, futures::future::join_all(handles)).await;
    }

    pub async fn run(
        &self,
        working_directory: &str,
        extracted: ExtractedCommand,
        mode: OutputMode,
        mut stream_sink: Option<Box<dyn FnMut(&[u8]) -> futures::future::BoxFuture<'static, std::io::Result<()>> + Send>>,
    ) -> Result<ExecOutcome, ExecError> {
        let permit = tokio::time::timeout(
            self.config.slot_acquisition_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| ExecError::TooManyConcurrent)?
        .expect("semaphore never closed");

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.clone();
        let _decrement_guard = DecrementGuard(in_flight);

        let command_path = resolve_command_path(
            &extracted.argv[0],
            working_directory,
            &self.config.allowed_command_paths,
            self.config.allow_auto_chmod,
        )?;

        let mut temp_guard = TempFileGuard::default();
        for file_arg in &extracted.file_args {
            let path = write_temp_file(working_directory, file_arg).await?;
            temp_guard.paths.push(path);
        }

        let mut cmd = Command::new(&command_path);
        cmd.args(&extracted.argv[1..]);
        cmd.current_dir(working_directory);
        cmd.envs(std::env::vars());
        for kv in &extracted.envv {
            if let Some((k, v)) = kv.split_once('=') {
                cmd.env(k, v);
            }
        }
        for (path, file_arg) in temp_guard.paths.iter().zip(&extracted.file_args) {
            cmd.env(&file_arg.env_name, path);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        if mode == OutputMode::Async {
            // The slot must stay held until the detached child actually
            // exits (or is killed on timeout), not merely until it is
            // spawned, so async children remain bounded by the same
            // concurrency and deadline discipline as every other mode
            // (spec §4.7, §5). `permit` is an owned, 'static permit so it
            // can move into the spawned task alongside the child.
            let mut child = cmd.spawn()?;
            let cleanup = temp_guard.disarm_into_async_cleanup();
            let hook_timeout = self.config.hook_timeout;
            let handle = tokio::spawn(async move {
                if tokio::time::timeout(hook_timeout, child.wait())
                    .await
                    .is_err()
                {
                    let _ = child.start_kill();
                }
                drop(cleanup);
                drop(permit);
            });
            self.async_children.lock().await.push(handle);
            return Ok(ExecOutcome::Detached);
        }

        let result = match mode {
            OutputMode::Async => unreachable!("handled above"),
            OutputMode::Capture => {
                let mut child = cmd.spawn()?;
                let stdout = child.stdout.take().expect("piped");
                let stderr = child.stderr.take().expect("piped");
                let combined = read_combined(stdout, stderr);

                match tokio::time::timeout(self.config.hook_timeout, async {
                    let output = combined.await;
                    let status = child.wait().await?;
                    Ok::<_, std::io::Error>((output, status))
                })
                .await
                {
                    Ok(Ok((output, status))) => Ok(ExecOutcome::Captured {
                        output,
                        success: status.success(),
                    }),
                    Ok(Err(e)) => Err(ExecError::Spawn(e)),
                    Err(_) => {
                        let _ = child.start_kill();
                        Err(ExecError::DeadlineExceeded)
                    }
                }
            }
            OutputMode::Stream => {
                let mut child = cmd.spawn()?;
                let mut stdout = child.stdout.take().expect("piped");
                let mut stderr = child.stderr.take().expect("piped");
                let mut had_output = false;

                let run = async {
                    let mut buf_out = [0u8; 4096];
                    let mut buf_err = [0u8; 4096];
                    let mut stdout_done = false;
                    let mut stderr_done = false;
                    while !stdout_done || !stderr_done {
                        tokio::select! {
                            n = stdout.read(&mut buf_out), if !stdout_done => {
                                let n = n?;
                                if n == 0 {
                                    stdout_done = true;
                                } else {
                                    if let Some(sink) = stream_sink.as_mut() {
                                        sink(&buf_out[..n]).await?;
                                    }
                                    had_output = true;
                                }
                            }
                            n = stderr.read(&mut buf_err), if !stderr_done => {
                                let n = n?;
                                if n == 0 {
                                    stderr_done = true;
                                } else {
                                    if let Some(sink) = stream_sink.as_mut() {
                                        sink(&buf_err[..n]).await?;
                                    }
                                    had_output = true;
                                }
                            }
                        }
                    }
                    let status = child.wait().await?;
                    Ok::<_, std::io::Error>(status)
                };

                match tokio::time::timeout(self.config.hook_timeout, run).await {
                    Ok(Ok(status)) => Ok(ExecOutcome::Streamed {
                        had_output,
                        success: status.success(),
                    }),
                    Ok(Err(e)) => Err(ExecError::Spawn(e)),
                    Err(_) => {
                        let _ = child.start_kill();
                        if had_output {
                            Ok(ExecOutcome::Streamed {
                                had_output: true,
                                success: false,
                            })
                        } else {
                            Err(ExecError::DeadlineExceeded)
                        }
                    }
                }
            }
        };

        drop(permit);
        result
    }
}

struct DecrementGuard(Arc<AtomicUsize>);
impl Drop for DecrementGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Scope-guard for temp files created by a single invocation: every path
/// pushed here is removed on drop, tolerating "already gone" (spec §4.7 step
/// 4, §9).
struct TempFileGuard {
    paths: Vec<PathBuf>,
    armed: bool,
}

impl Default for TempFileGuard {
    fn default() -> Self {
        TempFileGuard {
            paths: Vec::new(),
            armed: true,
        }
    }
}

impl TempFileGuard {
    /// Hand ownership of the temp-file paths to an [`AsyncCleanup`] that the
    /// caller keeps alive until the detached child actually exits, instead of
    /// removing them the moment `run` returns.
    fn disarm_into_async_cleanup(&mut self) -> AsyncCleanup {
        self.armed = false;
        AsyncCleanup(std::mem::take(&mut self.paths))
    }
}

/// Async-mode temp files outlive the synchronous guard's scope; they're
/// cleaned up once the detached child exits instead of when `run` returns.
struct AsyncCleanup(Vec<PathBuf>);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for path in &self.paths {
            cleanup_path(path);
        }
    }
}

impl Drop for AsyncCleanup {
    fn drop(&mut self) {
        for path in &self.0 {
            cleanup_path(path);
        }
    }
}

fn cleanup_path(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!(target: "hookforge::executor", "failed to remove temp file {}: {e}", path.display());
        }
    }
}

async fn write_temp_file(working_directory: &str, file_arg: &FileArg) -> Result<PathBuf, ExecError> {
    let name = format!("{}-{}", file_arg.env_name, Uuid::new_v4());
    let path = Path::new(working_directory).join(name);
    let mut f = tokio::fs::File::create(&path).await?;
    f.write_all(&file_arg.data).await?;
    f.flush().await?;
    Ok(path)
}

async fn read_combined<R1, R2>(mut a: R1, mut b: R2) -> Vec<u8>
where
    R1: AsyncRead + Unpin,
    R2: AsyncRead + Unpin,
{
    // Drain both pipes concurrently: reading one to EOF before starting the
    // other can deadlock a child that fills the other pipe's OS buffer.
    let mut buf_a = Vec::new();
    let mut buf_b = Vec::new();
    let (_, _) = tokio::join!(a.read_to_end(&mut buf_a), b.read_to_end(&mut buf_b));
    let mut out = buf_a;
    out.extend_from_slice(&buf_b);
    out
}

fn resolve_command_path(
    command: &str,
    working_directory: &str,
    allowed: &[PathBuf],
    allow_auto_chmod: bool,
) -> Result<PathBuf, ExecError> {
    let candidate = Path::new(command);
    let resolved = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        Path::new(working_directory).join(candidate)
    };

    if !allowed.is_empty() && !allowed.iter().any(|prefix| resolved.starts_with(prefix)) {
        return Err(ExecError::PathNotAllowed(resolved.display().to_string()));
    }

    if !is_executable(&resolved) {
        if allow_auto_chmod {
            chmod_0755(&resolved).map_err(|_| ExecError::NotExecutable(resolved.display().to_string()))?;
            if !is_executable(&resolved) {
                return Err(ExecError::NotExecutable(resolved.display().to_string()));
            }
        } else {
            return Err(ExecError::NotExecutable(resolved.display().to_string()));
        }
    }

    Ok(resolved)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.exists()
}

#[cfg(unix)]
fn chmod_0755(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn chmod_0755(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::ExtractedCommand;
    use std::io::Write;

    fn script(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (dir, path)
    }

    #[tokio::test]
    async fn capture_mode_returns_exit_code_derived_success() {
        let (dir, path) = script("echo hello");
        let executor = Executor::new(ExecutorConfig {
            max_concurrent_hooks: 2,
            slot_acquisition_timeout: Duration::from_secs(1),
            hook_timeout: Duration::from_secs(5),
            allowed_command_paths: vec![],
            allow_auto_chmod: false,
        });
        let extracted = ExtractedCommand {
            argv: vec![path.display().to_string()],
            envv: vec![],
            file_args: vec![],
        };
        let outcome = executor
            .run(dir.path().to_str().unwrap(), extracted, OutputMode::Capture, None)
            .await
            .unwrap();
        match outcome {
            ExecOutcome::Captured { output, success } => {
                assert!(success);
                assert!(String::from_utf8_lossy(&output).contains("hello"));
            }
            _ => panic!("expected captured outcome"),
        }
    }

    #[tokio::test]
    async fn timeout_returns_deadline_exceeded_and_leaves_no_temp_files() {
        let (dir, path) = script("sleep 5");
        let executor = Executor::new(ExecutorConfig {
            max_concurrent_hooks: 2,
            slot_acquisition_timeout: Duration::from_secs(1),
            hook_timeout: Duration::from_millis(200),
            allowed_command_paths: vec![],
            allow_auto_chmod: false,
        });
        let extracted = ExtractedCommand {
            argv: vec![path.display().to_string()],
            envv: vec![],
            file_args: vec![FileArg {
                env_name: "PAYLOAD".into(),
                data: b"hello".to_vec(),
            }],
        };
        let err = executor
            .run(dir.path().to_str().unwrap(), extracted, OutputMode::Capture, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::DeadlineExceeded));

        let remaining: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .filter(|n| n.to_string_lossy().starts_with("PAYLOAD-"))
            .collect();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn concurrency_cap_is_enforced() {
        let (dir, path) = script("sleep 1");
        let executor = Arc::new(Executor::new(ExecutorConfig {
            max_concurrent_hooks: 2,
            slot_acquisition_timeout: Duration::from_millis(300),
            hook_timeout: Duration::from_secs(5),
            allowed_command_paths: vec![],
            allow_auto_chmod: false,
        }));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let executor = executor.clone();
            let dir_path = dir.path().to_path_buf();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                let extracted = ExtractedCommand {
                    argv: vec![path.display().to_string()],
                    envv: vec![],
                    file_args: vec![],
                };
                executor
                    .run(dir_path.to_str().unwrap(), extracted, OutputMode::Capture, None)
                    .await
            }));
        }

        let mut ok = 0;
        let mut too_many = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(ExecError::TooManyConcurrent) => too_many += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 2);
        assert_eq!(too_many, 3);
    }
}
