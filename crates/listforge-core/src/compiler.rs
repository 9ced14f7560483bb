// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External compiler invocation.
//!
//! The actual rule compilation (parsing ad-block/hosts syntax, applying
//! transformations) is delegated entirely to an external executable with a
//! `--config <path> --output <path> [--verbose]` argument contract. This
//! module owns locating that executable, driving it as a subprocess with
//! timeout and cancellation, and interpreting its exit.
//!
//! [`RuleCompiler`] is the seam: production code uses [`HostlistCompiler`],
//! tests substitute a mock.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunking::ChunkMetadata;
use crate::error::{CompilerError, Result};

/// Default time budget for one external compiler invocation.
pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(300);

/// Captured output of one successful compiler invocation.
#[derive(Debug, Clone)]
pub struct CompilerInvocation {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall time of the invocation.
    pub elapsed_ms: u64,
}

/// Final or partial outcome of one orchestration call.
#[derive(Debug, Clone, Default)]
pub struct CompilerResult {
    /// Whether the run produced a usable output artifact.
    pub success: bool,
    /// Name from the configuration, when it was readable.
    pub config_name: String,
    /// Version from the configuration, when it was readable.
    pub config_version: String,
    /// Number of rules (non-blank, non-comment lines) in the output.
    pub rule_count: usize,
    /// Path of the output artifact.
    pub output_path: PathBuf,
    /// SHA-256 of the output artifact, lowercase hex.
    pub output_hash: String,
    /// Total run duration.
    pub elapsed_ms: u64,
    /// Human-readable failure summary, when the run failed (or partially
    /// failed).
    pub error_message: Option<String>,
    /// Per-chunk metadata, when the run was chunked.
    pub chunks: Option<Vec<ChunkMetadata>>,
    /// Duplicate rules removed by the chunk merge, when the run was chunked.
    pub duplicates_removed: Option<usize>,
}

impl CompilerResult {
    /// Create a failed result with a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Shortened output hash for display.
    pub fn hash_short(&self, length: usize) -> &str {
        &self.output_hash[..self.output_hash.len().min(length)]
    }

    /// Elapsed time in human-readable form.
    pub fn elapsed_formatted(&self) -> String {
        format_elapsed(self.elapsed_ms)
    }
}

/// Format a millisecond duration as `1.50s` or `500ms`.
pub fn format_elapsed(elapsed_ms: u64) -> String {
    if elapsed_ms >= 1000 {
        format!("{:.2}s", elapsed_ms as f64 / 1000.0)
    } else {
        format!("{elapsed_ms}ms")
    }
}

/// Count rules in a line-oriented filter file.
///
/// Blank lines and lines starting with `!` or `#` are not rules.
/// A missing file counts as zero rules.
pub async fn count_rules(path: &Path) -> std::io::Result<usize> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut lines = BufReader::new(file).lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if !trimmed.is_empty() && !trimmed.starts_with('!') && !trimmed.starts_with('#') {
            count += 1;
        }
    }
    Ok(count)
}

/// Driver for the external rule compiler.
#[async_trait]
pub trait RuleCompiler: Send + Sync {
    /// Compile `config_path` into `output_path`.
    ///
    /// Implementations must honor `cancel` at their suspension points and
    /// fail with [`CompilerError::OutputNotCreated`] when the tool exits
    /// successfully without producing the output file.
    async fn compile(
        &self,
        config_path: &Path,
        output_path: &Path,
        verbose: bool,
        cancel: &CancellationToken,
    ) -> Result<CompilerInvocation>;
}

/// Subprocess driver for `hostlist-compiler`.
pub struct HostlistCompiler {
    program: PathBuf,
    base_args: Vec<String>,
    timeout: Duration,
}

impl HostlistCompiler {
    /// Locate the compiler on `PATH`.
    ///
    /// Prefers a global `hostlist-compiler` install and falls back to
    /// `npx @adguard/hostlist-compiler`.
    pub fn locate() -> Result<Self> {
        if let Ok(path) = which::which("hostlist-compiler") {
            return Ok(Self::from_command(path));
        }
        if let Ok(npx) = which::which("npx") {
            let mut compiler = Self::from_command(npx);
            compiler.base_args = vec!["@adguard/hostlist-compiler".to_string()];
            return Ok(compiler);
        }
        Err(CompilerError::CompilerNotFound)
    }

    /// Use an explicit executable instead of PATH discovery.
    pub fn from_command(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            timeout: DEFAULT_COMPILE_TIMEOUT,
        }
    }

    /// Override the per-invocation time budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The executable this driver invokes.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

async fn drain(stream: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut buf = String::new();
    if let Some(mut stream) = stream {
        let _ = stream.read_to_string(&mut buf).await;
    }
    buf
}

#[async_trait]
impl RuleCompiler for HostlistCompiler {
    async fn compile(
        &self,
        config_path: &Path,
        output_path: &Path,
        verbose: bool,
        cancel: &CancellationToken,
    ) -> Result<CompilerInvocation> {
        let start = std::time::Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg("--config")
            .arg(config_path)
            .arg("--output")
            .arg(output_path);
        if verbose {
            cmd.arg("--verbose");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = ?self.program, config = ?config_path, "invoking external compiler");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompilerError::CompilerNotFound
            } else {
                CompilerError::Io(e)
            }
        })?;

        // Drain both streams concurrently so a chatty compiler cannot fill a
        // pipe buffer and deadlock against our exit wait.
        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let status = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!(program = ?self.program, "compiler invocation cancelled, killing process");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(CompilerError::Cancelled(
                    "external compiler invocation cancelled".to_string(),
                ));
            }

            _ = tokio::time::sleep(self.timeout) => {
                warn!(program = ?self.program, timeout = ?self.timeout, "compiler timed out, killing process");
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(CompilerError::Timeout(self.timeout));
            }

            status = child.wait() => status?,
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(CompilerError::CompilationFailed {
                exit_code: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        if !output_path.exists() {
            return Err(CompilerError::OutputNotCreated(output_path.to_path_buf()));
        }

        Ok(CompilerInvocation {
            stdout,
            stderr,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Version information for the orchestrator and its external tools.
#[derive(Debug, Clone, Default)]
pub struct VersionInfo {
    /// Version of this crate.
    pub core_version: String,
    /// Resolved compiler command, when one was found.
    pub compiler_command: Option<String>,
    /// Reported compiler version, when it could be queried.
    pub compiler_version: Option<String>,
    /// Reported Node.js version, when it could be queried.
    pub node_version: Option<String>,
}

impl VersionInfo {
    /// Whether an external compiler was found.
    pub fn has_compiler(&self) -> bool {
        self.compiler_command.is_some()
    }
}

/// Probe the environment for tool versions. Best effort; probes that fail or
/// hang are reported as absent.
pub async fn version_info() -> VersionInfo {
    let mut info = VersionInfo {
        core_version: env!("CARGO_PKG_VERSION").to_string(),
        ..Default::default()
    };

    if let Ok(path) = which::which("hostlist-compiler") {
        info.compiler_version = probe_version(&path, &["--version"]).await;
        info.compiler_command = Some(path.display().to_string());
    } else if let Ok(npx) = which::which("npx") {
        info.compiler_command = Some(format!("{} @adguard/hostlist-compiler", npx.display()));
    }

    if let Ok(node) = which::which("node") {
        info.node_version = probe_version(&node, &["--version"]).await;
    }

    info
}

/// Run `program args...` and return the first line of stdout.
async fn probe_version(program: &Path, args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(10),
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_count_rules_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        tokio::fs::write(
            &path,
            "! header\n||ads.example^\n\n# hosts comment\n||tracker.example^\n  \n",
        )
        .await
        .unwrap();

        assert_eq!(count_rules(&path).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_count_rules_missing_file_is_zero() {
        assert_eq!(count_rules(Path::new("/nonexistent/rules.txt")).await.unwrap(), 0);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(500), "500ms");
        assert_eq!(format_elapsed(999), "999ms");
        assert_eq!(format_elapsed(1500), "1.50s");
        assert_eq!(format_elapsed(61_230), "61.23s");
    }

    #[test]
    fn test_result_helpers() {
        let result = CompilerResult {
            success: true,
            output_hash: "abcdef0123456789abcdef0123456789deadbeef".to_string(),
            elapsed_ms: 2500,
            ..Default::default()
        };
        assert_eq!(result.hash_short(16), "abcdef0123456789");
        assert_eq!(result.elapsed_formatted(), "2.50s");

        let failed = CompilerResult::failure("compiler exploded");
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("compiler exploded"));
        assert_eq!(failed.hash_short(16), "");
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        /// Write an executable shell script standing in for the external
        /// compiler. Arguments arrive as `--config <path> --output <path>`.
        fn fake_compiler(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-compiler");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_successful_invocation_writes_output() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_compiler(
                dir.path(),
                r#"printf '! compiled\n||ads.example^\n' > "$4""#,
            );
            let config = dir.path().join("config.json");
            let output = dir.path().join("out.txt");
            std::fs::write(&config, "{}").unwrap();

            let compiler = HostlistCompiler::from_command(program);
            let cancel = CancellationToken::new();
            let invocation = compiler
                .compile(&config, &output, false, &cancel)
                .await
                .unwrap();

            assert!(output.exists());
            assert!(invocation.stderr.is_empty());
            assert_eq!(count_rules(&output).await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_nonzero_exit_captures_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_compiler(dir.path(), "echo 'bad source syntax' >&2\nexit 3");
            let config = dir.path().join("config.json");
            std::fs::write(&config, "{}").unwrap();

            let compiler = HostlistCompiler::from_command(program);
            let err = compiler
                .compile(&config, &dir.path().join("out.txt"), false, &CancellationToken::new())
                .await
                .unwrap_err();

            match err {
                CompilerError::CompilationFailed { exit_code, stderr } => {
                    assert_eq!(exit_code, 3);
                    assert!(stderr.contains("bad source syntax"));
                }
                other => panic!("expected CompilationFailed, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_missing_output_is_reported() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_compiler(dir.path(), "exit 0");
            let config = dir.path().join("config.json");
            std::fs::write(&config, "{}").unwrap();

            let compiler = HostlistCompiler::from_command(program);
            let err = compiler
                .compile(&config, &dir.path().join("out.txt"), false, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, CompilerError::OutputNotCreated(_)));
        }

        #[tokio::test]
        async fn test_timeout_kills_process() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_compiler(dir.path(), "sleep 30");
            let config = dir.path().join("config.json");
            std::fs::write(&config, "{}").unwrap();

            let compiler = HostlistCompiler::from_command(program)
                .with_timeout(Duration::from_millis(200));
            let err = compiler
                .compile(&config, &dir.path().join("out.txt"), false, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, CompilerError::Timeout(_)));
        }

        #[tokio::test]
        async fn test_cancellation_kills_process() {
            let dir = tempfile::tempdir().unwrap();
            let program = fake_compiler(dir.path(), "sleep 30");
            let config = dir.path().join("config.json");
            std::fs::write(&config, "{}").unwrap();

            let compiler = HostlistCompiler::from_command(program);
            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel_clone.cancel();
            });

            let err = compiler
                .compile(&config, &dir.path().join("out.txt"), false, &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, CompilerError::Cancelled(_)));
        }

        #[tokio::test]
        async fn test_missing_program_maps_to_compiler_not_found() {
            let compiler = HostlistCompiler::from_command("/nonexistent/hostlist-compiler");
            let dir = tempfile::tempdir().unwrap();
            let config = dir.path().join("config.json");
            std::fs::write(&config, "{}").unwrap();

            let err = compiler
                .compile(&config, &dir.path().join("out.txt"), false, &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, CompilerError::CompilerNotFound));
        }
    }
}
