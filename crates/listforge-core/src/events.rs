// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle events for the compilation pipeline.
//!
//! Every stage of a run is announced to registered handlers, which makes the
//! orchestrator auditable end to end: external policy engines can observe (and
//! at checkpoints, stop) a compilation without being compiled into it.
//!
//! Handlers are invoked sequentially in registration order. The dispatcher
//! applies two policies depending on the event kind:
//!
//! | Kind | Events | Handler error | Control flow |
//! |------|--------|---------------|--------------|
//! | Pre-commitment | starting, validation, source-loading, chunk-started, chunks-merging | propagates | [`EventDecision`] short-circuits |
//! | Configuration-loaded | configuration-loaded | propagates | none |
//! | Post-commitment | source-loaded, lock-acquired/released/failed, chunk-completed, chunks-merged, completed, error | logged and swallowed | none |
//!
//! Pre-commitment events fire before the corresponding operation has any side
//! effect, so failing fast is safe and handlers may stop the operation. Once
//! an operation has committed, a handler bug must not be able to corrupt the
//! result, so post-commitment notification is best effort.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CompilerError;
pub(crate) use crate::error::Result;
use crate::lock::FileLockKind;

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationSeverity {
    /// Informational only.
    Info,
    /// Suspicious but not fatal.
    Warning,
    /// The configuration is invalid; the run should fail.
    Error,
    /// The checkpoint must abort immediately.
    Critical,
}

impl fmt::Display for ValidationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A single diagnostic produced at a validation checkpoint.
#[derive(Debug, Clone)]
pub struct ValidationFinding {
    /// Severity of the finding.
    pub severity: ValidationSeverity,
    /// Stable machine-readable code, e.g. `CONFIG_NO_SOURCES`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Where the finding applies, e.g. `sources[2]`.
    pub location: Option<String>,
    /// Optional structured context for external consumers.
    pub context: Option<serde_json::Value>,
}

impl ValidationFinding {
    /// Create a finding.
    pub fn new(
        severity: ValidationSeverity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            location: None,
            context: None,
        }
    }

    /// Create an error-severity finding.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ValidationSeverity::Error, code, message)
    }

    /// Create a warning-severity finding.
    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ValidationSeverity::Warning, code, message)
    }

    /// Create a critical-severity finding.
    pub fn critical(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ValidationSeverity::Critical, code, message)
    }

    /// Attach a location to the finding.
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Decision returned by pre-commitment event handlers.
///
/// Control flow is carried in the return value instead of mutable flags on the
/// event arguments, so a reader of the call site can see every way an
/// operation can be stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDecision {
    /// Proceed; later handlers still run.
    Continue,
    /// Skip the single unit of work the event announces (one source, one
    /// chunk). Later handlers do not run.
    Skip {
        /// Why the unit was skipped.
        reason: String,
    },
    /// Abort the whole run. Later handlers do not run.
    Abort {
        /// Why the run was aborted.
        reason: String,
    },
}

impl EventDecision {
    /// Convenience constructor for [`EventDecision::Skip`].
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for [`EventDecision::Abort`].
    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    /// Whether this decision lets the operation proceed.
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

/// Arguments for the compilation-starting event.
#[derive(Debug, Clone)]
pub struct CompilationStartingArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Path to the configuration about to be read.
    pub config_path: PathBuf,
}

impl CompilationStartingArgs {
    /// Create args for a configuration path.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            timestamp: Utc::now(),
            config_path: config_path.into(),
        }
    }
}

/// Arguments for the configuration-loaded event.
#[derive(Debug, Clone)]
pub struct ConfigurationLoadedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Path the configuration was read from.
    pub config_path: PathBuf,
    /// Configured list name.
    pub config_name: String,
    /// Number of sources in the configuration.
    pub source_count: usize,
}

/// Arguments for a validation checkpoint.
///
/// Handlers may append findings; findings of [`ValidationSeverity::Error`] or
/// above fail the run at the checkpoint.
#[derive(Debug, Clone)]
pub struct ValidationArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Checkpoint name, e.g. `configuration` or `output`.
    pub stage: String,
    /// Findings accumulated so far (orchestrator-produced plus handler-added).
    pub findings: Vec<ValidationFinding>,
    /// How many items the checkpoint covered (sources, rules, ...).
    pub items_validated: usize,
}

impl ValidationArgs {
    /// Create args for a named checkpoint.
    pub fn new(stage: impl Into<String>, findings: Vec<ValidationFinding>, items: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            stage: stage.into(),
            findings,
            items_validated: items,
        }
    }

    /// Append a finding.
    pub fn add_finding(&mut self, finding: ValidationFinding) {
        self.findings.push(finding);
    }

    /// Whether the checkpoint passed (no error or critical findings).
    pub fn passed(&self) -> bool {
        !self
            .findings
            .iter()
            .any(|f| f.severity >= ValidationSeverity::Error)
    }

    /// First critical finding, if any.
    pub fn first_critical(&self) -> Option<&ValidationFinding> {
        self.findings
            .iter()
            .find(|f| f.severity == ValidationSeverity::Critical)
    }

    /// Messages of all error-or-worse findings.
    pub fn error_messages(&self) -> Vec<String> {
        self.findings
            .iter()
            .filter(|f| f.severity >= ValidationSeverity::Error)
            .map(|f| f.message.clone())
            .collect()
    }
}

/// Arguments raised before a source is handed to the compiler.
#[derive(Debug, Clone)]
pub struct SourceLoadingArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Zero-based index of the source.
    pub source_index: usize,
    /// Total number of sources in the configuration.
    pub total_sources: usize,
    /// Source locator (local path or URL).
    pub locator: String,
    /// Display name of the source, if configured.
    pub source_name: Option<String>,
    /// Whether the locator refers to a local file.
    pub is_local_file: bool,
}

/// Arguments raised after a source has been inspected.
#[derive(Debug, Clone)]
pub struct SourceLoadedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Zero-based index of the source.
    pub source_index: usize,
    /// Total number of sources in the configuration.
    pub total_sources: usize,
    /// Source locator (local path or URL).
    pub locator: String,
    /// Display name of the source, if configured.
    pub source_name: Option<String>,
    /// Whether the source was readable.
    pub success: bool,
    /// Why inspection failed, when it did.
    pub error_message: Option<String>,
    /// Size of the source content in bytes (local files only).
    pub content_size_bytes: u64,
    /// Estimated number of rules in the source (local files only).
    pub estimated_rule_count: usize,
    /// How long inspection took.
    pub load_duration_ms: u64,
    /// SHA-256 of the source content, when computed.
    pub content_hash: Option<String>,
}

/// Arguments raised when a file lock is acquired.
#[derive(Debug, Clone)]
pub struct FileLockAcquiredArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Locked path.
    pub path: PathBuf,
    /// Lock kind.
    pub kind: FileLockKind,
    /// Unique id of the lock.
    pub lock_id: Uuid,
    /// SHA-256 of the file at acquisition time, when computed.
    pub content_hash: Option<String>,
}

/// Arguments raised when a file lock is released.
#[derive(Debug, Clone)]
pub struct FileLockReleasedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Unlocked path.
    pub path: PathBuf,
    /// Unique id of the lock.
    pub lock_id: Uuid,
    /// How long the lock was held.
    pub held_ms: u64,
    /// Whether the content hash changed while the lock was held.
    pub was_modified: bool,
    /// SHA-256 at acquisition time, when computed.
    pub hash_before: Option<String>,
    /// SHA-256 at release time, when computed.
    pub hash_after: Option<String>,
}

/// Arguments raised when a file lock could not be acquired.
#[derive(Debug, Clone)]
pub struct FileLockFailedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Path that could not be locked.
    pub path: PathBuf,
    /// Requested lock kind.
    pub kind: FileLockKind,
    /// Why the lock failed.
    pub reason: String,
}

/// Arguments raised before a chunk is compiled.
#[derive(Debug, Clone)]
pub struct ChunkStartedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Zero-based chunk index.
    pub chunk_index: usize,
    /// Total number of chunks.
    pub total_chunks: usize,
    /// Number of sources assigned to the chunk.
    pub source_count: usize,
    /// Estimated rule count for the chunk.
    pub estimated_rules: usize,
}

/// Arguments raised after a chunk compile finished (or failed).
#[derive(Debug, Clone)]
pub struct ChunkCompletedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Zero-based chunk index.
    pub chunk_index: usize,
    /// Total number of chunks.
    pub total_chunks: usize,
    /// Whether the chunk compiled successfully.
    pub success: bool,
    /// Failure reason, when it failed.
    pub error_message: Option<String>,
    /// Number of rule lines the chunk produced.
    pub rule_count: usize,
    /// How long the chunk took.
    pub duration_ms: u64,
}

/// Arguments raised before chunk outputs are merged.
#[derive(Debug, Clone)]
pub struct ChunksMergingArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Number of chunk outputs to merge.
    pub chunk_count: usize,
    /// Total rule lines across all chunk outputs.
    pub total_rules_before_merge: usize,
}

/// Arguments raised after chunk outputs were merged.
#[derive(Debug, Clone)]
pub struct ChunksMergedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Number of chunk outputs merged.
    pub chunk_count: usize,
    /// Total rule lines before deduplication.
    pub total_rules_before_merge: usize,
    /// Rule lines after deduplication.
    pub final_rule_count: usize,
    /// Duplicate rule lines removed.
    pub duplicates_removed: usize,
    /// How long the merge took.
    pub duration_ms: u64,
}

/// Arguments raised when a compilation completes successfully.
#[derive(Debug, Clone)]
pub struct CompilationCompletedArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Number of rules in the output artifact.
    pub rule_count: usize,
    /// Path of the output artifact.
    pub output_path: PathBuf,
    /// Total run duration.
    pub duration_ms: u64,
    /// SHA-256 of the output artifact.
    pub content_hash: Option<String>,
}

/// Arguments raised when a compilation fails.
#[derive(Debug, Clone)]
pub struct CompilationErrorArgs {
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
    /// Human-readable failure summary.
    pub error_message: String,
    /// Stable error code, when known.
    pub error_code: Option<&'static str>,
}

impl CompilationErrorArgs {
    /// Create args from an error message and optional code.
    pub fn new(error_message: impl Into<String>, error_code: Option<&'static str>) -> Self {
        Self {
            timestamp: Utc::now(),
            error_message: error_message.into(),
            error_code,
        }
    }
}

/// Handler for compilation lifecycle events.
///
/// Override only the methods you need; every method has a default no-op
/// implementation. Pre-commitment methods return an [`EventDecision`];
/// returning an error from them fails the run.
#[async_trait]
pub trait CompilationEventHandler: Send + Sync {
    /// Handler name used in logs and error messages.
    fn name(&self) -> &str {
        "handler"
    }

    /// Called before the configuration is read. Abort cancels the run.
    async fn on_compilation_starting(
        &self,
        args: &CompilationStartingArgs,
    ) -> Result<EventDecision> {
        let _ = args;
        Ok(EventDecision::Continue)
    }

    /// Called after the configuration has been read.
    async fn on_configuration_loaded(&self, args: &ConfigurationLoadedArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called at validation checkpoints. Handlers may append findings.
    async fn on_validation(&self, args: &mut ValidationArgs) -> Result<EventDecision> {
        let _ = args;
        Ok(EventDecision::Continue)
    }

    /// Called before a source is handed to the compiler. Skip excludes the
    /// source from the run; abort cancels the run.
    async fn on_source_loading(&self, args: &SourceLoadingArgs) -> Result<EventDecision> {
        let _ = args;
        Ok(EventDecision::Continue)
    }

    /// Called after a source has been inspected.
    async fn on_source_loaded(&self, args: &SourceLoadedArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called when a file lock is acquired.
    async fn on_file_lock_acquired(&self, args: &FileLockAcquiredArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called when a file lock is released.
    async fn on_file_lock_released(&self, args: &FileLockReleasedArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called when a file lock could not be acquired.
    async fn on_file_lock_failed(&self, args: &FileLockFailedArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called before a chunk is compiled. Skip excludes the chunk; abort
    /// cancels the run.
    async fn on_chunk_started(&self, args: &ChunkStartedArgs) -> Result<EventDecision> {
        let _ = args;
        Ok(EventDecision::Continue)
    }

    /// Called after a chunk compile finished or failed.
    async fn on_chunk_completed(&self, args: &ChunkCompletedArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called before chunk outputs are merged. Abort cancels the run.
    async fn on_chunks_merging(&self, args: &ChunksMergingArgs) -> Result<EventDecision> {
        let _ = args;
        Ok(EventDecision::Continue)
    }

    /// Called after chunk outputs were merged.
    async fn on_chunks_merged(&self, args: &ChunksMergedArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called when a compilation completes successfully.
    async fn on_compilation_completed(&self, args: &CompilationCompletedArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }

    /// Called when a compilation fails.
    async fn on_compilation_error(&self, args: &CompilationErrorArgs) -> Result<()> {
        let _ = args;
        Ok(())
    }
}

/// Dispatches compilation lifecycle events to registered handlers.
///
/// Handlers run sequentially in registration order for every raise call -
/// later handlers may depend on state already updated by earlier ones.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<Vec<Arc<dyn CompilationEventHandler>>>,
}

impl EventDispatcher {
    /// Create a dispatcher with no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers are invoked in registration order.
    pub fn add_handler(&self, handler: Arc<dyn CompilationEventHandler>) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Remove a previously registered handler (by identity).
    pub fn remove_handler(&self, handler: &Arc<dyn CompilationEventHandler>) {
        self.handlers
            .write()
            .unwrap()
            .retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn CompilationEventHandler>> {
        self.handlers.read().unwrap().clone()
    }

    fn wrap_error(handler: &str, event: &'static str, err: CompilerError) -> CompilerError {
        CompilerError::Handler {
            handler: handler.to_string(),
            event,
            message: err.to_string(),
        }
    }

    /// Raise the compilation-starting event (pre-commitment).
    pub async fn raise_compilation_starting(
        &self,
        args: &CompilationStartingArgs,
    ) -> Result<EventDecision> {
        for handler in self.snapshot() {
            match handler.on_compilation_starting(args).await {
                Ok(EventDecision::Continue) => {}
                Ok(decision) => {
                    info!(handler = handler.name(), ?decision, "compilation stopped by handler");
                    return Ok(decision);
                }
                Err(e) => return Err(Self::wrap_error(handler.name(), "CompilationStarting", e)),
            }
        }
        Ok(EventDecision::Continue)
    }

    /// Raise the configuration-loaded event. Handler errors propagate
    /// (nothing has been committed yet), but there is no decision.
    pub async fn raise_configuration_loaded(&self, args: &ConfigurationLoadedArgs) -> Result<()> {
        for handler in self.snapshot() {
            handler
                .on_configuration_loaded(args)
                .await
                .map_err(|e| Self::wrap_error(handler.name(), "ConfigurationLoaded", e))?;
        }
        Ok(())
    }

    /// Raise a validation checkpoint (pre-commitment). Handlers may append
    /// findings to `args`.
    pub async fn raise_validation(&self, args: &mut ValidationArgs) -> Result<EventDecision> {
        debug!(stage = %args.stage, handlers = self.handler_count(), "raising validation checkpoint");
        for handler in self.snapshot() {
            match handler.on_validation(args).await {
                Ok(EventDecision::Continue) => {}
                Ok(decision) => {
                    warn!(
                        handler = handler.name(),
                        stage = %args.stage,
                        ?decision,
                        "validation checkpoint stopped by handler"
                    );
                    return Ok(decision);
                }
                Err(e) => return Err(Self::wrap_error(handler.name(), "Validation", e)),
            }
        }
        Ok(EventDecision::Continue)
    }

    /// Raise the source-loading event (pre-commitment).
    pub async fn raise_source_loading(&self, args: &SourceLoadingArgs) -> Result<EventDecision> {
        for handler in self.snapshot() {
            match handler.on_source_loading(args).await {
                Ok(EventDecision::Continue) => {}
                Ok(decision) => {
                    info!(
                        handler = handler.name(),
                        source_index = args.source_index,
                        ?decision,
                        "source stopped by handler"
                    );
                    return Ok(decision);
                }
                Err(e) => return Err(Self::wrap_error(handler.name(), "SourceLoading", e)),
            }
        }
        Ok(EventDecision::Continue)
    }

    /// Raise the source-loaded event (post-commitment).
    pub async fn raise_source_loaded(&self, args: &SourceLoadedArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_source_loaded(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during SourceLoaded");
            }
        }
    }

    /// Raise the file-lock-acquired event (post-commitment).
    pub async fn raise_file_lock_acquired(&self, args: &FileLockAcquiredArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_file_lock_acquired(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during FileLockAcquired");
            }
        }
    }

    /// Raise the file-lock-released event (post-commitment).
    pub async fn raise_file_lock_released(&self, args: &FileLockReleasedArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_file_lock_released(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during FileLockReleased");
            }
        }
    }

    /// Raise the file-lock-failed event (post-commitment).
    pub async fn raise_file_lock_failed(&self, args: &FileLockFailedArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_file_lock_failed(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during FileLockFailed");
            }
        }
    }

    /// Raise the chunk-started event (pre-commitment).
    pub async fn raise_chunk_started(&self, args: &ChunkStartedArgs) -> Result<EventDecision> {
        for handler in self.snapshot() {
            match handler.on_chunk_started(args).await {
                Ok(EventDecision::Continue) => {}
                Ok(decision) => {
                    info!(
                        handler = handler.name(),
                        chunk = args.chunk_index,
                        ?decision,
                        "chunk stopped by handler"
                    );
                    return Ok(decision);
                }
                Err(e) => return Err(Self::wrap_error(handler.name(), "ChunkStarted", e)),
            }
        }
        Ok(EventDecision::Continue)
    }

    /// Raise the chunk-completed event (post-commitment).
    pub async fn raise_chunk_completed(&self, args: &ChunkCompletedArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_chunk_completed(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during ChunkCompleted");
            }
        }
    }

    /// Raise the chunks-merging event (pre-commitment).
    pub async fn raise_chunks_merging(&self, args: &ChunksMergingArgs) -> Result<EventDecision> {
        for handler in self.snapshot() {
            match handler.on_chunks_merging(args).await {
                Ok(EventDecision::Continue) => {}
                Ok(decision) => {
                    info!(handler = handler.name(), ?decision, "merge stopped by handler");
                    return Ok(decision);
                }
                Err(e) => return Err(Self::wrap_error(handler.name(), "ChunksMerging", e)),
            }
        }
        Ok(EventDecision::Continue)
    }

    /// Raise the chunks-merged event (post-commitment).
    pub async fn raise_chunks_merged(&self, args: &ChunksMergedArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_chunks_merged(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during ChunksMerged");
            }
        }
    }

    /// Raise the compilation-completed event (post-commitment).
    pub async fn raise_compilation_completed(&self, args: &CompilationCompletedArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_compilation_completed(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during CompilationCompleted");
            }
        }
    }

    /// Raise the compilation-error event (post-commitment).
    pub async fn raise_compilation_error(&self, args: &CompilationErrorArgs) {
        for handler in self.snapshot() {
            if let Err(e) = handler.on_compilation_error(args).await {
                warn!(handler = handler.name(), error = %e, "handler failed during CompilationError");
            }
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records the order in which handlers ran.
    struct RecordingHandler {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        decision: EventDecision,
        fail_post: bool,
    }

    impl RecordingHandler {
        fn continuing(tag: &'static str, log: Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                log,
                decision: EventDecision::Continue,
                fail_post: false,
            })
        }
    }

    #[async_trait]
    impl CompilationEventHandler for RecordingHandler {
        fn name(&self) -> &str {
            self.tag
        }

        async fn on_compilation_starting(
            &self,
            _args: &CompilationStartingArgs,
        ) -> Result<EventDecision> {
            self.log.lock().unwrap().push(self.tag);
            Ok(self.decision.clone())
        }

        async fn on_chunk_completed(&self, _args: &ChunkCompletedArgs) -> Result<()> {
            self.log.lock().unwrap().push(self.tag);
            if self.fail_post {
                return Err(CompilerError::Plugin("post handler bug".to_string()));
            }
            Ok(())
        }
    }

    fn chunk_completed_args() -> ChunkCompletedArgs {
        ChunkCompletedArgs {
            timestamp: Utc::now(),
            chunk_index: 0,
            total_chunks: 1,
            success: true,
            error_message: None,
            rule_count: 10,
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.add_handler(RecordingHandler::continuing("first", log.clone()));
        dispatcher.add_handler(RecordingHandler::continuing("second", log.clone()));
        dispatcher.add_handler(RecordingHandler::continuing("third", log.clone()));

        let decision = dispatcher
            .raise_compilation_starting(&CompilationStartingArgs::new("config.json"))
            .await
            .unwrap();

        assert_eq!(decision, EventDecision::Continue);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_abort_decision_short_circuits_later_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.add_handler(RecordingHandler::continuing("first", log.clone()));
        dispatcher.add_handler(Arc::new(RecordingHandler {
            tag: "aborter",
            log: log.clone(),
            decision: EventDecision::abort("policy says no"),
            fail_post: false,
        }));
        dispatcher.add_handler(RecordingHandler::continuing("never", log.clone()));

        let decision = dispatcher
            .raise_compilation_starting(&CompilationStartingArgs::new("config.json"))
            .await
            .unwrap();

        assert_eq!(
            decision,
            EventDecision::Abort {
                reason: "policy says no".to_string()
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["first", "aborter"]);
    }

    #[tokio::test]
    async fn test_post_commitment_errors_are_swallowed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.add_handler(Arc::new(RecordingHandler {
            tag: "buggy",
            log: log.clone(),
            decision: EventDecision::Continue,
            fail_post: true,
        }));
        dispatcher.add_handler(RecordingHandler::continuing("after", log.clone()));

        // Must not panic or stop later handlers.
        dispatcher.raise_chunk_completed(&chunk_completed_args()).await;
        assert_eq!(*log.lock().unwrap(), vec!["buggy", "after"]);
    }

    #[tokio::test]
    async fn test_pre_commitment_error_propagates_with_handler_name() {
        struct FailingHandler;

        #[async_trait]
        impl CompilationEventHandler for FailingHandler {
            fn name(&self) -> &str {
                "audit"
            }

            async fn on_compilation_starting(
                &self,
                _args: &CompilationStartingArgs,
            ) -> Result<EventDecision> {
                Err(CompilerError::Plugin("store unreachable".to_string()))
            }
        }

        let dispatcher = EventDispatcher::new();
        dispatcher.add_handler(Arc::new(FailingHandler));

        let err = dispatcher
            .raise_compilation_starting(&CompilationStartingArgs::new("config.json"))
            .await
            .unwrap_err();

        match err {
            CompilerError::Handler { handler, event, .. } => {
                assert_eq!(handler, "audit");
                assert_eq!(event, "CompilationStarting");
            }
            other => panic!("expected Handler error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_validation_handlers_can_append_findings() {
        struct FindingHandler;

        #[async_trait]
        impl CompilationEventHandler for FindingHandler {
            async fn on_validation(&self, args: &mut ValidationArgs) -> Result<EventDecision> {
                args.add_finding(ValidationFinding::error(
                    "EXTERNAL_POLICY",
                    "source not on allowlist",
                ));
                Ok(EventDecision::Continue)
            }
        }

        let dispatcher = EventDispatcher::new();
        dispatcher.add_handler(Arc::new(FindingHandler));

        let mut args = ValidationArgs::new("configuration", Vec::new(), 3);
        let decision = dispatcher.raise_validation(&mut args).await.unwrap();

        assert_eq!(decision, EventDecision::Continue);
        assert_eq!(args.findings.len(), 1);
        assert!(!args.passed());
        assert_eq!(args.error_messages(), vec!["source not on allowlist"]);
    }

    #[tokio::test]
    async fn test_remove_handler() {
        let counter = Arc::new(AtomicUsize::new(0));

        struct CountingHandler(Arc<AtomicUsize>);

        #[async_trait]
        impl CompilationEventHandler for CountingHandler {
            async fn on_chunk_completed(&self, _args: &ChunkCompletedArgs) -> Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dispatcher = EventDispatcher::new();
        let handler: Arc<dyn CompilationEventHandler> =
            Arc::new(CountingHandler(counter.clone()));
        dispatcher.add_handler(handler.clone());
        assert_eq!(dispatcher.handler_count(), 1);

        dispatcher.raise_chunk_completed(&chunk_completed_args()).await;
        dispatcher.remove_handler(&handler);
        assert_eq!(dispatcher.handler_count(), 0);
        dispatcher.raise_chunk_completed(&chunk_completed_args()).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ValidationSeverity::Critical > ValidationSeverity::Error);
        assert!(ValidationSeverity::Error > ValidationSeverity::Warning);
        assert!(ValidationSeverity::Warning > ValidationSeverity::Info);
        assert_eq!(ValidationSeverity::Critical.to_string(), "critical");
    }

    #[test]
    fn test_validation_args_passed() {
        let mut args = ValidationArgs::new("configuration", Vec::new(), 0);
        assert!(args.passed());

        args.add_finding(ValidationFinding::warning("W1", "minor"));
        assert!(args.passed());

        args.add_finding(ValidationFinding::critical("C1", "tampering detected").at("sources[0]"));
        assert!(!args.passed());
        assert_eq!(args.first_critical().unwrap().code, "C1");
        assert_eq!(
            args.first_critical().unwrap().location.as_deref(),
            Some("sources[0]")
        );
    }
}
