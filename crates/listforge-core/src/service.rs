// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration service: the single entry point for a compilation run.
//!
//! [`CompilerService`] wires the event dispatcher, lock service, plugin
//! registry, and external compiler seam into a middleware pipeline and runs
//! it once per [`compile`](CompilerService::compile) call. Exactly one
//! [`CompilerResult`] comes back per call, even on failure - callers never
//! see an error type from the top-level entry point; every failure is caught
//! at this boundary and translated into `success = false` plus a message.
//!
//! Built-in pipeline stages, by order key:
//!
//! | Order | Stage | Work |
//! |-------|-------|------|
//! | 100 | load | starting event, configuration read (plugin formats honored), configuration-loaded event |
//! | 200 | validate | structural findings, `configuration` checkpoint |
//! | 300 | compile | source checkpoints + read locks, chunked or direct compile |
//! | 400 | finalize | transformer/validator/writer plugins, `output` checkpoint, hash + rule count, completed event |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::chunking::{
    ChunkingOptions, compile_chunks, should_enable_chunking, split_into_chunks,
};
use crate::compiler::{CompilerResult, HostlistCompiler, RuleCompiler, count_rules};
use crate::config::{
    CompilerConfiguration, ConfigurationFormat, FilterSource, read_configuration,
};
use crate::error::{CompilerError, Result};
use crate::events::{
    CompilationCompletedArgs, CompilationErrorArgs, CompilationEventHandler,
    CompilationStartingArgs, ConfigurationLoadedArgs, EventDecision, EventDispatcher,
    SourceLoadedArgs, SourceLoadingArgs, ValidationArgs,
};
use crate::lock::{FileLockHandle, FileLockService, hash_file};
use crate::pipeline::{
    CompilationContext, CompileOptions, Middleware, Next, Pipeline,
};
use crate::plugin::PluginRegistry;

/// Order key of the configuration load stage.
pub const LOAD_STAGE_ORDER: i32 = 100;
/// Order key of the validation stage.
pub const VALIDATE_STAGE_ORDER: i32 = 200;
/// Order key of the compile dispatch stage.
pub const COMPILE_STAGE_ORDER: i32 = 300;
/// Order key of the output finalization stage.
pub const FINALIZE_STAGE_ORDER: i32 = 400;

/// How long a source read lock acquisition may retry before the engine
/// continues without the lock.
const SOURCE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Builder for [`CompilerService`].
#[derive(Default)]
pub struct CompilerServiceBuilder {
    events: Option<Arc<EventDispatcher>>,
    handlers: Vec<Arc<dyn CompilationEventHandler>>,
    plugins: Option<Arc<PluginRegistry>>,
    compiler: Option<Arc<dyn RuleCompiler>>,
    chunking: ChunkingOptions,
    extra_middleware: Vec<Arc<dyn Middleware>>,
}

impl CompilerServiceBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing event dispatcher instead of a fresh one.
    pub fn events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a lifecycle event handler.
    pub fn handler(mut self, handler: Arc<dyn CompilationEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Use an existing plugin registry instead of an empty one.
    pub fn plugin_registry(mut self, plugins: Arc<PluginRegistry>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    /// Use an explicit compiler driver instead of PATH discovery at run time.
    pub fn compiler(mut self, compiler: Arc<dyn RuleCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Default chunking options for runs that do not override them.
    pub fn chunking(mut self, chunking: ChunkingOptions) -> Self {
        self.chunking = chunking;
        self
    }

    /// Add a custom pipeline stage.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.extra_middleware.push(middleware);
        self
    }

    /// Build the service.
    pub fn build(self) -> CompilerService {
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventDispatcher::new()));
        for handler in self.handlers {
            events.add_handler(handler);
        }
        let locks = Arc::new(FileLockService::new(events.clone()));
        CompilerService {
            events,
            locks,
            plugins: self
                .plugins
                .unwrap_or_else(|| Arc::new(PluginRegistry::new())),
            compiler: self.compiler,
            chunking: self.chunking,
            extra_middleware: self.extra_middleware,
        }
    }
}

/// The compilation orchestration service.
pub struct CompilerService {
    events: Arc<EventDispatcher>,
    locks: Arc<FileLockService>,
    plugins: Arc<PluginRegistry>,
    compiler: Option<Arc<dyn RuleCompiler>>,
    chunking: ChunkingOptions,
    extra_middleware: Vec<Arc<dyn Middleware>>,
}

impl CompilerService {
    /// Create a builder.
    pub fn builder() -> CompilerServiceBuilder {
        CompilerServiceBuilder::new()
    }

    /// The event dispatcher used by this service.
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// The file lock service used by this service.
    pub fn locks(&self) -> &Arc<FileLockService> {
        &self.locks
    }

    /// The plugin registry consulted by the pipeline.
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    /// Compile per `options` and return the result.
    ///
    /// Never fails with an error type: every failure, including cancellation
    /// by a handler, is translated into a result with `success = false` and a
    /// populated `error_message`.
    pub async fn compile(&self, mut options: CompileOptions) -> CompilerResult {
        let started = Instant::now();

        if options.output_path.is_none() {
            match resolve_default_output(&options.config_path) {
                Ok(path) => options.output_path = Some(path),
                Err(e) => {
                    return self
                        .failed_result(e.to_string(), Some(e.error_code()), None, 0)
                        .await;
                }
            }
        }

        let mut ctx = CompilationContext::new(options);
        let pipeline = self.build_pipeline();
        let outcome = pipeline.execute(&mut ctx).await;

        // Safety net: the compile stage releases its own locks; anything
        // still held here is leftover from an error path.
        self.locks.release_all_locks();

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Err(e) => {
                self.failed_result(
                    e.to_string(),
                    Some(e.error_code()),
                    ctx.configuration.as_ref(),
                    elapsed,
                )
                .await
            }
            Ok(()) => {
                if ctx.is_cancelled() {
                    let reason = ctx
                        .cancel_reason()
                        .unwrap_or("compilation cancelled")
                        .to_string();
                    return self
                        .failed_result(reason, Some("CANCELLED"), ctx.configuration.as_ref(), elapsed)
                        .await;
                }
                match ctx.result.take() {
                    Some(mut result) => {
                        if result.elapsed_ms == 0 {
                            result.elapsed_ms = elapsed;
                        }
                        if !result.success {
                            let message = result
                                .error_message
                                .clone()
                                .unwrap_or_else(|| "compilation failed".to_string());
                            self.events
                                .raise_compilation_error(&CompilationErrorArgs::new(message, None))
                                .await;
                        }
                        result
                    }
                    None => {
                        self.failed_result(
                            "compilation pipeline produced no result".to_string(),
                            None,
                            ctx.configuration.as_ref(),
                            elapsed,
                        )
                        .await
                    }
                }
            }
        }
    }

    /// Validate a configuration file without compiling it.
    pub async fn validate(
        &self,
        config_path: &Path,
        format: Option<ConfigurationFormat>,
        check_files: bool,
    ) -> Result<Vec<crate::events::ValidationFinding>> {
        let config = read_configuration(config_path, format).await?;
        Ok(config.validate(check_files))
    }

    fn build_pipeline(&self) -> Pipeline {
        let mut builder = Pipeline::builder()
            .with(Arc::new(LoadConfigurationStage {
                events: self.events.clone(),
                plugins: self.plugins.clone(),
            }))
            .with(Arc::new(ValidateConfigurationStage {
                events: self.events.clone(),
            }))
            .with(Arc::new(CompileDispatchStage {
                events: self.events.clone(),
                locks: self.locks.clone(),
                compiler: self.compiler.clone(),
                default_chunking: self.chunking.clone(),
            }))
            .with(Arc::new(FinalizeOutputStage {
                events: self.events.clone(),
                plugins: self.plugins.clone(),
            }));
        for middleware in &self.extra_middleware {
            builder = builder.with(middleware.clone());
        }
        builder.build()
    }

    async fn failed_result(
        &self,
        message: String,
        code: Option<&'static str>,
        config: Option<&CompilerConfiguration>,
        elapsed_ms: u64,
    ) -> CompilerResult {
        warn!(error = %message, "compilation failed");
        self.events
            .raise_compilation_error(&CompilationErrorArgs::new(message.clone(), code))
            .await;
        let mut result = CompilerResult::failure(message);
        if let Some(config) = config {
            result.config_name = config.name.clone();
            result.config_version = config.version.clone();
        }
        result.elapsed_ms = elapsed_ms;
        result
    }
}

impl std::fmt::Debug for CompilerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerService")
            .field("handlers", &self.events.handler_count())
            .field("plugins", &self.plugins.plugin_count())
            .field("has_compiler_override", &self.compiler.is_some())
            .finish()
    }
}

/// Default output location: `output/compiled-<UTC timestamp>.txt` next to the
/// configuration file. The directory is created if needed.
fn resolve_default_output(config_path: &Path) -> Result<PathBuf> {
    let parent = config_path.parent().unwrap_or_else(|| Path::new("."));
    let dir = parent.join("output");
    std::fs::create_dir_all(&dir)?;
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    Ok(dir.join(format!("compiled-{timestamp}.txt")))
}

fn none_if_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

struct LoadConfigurationStage {
    events: Arc<EventDispatcher>,
    plugins: Arc<PluginRegistry>,
}

#[async_trait]
impl Middleware for LoadConfigurationStage {
    fn name(&self) -> &str {
        "load-configuration"
    }

    fn order(&self) -> i32 {
        LOAD_STAGE_ORDER
    }

    async fn handle(&self, ctx: &mut CompilationContext, next: Next) -> Result<()> {
        let starting = CompilationStartingArgs::new(&ctx.options.config_path);
        match self.events.raise_compilation_starting(&starting).await? {
            EventDecision::Continue => {}
            EventDecision::Skip { reason } | EventDecision::Abort { reason } => {
                ctx.cancel(reason);
                return Ok(());
            }
        }

        let config_path = ctx.options.config_path.clone();
        let config = match read_configuration(&config_path, ctx.options.format).await {
            Ok(config) => config,
            Err(CompilerError::UnknownExtension { extension }) => {
                self.parse_with_plugin(&config_path, &extension).await?
            }
            Err(e) => return Err(e),
        };

        info!(
            name = %config.name,
            sources = config.sources.len(),
            format = ?config.source_format,
            "configuration loaded"
        );
        self.events
            .raise_configuration_loaded(&ConfigurationLoadedArgs {
                timestamp: Utc::now(),
                config_path,
                config_name: config.name.clone(),
                source_count: config.sources.len(),
            })
            .await?;

        ctx.configuration = Some(config);
        next.run(ctx).await
    }
}

impl LoadConfigurationStage {
    /// Fall back to a plugin-provided format parser for unknown extensions.
    async fn parse_with_plugin(
        &self,
        config_path: &Path,
        extension: &str,
    ) -> Result<CompilerConfiguration> {
        let bare = extension.trim_start_matches('.');
        let plugin = self.plugins.parser_for_extension(bare).ok_or_else(|| {
            CompilerError::UnknownExtension {
                extension: extension.to_string(),
            }
        })?;
        let parser = plugin.as_config_format_parser().ok_or_else(|| {
            CompilerError::Plugin(format!(
                "plugin '{}' no longer provides a format parser",
                plugin.id()
            ))
        })?;

        debug!(plugin = plugin.id(), extension = bare, "parsing configuration via plugin");
        let content = tokio::fs::read_to_string(config_path).await?;
        let mut config = parser.parse(&content)?;
        config.source_path = Some(config_path.to_path_buf());
        Ok(config)
    }
}

struct ValidateConfigurationStage {
    events: Arc<EventDispatcher>,
}

#[async_trait]
impl Middleware for ValidateConfigurationStage {
    fn name(&self) -> &str {
        "validate-configuration"
    }

    fn order(&self) -> i32 {
        VALIDATE_STAGE_ORDER
    }

    async fn handle(&self, ctx: &mut CompilationContext, next: Next) -> Result<()> {
        if ctx.is_cancelled() {
            return Ok(());
        }
        let Some(config) = ctx.configuration.as_ref() else {
            return next.run(ctx).await;
        };

        let findings = config.validate(ctx.options.check_source_files);
        let mut args = ValidationArgs::new("configuration", findings, config.sources.len());
        match self.events.raise_validation(&mut args).await? {
            EventDecision::Continue => {}
            EventDecision::Skip { reason } => {
                info!(%reason, "configuration validation skipped by handler");
                return next.run(ctx).await;
            }
            EventDecision::Abort { reason } => {
                ctx.cancel(reason);
                return Ok(());
            }
        }

        if let Some(critical) = args.first_critical() {
            let reason = critical.message.clone();
            ctx.cancel(reason);
            return Ok(());
        }

        if !args.passed() {
            let message = format!(
                "Configuration validation failed: {}",
                args.error_messages().join("; ")
            );
            warn!("{message}");
            let mut result = CompilerResult::failure(message);
            result.config_name = config.name.clone();
            result.config_version = config.version.clone();
            ctx.result = Some(result);
            return Ok(());
        }

        for finding in &args.findings {
            warn!(code = %finding.code, "{}", finding.message);
        }

        next.run(ctx).await
    }
}

struct CompileDispatchStage {
    events: Arc<EventDispatcher>,
    locks: Arc<FileLockService>,
    compiler: Option<Arc<dyn RuleCompiler>>,
    default_chunking: ChunkingOptions,
}

#[async_trait]
impl Middleware for CompileDispatchStage {
    fn name(&self) -> &str {
        "compile-dispatch"
    }

    fn order(&self) -> i32 {
        COMPILE_STAGE_ORDER
    }

    async fn handle(&self, ctx: &mut CompilationContext, next: Next) -> Result<()> {
        if ctx.is_cancelled() {
            return Ok(());
        }
        let Some(config) = ctx.configuration.clone() else {
            return next.run(ctx).await;
        };
        let output_path = match ctx.options.output_path.clone() {
            Some(path) => path,
            None => resolve_default_output(&ctx.options.config_path)?,
        };

        let compiler: Arc<dyn RuleCompiler> = match &self.compiler {
            Some(compiler) => compiler.clone(),
            None => Arc::new(HostlistCompiler::locate()?.with_timeout(ctx.options.timeout)),
        };

        // Source checkpoints; local sources are inspected and read-locked for
        // the duration of the compile.
        let mut kept: Vec<FilterSource> = Vec::with_capacity(config.sources.len());
        let mut held_locks: Vec<FileLockHandle> = Vec::new();
        let total = config.sources.len();
        for (index, source) in config.sources.iter().enumerate() {
            let loading = SourceLoadingArgs {
                timestamp: Utc::now(),
                source_index: index,
                total_sources: total,
                locator: source.source.clone(),
                source_name: none_if_empty(&source.name),
                is_local_file: source.is_local(),
            };
            match self.events.raise_source_loading(&loading).await {
                Ok(EventDecision::Continue) => {}
                Ok(EventDecision::Skip { reason }) => {
                    info!(source = %source.source, %reason, "source skipped by handler");
                    continue;
                }
                Ok(EventDecision::Abort { reason }) => {
                    release_locks(&self.locks, held_locks).await;
                    ctx.cancel(reason);
                    return Ok(());
                }
                Err(e) => {
                    release_locks(&self.locks, held_locks).await;
                    return Err(e);
                }
            }

            if source.is_local() {
                self.inspect_local_source(&config, source, index, total, &mut held_locks)
                    .await;
            } else {
                self.events
                    .raise_source_loaded(&SourceLoadedArgs {
                        timestamp: Utc::now(),
                        source_index: index,
                        total_sources: total,
                        locator: source.source.clone(),
                        source_name: none_if_empty(&source.name),
                        success: true,
                        error_message: None,
                        content_size_bytes: 0,
                        estimated_rule_count: 0,
                        load_duration_ms: 0,
                        content_hash: None,
                    })
                    .await;
            }
            kept.push(source.clone());
        }

        if kept.is_empty() {
            release_locks(&self.locks, held_locks).await;
            let mut result = CompilerResult::failure("all sources were skipped");
            result.config_name = config.name.clone();
            result.config_version = config.version.clone();
            ctx.result = Some(result);
            return Ok(());
        }

        let effective = if kept.len() == config.sources.len() {
            config.clone()
        } else {
            config.with_sources(kept)
        };

        let chunking = ctx
            .options
            .chunking
            .clone()
            .unwrap_or_else(|| self.default_chunking.clone());

        let compiled = self
            .run_compile(ctx, &effective, &output_path, compiler, &chunking)
            .await;
        release_locks(&self.locks, held_locks).await;

        let mut result = compiled?;
        result.config_name = config.name.clone();
        result.config_version = config.version.clone();
        ctx.result = Some(result);

        next.run(ctx).await
    }
}

impl CompileDispatchStage {
    /// Inspect a local source: read-lock it (with hash) for the duration of
    /// the compile and announce the outcome. Lock contention is not fatal -
    /// the compile continues without the lock, and the lock service has
    /// already raised the lock-failed event.
    async fn inspect_local_source(
        &self,
        config: &CompilerConfiguration,
        source: &FilterSource,
        index: usize,
        total: usize,
        held_locks: &mut Vec<FileLockHandle>,
    ) {
        let start = Instant::now();
        let path = config.resolve_source_path(source);
        let mut loaded = SourceLoadedArgs {
            timestamp: Utc::now(),
            source_index: index,
            total_sources: total,
            locator: source.source.clone(),
            source_name: none_if_empty(&source.name),
            success: false,
            error_message: None,
            content_size_bytes: 0,
            estimated_rule_count: 0,
            load_duration_ms: 0,
            content_hash: None,
        };

        match self
            .locks
            .try_acquire_read_lock(&path, SOURCE_LOCK_TIMEOUT, true)
            .await
        {
            Some(handle) => {
                loaded.success = true;
                loaded.content_hash = handle.content_hash().map(str::to_string);
                loaded.content_size_bytes = tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.len())
                    .unwrap_or(0);
                loaded.estimated_rule_count = count_rules(&path).await.unwrap_or(0);
                held_locks.push(handle);
            }
            None => {
                if path.exists() {
                    warn!(path = ?path, "continuing without source lock");
                    loaded.success = true;
                } else {
                    loaded.error_message =
                        Some(format!("source file not found: {path:?}"));
                }
            }
        }

        loaded.load_duration_ms = start.elapsed().as_millis() as u64;
        self.events.raise_source_loaded(&loaded).await;
    }

    async fn run_compile(
        &self,
        ctx: &CompilationContext,
        effective: &CompilerConfiguration,
        output_path: &Path,
        compiler: Arc<dyn RuleCompiler>,
        chunking: &ChunkingOptions,
    ) -> Result<CompilerResult> {
        if should_enable_chunking(effective, chunking) {
            let chunks = split_into_chunks(effective, chunking);
            info!(chunks = chunks.len(), "using chunked compilation");
            let chunked = compile_chunks(
                chunks,
                compiler,
                chunking,
                &self.events,
                ctx.options.verbose,
                ctx.cancel_token().clone(),
            )
            .await?;

            if chunked.success {
                let mut content = chunked.merged_rules.join("\n");
                content.push('\n');
                tokio::fs::write(output_path, content).await?;
            }

            Ok(CompilerResult {
                success: chunked.success,
                rule_count: chunked.final_rule_count,
                output_path: output_path.to_path_buf(),
                error_message: if chunked.errors.is_empty() {
                    None
                } else {
                    Some(chunked.errors.join("; "))
                },
                chunks: Some(chunked.chunks),
                duplicates_removed: Some(chunked.duplicates_removed),
                ..Default::default()
            })
        } else {
            // Direct path: hand the tool a JSON config. The original file is
            // passed through untouched when it already is JSON; anything else
            // goes through an isolated temp translation.
            let mut temp_config: Option<NamedTempFile> = None;
            let config_arg = match (&effective.source_format, &effective.source_path) {
                (Some(ConfigurationFormat::Json), Some(path)) => path.clone(),
                _ => {
                    let file = tempfile::Builder::new()
                        .prefix("listforge-config-")
                        .suffix(".json")
                        .tempfile()?;
                    tokio::fs::write(file.path(), effective.to_json()?).await?;
                    let path = file.path().to_path_buf();
                    temp_config = Some(file);
                    path
                }
            };

            let invocation = compiler
                .compile(&config_arg, output_path, ctx.options.verbose, ctx.cancel_token())
                .await?;
            drop(temp_config);

            debug!(elapsed_ms = invocation.elapsed_ms, "direct compilation complete");
            Ok(CompilerResult {
                success: true,
                rule_count: count_rules(output_path).await?,
                output_path: output_path.to_path_buf(),
                ..Default::default()
            })
        }
    }
}

async fn release_locks(locks: &FileLockService, handles: Vec<FileLockHandle>) {
    for handle in handles {
        locks.release(handle).await;
    }
}

struct FinalizeOutputStage {
    events: Arc<EventDispatcher>,
    plugins: Arc<PluginRegistry>,
}

#[async_trait]
impl Middleware for FinalizeOutputStage {
    fn name(&self) -> &str {
        "finalize-output"
    }

    fn order(&self) -> i32 {
        FINALIZE_STAGE_ORDER
    }

    async fn handle(&self, ctx: &mut CompilationContext, next: Next) -> Result<()> {
        if ctx.is_cancelled() {
            return Ok(());
        }
        let Some(result) = ctx.result.as_ref() else {
            return next.run(ctx).await;
        };
        if !result.success {
            return next.run(ctx).await;
        }
        let output_path = result.output_path.clone();

        let content = tokio::fs::read_to_string(&output_path).await?;
        let mut rules: Vec<String> = content.lines().map(str::to_string).collect();
        let original = rules.clone();

        for plugin in self.plugins.rule_transformers() {
            if let Some(transformer) = plugin.as_rule_transformer() {
                debug!(plugin = plugin.id(), "applying rule transformer");
                rules = transformer.transform(rules)?;
            }
        }

        // Output checkpoint: plugin validators contribute findings, and
        // external handlers get a last chance to gate the artifact.
        let mut findings = Vec::new();
        for plugin in self.plugins.rule_validators() {
            if let Some(validator) = plugin.as_rule_validator() {
                findings.extend(validator.validate(&rules));
            }
        }
        let mut args = ValidationArgs::new("output", findings, rules.len());
        match self.events.raise_validation(&mut args).await? {
            EventDecision::Continue => {}
            EventDecision::Skip { reason } => {
                info!(%reason, "output validation skipped by handler");
            }
            EventDecision::Abort { reason } => {
                ctx.cancel(reason);
                return Ok(());
            }
        }
        if let Some(critical) = args.first_critical() {
            let reason = critical.message.clone();
            ctx.cancel(reason);
            return Ok(());
        }
        if !args.passed() {
            let message = format!(
                "Output validation failed: {}",
                args.error_messages().join("; ")
            );
            if let Some(result) = ctx.result.as_mut() {
                result.success = false;
                result.error_message = Some(message);
            }
            return Ok(());
        }

        if rules != original {
            let mut content = rules.join("\n");
            content.push('\n');
            tokio::fs::write(&output_path, content).await?;
        }

        let output_hash = hash_file(&output_path).await?;
        let rule_count = count_rules(&output_path).await?;
        let elapsed_ms = ctx.elapsed_ms();
        if let Some(result) = ctx.result.as_mut() {
            result.output_hash = output_hash.clone();
            result.rule_count = rule_count;
            result.elapsed_ms = elapsed_ms;
        }

        // Secondary destinations are best effort; a writer bug must not
        // invalidate the already-produced artifact.
        for plugin in self.plugins.output_writers() {
            if let Some(writer) = plugin.as_output_writer() {
                if let Err(e) = writer.write(&output_path, &rules).await {
                    warn!(plugin = plugin.id(), error = %e, "output writer failed");
                }
            }
        }

        self.events
            .raise_compilation_completed(&CompilationCompletedArgs {
                timestamp: Utc::now(),
                rule_count,
                output_path,
                duration_ms: elapsed_ms,
                content_hash: Some(output_hash),
            })
            .await;

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let service = CompilerService::builder().build();
        assert_eq!(service.events().handler_count(), 0);
        assert_eq!(service.plugins().plugin_count(), 0);
        assert_eq!(service.locks().active_lock_count(), 0);
    }

    #[test]
    fn test_builder_wires_handlers_into_dispatcher() {
        struct Noop;
        #[async_trait]
        impl CompilationEventHandler for Noop {}

        let service = CompilerService::builder()
            .handler(Arc::new(Noop))
            .handler(Arc::new(Noop))
            .build();
        assert_eq!(service.events().handler_count(), 2);
    }

    #[test]
    fn test_builder_shares_event_dispatcher() {
        let events = Arc::new(EventDispatcher::new());
        let service = CompilerService::builder().events(events.clone()).build();
        assert!(Arc::ptr_eq(service.events(), &events));
    }

    #[test]
    fn test_resolve_default_output_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let output = resolve_default_output(&config_path).unwrap();

        assert!(output.starts_with(dir.path().join("output")));
        assert!(dir.path().join("output").is_dir());
        let name = output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("compiled-"));
        assert!(name.ends_with(".txt"));
    }

    #[tokio::test]
    async fn test_validate_reports_findings_without_compiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"sources": []}"#).await.unwrap();

        let service = CompilerService::builder().build();
        let findings = service.validate(&path, None, false).await.unwrap();
        let codes: Vec<&str> = findings.iter().map(|f| f.code.as_str()).collect();
        assert!(codes.contains(&"CONFIG_NAME_MISSING"));
        assert!(codes.contains(&"CONFIG_NO_SOURCES"));
    }

    #[tokio::test]
    async fn test_compile_missing_config_returns_failed_result() {
        let service = CompilerService::builder().build();
        let dir = tempfile::tempdir().unwrap();
        let mut options = CompileOptions::new(dir.path().join("missing.json"));
        options.output_path = Some(dir.path().join("out.txt"));

        let result = service.compile(options).await;
        assert!(!result.success);
        assert!(
            result
                .error_message
                .as_deref()
                .unwrap()
                .contains("not found")
        );
    }

    #[tokio::test]
    async fn test_compile_invalid_config_fails_at_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"name": "", "sources": []}"#)
            .await
            .unwrap();

        let service = CompilerService::builder().build();
        let mut options = CompileOptions::new(&path);
        options.output_path = Some(dir.path().join("out.txt"));

        let result = service.compile(options).await;
        assert!(!result.success);
        let message = result.error_message.as_deref().unwrap();
        assert!(message.contains("validation failed"));
        assert!(message.contains("name"));
        assert!(message.contains("source"));
    }
}
