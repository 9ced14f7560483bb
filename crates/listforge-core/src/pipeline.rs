// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compilation pipeline: ordered middleware around a shared context.
//!
//! A run is composed of independent stages (configuration read, validation,
//! compile dispatch, output finalization, caller-supplied extras) chained by
//! ascending order key. Each stage may do work before and/or after delegating
//! to the remainder of the chain via [`Next`]; a stage that does not call
//! `next` short-circuits every later stage. The terminal stage is a no-op, so
//! an empty chain is always safe to invoke.
//!
//! The pipeline can never return "nothing": after the chain runs, the
//! orchestrator inspects the cancellation flag first, then the result slot,
//! and synthesizes a failure if both are empty.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunking::ChunkingOptions;
use crate::compiler::{CompilerResult, DEFAULT_COMPILE_TIMEOUT};
use crate::config::{CompilerConfiguration, ConfigurationFormat};
use crate::error::Result;

/// Options for one orchestration call.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Path to the configuration file.
    pub config_path: PathBuf,
    /// Output artifact path; a timestamped default next to the configuration
    /// is used when absent.
    pub output_path: Option<PathBuf>,
    /// Configuration format override; detected from the extension when
    /// absent.
    pub format: Option<ConfigurationFormat>,
    /// Pass `--verbose` to the external compiler and log more.
    pub verbose: bool,
    /// Chunking options; the service default applies when absent.
    pub chunking: Option<ChunkingOptions>,
    /// Time budget per external compiler invocation.
    pub timeout: Duration,
    /// Also check that local source files exist during validation.
    pub check_source_files: bool,
}

impl CompileOptions {
    /// Options with defaults for a configuration path.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            output_path: None,
            format: None,
            verbose: false,
            chunking: None,
            timeout: DEFAULT_COMPILE_TIMEOUT,
            check_source_files: false,
        }
    }
}

/// Mutable per-run state threaded through the pipeline.
///
/// Owned exclusively by one pipeline execution; never shared across runs.
pub struct CompilationContext {
    /// Run options.
    pub options: CompileOptions,
    /// The configuration, once the load stage has read it.
    pub configuration: Option<CompilerConfiguration>,
    /// The in-progress or final result, once a stage has produced one.
    pub result: Option<CompilerResult>,
    values: HashMap<String, serde_json::Value>,
    cancelled: bool,
    cancel_reason: Option<String>,
    cancel_token: CancellationToken,
    started_at: Instant,
}

impl CompilationContext {
    /// Create a context for one run.
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            configuration: None,
            result: None,
            values: HashMap::new(),
            cancelled: false,
            cancel_reason: None,
            cancel_token: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    /// Cancel the run with a human-readable reason.
    ///
    /// Sets the flag checked by later stages and fires the cancellation
    /// token observed by in-flight compiles and lock waits. The first reason
    /// wins.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        if !self.cancelled {
            self.cancelled = true;
            self.cancel_reason = Some(reason.into());
            self.cancel_token.cancel();
        }
    }

    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Why the run was cancelled, when it was.
    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    /// Cancellation token threaded through compiles and lock waits.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Store a value in the middleware-to-middleware side channel.
    pub fn set_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Read a value from the side channel.
    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Milliseconds since the context was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for CompilationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationContext")
            .field("config_path", &self.options.config_path)
            .field("has_configuration", &self.configuration.is_some())
            .field("has_result", &self.result.is_some())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

/// One pipeline stage.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Stage name for logs.
    fn name(&self) -> &str;

    /// Ordering key; lower runs first.
    fn order(&self) -> i32;

    /// Do this stage's work, optionally delegating to the rest of the chain
    /// with `next.run(ctx).await`. Not calling `next` short-circuits every
    /// later stage.
    async fn handle(&self, ctx: &mut CompilationContext, next: Next) -> Result<()>;
}

/// The remainder of the middleware chain.
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
}

impl Next {
    /// Run the remaining stages. Past the end of the chain this is a no-op.
    pub fn run<'c>(
        self,
        ctx: &'c mut CompilationContext,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'c>> {
        Box::pin(async move {
            match self.chain.get(self.index).cloned() {
                Some(middleware) => {
                    debug!(stage = middleware.name(), "entering pipeline stage");
                    let next = Next {
                        chain: self.chain.clone(),
                        index: self.index + 1,
                    };
                    middleware.handle(ctx, next).await
                }
                None => Ok(()),
            }
        })
    }
}

/// An ordered, composed middleware chain. Built once, executed once per run.
pub struct Pipeline {
    middleware: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    /// Start building a pipeline.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    /// Whether the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// Execute the chain against a context.
    pub async fn execute(&self, ctx: &mut CompilationContext) -> Result<()> {
        Next {
            chain: self.middleware.clone(),
            index: 0,
        }
        .run(ctx)
        .await
    }
}

/// Builder collecting middleware before sorting them into a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Add a stage. Stages are sorted by their order key at build time;
    /// stages with equal keys keep registration order.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Sort and build.
    pub fn build(mut self) -> Pipeline {
        self.middleware.sort_by_key(|m| m.order());
        Pipeline {
            middleware: self.middleware.into(),
        }
    }
}
