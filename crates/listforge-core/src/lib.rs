// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listforge Core - Filter-List Compilation Orchestrator
//!
//! This crate turns a declarative filter-list configuration (named sources,
//! transformations, inclusion/exclusion lists) into a single deduplicated
//! output artifact by driving an external compiling tool, optionally in
//! bounded-parallel chunks, under integrity-verified file access, with a
//! pluggable lifecycle-event system for zero-trust validation checkpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       CompilerService                            │
//! │        compile(options) -> CompilerResult (never errors)         │
//! └──────────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Pipeline (middleware chain)                   │
//! │   load(100) → validate(200) → compile(300) → finalize(400) → …   │
//! └──────────────────────────────────────────────────────────────────┘
//!          │                    │                       │
//!          │ events             │ chunk-or-direct       │ hash + count
//!          ▼                    ▼                       ▼
//! ┌────────────────┐  ┌───────────────────┐  ┌─────────────────────┐
//! │ EventDispatcher│  │  Chunking Engine   │  │  FileLockService    │
//! │ 14 lifecycle   │  │  split / batched   │  │  read/write locks   │
//! │ checkpoints    │  │  parallel / merge  │  │  SHA-256 integrity  │
//! └────────────────┘  └───────────────────┘  └─────────────────────┘
//!          │                    │
//!          ▼                    ▼
//! ┌────────────────┐  ┌───────────────────────────────────────────┐
//! │ PluginRegistry │  │    external compiler (subprocess)         │
//! │ 4 capabilities │  │  --config <path> --output <path>          │
//! └────────────────┘  └───────────────────────────────────────────┘
//! ```
//!
//! # Event policy
//!
//! Handlers observe (and at checkpoints, stop) every stage of a run:
//!
//! | Checkpoint | Kind | Handler may |
//! |------------|------|-------------|
//! | starting, validation, source-loading, chunk-started, chunks-merging | pre-commitment | skip / abort; errors propagate |
//! | source-loaded, lock events, chunk-completed, chunks-merged, completed, error | post-commitment | observe only; errors swallowed |
//!
//! # Example
//!
//! ```rust,ignore
//! use listforge_core::pipeline::CompileOptions;
//! use listforge_core::service::CompilerService;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = CompilerService::builder().build();
//!     let result = service.compile(CompileOptions::new("filters.yaml")).await;
//!     if result.success {
//!         println!("{} rules, sha256 {}", result.rule_count, result.hash_short(16));
//!     } else {
//!         eprintln!("failed: {}", result.error_message.unwrap_or_default());
//!     }
//! }
//! ```
//!
//! # Modules
//!
//! - [`chunking`]: split, bounded-parallel compile, deterministic merge
//! - [`compiler`]: external compiler subprocess driver and result types
//! - [`config`]: configuration model, JSON/YAML/TOML reading, validation
//! - [`error`]: unified error type with stable codes
//! - [`events`]: lifecycle event args, handler trait, dispatcher
//! - [`lock`]: file locks and SHA-256 content integrity
//! - [`pipeline`]: compilation context and middleware chain
//! - [`plugin`]: capability traits, registry, dynamic loading
//! - [`service`]: orchestration entry point and built-in stages

#![deny(missing_docs)]

/// Chunk splitting, bounded-parallel compilation, deterministic merge.
pub mod chunking;

/// External compiler subprocess driver and result types.
pub mod compiler;

/// Configuration model, multi-format reading, validation.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Lifecycle event arguments, handler trait, and dispatcher.
pub mod events;

/// File locking and content-integrity verification.
pub mod lock;

/// Compilation context and middleware pipeline.
pub mod pipeline;

/// Plugin capabilities, registry, and dynamic loading.
pub mod plugin;

/// Orchestration service and built-in pipeline stages.
pub mod service;

pub use chunking::{ChunkMetadata, ChunkedCompilationResult, ChunkingOptions, ChunkingStrategy};
pub use compiler::{CompilerResult, HostlistCompiler, RuleCompiler, VersionInfo};
pub use config::{CompilerConfiguration, ConfigurationFormat, FilterSource, read_configuration};
pub use error::{CompilerError, Result};
pub use events::{
    CompilationEventHandler, EventDecision, EventDispatcher, ValidationFinding, ValidationSeverity,
};
pub use lock::{FileLockHandle, FileLockKind, FileLockService, LockError};
pub use pipeline::{CompilationContext, CompileOptions, Middleware, Next, Pipeline};
pub use plugin::{Plugin, PluginRegistry};
pub use service::{CompilerService, CompilerServiceBuilder};
