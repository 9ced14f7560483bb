// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Chunked parallel compilation.
//!
//! Large configurations are split into independently compilable chunks, each
//! driven through its own external-compiler invocation, then merged with
//! order-preserving deduplication. Chunks run in sequential batches of
//! `max_parallel` spawned tasks, so peak parallelism is bounded at all times.
//!
//! Determinism: the merge consumes chunk outputs in chunk-index order, never
//! completion order, so identical inputs always produce byte-identical
//! merged output regardless of scheduling.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compiler::RuleCompiler;
use crate::config::{CompilerConfiguration, FilterSource};
use crate::error::{CompilerError, Result};
use crate::events::{
    ChunkCompletedArgs, ChunkStartedArgs, ChunksMergedArgs, ChunksMergingArgs, EventDecision,
    EventDispatcher,
};

/// Strategy for splitting sources into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkingStrategy {
    /// Distribute whole sources across chunks.
    #[default]
    Source,
    /// Split by rule line count. Reserved; falls back to [`Self::Source`].
    LineCount,
}

/// Options for chunked parallel compilation.
#[derive(Debug, Clone)]
pub struct ChunkingOptions {
    /// Tri-state toggle: `Some(true)` forces chunking on, `Some(false)`
    /// forces it off, `None` lets the engine decide.
    pub enabled: Option<bool>,
    /// Estimated rules per chunk; used only by the speedup estimate.
    pub chunk_size: usize,
    /// Maximum concurrently running compiler subprocesses.
    pub max_parallel: usize,
    /// Splitting strategy.
    pub strategy: ChunkingStrategy,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            enabled: None,
            chunk_size: 100_000,
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            strategy: ChunkingStrategy::Source,
        }
    }
}

impl ChunkingOptions {
    /// Options tuned for very large filter lists.
    pub fn for_large_lists() -> Self {
        Self {
            enabled: Some(true),
            max_parallel: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .max(2),
            ..Default::default()
        }
    }
}

/// Metadata about one compilation chunk.
///
/// Created when a configuration is split; finalized when the chunk's compile
/// completes or fails, and read-only after that.
#[derive(Debug, Clone, Default)]
pub struct ChunkMetadata {
    /// Zero-based ordinal of the chunk.
    pub index: usize,
    /// Total number of chunks.
    pub total: usize,
    /// Estimated rule count for the chunk.
    pub estimated_rules: usize,
    /// Actual rule lines produced, once compiled.
    pub actual_rules: Option<usize>,
    /// Sources assigned to the chunk.
    pub sources: Vec<FilterSource>,
    /// Compile duration, once finished.
    pub elapsed_ms: Option<u64>,
    /// Whether the chunk compiled successfully.
    pub success: bool,
    /// Failure reason, when it failed.
    pub error_message: Option<String>,
}

impl ChunkMetadata {
    fn new(index: usize, total: usize, sources: Vec<FilterSource>) -> Self {
        Self {
            index,
            total,
            sources,
            ..Default::default()
        }
    }
}

/// Result of a chunked compilation.
#[derive(Debug, Clone, Default)]
pub struct ChunkedCompilationResult {
    /// Whether at least one chunk compiled successfully.
    pub success: bool,
    /// Wall time of the whole chunked compile.
    pub total_elapsed_ms: u64,
    /// Finalized metadata for every chunk, in chunk order.
    pub chunks: Vec<ChunkMetadata>,
    /// Sum of rule lines produced across chunks, before merging.
    pub total_rules: usize,
    /// Rule lines after the deduplicating merge.
    pub final_rule_count: usize,
    /// Duplicate rule lines removed by the merge.
    pub duplicates_removed: usize,
    /// The merged rule lines, in deterministic order.
    pub merged_rules: Vec<String>,
    /// One entry per failed chunk.
    pub errors: Vec<String>,
}

impl ChunkedCompilationResult {
    /// Measured speedup versus sequential compilation: the sum of chunk times
    /// divided by wall time. `1.0` when nothing ran.
    pub fn measured_speedup(&self) -> f64 {
        if self.chunks.is_empty() || self.total_elapsed_ms == 0 {
            return 1.0;
        }
        let total_chunk_time: u64 = self.chunks.iter().filter_map(|c| c.elapsed_ms).sum();
        total_chunk_time as f64 / self.total_elapsed_ms as f64
    }
}

/// Decide whether a configuration should be compiled in chunks.
///
/// Zero or one sources never chunk; an explicit toggle wins; otherwise the
/// source-count strategy chunks whenever there is more than one source.
pub fn should_enable_chunking(config: &CompilerConfiguration, options: &ChunkingOptions) -> bool {
    if config.sources.len() <= 1 {
        return false;
    }
    match options.enabled {
        Some(false) => false,
        Some(true) => {
            debug!("chunking explicitly enabled");
            true
        }
        None => {
            let enable = matches!(options.strategy, ChunkingStrategy::Source);
            if enable {
                debug!(sources = config.sources.len(), "chunking enabled by source count");
            }
            enable
        }
    }
}

/// Split a configuration into `ceil(source_count / max_parallel)` balanced
/// chunks.
///
/// Each chunk is a full, independent configuration carrying its source subset
/// plus the original list-level transformation/inclusion/exclusion settings.
pub fn split_into_chunks(
    config: &CompilerConfiguration,
    options: &ChunkingOptions,
) -> Vec<(CompilerConfiguration, ChunkMetadata)> {
    let sources = &config.sources;
    if sources.is_empty() {
        warn!("no sources to chunk");
        return Vec::new();
    }

    if options.strategy == ChunkingStrategy::LineCount {
        warn!("LineCount strategy not yet implemented, falling back to Source strategy");
    }

    let max_parallel = options.max_parallel.max(1);
    let total_chunks = sources.len().div_ceil(max_parallel);
    let per_chunk = sources.len().div_ceil(total_chunks);

    info!(
        chunks = total_chunks,
        sources_per_chunk = per_chunk,
        "splitting configuration into chunks"
    );

    let mut chunks = Vec::with_capacity(total_chunks);
    for i in 0..total_chunks {
        let start = i * per_chunk;
        let end = (start + per_chunk).min(sources.len());
        let chunk_sources: Vec<FilterSource> = sources[start..end].to_vec();

        let mut chunk_config = config.with_sources(chunk_sources.clone());
        chunk_config.name = format!("{} (chunk {}/{})", config.name, i + 1, total_chunks);

        chunks.push((
            chunk_config,
            ChunkMetadata::new(i, total_chunks, chunk_sources),
        ));
    }
    chunks
}

/// Merge compiled rule lines from multiple chunks.
///
/// Chunk outputs are concatenated in the order given, then non-comment rule
/// lines are deduplicated preserving first-seen order. Blank lines and lines
/// starting with `!` or `#` are always retained verbatim and never counted as
/// duplicates.
///
/// Returns the merged lines and the number of duplicates removed.
pub fn merge_chunks(chunk_results: &[Vec<String>]) -> (Vec<String>, usize) {
    let total: usize = chunk_results.iter().map(|c| c.len()).sum();
    let mut seen = std::collections::HashSet::new();
    let mut merged = Vec::with_capacity(total);

    for rule in chunk_results.iter().flatten() {
        let trimmed = rule.trim();
        if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('#') {
            merged.push(rule.clone());
            continue;
        }
        if seen.insert(rule.clone()) {
            merged.push(rule.clone());
        }
    }

    let duplicates_removed = total - merged.len();
    debug!(
        merged = merged.len(),
        duplicates_removed, "merged chunk outputs"
    );
    (merged, duplicates_removed)
}

/// Coarse speedup estimate for reporting: `min(chunk_count, max_parallel)`.
/// Never used for correctness decisions.
pub fn estimate_speedup(total_rules: usize, options: &ChunkingOptions) -> f64 {
    if total_rules == 0 || options.enabled == Some(false) {
        return 1.0;
    }
    let num_chunks = total_rules.div_ceil(options.chunk_size.max(1));
    num_chunks.min(options.max_parallel) as f64
}

enum BatchOutcome {
    Spawned {
        index: usize,
        total: usize,
        handle: JoinHandle<(Vec<String>, ChunkMetadata)>,
    },
    Skipped(ChunkMetadata),
}

/// Compile chunks in bounded-parallel batches and merge the outputs.
///
/// Within a batch all chunk compiles run concurrently; the whole batch is
/// joined before the next batch starts, so at most `max_parallel` compiler
/// subprocesses exist at any time. A failed chunk never aborts its siblings;
/// its error is recorded in the chunk metadata and the result error list.
///
/// Failure semantics: the result is successful iff at least one chunk
/// succeeded. On partial failure the succeeding chunks' output is still
/// merged - a partial filter list is more useful than none.
pub async fn compile_chunks(
    chunks: Vec<(CompilerConfiguration, ChunkMetadata)>,
    compiler: Arc<dyn RuleCompiler>,
    options: &ChunkingOptions,
    events: &EventDispatcher,
    verbose: bool,
    cancel: CancellationToken,
) -> Result<ChunkedCompilationResult> {
    let start = Instant::now();
    let mut result = ChunkedCompilationResult::default();
    let mut chunk_outputs: Vec<Vec<String>> = Vec::new();

    let max_parallel = options.max_parallel.max(1);
    let chunk_count = chunks.len();
    let total_batches = chunk_count.div_ceil(max_parallel);
    info!(
        chunks = chunk_count,
        max_parallel, "compiling chunks in parallel batches"
    );

    let mut iter = chunks.into_iter().peekable();
    let mut batch_number = 0;
    while iter.peek().is_some() {
        batch_number += 1;
        if cancel.is_cancelled() {
            return Err(CompilerError::Cancelled(
                "chunked compilation cancelled".to_string(),
            ));
        }

        let batch: Vec<_> = iter.by_ref().take(max_parallel).collect();
        debug!(batch = batch_number, total_batches, size = batch.len(), "processing batch");

        let mut outcomes = Vec::with_capacity(batch.len());
        for (config, mut metadata) in batch {
            let args = ChunkStartedArgs {
                timestamp: Utc::now(),
                chunk_index: metadata.index,
                total_chunks: metadata.total,
                source_count: metadata.sources.len(),
                estimated_rules: metadata.estimated_rules,
            };
            match events.raise_chunk_started(&args).await? {
                EventDecision::Continue => {
                    let index = metadata.index;
                    let total = metadata.total;
                    let handle = tokio::spawn(compile_single_chunk(
                        config,
                        metadata,
                        compiler.clone(),
                        verbose,
                        cancel.clone(),
                    ));
                    outcomes.push(BatchOutcome::Spawned { index, total, handle });
                }
                EventDecision::Skip { reason } => {
                    info!(chunk = metadata.index, %reason, "chunk skipped by handler");
                    metadata.success = false;
                    metadata.elapsed_ms = Some(0);
                    metadata.error_message = Some(format!("skipped: {reason}"));
                    outcomes.push(BatchOutcome::Skipped(metadata));
                }
                EventDecision::Abort { reason } => {
                    return Err(CompilerError::Cancelled(reason));
                }
            }
        }

        // Join in spawn order; together with sequential batches this keeps
        // result.chunks and chunk_outputs in chunk-index order.
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Skipped(metadata) => result.chunks.push(metadata),
                BatchOutcome::Spawned { index, total, handle } => match handle.await {
                    Ok((rules, metadata)) => {
                        events
                            .raise_chunk_completed(&ChunkCompletedArgs {
                                timestamp: Utc::now(),
                                chunk_index: metadata.index,
                                total_chunks: metadata.total,
                                success: metadata.success,
                                error_message: metadata.error_message.clone(),
                                rule_count: rules.len(),
                                duration_ms: metadata.elapsed_ms.unwrap_or(0),
                            })
                            .await;
                        if metadata.success && !rules.is_empty() {
                            chunk_outputs.push(rules);
                        }
                        if !metadata.success {
                            if let Some(error) = &metadata.error_message {
                                result
                                    .errors
                                    .push(format!("Chunk {}: {}", metadata.index + 1, error));
                            }
                        }
                        result.chunks.push(metadata);
                    }
                    Err(join_error) => {
                        let message = format!("chunk task failed: {join_error}");
                        warn!(chunk = index, "{message}");
                        events
                            .raise_chunk_completed(&ChunkCompletedArgs {
                                timestamp: Utc::now(),
                                chunk_index: index,
                                total_chunks: total,
                                success: false,
                                error_message: Some(message.clone()),
                                rule_count: 0,
                                duration_ms: 0,
                            })
                            .await;
                        result.errors.push(format!("Chunk {}: {}", index + 1, message));
                        result.chunks.push(ChunkMetadata {
                            index,
                            total,
                            success: false,
                            error_message: Some(message),
                            ..Default::default()
                        });
                    }
                },
            }
        }
    }

    if !chunk_outputs.is_empty() {
        let total_before: usize = chunk_outputs.iter().map(|c| c.len()).sum();
        let merging = ChunksMergingArgs {
            timestamp: Utc::now(),
            chunk_count: chunk_outputs.len(),
            total_rules_before_merge: total_before,
        };
        match events.raise_chunks_merging(&merging).await? {
            EventDecision::Continue => {}
            EventDecision::Skip { reason } | EventDecision::Abort { reason } => {
                return Err(CompilerError::Cancelled(reason));
            }
        }

        let merge_start = Instant::now();
        let (merged, duplicates_removed) = merge_chunks(&chunk_outputs);
        result.final_rule_count = merged.len();
        result.duplicates_removed = duplicates_removed;
        result.merged_rules = merged;

        events
            .raise_chunks_merged(&ChunksMergedArgs {
                timestamp: Utc::now(),
                chunk_count: chunk_outputs.len(),
                total_rules_before_merge: total_before,
                final_rule_count: result.final_rule_count,
                duplicates_removed,
                duration_ms: merge_start.elapsed().as_millis() as u64,
            })
            .await;
    }

    result.total_rules = result
        .chunks
        .iter()
        .filter_map(|c| c.actual_rules)
        .sum();
    result.total_elapsed_ms = start.elapsed().as_millis() as u64;
    result.success = result.chunks.iter().any(|c| c.success);

    info!(
        rules = result.final_rule_count,
        duplicates_removed = result.duplicates_removed,
        elapsed_ms = result.total_elapsed_ms,
        success = result.success,
        "chunked compilation complete"
    );
    let speedup = result.measured_speedup();
    if speedup > 1.0 {
        info!(speedup = format!("{speedup:.2}x"), "parallel speedup");
    }

    Ok(result)
}

/// Compile one chunk, capturing any failure in its metadata.
async fn compile_single_chunk(
    config: CompilerConfiguration,
    mut metadata: ChunkMetadata,
    compiler: Arc<dyn RuleCompiler>,
    verbose: bool,
    cancel: CancellationToken,
) -> (Vec<String>, ChunkMetadata) {
    let start = Instant::now();
    debug!(
        chunk = metadata.index + 1,
        total = metadata.total,
        name = %config.name,
        "starting chunk"
    );

    match run_chunk(&config, compiler, verbose, cancel).await {
        Ok(rules) => {
            metadata.success = true;
            metadata.elapsed_ms = Some(start.elapsed().as_millis() as u64);
            metadata.actual_rules = Some(rules.len());
            info!(
                chunk = metadata.index + 1,
                total = metadata.total,
                rules = rules.len(),
                elapsed_ms = metadata.elapsed_ms.unwrap_or(0),
                "chunk complete"
            );
            (rules, metadata)
        }
        Err(e) => {
            metadata.success = false;
            metadata.elapsed_ms = Some(start.elapsed().as_millis() as u64);
            metadata.error_message = Some(e.to_string());
            warn!(
                chunk = metadata.index + 1,
                total = metadata.total,
                error = %e,
                "chunk failed"
            );
            (Vec::new(), metadata)
        }
    }
}

/// Invoke the external compiler for one chunk through isolated temp files.
///
/// Both temp files are removed when their guards drop, on every exit path
/// including error and cancellation.
async fn run_chunk(
    config: &CompilerConfiguration,
    compiler: Arc<dyn RuleCompiler>,
    verbose: bool,
    cancel: CancellationToken,
) -> Result<Vec<String>> {
    let config_file = tempfile::Builder::new()
        .prefix("chunk-config-")
        .suffix(".json")
        .tempfile()?;
    let output_file = tempfile::Builder::new()
        .prefix("chunk-output-")
        .suffix(".txt")
        .tempfile()?;

    tokio::fs::write(config_file.path(), config.to_json()?).await?;

    compiler
        .compile(config_file.path(), output_file.path(), verbose, &cancel)
        .await?;

    let content = tokio::fs::read_to_string(output_file.path()).await?;
    Ok(content.lines().map(str::to_string).collect())
}
