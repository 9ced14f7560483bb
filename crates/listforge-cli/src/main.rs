// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listforge CLI
//!
//! Compiles filter-list configurations through the orchestration core.
//!
//! ```text
//! listforge compile filters.yaml --output rules.txt --chunk
//! listforge validate filters.yaml --check-files
//! listforge info
//! ```

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use listforge_core::chunking::ChunkingOptions;
use listforge_core::compiler::{format_elapsed, version_info};
use listforge_core::config::ConfigurationFormat;
use listforge_core::events::ValidationSeverity;
use listforge_core::pipeline::CompileOptions;
use listforge_core::plugin::PluginRegistry;
use listforge_core::service::CompilerService;

#[derive(Parser)]
#[command(name = "listforge", version, about = "Filter-list compilation orchestrator")]
struct Cli {
    /// Enable verbose output (debug logging, --verbose to the compiler).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Json,
    Yaml,
    Toml,
}

impl From<FormatArg> for ConfigurationFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Json => ConfigurationFormat::Json,
            FormatArg::Yaml => ConfigurationFormat::Yaml,
            FormatArg::Toml => ConfigurationFormat::Toml,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a configuration into a filter-list artifact.
    Compile {
        /// Path to the configuration file (.json, .yaml, .yml, .toml).
        config: PathBuf,

        /// Output file path. Defaults to output/compiled-<timestamp>.txt
        /// next to the configuration.
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Force the configuration format instead of detecting it.
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Force chunked parallel compilation on.
        #[arg(long, conflicts_with = "no_chunk")]
        chunk: bool,

        /// Force chunked parallel compilation off.
        #[arg(long)]
        no_chunk: bool,

        /// Maximum concurrent compiler processes for chunked runs.
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Per-invocation compiler timeout in seconds.
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,

        /// Check that local source files exist before compiling.
        #[arg(long)]
        check_files: bool,

        /// Directory of plugin libraries to load before compiling.
        #[arg(long, env = "LISTFORGE_PLUGIN_DIR")]
        plugin_dir: Option<PathBuf>,
    },

    /// Validate a configuration without compiling it.
    Validate {
        /// Path to the configuration file.
        config: PathBuf,

        /// Force the configuration format instead of detecting it.
        #[arg(long, value_enum)]
        format: Option<FormatArg>,

        /// Also check that local source files exist.
        #[arg(long)]
        check_files: bool,
    },

    /// Show version information for listforge and its external tools.
    Info,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Commands::Compile {
            config,
            output,
            format,
            chunk,
            no_chunk,
            max_parallel,
            timeout_secs,
            check_files,
            plugin_dir,
        } => {
            run_compile(
                config,
                output,
                format.map(Into::into),
                chunk,
                no_chunk,
                max_parallel,
                timeout_secs,
                check_files,
                plugin_dir,
                cli.verbose,
            )
            .await
        }
        Commands::Validate {
            config,
            format,
            check_files,
        } => run_validate(config, format.map(Into::into), check_files).await,
        Commands::Info => run_info().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_compile(
    config: PathBuf,
    output: Option<PathBuf>,
    format: Option<ConfigurationFormat>,
    chunk: bool,
    no_chunk: bool,
    max_parallel: Option<usize>,
    timeout_secs: u64,
    check_files: bool,
    plugin_dir: Option<PathBuf>,
    verbose: bool,
) -> ExitCode {
    let plugins = Arc::new(PluginRegistry::new());
    if let Some(dir) = plugin_dir {
        match plugins.load_from_directory(&dir, None, false) {
            Ok(count) if count > 0 => eprintln!("Loaded {count} plugin(s) from {}", dir.display()),
            Ok(_) => {}
            Err(e) => {
                eprintln!("Error loading plugins from {}: {e}", dir.display());
                return ExitCode::FAILURE;
            }
        }
        if let Err(e) = plugins.initialize_all(false) {
            eprintln!("Error initializing plugins: {e}");
            return ExitCode::FAILURE;
        }
    }

    let service = CompilerService::builder().plugin_registry(plugins).build();

    let mut chunking = ChunkingOptions::default();
    if chunk {
        chunking.enabled = Some(true);
    } else if no_chunk {
        chunking.enabled = Some(false);
    }
    if let Some(max_parallel) = max_parallel {
        chunking.max_parallel = max_parallel.max(1);
    }

    let mut options = CompileOptions::new(&config);
    options.output_path = output;
    options.format = format;
    options.verbose = verbose;
    options.chunking = Some(chunking);
    options.timeout = Duration::from_secs(timeout_secs);
    options.check_source_files = check_files;

    let result = service.compile(options).await;

    if result.success {
        println!("Compiled '{}' successfully", result.config_name);
        println!("  Rules:   {}", result.rule_count);
        println!("  Output:  {}", result.output_path.display());
        println!("  SHA-256: {}...", result.hash_short(32));
        println!("  Elapsed: {}", result.elapsed_formatted());
        if let Some(chunks) = &result.chunks {
            let succeeded = chunks.iter().filter(|c| c.success).count();
            println!("  Chunks:  {succeeded}/{} succeeded", chunks.len());
            if let Some(duplicates) = result.duplicates_removed {
                println!("  Duplicates removed: {duplicates}");
            }
        }
        if let Some(message) = &result.error_message {
            // Partial success: some chunks failed but output was produced.
            eprintln!("Warning: {message}");
        }
        ExitCode::SUCCESS
    } else {
        eprintln!(
            "Compilation failed after {}: {}",
            format_elapsed(result.elapsed_ms),
            result.error_message.as_deref().unwrap_or("unknown error")
        );
        ExitCode::FAILURE
    }
}

async fn run_validate(
    config: PathBuf,
    format: Option<ConfigurationFormat>,
    check_files: bool,
) -> ExitCode {
    let service = CompilerService::builder().build();
    match service.validate(&config, format, check_files).await {
        Ok(findings) if findings.is_empty() => {
            println!("Configuration is valid");
            ExitCode::SUCCESS
        }
        Ok(findings) => {
            let mut fatal = false;
            for finding in &findings {
                let location = finding
                    .location
                    .as_deref()
                    .map(|l| format!(" ({l})"))
                    .unwrap_or_default();
                println!(
                    "{}: [{}] {}{location}",
                    finding.severity, finding.code, finding.message
                );
                fatal |= finding.severity >= ValidationSeverity::Error;
            }
            if fatal {
                ExitCode::FAILURE
            } else {
                println!("Configuration is valid (with warnings)");
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_info() -> ExitCode {
    let info = version_info().await;
    println!("listforge-core {}", info.core_version);
    match (&info.compiler_command, &info.compiler_version) {
        (Some(command), Some(version)) => println!("hostlist-compiler {version} ({command})"),
        (Some(command), None) => println!("hostlist-compiler via {command}"),
        _ => println!("hostlist-compiler not found"),
    }
    match &info.node_version {
        Some(version) => println!("node {version}"),
        None => println!("node not found"),
    }
    if !info.has_compiler() {
        eprintln!("Install the compiler with: npm install -g @adguard/hostlist-compiler");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
