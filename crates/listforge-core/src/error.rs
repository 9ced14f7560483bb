// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for listforge-core.
//!
//! Provides a unified error type with stable error codes. The orchestration
//! entry point never surfaces these to callers directly - they are translated
//! into a failed [`CompilerResult`](crate::compiler::CompilerResult) at the
//! pipeline boundary.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lock::LockError;

/// Result type using CompilerError
pub type Result<T> = std::result::Result<T, CompilerError>;

/// Errors that can occur while orchestrating a compilation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CompilerError {
    /// Configuration file does not exist.
    #[error("Configuration file not found: {0:?}")]
    ConfigNotFound(PathBuf),

    /// Configuration file has an unrecognized extension.
    #[error("Unknown configuration file extension '{extension}'. Supported: .json, .yaml, .yml, .toml")]
    UnknownExtension {
        /// The offending extension (including the leading dot, if any).
        extension: String,
    },

    /// Configuration content failed to parse.
    #[error("Invalid {format} configuration: {message}")]
    Parse {
        /// Name of the format that failed to parse ("json", "yaml", "toml").
        format: &'static str,
        /// Parser diagnostic.
        message: String,
    },

    /// Configuration failed structural validation.
    #[error("Configuration validation failed:\n{0}")]
    Validation(String),

    /// The external compiler executable could not be located.
    #[error(
        "hostlist-compiler not found. Install with: npm install -g @adguard/hostlist-compiler"
    )]
    CompilerNotFound,

    /// The external compiler exited with a non-zero code.
    #[error("Compiler exited with code {exit_code}: {stderr}")]
    CompilationFailed {
        /// Exit code from the compiler process.
        exit_code: i32,
        /// Captured standard error output.
        stderr: String,
    },

    /// The compiler reported success but the output file is missing.
    #[error("Compiler finished but output file was not created: {0:?}")]
    OutputNotCreated(PathBuf),

    /// The compiler process exceeded its time budget.
    #[error("Compilation timed out after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled cooperatively.
    #[error("Compilation cancelled: {0}")]
    Cancelled(String),

    /// A file lock operation failed.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A pre-commitment event handler failed.
    #[error("Event handler '{handler}' failed during {event}: {message}")]
    Handler {
        /// Name of the failing handler.
        handler: String,
        /// Event being raised when the handler failed.
        event: &'static str,
        /// Underlying error message.
        message: String,
    },

    /// A plugin failed to load, register, or initialize.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CompilerError {
    /// Get the stable error code string for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::UnknownExtension { .. } => "UNKNOWN_EXTENSION",
            Self::Parse { .. } => "PARSE_ERROR",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::CompilerNotFound => "COMPILER_NOT_FOUND",
            Self::CompilationFailed { .. } => "COMPILATION_FAILED",
            Self::OutputNotCreated(_) => "OUTPUT_NOT_CREATED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled(_) => "CANCELLED",
            Self::Lock(_) => "LOCK_FAILED",
            Self::Handler { .. } => "HANDLER_FAILED",
            Self::Plugin(_) => "PLUGIN_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Whether the error is potentially recoverable by the user
    /// (missing files, missing tools, bad configuration).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_)
                | Self::UnknownExtension { .. }
                | Self::Validation(_)
                | Self::CompilerNotFound
        )
    }
}
