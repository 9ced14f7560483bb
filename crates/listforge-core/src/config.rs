// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compiler configuration: data model, multi-format reading, validation.
//!
//! The external compiler only accepts JSON, so YAML and TOML configurations
//! are parsed here and translated to the JSON shape before invocation.
//! Validation produces [`ValidationFinding`]s rather than errors so the
//! validation checkpoint can decide what is fatal.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CompilerError, Result};
use crate::events::{ValidationFinding, ValidationSeverity};

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationFormat {
    /// JSON (`.json`) - the external compiler's native format.
    Json,
    /// YAML (`.yaml`, `.yml`).
    Yaml,
    /// TOML (`.toml`).
    Toml,
}

impl ConfigurationFormat {
    /// Lowercase format name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        }
    }

    /// Detect the format from a file extension.
    pub fn detect(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            _ => Err(CompilerError::UnknownExtension {
                extension: if extension.is_empty() {
                    String::new()
                } else {
                    format!(".{extension}")
                },
            }),
        }
    }
}

impl std::fmt::Display for ConfigurationFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supported filter source syntaxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Ad-block filter syntax.
    Adblock,
    /// Hosts-file syntax.
    Hosts,
}

impl SourceKind {
    /// Parse a source type string (case-insensitive, accepts short aliases).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "adblock" | "adb" => Some(Self::Adblock),
            "hosts" | "host" => Some(Self::Hosts),
            _ => None,
        }
    }
}

/// Transformations understood by the external compiler.
///
/// Used only for validating configuration values; the transformation
/// semantics live entirely in the external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformation {
    /// Strip comment lines.
    RemoveComments,
    /// Convert hosts rules to compact adblock rules.
    Compress,
    /// Strip rule modifiers.
    RemoveModifiers,
    /// Drop rules that fail syntax validation.
    Validate,
    /// Like `Validate` but allowing IP addresses.
    ValidateAllowIp,
    /// Remove duplicate rules.
    Deduplicate,
    /// Invert allow rules.
    InvertAllow,
    /// Drop empty lines.
    RemoveEmptyLines,
    /// Trim surrounding whitespace.
    TrimLines,
    /// Ensure the output ends with a newline.
    InsertFinalNewLine,
    /// Convert rules to ASCII (punycode).
    ConvertToAscii,
}

impl Transformation {
    /// All transformations in canonical order.
    pub const ALL: [Transformation; 11] = [
        Self::RemoveComments,
        Self::Compress,
        Self::RemoveModifiers,
        Self::Validate,
        Self::ValidateAllowIp,
        Self::Deduplicate,
        Self::InvertAllow,
        Self::RemoveEmptyLines,
        Self::TrimLines,
        Self::InsertFinalNewLine,
        Self::ConvertToAscii,
    ];

    /// Canonical name as the external compiler spells it.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Self::RemoveComments => "RemoveComments",
            Self::Compress => "Compress",
            Self::RemoveModifiers => "RemoveModifiers",
            Self::Validate => "Validate",
            Self::ValidateAllowIp => "ValidateAllowIp",
            Self::Deduplicate => "Deduplicate",
            Self::InvertAllow => "InvertAllow",
            Self::RemoveEmptyLines => "RemoveEmptyLines",
            Self::TrimLines => "TrimLines",
            Self::InsertFinalNewLine => "InsertFinalNewLine",
            Self::ConvertToAscii => "ConvertToAscii",
        }
    }

    /// Parse a transformation name (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.canonical_name().to_ascii_lowercase() == normalized)
    }

    /// Names from `values` that are not valid transformations.
    pub fn invalid_names(values: &[String]) -> Vec<String> {
        values
            .iter()
            .filter(|v| Self::parse(v).is_none())
            .cloned()
            .collect()
    }

    /// Recommended transformation set for typical compilations.
    pub fn recommended() -> Vec<Transformation> {
        vec![
            Self::Validate,
            Self::Deduplicate,
            Self::RemoveEmptyLines,
            Self::TrimLines,
            Self::InsertFinalNewLine,
        ]
    }

    /// Minimal set that preserves original content.
    pub fn minimal() -> Vec<Transformation> {
        vec![Self::Deduplicate, Self::InsertFinalNewLine]
    }
}

fn default_source_type() -> String {
    "adblock".to_string()
}

fn is_default_source_type(value: &str) -> bool {
    value == "adblock"
}

/// One source filter list to compile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSource {
    /// Display name of the source.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Source locator: a local path or an HTTP(S) URL.
    pub source: String,
    /// Source syntax (`adblock` or `hosts`).
    #[serde(
        rename = "type",
        default = "default_source_type",
        skip_serializing_if = "is_default_source_type"
    )]
    pub source_type: String,
    /// Per-source transformations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformations: Vec<String>,
    /// Per-source inclusion patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inclusions: Vec<String>,
    /// Per-source exclusion patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<String>,
}

impl FilterSource {
    /// Create a source from a locator.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            source: source.into(),
            source_type: default_source_type(),
            transformations: Vec::new(),
            inclusions: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    /// Whether the locator is an HTTP(S) URL.
    pub fn is_url(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }

    /// Whether the locator is a local file path.
    pub fn is_local(&self) -> bool {
        !self.is_url()
    }

    /// Parsed source kind, if the type string is valid.
    pub fn kind(&self) -> Option<SourceKind> {
        SourceKind::parse(&self.source_type)
    }
}

/// Declarative build specification for the external compiler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilerConfiguration {
    /// Name of the compiled list.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Homepage URL embedded in the output header.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    /// License string embedded in the output header.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    /// Version string embedded in the output header.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Sources to compile.
    #[serde(default)]
    pub sources: Vec<FilterSource>,
    /// List-level transformations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformations: Vec<String>,
    /// List-level inclusion patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inclusions: Vec<String>,
    /// List-level exclusion patterns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<String>,

    /// Format the configuration was read from. Not serialized.
    #[serde(skip)]
    pub source_format: Option<ConfigurationFormat>,
    /// Path the configuration was read from. Not serialized.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl CompilerConfiguration {
    /// Clone of this configuration carrying only `sources`.
    ///
    /// List-level transformations, inclusions, and exclusions are preserved;
    /// read-from metadata is not (the derived value is never re-serialized
    /// back to its origin).
    pub fn with_sources(&self, sources: Vec<FilterSource>) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            homepage: self.homepage.clone(),
            license: self.license.clone(),
            version: self.version.clone(),
            sources,
            transformations: self.transformations.clone(),
            inclusions: self.inclusions.clone(),
            exclusions: self.exclusions.clone(),
            source_format: None,
            source_path: None,
        }
    }

    /// Number of local file sources.
    pub fn local_sources_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_local()).count()
    }

    /// Number of remote URL sources.
    pub fn remote_sources_count(&self) -> usize {
        self.sources.iter().filter(|s| s.is_url()).count()
    }

    /// Resolve a local source locator relative to the configuration file.
    pub fn resolve_source_path(&self, source: &FilterSource) -> PathBuf {
        let raw = PathBuf::from(&source.source);
        if raw.is_absolute() {
            return raw;
        }
        match self.source_path.as_ref().and_then(|p| p.parent()) {
            Some(dir) => dir.join(raw),
            None => raw,
        }
    }

    /// Structurally validate the configuration.
    ///
    /// When `check_files` is set, local source locators are also checked for
    /// existence (resolved relative to the configuration file) - missing
    /// files are warnings, since the external tool may still be able to
    /// resolve them differently.
    pub fn validate(&self, check_files: bool) -> Vec<ValidationFinding> {
        let mut findings = Vec::new();

        if self.name.trim().is_empty() {
            findings.push(ValidationFinding::error(
                "CONFIG_NAME_MISSING",
                "Configuration 'name' is required",
            ));
        }

        if self.sources.is_empty() {
            findings.push(ValidationFinding::error(
                "CONFIG_NO_SOURCES",
                "At least one source is required",
            ));
        }

        for (i, source) in self.sources.iter().enumerate() {
            let location = format!("sources[{i}]");
            let display = if source.name.is_empty() {
                location.clone()
            } else {
                source.name.clone()
            };

            if source.source.trim().is_empty() {
                findings.push(
                    ValidationFinding::error(
                        "SOURCE_LOCATOR_MISSING",
                        format!("Source '{display}' is missing its 'source' field"),
                    )
                    .at(location.clone()),
                );
            }

            if source.kind().is_none() {
                findings.push(
                    ValidationFinding::error(
                        "SOURCE_TYPE_INVALID",
                        format!(
                            "Source '{display}' has invalid type '{}'. Valid types: adblock, hosts",
                            source.source_type
                        ),
                    )
                    .at(location.clone()),
                );
            }

            let invalid = Transformation::invalid_names(&source.transformations);
            if !invalid.is_empty() {
                findings.push(
                    ValidationFinding::warning(
                        "TRANSFORMATION_UNKNOWN",
                        format!(
                            "Source '{display}' has unknown transformations: {}",
                            invalid.join(", ")
                        ),
                    )
                    .at(location.clone()),
                );
            }

            if check_files && source.is_local() && !source.source.trim().is_empty() {
                let resolved = self.resolve_source_path(source);
                if !resolved.exists() {
                    findings.push(
                        ValidationFinding::warning(
                            "SOURCE_FILE_MISSING",
                            format!("Source file for '{display}' not found: {resolved:?}"),
                        )
                        .at(location.clone()),
                    );
                }
            }

            validate_patterns(
                source.inclusions.iter().chain(&source.exclusions),
                Some(&location),
                &mut findings,
            );
        }

        let invalid = Transformation::invalid_names(&self.transformations);
        if !invalid.is_empty() {
            findings.push(ValidationFinding::warning(
                "TRANSFORMATION_UNKNOWN",
                format!("Unknown list-level transformations: {}", invalid.join(", ")),
            ));
        }

        validate_patterns(
            self.inclusions.iter().chain(&self.exclusions),
            None,
            &mut findings,
        );

        findings
    }

    /// Serialize to the pretty-printed JSON shape the external tool accepts.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Check `/pattern/` style inclusion/exclusion entries for regex validity.
fn validate_patterns<'a>(
    patterns: impl Iterator<Item = &'a String>,
    location: Option<&str>,
    findings: &mut Vec<ValidationFinding>,
) {
    for pattern in patterns {
        if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let inner = &pattern[1..pattern.len() - 1];
            if let Err(e) = regex::Regex::new(inner) {
                let mut finding = ValidationFinding::warning(
                    "PATTERN_INVALID",
                    format!("Invalid regex pattern '{pattern}': {e}"),
                );
                if let Some(loc) = location {
                    finding = finding.at(loc);
                }
                findings.push(finding);
            }
        }
    }
}

/// Whether any finding is fatal (error severity or above).
pub fn findings_are_fatal(findings: &[ValidationFinding]) -> bool {
    findings
        .iter()
        .any(|f| f.severity >= ValidationSeverity::Error)
}

/// Read and parse a configuration file.
///
/// The format is taken from `format` when given, otherwise detected from the
/// file extension.
pub async fn read_configuration(
    path: &Path,
    format: Option<ConfigurationFormat>,
) -> Result<CompilerConfiguration> {
    if !path.exists() {
        return Err(CompilerError::ConfigNotFound(path.to_path_buf()));
    }

    let format = match format {
        Some(format) => format,
        None => ConfigurationFormat::detect(path)?,
    };
    let content = tokio::fs::read_to_string(path).await?;
    let mut config = parse_configuration(&content, format)?;
    config.source_format = Some(format);
    config.source_path = Some(path.to_path_buf());
    Ok(config)
}

/// Parse configuration content in a known format.
pub fn parse_configuration(
    content: &str,
    format: ConfigurationFormat,
) -> Result<CompilerConfiguration> {
    match format {
        ConfigurationFormat::Json => {
            serde_json::from_str(content).map_err(|e| CompilerError::Parse {
                format: "json",
                message: e.to_string(),
            })
        }
        ConfigurationFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| CompilerError::Parse {
                format: "yaml",
                message: e.to_string(),
            })
        }
        ConfigurationFormat::Toml => toml::from_str(content).map_err(|e| CompilerError::Parse {
            format: "toml",
            message: e.to_string(),
        }),
    }
}
