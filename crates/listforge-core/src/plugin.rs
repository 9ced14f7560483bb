// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Plugin capabilities and registry.
//!
//! Optional behavior - rule transformers, rule validators, configuration
//! format parsers, output destination writers - is provided by plugins so the
//! pipeline never hard-codes them. Plugins are registered programmatically or
//! discovered from dynamic libraries (`.so`/`.dylib`/`.dll`) exporting a
//! [`PluginDeclaration`] under the `LISTFORGE_PLUGIN` symbol.
//!
//! Disabling a plugin is not unregistering it: a disabled plugin stays in the
//! registry and is merely excluded from capability queries until re-enabled.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use libloading::Library;
use tracing::{debug, info, warn};

use crate::config::CompilerConfiguration;
use crate::error::{CompilerError, Result};
use crate::events::ValidationFinding;

/// ABI version for dynamically loaded plugins. Bumped on any breaking change
/// to [`PluginDeclaration`] or the capability traits.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Transforms the final rule list before it is written.
pub trait RuleTransformer: Send + Sync {
    /// Execution order among transformer plugins; lower runs first.
    fn execution_order(&self) -> i32 {
        0
    }

    /// Transform the rule lines.
    fn transform(&self, rules: Vec<String>) -> Result<Vec<String>>;
}

/// Validates the final rule list, producing findings for the output
/// validation checkpoint.
pub trait RuleValidator: Send + Sync {
    /// Validate the rule lines.
    fn validate(&self, rules: &[String]) -> Vec<ValidationFinding>;
}

/// Parses additional configuration formats.
pub trait ConfigFormatParser: Send + Sync {
    /// File extensions (without dot, lowercase) this parser handles.
    fn extensions(&self) -> &[&str];

    /// Parse configuration content.
    fn parse(&self, content: &str) -> Result<CompilerConfiguration>;
}

/// Writes the output artifact to an additional destination.
#[async_trait]
pub trait OutputWriter: Send + Sync {
    /// Write the compiled rules. `output_path` is the primary artifact.
    async fn write(&self, output_path: &Path, rules: &[String]) -> Result<()>;
}

/// A pluggable capability bundle.
///
/// Implementations advertise the capabilities they provide by overriding the
/// matching `as_*` accessor.
pub trait Plugin: Send + Sync {
    /// Stable unique id used for registration and lookup.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str {
        self.id()
    }

    /// Semantic version of the plugin.
    fn version(&self) -> &str {
        "0.0.0"
    }

    /// One-time initialization hook, called by
    /// [`PluginRegistry::initialize_all`].
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Rule transformer capability, if provided.
    fn as_rule_transformer(&self) -> Option<&dyn RuleTransformer> {
        None
    }

    /// Rule validator capability, if provided.
    fn as_rule_validator(&self) -> Option<&dyn RuleValidator> {
        None
    }

    /// Configuration format parser capability, if provided.
    fn as_config_format_parser(&self) -> Option<&dyn ConfigFormatParser> {
        None
    }

    /// Output writer capability, if provided.
    fn as_output_writer(&self) -> Option<&dyn OutputWriter> {
        None
    }
}

/// Declaration exported by a plugin dynamic library under the
/// `LISTFORGE_PLUGIN` symbol.
#[repr(C)]
pub struct PluginDeclaration {
    /// Must equal [`PLUGIN_ABI_VERSION`] of the host.
    pub abi_version: u32,
    /// Registration entry point; called once with the host registry.
    pub register: unsafe extern "C" fn(&PluginRegistry),
}

/// Export a [`PluginDeclaration`] from a plugin crate.
///
/// The argument is a `fn(&PluginRegistry)` that registers the crate's
/// plugins:
///
/// ```ignore
/// fn register(registry: &listforge_core::plugin::PluginRegistry) {
///     registry.register(std::sync::Arc::new(MyTransformer::default()));
/// }
///
/// listforge_core::export_plugin!(register);
/// ```
#[macro_export]
macro_rules! export_plugin {
    ($register:path) => {
        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub static LISTFORGE_PLUGIN: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                abi_version: $crate::plugin::PLUGIN_ABI_VERSION,
                register: {
                    unsafe extern "C" fn __listforge_register(
                        registry: &$crate::plugin::PluginRegistry,
                    ) {
                        $register(registry)
                    }
                    __listforge_register
                },
            };
    };
}

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
    initialized: bool,
}

/// Holds registered plugins and answers capability queries.
///
/// Queries return only enabled plugins. Enable/disable toggles are live: they
/// affect subsequent queries (and therefore subsequent pipeline runs), never
/// work already in flight.
#[derive(Default)]
pub struct PluginRegistry {
    entries: Mutex<Vec<PluginEntry>>,
    // Loaded plugin libraries must outlive every plugin they provide.
    libraries: Mutex<Vec<Library>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin, enabled by default.
    ///
    /// A duplicate id is rejected and logged, not an error: returns `false`.
    pub fn register(&self, plugin: Arc<dyn Plugin>) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.plugin.id() == plugin.id()) {
            warn!(id = plugin.id(), "duplicate plugin id rejected");
            return false;
        }
        debug!(id = plugin.id(), version = plugin.version(), "plugin registered");
        entries.push(PluginEntry {
            plugin,
            enabled: true,
            initialized: false,
        });
        true
    }

    /// Remove a plugin by id. Returns `false` if the id is unknown.
    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.plugin.id() != id);
        before != entries.len()
    }

    /// Enable or disable a plugin. Returns `false` if the id is unknown.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.iter_mut().find(|e| e.plugin.id() == id) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Whether a plugin id is registered (enabled or not).
    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.plugin.id() == id)
    }

    /// Whether a plugin is registered and enabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.plugin.id() == id && e.enabled)
    }

    /// Number of registered plugins (enabled or not).
    pub fn plugin_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Look up a plugin by id.
    pub fn plugin(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.plugin.id() == id)
            .map(|e| e.plugin.clone())
    }

    fn enabled_plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.enabled)
            .map(|e| e.plugin.clone())
            .collect()
    }

    /// Enabled plugins providing the rule transformer capability, sorted by
    /// their declared execution order.
    pub fn rule_transformers(&self) -> Vec<Arc<dyn Plugin>> {
        let mut plugins: Vec<Arc<dyn Plugin>> = self
            .enabled_plugins()
            .into_iter()
            .filter(|p| p.as_rule_transformer().is_some())
            .collect();
        plugins.sort_by_key(|p| {
            p.as_rule_transformer()
                .map(|t| t.execution_order())
                .unwrap_or(0)
        });
        plugins
    }

    /// Enabled plugins providing the rule validator capability.
    pub fn rule_validators(&self) -> Vec<Arc<dyn Plugin>> {
        self.enabled_plugins()
            .into_iter()
            .filter(|p| p.as_rule_validator().is_some())
            .collect()
    }

    /// Enabled plugins providing the configuration format parser capability.
    pub fn config_format_parsers(&self) -> Vec<Arc<dyn Plugin>> {
        self.enabled_plugins()
            .into_iter()
            .filter(|p| p.as_config_format_parser().is_some())
            .collect()
    }

    /// Enabled plugins providing the output writer capability.
    pub fn output_writers(&self) -> Vec<Arc<dyn Plugin>> {
        self.enabled_plugins()
            .into_iter()
            .filter(|p| p.as_output_writer().is_some())
            .collect()
    }

    /// Enabled format parser handling `extension` (without dot), if any.
    pub fn parser_for_extension(&self, extension: &str) -> Option<Arc<dyn Plugin>> {
        let extension = extension.to_ascii_lowercase();
        self.config_format_parsers().into_iter().find(|p| {
            p.as_config_format_parser()
                .is_some_and(|parser| parser.extensions().contains(&extension.as_str()))
        })
    }

    /// Call each enabled, not-yet-initialized plugin's init hook once.
    ///
    /// Failures are logged and skipped unless `fail_fast` is set. Returns the
    /// number of plugins initialized.
    pub fn initialize_all(&self, fail_fast: bool) -> Result<usize> {
        let pending: Vec<Arc<dyn Plugin>> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.enabled && !e.initialized)
            .map(|e| e.plugin.clone())
            .collect();

        let mut initialized = 0;
        for plugin in pending {
            match plugin.initialize() {
                Ok(()) => {
                    let mut entries = self.entries.lock().unwrap();
                    if let Some(entry) =
                        entries.iter_mut().find(|e| e.plugin.id() == plugin.id())
                    {
                        entry.initialized = true;
                    }
                    initialized += 1;
                }
                Err(e) => {
                    warn!(id = plugin.id(), error = %e, "plugin initialization failed");
                    if fail_fast {
                        return Err(CompilerError::Plugin(format!(
                            "plugin '{}' failed to initialize: {e}",
                            plugin.id()
                        )));
                    }
                }
            }
        }
        Ok(initialized)
    }

    /// Load plugins from a dynamic library.
    ///
    /// The library must export a `LISTFORGE_PLUGIN` [`PluginDeclaration`]
    /// (see [`export_plugin!`](crate::export_plugin)). Its registration entry
    /// point is called with this registry, and the library is kept loaded for
    /// the registry's lifetime. Returns the number of plugins registered.
    ///
    /// # Safety
    ///
    /// Loading a dynamic library executes arbitrary code; only load plugin
    /// binaries you trust. This method is safe to call because the unsafety
    /// is inherent to dynamic loading, not to this API's usage.
    pub fn load_from_library(&self, path: &Path) -> Result<usize> {
        let library = unsafe { Library::new(path) }.map_err(|e| {
            CompilerError::Plugin(format!("failed to load plugin library {path:?}: {e}"))
        })?;

        let declaration: &PluginDeclaration = unsafe {
            let symbol = library
                .get::<*const PluginDeclaration>(b"LISTFORGE_PLUGIN\0")
                .map_err(|e| {
                    CompilerError::Plugin(format!(
                        "plugin {path:?} is missing the LISTFORGE_PLUGIN symbol \
                         (did it use export_plugin!?): {e}"
                    ))
                })?;
            &**symbol
        };

        if declaration.abi_version != PLUGIN_ABI_VERSION {
            return Err(CompilerError::Plugin(format!(
                "ABI version mismatch for {path:?}: plugin has v{}, host expects v{}",
                declaration.abi_version, PLUGIN_ABI_VERSION
            )));
        }

        let before = self.plugin_count();
        unsafe { (declaration.register)(self) };
        let registered = self.plugin_count() - before;

        // Dropping the library would unload plugin code out from under the
        // registered Arc<dyn Plugin> instances.
        self.libraries.lock().unwrap().push(library);

        info!(path = ?path, registered, "loaded plugin library");
        Ok(registered)
    }

    /// Load all plugin libraries from a directory.
    ///
    /// Files with the platform's dynamic-library extension are considered;
    /// `pattern`, when given, additionally filters by filename substring.
    /// Per-file failures are logged and skipped unless `fail_fast` is set.
    /// Returns the total number of plugins registered.
    pub fn load_from_directory(
        &self,
        dir: &Path,
        pattern: Option<&str>,
        fail_fast: bool,
    ) -> Result<usize> {
        let mut total = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !is_plugin_library(&path) {
                continue;
            }
            if let Some(pattern) = pattern {
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(pattern));
                if !matches {
                    continue;
                }
            }
            match self.load_from_library(&path) {
                Ok(count) => total += count,
                Err(e) => {
                    warn!(path = ?path, error = %e, "skipping plugin library");
                    if fail_fast {
                        return Err(e);
                    }
                }
            }
        }
        Ok(total)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugin_count())
            .field("libraries", &self.libraries.lock().unwrap().len())
            .finish()
    }
}

/// Whether a path looks like a dynamic library for the current platform.
fn is_plugin_library(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some("dylib") => cfg!(target_os = "macos"),
        Some("so") => cfg!(target_os = "linux"),
        Some("dll") => cfg!(target_os = "windows"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ValidationSeverity;

    struct SortTransformer {
        id: &'static str,
        order: i32,
    }

    impl RuleTransformer for SortTransformer {
        fn execution_order(&self) -> i32 {
            self.order
        }

        fn transform(&self, mut rules: Vec<String>) -> Result<Vec<String>> {
            rules.sort();
            Ok(rules)
        }
    }

    impl Plugin for SortTransformer {
        fn id(&self) -> &str {
            self.id
        }

        fn as_rule_transformer(&self) -> Option<&dyn RuleTransformer> {
            Some(self)
        }
    }

    struct LengthValidator;

    impl RuleValidator for LengthValidator {
        fn validate(&self, rules: &[String]) -> Vec<ValidationFinding> {
            rules
                .iter()
                .filter(|r| r.len() > 80)
                .map(|r| {
                    ValidationFinding::warning("RULE_TOO_LONG", format!("rule too long: {r}"))
                })
                .collect()
        }
    }

    impl Plugin for LengthValidator {
        fn id(&self) -> &str {
            "length-validator"
        }

        fn as_rule_validator(&self) -> Option<&dyn RuleValidator> {
            Some(self)
        }
    }

    struct IniParser;

    impl ConfigFormatParser for IniParser {
        fn extensions(&self) -> &[&str] {
            &["ini", "cfg"]
        }

        fn parse(&self, _content: &str) -> Result<CompilerConfiguration> {
            Ok(CompilerConfiguration {
                name: "from ini".to_string(),
                ..Default::default()
            })
        }
    }

    impl Plugin for IniParser {
        fn id(&self) -> &str {
            "ini-parser"
        }

        fn as_config_format_parser(&self) -> Option<&dyn ConfigFormatParser> {
            Some(self)
        }
    }

    struct FailingInit;

    impl Plugin for FailingInit {
        fn id(&self) -> &str {
            "failing-init"
        }

        fn initialize(&self) -> Result<()> {
            Err(CompilerError::Plugin("init exploded".to_string()))
        }
    }

    #[test]
    fn test_register_and_duplicate_rejection() {
        let registry = PluginRegistry::new();
        assert!(registry.register(Arc::new(SortTransformer { id: "sort", order: 0 })));
        assert!(!registry.register(Arc::new(SortTransformer { id: "sort", order: 5 })));
        assert_eq!(registry.plugin_count(), 1);
        assert!(registry.contains("sort"));
    }

    #[test]
    fn test_unregister() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(LengthValidator));
        assert!(registry.unregister("length-validator"));
        assert!(!registry.unregister("length-validator"));
        assert!(!registry.contains("length-validator"));
    }

    #[test]
    fn test_disabled_plugin_excluded_from_queries_but_still_registered() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(LengthValidator));
        assert_eq!(registry.rule_validators().len(), 1);

        assert!(registry.set_enabled("length-validator", false));
        assert!(registry.rule_validators().is_empty());
        assert!(registry.contains("length-validator"));
        assert!(!registry.is_enabled("length-validator"));

        assert!(registry.set_enabled("length-validator", true));
        assert_eq!(registry.rule_validators().len(), 1);
    }

    #[test]
    fn test_set_enabled_unknown_id() {
        let registry = PluginRegistry::new();
        assert!(!registry.set_enabled("ghost", false));
    }

    #[test]
    fn test_transformers_sorted_by_execution_order() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(SortTransformer { id: "late", order: 10 }));
        registry.register(Arc::new(SortTransformer { id: "early", order: -5 }));
        registry.register(Arc::new(SortTransformer { id: "middle", order: 0 }));

        let ids: Vec<String> = registry
            .rule_transformers()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["early", "middle", "late"]);
    }

    #[test]
    fn test_capability_filtering() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(SortTransformer { id: "sort", order: 0 }));
        registry.register(Arc::new(LengthValidator));
        registry.register(Arc::new(IniParser));

        assert_eq!(registry.rule_transformers().len(), 1);
        assert_eq!(registry.rule_validators().len(), 1);
        assert_eq!(registry.config_format_parsers().len(), 1);
        assert!(registry.output_writers().is_empty());
    }

    #[test]
    fn test_parser_for_extension() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(IniParser));

        assert!(registry.parser_for_extension("ini").is_some());
        assert!(registry.parser_for_extension("CFG").is_some());
        assert!(registry.parser_for_extension("xml").is_none());

        registry.set_enabled("ini-parser", false);
        assert!(registry.parser_for_extension("ini").is_none());
    }

    #[test]
    fn test_initialize_all_continues_past_failures() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(FailingInit));
        registry.register(Arc::new(LengthValidator));

        let initialized = registry.initialize_all(false).unwrap();
        assert_eq!(initialized, 1);

        // Already-initialized plugins are not re-initialized.
        let initialized = registry.initialize_all(false).unwrap();
        assert_eq!(initialized, 0);
    }

    #[test]
    fn test_initialize_all_fail_fast() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(FailingInit));

        let err = registry.initialize_all(true).unwrap_err();
        assert!(matches!(err, CompilerError::Plugin(_)));
        assert!(err.to_string().contains("failing-init"));
    }

    #[test]
    fn test_validator_capability_produces_findings() {
        let registry = PluginRegistry::new();
        registry.register(Arc::new(LengthValidator));

        let long_rule = "|".repeat(100);
        let rules = vec!["||ads.example^".to_string(), long_rule];
        let plugins = registry.rule_validators();
        let findings = plugins[0].as_rule_validator().unwrap().validate(&rules);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, ValidationSeverity::Warning);
    }

    #[test]
    fn test_is_plugin_library_extension() {
        #[cfg(target_os = "linux")]
        {
            assert!(is_plugin_library(Path::new("/plugins/libfoo.so")));
            assert!(!is_plugin_library(Path::new("/plugins/libfoo.dylib")));
        }
        assert!(!is_plugin_library(Path::new("/plugins/readme.txt")));
        assert!(!is_plugin_library(Path::new("/plugins/noext")));
    }

    #[test]
    fn test_load_from_missing_library_is_error() {
        let registry = PluginRegistry::new();
        let err = registry
            .load_from_library(Path::new("/nonexistent/libplugin.so"))
            .unwrap_err();
        assert!(matches!(err, CompilerError::Plugin(_)));
    }

    #[test]
    fn test_load_from_directory_skips_non_libraries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a plugin").unwrap();

        let registry = PluginRegistry::new();
        let loaded = registry.load_from_directory(dir.path(), None, false).unwrap();
        assert_eq!(loaded, 0);
    }

    #[test]
    fn test_load_from_directory_fail_fast_on_bad_library() {
        let dir = tempfile::tempdir().unwrap();
        let ext = if cfg!(target_os = "macos") {
            "dylib"
        } else if cfg!(target_os = "windows") {
            "dll"
        } else {
            "so"
        };
        std::fs::write(dir.path().join(format!("libbroken.{ext}")), b"not elf").unwrap();

        let registry = PluginRegistry::new();
        // Tolerant mode skips the broken library.
        assert_eq!(registry.load_from_directory(dir.path(), None, false).unwrap(), 0);
        // Fail-fast propagates.
        assert!(registry.load_from_directory(dir.path(), None, true).is_err());
        // Pattern filter avoids even touching it.
        assert_eq!(
            registry
                .load_from_directory(dir.path(), Some("other"), true)
                .unwrap(),
            0
        );
    }
}
