//! WASM plugin sandbox using Extism (wasmtime).
//!
//! Every WASM plugin gets its own Extism instance, linked against its own
//! copies of the dependency modules it declares. Two plugins shipping
//! different builds of the same dependency therefore never see each other's.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::context::{PluginContext, PluginModule};
use crate::error::PluginError;
use crate::manifest::{PluginKind, PluginManifest};
use crate::wasm_bridge::{WasmServiceEndpoint, WasmTrackingDevice};

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 64 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per call (default: 50_000_000).
    pub fuel_limit: u64,
    /// Whether to enable WASI (default: false).
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            fuel_limit: 50_000_000,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.memory_limit),
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fuel_limit),
            wasi_enabled: std::env::var("PLUGIN_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Export probing ─────────────────────────────────────────────────────

/// Names exported by a WASM module, read without instantiating it.
pub fn module_exports(wasm_bytes: &[u8]) -> Result<Vec<String>, PluginError> {
    let mut names = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload.map_err(|e| PluginError::WasmValidation(e.to_string()))?;
        if let wasmparser::Payload::ExportSection(reader) = payload {
            for export in reader {
                let export = export.map_err(|e| PluginError::WasmValidation(e.to_string()))?;
                names.push(export.name.to_string());
            }
        }
    }
    Ok(names)
}

/// Capabilities advertised by marker exports.
pub fn exported_kinds(exports: &[String]) -> Vec<PluginKind> {
    [PluginKind::TrackingDevice, PluginKind::ServiceEndpoint]
        .into_iter()
        .filter(|kind| exports.iter().any(|name| name == kind.marker_export()))
        .collect()
}

// ─── Sandbox ────────────────────────────────────────────────────────────

/// A loaded WASM plugin sandbox.
pub struct PluginSandbox {
    plugin: extism::Plugin,
    config: SandboxConfig,
    plugin_name: String,
}

impl std::fmt::Debug for PluginSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginSandbox")
            .field("plugin_name", &self.plugin_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PluginSandbox {
    /// Instantiate `wasm_path` linked against the named dependency modules.
    ///
    /// The main module is registered as `main`, so Extism treats it as the
    /// entry point regardless of dependency order.
    pub fn load(
        wasm_path: &Path,
        dependencies: &[(String, PathBuf)],
        config: SandboxConfig,
        name: &str,
    ) -> Result<Self, PluginError> {
        let wasm_bytes = std::fs::read(wasm_path)?;

        let mut modules: Vec<extism::Wasm> = dependencies
            .iter()
            .map(|(dep_name, path)| extism::Wasm::file(path).with_name(dep_name))
            .collect();
        modules.push(extism::Wasm::data(wasm_bytes).with_name("main"));

        let manifest =
            extism::Manifest::new(modules).with_memory_max((config.memory_limit / 65536) as u32);

        if config.wasi_enabled {
            tracing::warn!(plugin = %name, "WASI enabled for plugin");
        }

        let plugin = extism::PluginBuilder::new(manifest)
            .with_wasi(config.wasi_enabled)
            .with_fuel_limit(config.fuel_limit)
            .build()
            .map_err(|e| PluginError::Sandbox(e.to_string()))?;

        Ok(Self {
            plugin,
            config,
            plugin_name: name.to_string(),
        })
    }

    /// Call a WASM function by name with raw byte input/output.
    pub fn call(&mut self, function_name: &str, input: &[u8]) -> Result<Vec<u8>, PluginError> {
        self.plugin
            .call::<&[u8], Vec<u8>>(function_name, input)
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("fuel") {
                    PluginError::FuelExhausted(self.plugin_name.clone())
                } else if msg.contains("memory") {
                    PluginError::MemoryExceeded(self.plugin_name.clone())
                } else {
                    PluginError::Sandbox(msg)
                }
            })
    }

    /// Call a WASM function with JSON input. Empty output decodes as `O::default()`.
    pub fn call_json<I: Serialize, O: DeserializeOwned + Default>(
        &mut self,
        function_name: &str,
        input: &I,
    ) -> Result<O, PluginError> {
        let json_bytes = serde_json::to_vec(input)?;
        let output_bytes = self.call(function_name, &json_bytes)?;
        if output_bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(O::default());
        }
        Ok(serde_json::from_slice(&output_bytes)?)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.plugin.function_exists(name)
    }

    pub fn name(&self) -> &str {
        &self.plugin_name
    }
}

// ─── Context ────────────────────────────────────────────────────────────

/// Load context for a plugin folder holding a WASM module.
pub struct WasmContext {
    manifest: PluginManifest,
    directory: PathBuf,
    shared_dir: Option<PathBuf>,
    config: SandboxConfig,
    module: Option<PluginModule>,
}

impl WasmContext {
    pub fn new(
        manifest: PluginManifest,
        directory: PathBuf,
        shared_dir: Option<PathBuf>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            manifest,
            directory,
            shared_dir,
            config,
            module: None,
        }
    }

    fn wasm_path(&self) -> Result<PathBuf, PluginError> {
        let module = self.manifest.module.as_ref().ok_or_else(|| {
            PluginError::Manifest(format!(
                "plugin {} has no [module] section",
                self.manifest.guid()
            ))
        })?;
        Ok(self.directory.join(&module.wasm))
    }

    fn resolved_dependencies(&self) -> Result<Vec<(String, PathBuf)>, PluginError> {
        let Some(module) = self.manifest.module.as_ref() else {
            return Ok(Vec::new());
        };
        module
            .dependencies
            .iter()
            .map(|dep| {
                self.resolve_dependency(&dep.name)
                    .map(|path| (dep.name.clone(), path))
                    .ok_or_else(|| PluginError::MissingDependency {
                        plugin: self.manifest.guid().to_string(),
                        dependency: dep.name.clone(),
                    })
            })
            .collect()
    }
}

impl PluginContext for WasmContext {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn location(&self) -> &Path {
        &self.directory
    }

    fn exported_capabilities(&self) -> Result<Vec<PluginKind>, PluginError> {
        let bytes = std::fs::read(self.wasm_path()?)?;
        Ok(exported_kinds(&module_exports(&bytes)?))
    }

    fn resolve_dependency(&self, name: &str) -> Option<PathBuf> {
        let dep = self
            .manifest
            .module
            .as_ref()?
            .dependencies
            .iter()
            .find(|dep| dep.name == name)?;

        let local = self.directory.join(&dep.path);
        if local.is_file() {
            return Some(local);
        }

        let file_name = Path::new(&dep.path).file_name()?;
        self.shared_dir
            .as_ref()
            .map(|shared| shared.join(file_name))
            .filter(|path| path.is_file())
    }

    fn load(&mut self) -> Result<PluginModule, PluginError> {
        let dependencies = self.resolved_dependencies()?;
        let guid = self.manifest.guid().to_string();
        let sandbox =
            PluginSandbox::load(&self.wasm_path()?, &dependencies, self.config.clone(), &guid)?;

        let module = match self.manifest.kind() {
            PluginKind::TrackingDevice => {
                PluginModule::Device(Arc::new(WasmTrackingDevice::new(&guid, sandbox)?))
            }
            PluginKind::ServiceEndpoint => {
                PluginModule::Endpoint(Arc::new(WasmServiceEndpoint::new(&guid, sandbox)?))
            }
        };

        tracing::debug!(
            plugin = %guid,
            dependencies = dependencies.len(),
            "WASM module instantiated"
        );
        self.module = Some(module.clone());
        Ok(module)
    }

    fn unload(&mut self) {
        if self.module.take().is_some() {
            tracing::debug!(plugin = %self.manifest.guid(), "WASM context released");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ModuleConfig, ModuleDependency};

    /// A valid module with one empty function exported under every name.
    fn module_exporting(names: &[&str]) -> Vec<u8> {
        let mut bytes = b"\0asm\x01\0\0\0".to_vec();
        // type section: one `() -> ()` signature
        bytes.extend_from_slice(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
        // function section: one function of type 0
        bytes.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]);

        let mut exports = vec![names.len() as u8];
        for name in names {
            exports.push(name.len() as u8);
            exports.extend_from_slice(name.as_bytes());
            exports.extend_from_slice(&[0x00, 0x00]);
        }
        bytes.push(0x07);
        bytes.push(exports.len() as u8);
        bytes.extend_from_slice(&exports);

        // code section: one body with no locals, just `end`
        bytes.extend_from_slice(&[0x0a, 0x04, 0x01, 0x02, 0x00, 0x0b]);
        bytes
    }

    fn wasm_manifest(kind: PluginKind, dependencies: Vec<ModuleDependency>) -> PluginManifest {
        let mut manifest = PluginManifest::in_process("WASM-TEST", "Wasm Test", kind);
        manifest.module = Some(ModuleConfig {
            wasm: "plugin.wasm".into(),
            dependencies,
        });
        manifest
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.fuel_limit, 50_000_000);
        assert!(!config.wasi_enabled);
    }

    #[test]
    fn test_module_exports() {
        let bytes = module_exporting(&["posebridge_tracking_device", "device_update"]);
        let exports = module_exports(&bytes).unwrap();
        assert_eq!(exports, vec!["posebridge_tracking_device", "device_update"]);
        assert_eq!(exported_kinds(&exports), vec![PluginKind::TrackingDevice]);
    }

    #[test]
    fn test_module_without_markers() {
        let bytes = module_exporting(&["something_else"]);
        let exports = module_exports(&bytes).unwrap();
        assert!(exported_kinds(&exports).is_empty());
    }

    #[test]
    fn test_module_exports_rejects_garbage() {
        let result = module_exports(b"this is not wasm");
        assert!(matches!(result, Err(PluginError::WasmValidation(_))));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = PluginSandbox::load(
            Path::new("/nonexistent/plugin.wasm"),
            &[],
            SandboxConfig::default(),
            "test",
        );
        assert!(matches!(result, Err(PluginError::Io(_))));
    }

    #[test]
    fn test_context_probes_exports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.wasm"),
            module_exporting(&["posebridge_service_endpoint"]),
        )
        .unwrap();

        let context = WasmContext::new(
            wasm_manifest(PluginKind::ServiceEndpoint, Vec::new()),
            dir.path().to_path_buf(),
            None,
            SandboxConfig::default(),
        );
        assert_eq!(
            context.exported_capabilities().unwrap(),
            vec![PluginKind::ServiceEndpoint]
        );
    }

    #[test]
    fn test_dependency_prefers_plugin_folder() {
        let plugin_dir = tempfile::tempdir().unwrap();
        let shared_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(plugin_dir.path().join("deps")).unwrap();
        std::fs::write(plugin_dir.path().join("deps/usb.wasm"), b"local").unwrap();
        std::fs::write(shared_dir.path().join("usb.wasm"), b"shared").unwrap();
        std::fs::write(shared_dir.path().join("math.wasm"), b"shared").unwrap();

        let context = WasmContext::new(
            wasm_manifest(
                PluginKind::TrackingDevice,
                vec![
                    ModuleDependency {
                        name: "usb".into(),
                        path: "deps/usb.wasm".into(),
                    },
                    ModuleDependency {
                        name: "math".into(),
                        path: "deps/math.wasm".into(),
                    },
                ],
            ),
            plugin_dir.path().to_path_buf(),
            Some(shared_dir.path().to_path_buf()),
            SandboxConfig::default(),
        );

        assert_eq!(
            context.resolve_dependency("usb").unwrap(),
            plugin_dir.path().join("deps/usb.wasm")
        );
        assert_eq!(
            context.resolve_dependency("math").unwrap(),
            shared_dir.path().join("math.wasm")
        );
        assert!(context.resolve_dependency("unknown").is_none());
    }

    #[test]
    fn test_missing_dependency_fails_before_instantiation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("plugin.wasm"),
            module_exporting(&["posebridge_tracking_device"]),
        )
        .unwrap();

        let mut context = WasmContext::new(
            wasm_manifest(
                PluginKind::TrackingDevice,
                vec![ModuleDependency {
                    name: "usb".into(),
                    path: "deps/usb.wasm".into(),
                }],
            ),
            dir.path().to_path_buf(),
            None,
            SandboxConfig::default(),
        );

        match context.load() {
            Err(PluginError::MissingDependency { dependency, .. }) => assert_eq!(dependency, "usb"),
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }
}
