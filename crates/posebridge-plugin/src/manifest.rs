//! Plugin manifest parsing and validation.
//!
//! Parses the `plugin.toml` file every plugin folder carries. The manifest
//! is read before any plugin code runs, so everything the host needs to
//! list, skip or reject a plugin has to be in here.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Plugin contract version implemented by this host.
pub const CONTRACT_VERSION: &str = "1.0.0";

/// Name of the manifest file inside a plugin folder.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Guids no plugin may claim.
const RESERVED_GUIDS: &[&str] = &["INVALID", "POSEBRIDGE"];

/// Which plugin capability a module provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginKind {
    TrackingDevice,
    ServiceEndpoint,
}

impl PluginKind {
    /// Export a WASM module carries to advertise this capability.
    pub fn marker_export(self) -> &'static str {
        match self {
            Self::TrackingDevice => "posebridge_tracking_device",
            Self::ServiceEndpoint => "posebridge_service_endpoint",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::TrackingDevice => "tracking device",
            Self::ServiceEndpoint => "service endpoint",
        }
    }
}

/// Plugin manifest parsed from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,
    #[serde(default)]
    pub module: Option<ModuleConfig>,
    #[serde(default)]
    pub dependency: DependencyInfo,
}

/// Plugin metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub name: String,
    pub guid: String,
    pub version: String,
    pub kind: PluginKind,
    /// Semver requirement on the host contract version.
    #[serde(default = "default_contract")]
    pub contract: String,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub update_endpoint: Option<String>,
}

fn default_contract() -> String {
    "^1".to_string()
}

/// Module section: the WASM binary and the modules it links against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub wasm: String,
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,
}

/// A dependency module, looked up in the plugin folder first and the
/// host's shared folder second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub name: String,
    pub path: String,
}

/// Runtime dependency the plugin needs installed outside the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyInfo {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Export of the plugin that installs the dependency.
    #[serde(default)]
    pub installer: Option<String>,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin guid: 1-64 ASCII letters, digits, `-`, `_` or `.`,
/// and not one of the reserved guids.
pub fn validate_guid(guid: &str) -> Result<(), PluginError> {
    let len = guid.len();
    if !(1..=64).contains(&len) {
        return Err(PluginError::InvalidManifest(format!(
            "plugin.guid must be 1-64 characters, got {len}"
        )));
    }

    if let Some(ch) = guid
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.'))
    {
        return Err(PluginError::InvalidManifest(format!(
            "plugin.guid contains invalid character '{ch}'"
        )));
    }

    if RESERVED_GUIDS.iter().any(|r| r.eq_ignore_ascii_case(guid)) {
        return Err(PluginError::InvalidManifest(format!(
            "plugin.guid '{guid}' is reserved"
        )));
    }

    Ok(())
}

/// Validate a version string as semver.
fn validate_semver(value: &str, field_name: &str) -> Result<(), PluginError> {
    semver::Version::parse(value).map_err(|_| {
        PluginError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = Path::new(path);
    if path.is_empty() {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must not be empty"
        )));
    }
    if p.is_absolute() {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    Ok(())
}

fn validate_optional_text(value: Option<&str>, field_name: &str) -> Result<(), PluginError> {
    if let Some(text) = value {
        let len = text.len();
        if len == 0 || len > 255 {
            return Err(PluginError::InvalidManifest(format!(
                "{field_name} must be 1-255 characters, got {len}"
            )));
        }
    }
    Ok(())
}

impl PluginManifest {
    /// Parse a plugin manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    /// Validate all fields of a parsed manifest.
    pub fn validate(&self) -> Result<(), PluginError> {
        // ── Plugin metadata ─────────────────────────────────────────
        let name_len = self.plugin.name.trim().len();
        if name_len == 0 || name_len > 128 {
            return Err(PluginError::InvalidManifest(format!(
                "plugin.name must be 1-128 characters, got {name_len}"
            )));
        }

        validate_guid(&self.plugin.guid)?;
        validate_semver(&self.plugin.version, "plugin.version")?;

        semver::VersionReq::parse(&self.plugin.contract).map_err(|_| {
            PluginError::InvalidManifest(format!(
                "plugin.contract is not a valid version requirement: '{}'",
                self.plugin.contract
            ))
        })?;

        validate_optional_text(self.plugin.publisher.as_deref(), "plugin.publisher")?;
        validate_optional_text(self.plugin.website.as_deref(), "plugin.website")?;
        validate_optional_text(self.plugin.update_endpoint.as_deref(), "plugin.update_endpoint")?;

        // ── Module ──────────────────────────────────────────────────
        if let Some(ref module) = self.module {
            validate_path_safety(&module.wasm, "module.wasm")?;
            let mut seen = std::collections::HashSet::new();
            for dep in &module.dependencies {
                if dep.name.is_empty() {
                    return Err(PluginError::InvalidManifest(
                        "module.dependencies entry has an empty name".into(),
                    ));
                }
                if !seen.insert(dep.name.as_str()) {
                    return Err(PluginError::InvalidManifest(format!(
                        "module dependency '{}' is declared twice",
                        dep.name
                    )));
                }
                validate_path_safety(&dep.path, "module.dependencies.path")?;
            }
        }

        // ── Dependency ──────────────────────────────────────────────
        validate_optional_text(self.dependency.link.as_deref(), "dependency.link")?;
        validate_optional_text(self.dependency.source.as_deref(), "dependency.source")?;
        validate_optional_text(self.dependency.installer.as_deref(), "dependency.installer")?;

        Ok(())
    }

    /// Parse and validate in one step.
    pub fn parse_and_validate(toml_str: &str) -> Result<Self, PluginError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read `plugin.toml` from a plugin folder.
    pub fn read_from_dir(dir: &Path) -> Result<Self, PluginError> {
        let text = std::fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Self::parse_and_validate(&text)
    }

    /// Whether this host's contract version satisfies the plugin's requirement.
    pub fn is_contract_compatible(&self) -> Result<bool, PluginError> {
        let requirement = semver::VersionReq::parse(&self.plugin.contract)?;
        let host = semver::Version::parse(CONTRACT_VERSION)?;
        Ok(requirement.matches(&host))
    }

    pub fn guid(&self) -> &str {
        &self.plugin.guid
    }

    pub fn name(&self) -> &str {
        &self.plugin.name
    }

    pub fn kind(&self) -> PluginKind {
        self.plugin.kind
    }

    /// Manifest for an in-process plugin with no module section.
    pub fn in_process(guid: &str, name: &str, kind: PluginKind) -> Self {
        Self {
            plugin: PluginMeta {
                name: name.to_string(),
                guid: guid.to_string(),
                version: "1.0.0".to_string(),
                kind,
                contract: default_contract(),
                publisher: None,
                website: None,
                update_endpoint: None,
            },
            module: None,
            dependency: DependencyInfo::default(),
        }
    }
}
