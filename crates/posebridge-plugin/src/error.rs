//! Plugin host error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already exists: {0}")]
    AlreadyExists(String),

    #[error("missing dependency module '{dependency}' for plugin {plugin}")]
    MissingDependency { plugin: String, dependency: String },

    #[error("composition error: {0}")]
    Composition(String),

    #[error("plugin exposes no known capability: {0}")]
    CapabilityMissing(String),

    #[error("plugin {guid} is not a {expected}")]
    WrongKind { guid: String, expected: &'static str },

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("plugin is not initialized: {0}")]
    NotInitialized(String),

    #[error("plugin has been shut down: {0}")]
    ShutDown(String),

    #[error("update lock is already held by this thread")]
    Reentrant,

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error("no plugin can serve the {0} role")]
    NoProvider(&'static str),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

/// Failures raised while routing an input action to an endpoint handler.
///
/// A binding that simply does not match is not an error; these cover
/// payloads and declarations that disagree with each other.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("payload for action {action} is not a {expected}")]
    PayloadType {
        action: String,
        expected: &'static str,
    },

    #[error("endpoint {endpoint} does not accept action {action} on tracker {role}")]
    UnsupportedTarget {
        endpoint: String,
        role: String,
        action: String,
    },

    #[error("action {action} carries {fired} but the target expects {expected}")]
    TypeMismatch {
        action: String,
        fired: &'static str,
        expected: &'static str,
    },
}

// ─── Load status ────────────────────────────────────────────────────────

/// Outcome recorded for every plugin load attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Loaded and published.
    Loaded,
    /// Listed in the disabled set; nothing was instantiated.
    LoadingSkipped,
    /// The folder had no readable or valid manifest.
    Discovery,
    /// The module or one of its dependency modules failed to instantiate.
    Composition,
    /// Neither the tracking device nor the service endpoint capability is exported.
    CapabilityMissing,
    /// The guid is malformed, reserved, or already taken by an earlier plugin.
    BadOrDuplicateGuid,
    /// A lifecycle hook failed after instantiation.
    Lifecycle,
}

impl LoadStatus {
    /// Skipped plugins count as handled so they stay out of error listings.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Loaded | Self::LoadingSkipped)
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Loaded => "loaded",
            Self::LoadingSkipped => "loading skipped",
            Self::Discovery => "discovery error",
            Self::Composition => "composition error",
            Self::CapabilityMissing => "capability missing",
            Self::BadOrDuplicateGuid => "bad or duplicate guid",
            Self::Lifecycle => "lifecycle error",
        };
        f.write_str(text)
    }
}

/// A failed or skipped load, categorised by [`LoadStatus`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}: {message}")]
pub struct LoadError {
    pub status: LoadStatus,
    pub message: String,
}

impl LoadError {
    pub fn new(status: LoadStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

// ─── Crash categories ───────────────────────────────────────────────────

/// Category handed to the crash reporter before a fatal exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashCategory {
    /// A plugin asked the host to exit with its fatal flag set.
    PluginFatal,
    /// No loaded plugin can act as base device or service endpoint.
    NoDeviceForCriticalRole,
    /// The host itself failed (update thread died, state unreadable).
    HostFailure,
}

impl fmt::Display for CrashCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::PluginFatal => "plugin requested a fatal exit",
            Self::NoDeviceForCriticalRole => "no plugin available for a critical role",
            Self::HostFailure => "host failure",
        };
        f.write_str(text)
    }
}
