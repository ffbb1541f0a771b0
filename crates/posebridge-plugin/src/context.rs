//! Isolated load contexts.
//!
//! Each plugin is instantiated inside its own [`PluginContext`], which owns
//! whatever the plugin was built from (a WASM store, an in-process factory)
//! and can be torn down without touching other plugins.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::contract::{ServiceEndpoint, TrackingDevice};
use crate::error::PluginError;
use crate::manifest::{PluginKind, PluginManifest};

/// An instantiated plugin.
#[derive(Clone)]
pub enum PluginModule {
    Device(Arc<dyn TrackingDevice>),
    Endpoint(Arc<dyn ServiceEndpoint>),
}

impl PluginModule {
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Device(_) => PluginKind::TrackingDevice,
            Self::Endpoint(_) => PluginKind::ServiceEndpoint,
        }
    }

    pub fn as_device(&self) -> Option<&Arc<dyn TrackingDevice>> {
        match self {
            Self::Device(device) => Some(device),
            Self::Endpoint(_) => None,
        }
    }

    pub fn as_endpoint(&self) -> Option<&Arc<dyn ServiceEndpoint>> {
        match self {
            Self::Endpoint(endpoint) => Some(endpoint),
            Self::Device(_) => None,
        }
    }
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginModule").field(&self.kind()).finish()
    }
}

/// A per-plugin load context.
pub trait PluginContext: Send {
    fn manifest(&self) -> &PluginManifest;

    /// Folder the plugin was discovered in.
    fn location(&self) -> &Path;

    /// Capabilities the module advertises, found without running its code.
    fn exported_capabilities(&self) -> Result<Vec<PluginKind>, PluginError>;

    /// Where dependency module `name` resolves to, if anywhere.
    fn resolve_dependency(&self, name: &str) -> Option<PathBuf>;

    /// Instantiate the plugin inside this context.
    fn load(&mut self) -> Result<PluginModule, PluginError>;

    /// Release everything the context holds.
    fn unload(&mut self);
}

// ─── In-process plugins ─────────────────────────────────────────────────

type Factory = dyn Fn() -> Result<PluginModule, PluginError> + Send + Sync;

/// Context for a plugin compiled into the host binary.
pub struct StaticContext {
    manifest: PluginManifest,
    location: PathBuf,
    exports: Vec<PluginKind>,
    factory: Arc<Factory>,
    loaded: bool,
}

impl StaticContext {
    /// Context whose exports match the manifest's kind.
    pub fn new<F>(manifest: PluginManifest, factory: F) -> Self
    where
        F: Fn() -> Result<PluginModule, PluginError> + Send + Sync + 'static,
    {
        let exports = vec![manifest.kind()];
        Self::with_exports(manifest, exports, factory)
    }

    /// Context advertising an explicit export list.
    pub fn with_exports<F>(manifest: PluginManifest, exports: Vec<PluginKind>, factory: F) -> Self
    where
        F: Fn() -> Result<PluginModule, PluginError> + Send + Sync + 'static,
    {
        let location = PathBuf::from(format!("static://{}", manifest.guid()));
        Self {
            manifest,
            location,
            exports,
            factory: Arc::new(factory),
            loaded: false,
        }
    }

    pub fn device<D>(guid: &str, name: &str, make: impl Fn() -> D + Send + Sync + 'static) -> Self
    where
        D: TrackingDevice + 'static,
    {
        let manifest = PluginManifest::in_process(guid, name, PluginKind::TrackingDevice);
        Self::new(manifest, move || Ok(PluginModule::Device(Arc::new(make()))))
    }

    pub fn endpoint<E>(guid: &str, name: &str, make: impl Fn() -> E + Send + Sync + 'static) -> Self
    where
        E: ServiceEndpoint + 'static,
    {
        let manifest = PluginManifest::in_process(guid, name, PluginKind::ServiceEndpoint);
        Self::new(manifest, move || Ok(PluginModule::Endpoint(Arc::new(make()))))
    }
}

impl PluginContext for StaticContext {
    fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn exported_capabilities(&self) -> Result<Vec<PluginKind>, PluginError> {
        Ok(self.exports.clone())
    }

    fn resolve_dependency(&self, _name: &str) -> Option<PathBuf> {
        None
    }

    fn load(&mut self) -> Result<PluginModule, PluginError> {
        let module = (self.factory)()?;
        self.loaded = true;
        Ok(module)
    }

    fn unload(&mut self) {
        if self.loaded {
            tracing::debug!(plugin = %self.manifest.guid(), "in-process plugin context released");
        }
        self.loaded = false;
    }
}
