//! Plugin discovery and loading.
//!
//! Discovery walks the plugin roots and reads manifests without running any
//! plugin code. Loading probes the module's exports, instantiates it in its
//! own context and checks the result. A failing plugin is recorded and
//! skipped; it never stops the plugins after it.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::context::{PluginContext, PluginModule, StaticContext};
use crate::error::{LoadError, LoadStatus, PluginError};
use crate::manifest::{self, PluginKind, PluginManifest, MANIFEST_FILE};
use crate::sandbox::{SandboxConfig, WasmContext};
use crate::sync::{lock, read, write};

/// Capacity of the attempt notification channel.
const ATTEMPT_CHANNEL_CAPACITY: usize = 64;

// ─── Candidates and results ─────────────────────────────────────────────

/// A discovered plugin that has not been instantiated yet.
pub struct CandidateModule {
    context: Box<dyn PluginContext>,
}

impl CandidateModule {
    pub fn new(context: Box<dyn PluginContext>) -> Self {
        Self { context }
    }

    pub fn manifest(&self) -> &PluginManifest {
        self.context.manifest()
    }

    pub fn location(&self) -> &Path {
        self.context.location()
    }
}

impl From<StaticContext> for CandidateModule {
    fn from(context: StaticContext) -> Self {
        Self::new(Box::new(context))
    }
}

impl fmt::Debug for CandidateModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateModule")
            .field("guid", &self.manifest().guid())
            .field("location", &self.location())
            .finish()
    }
}

/// A successfully instantiated plugin, ready to be published.
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub module: PluginModule,
    pub context: Box<dyn PluginContext>,
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("guid", &self.manifest.guid())
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

pub type LoadResult = Result<LoadedPlugin, LoadError>;

/// One entry of the attempted-plugins list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadAttempt {
    pub name: String,
    pub guid: Option<String>,
    pub folder: PathBuf,
    pub kind: Option<PluginKind>,
    pub version: Option<String>,
    pub publisher: Option<String>,
    pub website: Option<String>,
    pub dependency_link: Option<String>,
    pub dependency_source: Option<String>,
    pub dependency_installer: Option<String>,
    pub status: LoadStatus,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl LoadAttempt {
    fn from_manifest(manifest: &PluginManifest, folder: &Path, outcome: Result<(), &LoadError>) -> Self {
        let (status, error) = match outcome {
            Ok(()) => (LoadStatus::Loaded, None),
            Err(e) => (e.status, Some(e.message.clone())),
        };
        Self {
            name: manifest.name().to_string(),
            guid: Some(manifest.guid().to_string()),
            folder: folder.to_path_buf(),
            kind: Some(manifest.kind()),
            version: Some(manifest.plugin.version.clone()),
            publisher: manifest.plugin.publisher.clone(),
            website: manifest.plugin.website.clone(),
            dependency_link: manifest.dependency.link.clone(),
            dependency_source: manifest.dependency.source.clone(),
            dependency_installer: manifest.dependency.installer.clone(),
            status,
            error,
            attempted_at: Utc::now(),
        }
    }

    fn discovery_failure(folder: &Path, error: String) -> Self {
        Self {
            name: folder
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            guid: None,
            folder: folder.to_path_buf(),
            kind: None,
            version: None,
            publisher: None,
            website: None,
            dependency_link: None,
            dependency_source: None,
            dependency_installer: None,
            status: LoadStatus::Discovery,
            error: Some(error),
            attempted_at: Utc::now(),
        }
    }
}

// ─── Loader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    pub sandbox: SandboxConfig,
    /// Folder searched for dependency modules a plugin does not ship itself.
    pub shared_dir: Option<PathBuf>,
}

/// Discovers and loads plugins, keeping a record of every attempt.
pub struct PluginLoader {
    config: LoaderConfig,
    disabled: BTreeSet<String>,
    claimed_guids: Mutex<HashSet<String>>,
    attempted: RwLock<Vec<LoadAttempt>>,
    notices: broadcast::Sender<LoadAttempt>,
}

impl PluginLoader {
    pub fn new(config: LoaderConfig, disabled: BTreeSet<String>) -> Self {
        let (notices, _) = broadcast::channel(ATTEMPT_CHANNEL_CAPACITY);
        Self {
            config,
            disabled,
            claimed_guids: Mutex::new(HashSet::new()),
            attempted: RwLock::new(Vec::new()),
            notices,
        }
    }

    /// Receive every attempt recorded from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LoadAttempt> {
        self.notices.subscribe()
    }

    /// Every attempt recorded so far, in order.
    pub fn attempted(&self) -> Vec<LoadAttempt> {
        read(&self.attempted).clone()
    }

    fn record(&self, attempt: LoadAttempt) {
        if attempt.status.is_success() {
            tracing::info!(
                plugin = %attempt.name,
                folder = %attempt.folder.display(),
                status = %attempt.status,
                "plugin load attempt"
            );
        } else {
            tracing::warn!(
                plugin = %attempt.name,
                folder = %attempt.folder.display(),
                status = %attempt.status,
                error = attempt.error.as_deref().unwrap_or_default(),
                "plugin load attempt failed"
            );
        }
        write(&self.attempted).push(attempt.clone());
        // no subscribers is fine
        let _ = self.notices.send(attempt);
    }

    /// Find plugin folders under each root, in name order per root.
    ///
    /// Folders without a readable, valid manifest are recorded as discovery
    /// failures and skipped.
    pub fn discover(&self, roots: &[PathBuf]) -> Vec<CandidateModule> {
        let mut candidates = Vec::new();

        for root in roots {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(root = %root.display(), "cannot read plugin root: {e}");
                    continue;
                }
            };

            let mut folders: Vec<PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            folders.sort();

            for folder in folders {
                if !folder.join(MANIFEST_FILE).is_file() {
                    self.record(LoadAttempt::discovery_failure(
                        &folder,
                        format!("no {MANIFEST_FILE} in plugin folder"),
                    ));
                    continue;
                }

                match PluginManifest::read_from_dir(&folder) {
                    Ok(manifest) => {
                        let context = WasmContext::new(
                            manifest,
                            folder,
                            self.config.shared_dir.clone(),
                            self.config.sandbox.clone(),
                        );
                        candidates.push(CandidateModule::new(Box::new(context)));
                    }
                    Err(e) => self.record(LoadAttempt::discovery_failure(&folder, e.to_string())),
                }
            }
        }

        tracing::debug!(count = candidates.len(), "plugin discovery finished");
        candidates
    }

    /// Load one candidate. The attempt is recorded whatever the outcome.
    pub fn load(&self, candidate: CandidateModule) -> LoadResult {
        let CandidateModule { mut context } = candidate;
        let manifest = context.manifest().clone();
        let folder = context.location().to_path_buf();

        let outcome = self.instantiate(context.as_mut(), &manifest);
        self.record(LoadAttempt::from_manifest(
            &manifest,
            &folder,
            outcome.as_ref().map(|_| ()),
        ));

        match outcome {
            Ok(module) => Ok(LoadedPlugin {
                manifest,
                module,
                context,
            }),
            Err(e) => {
                context.unload();
                Err(e)
            }
        }
    }

    /// Load every candidate in order, skipping failures.
    pub fn load_all(&self, candidates: Vec<CandidateModule>) -> Vec<LoadedPlugin> {
        candidates
            .into_iter()
            .filter_map(|candidate| self.load(candidate).ok())
            .collect()
    }

    fn instantiate(
        &self,
        context: &mut dyn PluginContext,
        manifest: &PluginManifest,
    ) -> Result<PluginModule, LoadError> {
        let guid = manifest.guid();
        let kind = manifest.kind();

        manifest::validate_guid(guid)
            .map_err(|e| LoadError::new(LoadStatus::BadOrDuplicateGuid, e.to_string()))?;

        if lock(&self.claimed_guids).contains(guid) {
            return Err(LoadError::new(
                LoadStatus::BadOrDuplicateGuid,
                format!("guid {guid} is already taken by another plugin"),
            ));
        }

        if self.disabled.contains(guid) {
            lock(&self.claimed_guids).insert(guid.to_string());
            return Err(LoadError::new(
                LoadStatus::LoadingSkipped,
                "plugin is disabled",
            ));
        }

        let compatible = manifest
            .is_contract_compatible()
            .map_err(|e| LoadError::new(LoadStatus::Composition, e.to_string()))?;
        if !compatible {
            return Err(LoadError::new(
                LoadStatus::Composition,
                format!(
                    "plugin requires contract {} but the host implements {}",
                    manifest.plugin.contract,
                    manifest::CONTRACT_VERSION
                ),
            ));
        }

        let exports = context
            .exported_capabilities()
            .map_err(|e| LoadError::new(LoadStatus::Composition, e.to_string()))?;
        if exports.is_empty() {
            return Err(LoadError::new(
                LoadStatus::CapabilityMissing,
                "module exposes neither a tracking device nor a service endpoint",
            ));
        }
        if !exports.contains(&kind) {
            return Err(LoadError::new(
                LoadStatus::Composition,
                format!("manifest declares a {} but the module does not export one", kind.label()),
            ));
        }

        let module = context.load().map_err(|e| match e {
            PluginError::CapabilityMissing(msg) => LoadError::new(LoadStatus::CapabilityMissing, msg),
            other => LoadError::new(LoadStatus::Composition, other.to_string()),
        })?;

        if module.kind() != kind {
            return Err(LoadError::new(
                LoadStatus::Composition,
                format!(
                    "manifest declares a {} but the module instantiated a {}",
                    kind.label(),
                    module.kind().label()
                ),
            ));
        }

        lock(&self.claimed_guids).insert(guid.to_string());
        Ok(module)
    }
}
