//! Input action routing.
//!
//! Bindings map a device-side action to an action the active service
//! endpoint accepts, per endpoint and tracker role. The table is never
//! mutated in place: every write builds a new [`BindingTable`] and swaps the
//! `Arc`, so a dispatch racing a rebind sees either the old or the new table.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::actions::{ActionPayload, InputAction};
use crate::context::PluginModule;
use crate::error::RoutingError;
use crate::registry::PluginRegistry;
use crate::sync::{lock, read, write};
use crate::tracker::{JointRole, TrackerRole};

/// The device-side end of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionSource {
    pub device: String,
    pub joint: JointRole,
    pub action: String,
}

impl ActionSource {
    pub fn new(device: impl Into<String>, joint: JointRole, action: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            joint,
            action: action.into(),
        }
    }
}

/// One persisted binding. A `None` target is a declared but disabled binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub endpoint: String,
    pub role: TrackerRole,
    pub source: ActionSource,
    pub target: Option<String>,
}

type RoleBindings = BTreeMap<ActionSource, Option<String>>;

/// Immutable binding snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingTable {
    endpoints: BTreeMap<String, BTreeMap<TrackerRole, RoleBindings>>,
}

impl BindingTable {
    /// `None` when unbound, `Some(None)` when bound but disabled.
    pub fn get(&self, endpoint: &str, role: TrackerRole, source: &ActionSource) -> Option<Option<&str>> {
        self.endpoints
            .get(endpoint)?
            .get(&role)?
            .get(source)
            .map(Option::as_deref)
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .values()
            .flat_map(BTreeMap::values)
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every binding on `endpoint` fed by `action` of `device`, across roles.
    fn matching<'a>(
        &'a self,
        endpoint: &str,
        device: &'a str,
        action: &'a str,
    ) -> impl Iterator<Item = (TrackerRole, Option<&'a str>)> + 'a {
        self.endpoints
            .get(endpoint)
            .into_iter()
            .flat_map(move |roles| {
                roles.iter().flat_map(move |(role, sources)| {
                    sources
                        .iter()
                        .filter(move |(source, _)| source.device == device && source.action == action)
                        .map(move |(_, target)| (*role, target.as_deref()))
                })
            })
    }

    fn insert(&mut self, record: BindingRecord) {
        self.endpoints
            .entry(record.endpoint)
            .or_default()
            .entry(record.role)
            .or_default()
            .insert(record.source, record.target);
    }

    fn remove(&mut self, endpoint: &str, role: TrackerRole, source: &ActionSource) -> bool {
        let Some(roles) = self.endpoints.get_mut(endpoint) else {
            return false;
        };
        let Some(sources) = roles.get_mut(&role) else {
            return false;
        };
        let removed = sources.remove(source).is_some();
        if sources.is_empty() {
            roles.remove(&role);
        }
        if roles.is_empty() {
            self.endpoints.remove(endpoint);
        }
        removed
    }

    pub fn records(&self) -> Vec<BindingRecord> {
        self.endpoints
            .iter()
            .flat_map(|(endpoint, roles)| {
                roles.iter().flat_map(move |(role, sources)| {
                    sources.iter().map(move |(source, target)| BindingRecord {
                        endpoint: endpoint.clone(),
                        role: *role,
                        source: source.clone(),
                        target: target.clone(),
                    })
                })
            })
            .collect()
    }
}

impl FromIterator<BindingRecord> for BindingTable {
    fn from_iter<I: IntoIterator<Item = BindingRecord>>(records: I) -> Self {
        let mut table = Self::default();
        for record in records {
            table.insert(record);
        }
        table
    }
}

// ─── Router ─────────────────────────────────────────────────────────────

pub struct InputActionRouter {
    registry: Arc<PluginRegistry>,
    table: RwLock<Arc<BindingTable>>,
    /// Serialises writers; readers only clone the current `Arc`.
    writer: Mutex<()>,
}

impl InputActionRouter {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            table: RwLock::new(Arc::new(BindingTable::default())),
            writer: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<BindingTable> {
        Arc::clone(&read(&self.table))
    }

    fn update(&self, f: impl FnOnce(&mut BindingTable) -> bool) -> bool {
        let _writer = lock(&self.writer);
        let mut next = self.snapshot().as_ref().clone();
        let changed = f(&mut next);
        if changed {
            *write(&self.table) = Arc::new(next);
        }
        changed
    }

    /// Bind `source` to `target` for `(endpoint, role)`. A `None` target
    /// records the binding as disabled.
    ///
    /// When the endpoint's declarations are known, the target must be
    /// declared for `role`; when the source is declared too, both payload
    /// types must agree.
    pub fn bind(
        &self,
        endpoint: &str,
        role: TrackerRole,
        source: ActionSource,
        target: Option<&str>,
    ) -> Result<(), RoutingError> {
        let actions = self.registry.actions();
        if let Some(target) = target {
            if actions.has_endpoint(endpoint) {
                let declared = actions.target(endpoint, role, target).ok_or_else(|| {
                    RoutingError::UnsupportedTarget {
                        endpoint: endpoint.to_string(),
                        role: format!("{role:?}"),
                        action: target.to_string(),
                    }
                })?;
                if let Some(fired) = actions.source(&source.device, &source.action) {
                    if fired.action.data_type() != declared.data_type() {
                        return Err(RoutingError::TypeMismatch {
                            action: source.action.clone(),
                            fired: fired.action.data_type_name(),
                            expected: declared.action().data_type_name(),
                        });
                    }
                }
            }
        }

        let record = BindingRecord {
            endpoint: endpoint.to_string(),
            role,
            source,
            target: target.map(str::to_string),
        };
        tracing::debug!(
            plugin = %record.endpoint,
            role = ?record.role,
            source = %record.source.action,
            target = ?record.target,
            "action bound"
        );
        self.update(|table| {
            table.insert(record);
            true
        });
        Ok(())
    }

    /// Remove a binding. Returns whether one existed.
    pub fn unbind(&self, endpoint: &str, role: TrackerRole, source: &ActionSource) -> bool {
        let removed = self.update(|table| table.remove(endpoint, role, source));
        if removed {
            tracing::debug!(plugin = %endpoint, role = ?role, source = %source.action, "action unbound");
        }
        removed
    }

    /// Current target of a binding; `None` when unbound or disabled.
    pub fn target_of(&self, endpoint: &str, role: TrackerRole, source: &ActionSource) -> Option<String> {
        self.snapshot()
            .get(endpoint, role, source)
            .flatten()
            .map(str::to_string)
    }

    /// Whether `action` of `device` reaches anything on the active endpoint.
    pub fn is_used(&self, device: &str, action: &str) -> bool {
        let Some(endpoint) = self.registry.current_service_endpoint() else {
            return false;
        };
        let table = self.snapshot();
        let used = table
            .matching(&endpoint, device, action)
            .any(|(_, target)| target.is_some());
        used
    }

    pub fn records(&self) -> Vec<BindingRecord> {
        self.snapshot().records()
    }

    /// Replace every binding with `records`, as loaded from disk.
    pub fn restore(&self, records: impl IntoIterator<Item = BindingRecord>) {
        let table: BindingTable = records.into_iter().collect();
        let count = table.len();
        let _writer = lock(&self.writer);
        *write(&self.table) = Arc::new(table);
        tracing::debug!(bindings = count, "bindings restored");
    }

    /// Deliver a fired action to every enabled binding on the active
    /// endpoint. Returns how many targets received it. Unbound actions,
    /// a missing or uninitialized endpoint and undeclared targets are
    /// silently skipped.
    pub fn dispatch(&self, device: &str, action: &dyn InputAction, payload: ActionPayload) -> usize {
        let Some(endpoint_guid) = self.registry.current_service_endpoint() else {
            tracing::trace!(plugin = %device, action = %action.guid(), "no service endpoint, action dropped");
            return 0;
        };
        let Some(endpoint) = self.registry.get(&endpoint_guid) else {
            return 0;
        };
        if !endpoint.is_initialized() {
            tracing::trace!(plugin = %endpoint_guid, "service endpoint not initialized, action dropped");
            return 0;
        }

        let table = self.snapshot();
        let actions = self.registry.actions();
        let deliveries: Vec<_> = table
            .matching(&endpoint_guid, device, action.guid())
            .filter_map(|(role, target)| {
                let target = target?;
                let Some(declared) = actions.target(&endpoint_guid, role, target) else {
                    tracing::trace!(plugin = %endpoint_guid, role = ?role, action = %target, "target not declared");
                    return None;
                };
                if declared.data_type() != action.data_type() {
                    tracing::warn!(
                        plugin = %endpoint_guid,
                        action = %action.guid(),
                        fired = action.data_type_name(),
                        expected = declared.action().data_type_name(),
                        "payload type does not match bound target"
                    );
                    return None;
                }
                Some((role, declared))
            })
            .collect();

        // One call for the whole batch: a shutdown lands before or after it,
        // never between two targets.
        let handled = if deliveries.is_empty() {
            0
        } else {
            let delivered = endpoint.call(|module| {
                let PluginModule::Endpoint(service) = module else {
                    return 0;
                };
                deliveries
                    .iter()
                    .filter(|(role, declared)| {
                        match service.process_key_input(declared, &payload, *role) {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::warn!(plugin = %endpoint_guid, "action delivery failed: {e}");
                                false
                            }
                        }
                    })
                    .count()
            });
            delivered.unwrap_or_else(|e| {
                tracing::warn!(plugin = %endpoint_guid, "service endpoint unavailable: {e}");
                0
            })
        };

        if handled == 0 {
            tracing::trace!(plugin = %device, action = %action.guid(), "action not routed");
        }
        handled
    }
}
