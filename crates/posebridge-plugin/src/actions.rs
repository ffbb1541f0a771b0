//! Typed input actions and the registry of their declarations.
//!
//! A device declares [`KeyInputAction<T>`]s on its joints and fires them
//! with a `T` payload. An endpoint declares [`InputActionTarget`]s per
//! tracker role. Everything between the two sides is type-erased: the
//! payload travels as [`ActionPayload`] and is downcast back to `T` by the
//! invoker captured when the target was declared.

use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, RwLock, Weak};

use uuid::Uuid;

use crate::error::RoutingError;
use crate::sync::{read, write};
use crate::tracker::{JointRole, TrackedJoint, TrackerRole};

/// Opaque payload of a fired action.
pub type ActionPayload = Arc<dyn Any + Send + Sync>;

/// Receives actions fired by a plugin. Implemented by the host facade.
pub trait ActionDispatcher: Send + Sync {
    fn dispatch(&self, action: &dyn InputAction, payload: ActionPayload);

    fn is_action_used(&self, action: &dyn InputAction) -> bool;
}

/// Type-erased view of a [`KeyInputAction<T>`].
pub trait InputAction: Send + Sync + 'static {
    fn guid(&self) -> &str;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn image(&self) -> Option<&str>;

    /// `TypeId` of the payload type `T`.
    fn data_type(&self) -> TypeId;

    fn data_type_name(&self) -> &'static str;

    /// Point the action at the dispatcher of the plugin that owns it.
    fn attach_dispatcher(&self, dispatcher: Weak<dyn ActionDispatcher>);

    /// Whether firing the action would currently reach any handler.
    fn is_used(&self) -> bool;

    fn as_any(&self) -> &dyn Any;
}

/// Fresh upper-case guid for actions created without an explicit one.
pub fn new_action_guid() -> String {
    Uuid::new_v4().to_string().to_uppercase()
}

// ─── Typed action ───────────────────────────────────────────────────────

/// An input action carrying a payload of type `T`.
pub struct KeyInputAction<T> {
    guid: String,
    name: String,
    description: String,
    image: Option<String>,
    dispatcher: RwLock<Option<Weak<dyn ActionDispatcher>>>,
    _payload: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> KeyInputAction<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_guid(new_action_guid(), name)
    }

    pub fn with_guid(guid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            description: String::new(),
            image: None,
            dispatcher: RwLock::new(None),
            _payload: PhantomData,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Fire the action. A no-op until the host has attached a dispatcher.
    pub fn invoke(&self, data: T) {
        let dispatcher = read(&self.dispatcher).as_ref().and_then(Weak::upgrade);
        match dispatcher {
            Some(dispatcher) => dispatcher.dispatch(self, Arc::new(data)),
            None => tracing::trace!(action = %self.guid, "action fired without a dispatcher"),
        }
    }
}

impl<T: Send + Sync + 'static> InputAction for KeyInputAction<T> {
    fn guid(&self) -> &str {
        &self.guid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    fn data_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn data_type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn attach_dispatcher(&self, dispatcher: Weak<dyn ActionDispatcher>) {
        *write(&self.dispatcher) = Some(dispatcher);
    }

    fn is_used(&self) -> bool {
        read(&self.dispatcher)
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|dispatcher| dispatcher.is_action_used(self))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T> fmt::Debug for KeyInputAction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyInputAction")
            .field("guid", &self.guid)
            .field("name", &self.name)
            .field("data_type", &type_name::<T>())
            .finish_non_exhaustive()
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────

/// Shared handle to a type-erased action. Equality, ordering and hashing
/// go by guid only.
#[derive(Clone)]
pub struct ActionHandle(Arc<dyn InputAction>);

impl ActionHandle {
    pub fn new(action: Arc<dyn InputAction>) -> Self {
        Self(action)
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<&KeyInputAction<T>> {
        self.0.as_any().downcast_ref()
    }
}

impl<A: InputAction> From<Arc<A>> for ActionHandle {
    fn from(action: Arc<A>) -> Self {
        Self(action)
    }
}

impl Deref for ActionHandle {
    type Target = dyn InputAction;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PartialEq for ActionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.guid() == other.guid()
    }
}

impl Eq for ActionHandle {}

impl PartialOrd for ActionHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActionHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.guid().cmp(other.guid())
    }
}

impl Hash for ActionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.guid().hash(state);
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("guid", &self.guid())
            .field("name", &self.name())
            .field("data_type", &self.data_type_name())
            .finish()
    }
}

// ─── Endpoint targets ───────────────────────────────────────────────────

type Invoker = dyn Fn(&ActionPayload, TrackerRole) -> Result<(), RoutingError> + Send + Sync;

/// An action a service endpoint accepts, with the handler that receives it.
#[derive(Clone)]
pub struct InputActionTarget {
    action: ActionHandle,
    invoker: Arc<Invoker>,
}

impl InputActionTarget {
    /// Declare `action` as receivable. `handler` gets the typed payload and
    /// the tracker role the binding was made on.
    pub fn new<T, F>(action: Arc<KeyInputAction<T>>, handler: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&KeyInputAction<T>, &T, TrackerRole) + Send + Sync + 'static,
    {
        let typed = Arc::clone(&action);
        let invoker = move |payload: &ActionPayload, receiver: TrackerRole| -> Result<(), RoutingError> {
            let data = (**payload)
                .downcast_ref::<T>()
                .ok_or_else(|| RoutingError::PayloadType {
                    action: typed.guid.clone(),
                    expected: type_name::<T>(),
                })?;
            handler(&*typed, data, receiver);
            Ok(())
        };
        Self {
            action: ActionHandle::from(action),
            invoker: Arc::new(invoker),
        }
    }

    pub fn action(&self) -> &ActionHandle {
        &self.action
    }

    pub fn guid(&self) -> &str {
        self.action.guid()
    }

    pub fn data_type(&self) -> TypeId {
        self.action.data_type()
    }

    /// Hand a payload to the handler. The payload must hold a `T`.
    pub fn invoke(&self, payload: &ActionPayload, receiver: TrackerRole) -> Result<(), RoutingError> {
        (self.invoker)(payload, receiver)
    }
}

impl fmt::Debug for InputActionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputActionTarget")
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

// ─── Registry ───────────────────────────────────────────────────────────

/// An action a device declared on one of its joints.
#[derive(Debug, Clone)]
pub struct DeclaredSource {
    pub device: String,
    pub joint: JointRole,
    pub action: ActionHandle,
}

/// Declared action sources per device and targets per endpoint.
///
/// Only declarations live here. Which source feeds which target is the
/// router's binding table.
#[derive(Default)]
pub struct ActionRegistry {
    sources: RwLock<HashMap<String, Vec<DeclaredSource>>>,
    targets: RwLock<HashMap<String, BTreeMap<TrackerRole, Vec<InputActionTarget>>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the declared sources of `device` with the actions of its
    /// joints and attach `dispatcher` to each of them.
    pub fn declare_device(
        &self,
        device: &str,
        joints: &[TrackedJoint],
        dispatcher: &Weak<dyn ActionDispatcher>,
    ) -> usize {
        let declared: Vec<DeclaredSource> = joints
            .iter()
            .flat_map(|joint| {
                joint.supported_input_actions.iter().map(|action| DeclaredSource {
                    device: device.to_string(),
                    joint: joint.role,
                    action: action.clone(),
                })
            })
            .collect();

        for source in &declared {
            source.action.attach_dispatcher(dispatcher.clone());
        }

        let count = declared.len();
        write(&self.sources).insert(device.to_string(), declared);
        tracing::debug!(plugin = %device, actions = count, "device actions declared");
        count
    }

    /// Replace the targets `endpoint` accepts, per tracker role.
    pub fn declare_endpoint(
        &self,
        endpoint: &str,
        targets: BTreeMap<TrackerRole, Vec<InputActionTarget>>,
    ) -> usize {
        let count = targets.values().map(Vec::len).sum();
        write(&self.targets).insert(endpoint.to_string(), targets);
        tracing::debug!(plugin = %endpoint, actions = count, "endpoint actions declared");
        count
    }

    /// Drop every declaration made by `guid`.
    pub fn forget(&self, guid: &str) {
        write(&self.sources).remove(guid);
        write(&self.targets).remove(guid);
    }

    pub fn has_device(&self, device: &str) -> bool {
        read(&self.sources).contains_key(device)
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        read(&self.targets).contains_key(endpoint)
    }

    pub fn sources_of(&self, device: &str) -> Vec<DeclaredSource> {
        read(&self.sources).get(device).cloned().unwrap_or_default()
    }

    pub fn source(&self, device: &str, action: &str) -> Option<DeclaredSource> {
        read(&self.sources)
            .get(device)?
            .iter()
            .find(|source| source.action.guid() == action)
            .cloned()
    }

    pub fn targets_of(&self, endpoint: &str, role: TrackerRole) -> Vec<InputActionTarget> {
        read(&self.targets)
            .get(endpoint)
            .and_then(|roles| roles.get(&role))
            .cloned()
            .unwrap_or_default()
    }

    pub fn target(&self, endpoint: &str, role: TrackerRole, action: &str) -> Option<InputActionTarget> {
        read(&self.targets)
            .get(endpoint)?
            .get(&role)?
            .iter()
            .find(|target| target.guid() == action)
            .cloned()
    }
}
