//! PoseBridge Plugin Runtime
//!
//! Hosts tracking device and service endpoint plugins. Plugins are loaded
//! into isolated contexts (Extism WASM sandboxes, or in-process factories),
//! probed for their capability before any plugin code runs, and published
//! to a registry that selects one base device, any number of override
//! devices and one service endpoint. Joint poses flow from devices through
//! per-device calibration to the endpoint every frame; typed input actions
//! flow from device joints to endpoint handlers through the router.

pub mod actions;
pub mod calibration;
pub mod context;
pub mod contract;
pub mod error;
pub mod frame;
pub mod host;
pub mod loader;
pub mod localization;
pub mod manifest;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod sandbox;
pub mod settings;
mod sync;
pub mod tracker;
pub mod wasm_bridge;

pub use actions::{ActionHandle, ActionPayload, InputAction, InputActionTarget, KeyInputAction};
pub use calibration::{CalibrationFrame, CalibrationStore};
pub use context::{PluginContext, PluginModule, StaticContext};
pub use contract::{Capability, DeviceCapabilities, EndpointCapabilities, ServiceEndpoint, TrackingDevice};
pub use error::{CrashCategory, LoadError, LoadStatus, PluginError, RoutingError};
pub use frame::{FrameContext, FrameGuard, Selection, TrackerSlot};
pub use host::{CrashReporter, HostCore, HostEvent, HostFacade, LogCrashReporter, LogSeverity};
pub use loader::{CandidateModule, LoadAttempt, LoadedPlugin, LoaderConfig, PluginLoader};
pub use localization::Localization;
pub use manifest::{PluginKind, PluginManifest};
pub use registry::{LoadState, PluginRegistry};
pub use router::{ActionSource, BindingRecord, InputActionRouter};
pub use runtime::{ExitReason, FrameReport, HostConfig, HostRuntime, UpdateLoop};
pub use sandbox::{PluginSandbox, SandboxConfig};
pub use settings::{HostState, SettingsStore};
pub use tracker::{JointPose, JointRole, TrackedJoint, TrackerBase, TrackerRole, TrackingState};
