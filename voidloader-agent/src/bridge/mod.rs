//! Host bridge
//!
//! Owns the agent's process-wide state: the lifecycle state machine, the
//! classification gate, the frozen registry (through the pipeline) and the
//! negotiated instrumentation handle.
//!
//! Lifecycle:
//! `Uninitialized -> CapabilitiesNegotiated -> EventCallbacksArmed -> Active
//! -> ShuttingDown -> Inactive`. A failure before `Active` moves straight to
//! `Inactive` and leaves nothing armed.
//!
//! Load events are only handled in `EventCallbacksArmed` and `Active`; the
//! registry and gate are immutable by then, so the hot path takes no lock.

pub mod callbacks;
pub mod jvmti;

use crate::buffer::{HostAllocator, HostBuffer};
use crate::gate::{ClassGate, Classification};
use crate::pipeline::TransformPipeline;
use crate::registry::ExtensionRegistry;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Host events the agent subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    VmInit,
    VmDeath,
    ClassFileLoadHook,
}

impl HostEvent {
    /// Subscription order; rollback walks it backwards
    pub const ALL: [HostEvent; 3] = [Self::ClassFileLoadHook, Self::VmInit, Self::VmDeath];

    /// JVMTI event number
    pub fn number(self) -> i32 {
        match self {
            Self::VmInit => 50,
            Self::VmDeath => 51,
            Self::ClassFileLoadHook => 54,
        }
    }
}

impl fmt::Display for HostEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::VmInit => "VMInit",
            Self::VmDeath => "VMDeath",
            Self::ClassFileLoadHook => "ClassFileLoadHook",
        })
    }
}

/// Errors raised while bringing the bridge up
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Invalid agent configuration: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("No JavaVM handle available")]
    NoJavaVm,

    #[error("JVMTI environment unavailable (GetEnv returned {0})")]
    EnvUnavailable(i32),

    #[error("Required capabilities refused: {0}")]
    Capabilities(String),

    #[error("Failed to register event callbacks: {0}")]
    Callbacks(String),

    #[error("Failed to toggle {event} events: {reason}")]
    Event { event: HostEvent, reason: String },

    #[error("Failed to query the VM phase: {0}")]
    Phase(String),

    #[error("Extension registry already published")]
    AlreadyPublished,

    #[error("Cannot {action} while agent is {state}")]
    InvalidState {
        action: &'static str,
        state: AgentState,
    },
}

/// Lifecycle state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentState {
    Uninitialized = 0,
    CapabilitiesNegotiated = 1,
    EventCallbacksArmed = 2,
    Active = 3,
    ShuttingDown = 4,
    Inactive = 5,
}

impl AgentState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::CapabilitiesNegotiated,
            2 => Self::EventCallbacksArmed,
            3 => Self::Active,
            4 => Self::ShuttingDown,
            _ => Self::Inactive,
        }
    }

    /// Whether load events are transformed in this state
    pub fn accepts_load_events(self) -> bool {
        matches!(self, Self::EventCallbacksArmed | Self::Active)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::CapabilitiesNegotiated => "capabilities-negotiated",
            Self::EventCallbacksArmed => "event-callbacks-armed",
            Self::Active => "active",
            Self::ShuttingDown => "shutting-down",
            Self::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// The instrumentation interface the bridge drives
///
/// Implemented by [`jvmti::Jvmti`] for a real VM.
pub trait Instrumentation: Send + Sync {
    /// Request every capability the agent needs
    fn add_capabilities(&self) -> Result<(), BridgeError>;

    /// Install the load-hook, init and shutdown callbacks
    fn register_callbacks(&self) -> Result<(), BridgeError>;

    /// Enable or disable delivery of one event
    fn set_event(&self, event: HostEvent, enabled: bool) -> Result<(), BridgeError>;

    /// Whether the host already finished initialization
    fn is_live(&self) -> Result<bool, BridgeError>;

    /// Give the environment back to the host
    fn dispose(&self);
}

/// How one load event is answered
#[derive(Debug)]
pub enum LoadDecision<'a> {
    /// Leave the out-parameters untouched
    Unchanged,
    /// Hand this buffer to the host as the new class bytes
    Replaced(HostBuffer<'a>),
}

impl LoadDecision<'_> {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Self::Unchanged)
    }
}

/// Process-wide agent state
pub struct AgentContext {
    state: AtomicU8,
    gate: ClassGate,
    pipeline: OnceLock<TransformPipeline>,
    host: OnceLock<Arc<dyn Instrumentation>>,
}

impl Default for AgentContext {
    fn default() -> Self {
        Self::new(ClassGate::default())
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("state", &self.state())
            .field("extensions", &self.registry().map(ExtensionRegistry::len))
            .finish()
    }
}

impl AgentContext {
    pub fn new(gate: ClassGate) -> Self {
        Self {
            state: AtomicU8::new(AgentState::Uninitialized as u8),
            gate,
            pipeline: OnceLock::new(),
            host: OnceLock::new(),
        }
    }

    pub fn state(&self) -> AgentState {
        AgentState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn gate(&self) -> &ClassGate {
        &self.gate
    }

    /// The published registry, once discovery has finished
    pub fn registry(&self) -> Option<&ExtensionRegistry> {
        self.pipeline.get().map(TransformPipeline::registry)
    }

    /// Publish the frozen registry; allowed once, before arming
    pub fn publish(&self, registry: Arc<ExtensionRegistry>) -> Result<(), BridgeError> {
        let state = self.state();
        if state != AgentState::Uninitialized {
            return Err(BridgeError::InvalidState {
                action: "publish the registry",
                state,
            });
        }
        self.pipeline
            .set(TransformPipeline::new(registry))
            .map_err(|_| BridgeError::AlreadyPublished)
    }

    /// Acquire capabilities and arm the callbacks
    ///
    /// On any failure the environment is disposed, events already enabled are
    /// disabled again, and the agent ends up `Inactive`.
    pub fn negotiate_and_arm(&self, host: Arc<dyn Instrumentation>) -> Result<AgentState, BridgeError> {
        if let Err(e) = self.negotiate(host.clone()) {
            host.dispose();
            self.force_inactive();
            return Err(e);
        }
        if let Err(e) = self.arm(host.as_ref()) {
            host.dispose();
            self.force_inactive();
            return Err(e);
        }
        Ok(self.state())
    }

    fn negotiate(&self, host: Arc<dyn Instrumentation>) -> Result<(), BridgeError> {
        let state = self.state();
        if state != AgentState::Uninitialized {
            return Err(BridgeError::InvalidState {
                action: "negotiate capabilities",
                state,
            });
        }

        host.add_capabilities()?;
        if self.host.set(host).is_err() {
            return Err(BridgeError::InvalidState {
                action: "negotiate capabilities",
                state: AgentState::CapabilitiesNegotiated,
            });
        }
        self.transition(AgentState::Uninitialized, AgentState::CapabilitiesNegotiated)?;
        Ok(())
    }

    fn arm(&self, host: &dyn Instrumentation) -> Result<(), BridgeError> {
        host.register_callbacks()?;

        let mut enabled = Vec::with_capacity(HostEvent::ALL.len());
        for event in HostEvent::ALL {
            if let Err(e) = host.set_event(event, true) {
                for done in enabled.iter().rev() {
                    if let Err(undo) = host.set_event(*done, false) {
                        tracing::warn!(event = %done, error = %undo, "Failed to roll back event");
                    }
                }
                return Err(e);
            }
            enabled.push(event);
        }

        self.transition(AgentState::CapabilitiesNegotiated, AgentState::EventCallbacksArmed)?;
        tracing::info!("Event callbacks armed");

        // Attached after VMInit was delivered: it will not come again.
        match host.is_live() {
            Ok(true) => {
                self.mark_active();
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Could not query VM phase, waiting for VMInit"),
        }
        Ok(())
    }

    /// `EventCallbacksArmed -> Active`; returns false in any other state
    pub fn mark_active(&self) -> bool {
        let moved = self
            .transition(AgentState::EventCallbacksArmed, AgentState::Active)
            .is_ok();
        if moved {
            let count = self.registry().map_or(0, ExtensionRegistry::len);
            tracing::info!(extensions = count, "Agent active, ready for class transformation");
        }
        moved
    }

    /// `Active | EventCallbacksArmed -> ShuttingDown -> Inactive`
    pub fn shutdown(&self) -> bool {
        let from = self.state();
        if !from.accepts_load_events() || self.transition(from, AgentState::ShuttingDown).is_err() {
            return false;
        }
        tracing::info!("VM shutting down, disarming");

        if let Some(host) = self.host.get() {
            for event in HostEvent::ALL.iter().rev() {
                if let Err(e) = host.set_event(*event, false) {
                    tracing::debug!(event = %event, error = %e, "Event not disabled during shutdown");
                }
            }
        }

        self.state
            .store(AgentState::Inactive as u8, Ordering::Release);
        true
    }

    fn force_inactive(&self) {
        self.state
            .store(AgentState::Inactive as u8, Ordering::Release);
    }

    fn transition(&self, from: AgentState, to: AgentState) -> Result<(), BridgeError> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| tracing::debug!(%from, %to, "Agent state changed"))
            .map_err(|actual| BridgeError::InvalidState {
                action: "change state",
                state: AgentState::from_u8(actual),
            })
    }

    /// Decide the answer to one load event
    ///
    /// `name` is `None` when the host supplied no usable name. Only Target
    /// classes reach the pipeline; every other path returns without logging
    /// or allocating.
    pub fn handle_class_load<'a>(
        &self,
        name: Option<&str>,
        class_data: &[u8],
        allocator: &'a dyn HostAllocator,
    ) -> LoadDecision<'a> {
        if !self.state().accepts_load_events() {
            return LoadDecision::Unchanged;
        }
        let Some(name) = name else {
            return LoadDecision::Unchanged;
        };
        if self.gate.classify(name) != Classification::Target {
            return LoadDecision::Unchanged;
        }
        let Some(pipeline) = self.pipeline.get() else {
            return LoadDecision::Unchanged;
        };

        tracing::debug!(class = %name, len = class_data.len(), "Transforming target class");
        match pipeline.transform(name, class_data, allocator) {
            Ok(outcome) => {
                tracing::info!(
                    class = %name,
                    applied = ?outcome.applied,
                    failed = outcome.failures.len(),
                    "Class transformed"
                );
                LoadDecision::Replaced(outcome.buffer)
            }
            Err(e) => {
                tracing::error!(class = %name, error = %e, "Transformation aborted, class left unchanged");
                LoadDecision::Unchanged
            }
        }
    }
}

static CONTEXT: OnceLock<AgentContext> = OnceLock::new();

/// The process-wide agent context
pub fn global() -> &'static AgentContext {
    CONTEXT.get_or_init(AgentContext::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::HeapAllocator;
    use crate::registry::{ExtensionKind, ExtensionRecord};
    use std::sync::Mutex;
    use voidloader_api::{ClassTransformer, TransformError};

    const TARGET: &str = "net/minecraft/client/Minecraft";

    #[derive(Default)]
    struct FakeHost {
        live: bool,
        refuse_capabilities: bool,
        refuse_event: Option<HostEvent>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl Instrumentation for FakeHost {
        fn add_capabilities(&self) -> Result<(), BridgeError> {
            self.record("caps".into());
            if self.refuse_capabilities {
                return Err(BridgeError::Capabilities("JVMTI_ERROR_NOT_AVAILABLE".into()));
            }
            Ok(())
        }

        fn register_callbacks(&self) -> Result<(), BridgeError> {
            self.record("callbacks".into());
            Ok(())
        }

        fn set_event(&self, event: HostEvent, enabled: bool) -> Result<(), BridgeError> {
            self.record(format!("{}:{event}", if enabled { "on" } else { "off" }));
            if enabled && self.refuse_event == Some(event) {
                return Err(BridgeError::Event {
                    event,
                    reason: "refused".into(),
                });
            }
            Ok(())
        }

        fn is_live(&self) -> Result<bool, BridgeError> {
            Ok(self.live)
        }

        fn dispose(&self) {
            self.record("dispose".into());
        }
    }

    struct Marker;

    impl ClassTransformer for Marker {
        fn applies_to(&self, class_name: &str) -> bool {
            class_name == TARGET
        }

        fn transform(&self, _: &str, bytes: &[u8]) -> Result<Vec<u8>, TransformError> {
            let mut out = bytes.to_vec();
            out.push(0xEE);
            Ok(out)
        }
    }

    fn registry_with_marker() -> Arc<ExtensionRegistry> {
        let mut registry = ExtensionRegistry::new();
        registry
            .admit(
                ExtensionRecord::new("marker", ExtensionKind::Managed, "marker.jar")
                    .unwrap()
                    .with_rule(Arc::new(Marker)),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn armed_context(host: Arc<FakeHost>) -> AgentContext {
        let ctx = AgentContext::default();
        ctx.publish(registry_with_marker()).unwrap();
        ctx.negotiate_and_arm(host).unwrap();
        ctx
    }

    #[test]
    fn test_full_lifecycle() {
        let host = Arc::new(FakeHost::default());
        let ctx = armed_context(host.clone());
        assert_eq!(ctx.state(), AgentState::EventCallbacksArmed);
        assert_eq!(
            host.calls(),
            vec!["caps", "callbacks", "on:ClassFileLoadHook", "on:VMInit", "on:VMDeath"]
        );

        assert!(ctx.mark_active());
        assert_eq!(ctx.state(), AgentState::Active);
        assert!(!ctx.mark_active());

        assert!(ctx.shutdown());
        assert_eq!(ctx.state(), AgentState::Inactive);
        assert!(!ctx.shutdown());
    }

    #[test]
    fn test_late_attach_goes_straight_to_active() {
        let host = Arc::new(FakeHost {
            live: true,
            ..Default::default()
        });
        let ctx = armed_context(host);
        assert_eq!(ctx.state(), AgentState::Active);
    }

    #[test]
    fn test_capability_failure_is_fatal() {
        let host = Arc::new(FakeHost {
            refuse_capabilities: true,
            ..Default::default()
        });
        let ctx = AgentContext::default();
        ctx.publish(registry_with_marker()).unwrap();

        let err = ctx.negotiate_and_arm(host.clone()).unwrap_err();
        assert!(matches!(err, BridgeError::Capabilities(_)));
        assert_eq!(ctx.state(), AgentState::Inactive);
        assert_eq!(host.calls(), vec!["caps", "dispose"]);
    }

    #[test]
    fn test_event_failure_rolls_back_enabled_events() {
        let host = Arc::new(FakeHost {
            refuse_event: Some(HostEvent::VmDeath),
            ..Default::default()
        });
        let ctx = AgentContext::default();
        ctx.publish(registry_with_marker()).unwrap();

        let err = ctx.negotiate_and_arm(host.clone()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Event {
                event: HostEvent::VmDeath,
                ..
            }
        ));
        assert_eq!(ctx.state(), AgentState::Inactive);
        assert_eq!(
            host.calls(),
            vec![
                "caps",
                "callbacks",
                "on:ClassFileLoadHook",
                "on:VMInit",
                "on:VMDeath",
                "off:VMInit",
                "off:ClassFileLoadHook",
                "dispose"
            ]
        );

        let data = [0xCA, 0xFE];
        assert!(ctx
            .handle_class_load(Some(TARGET), &data, &HeapAllocator)
            .is_unchanged());
    }

    #[test]
    fn test_second_negotiation_is_refused() {
        let host = Arc::new(FakeHost::default());
        let ctx = armed_context(host.clone());
        let err = ctx.negotiate_and_arm(host).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState { .. }));
    }

    #[test]
    fn test_publish_only_before_negotiation() {
        let ctx = AgentContext::default();
        ctx.publish(Arc::new(ExtensionRegistry::new())).unwrap();
        assert!(matches!(
            ctx.publish(Arc::new(ExtensionRegistry::new())),
            Err(BridgeError::AlreadyPublished)
        ));
    }

    #[test]
    fn test_load_events_ignored_until_armed() {
        let ctx = AgentContext::default();
        ctx.publish(registry_with_marker()).unwrap();
        let decision = ctx.handle_class_load(Some(TARGET), &[0xCA], &HeapAllocator);
        assert!(decision.is_unchanged());
    }

    #[test]
    fn test_target_class_is_replaced() {
        let ctx = armed_context(Arc::new(FakeHost::default()));
        ctx.mark_active();

        match ctx.handle_class_load(Some(TARGET), &[0xCA, 0xFE], &HeapAllocator) {
            LoadDecision::Replaced(buffer) => assert_eq!(buffer.as_slice(), &[0xCA, 0xFE, 0xEE]),
            LoadDecision::Unchanged => panic!("Expected target class to be replaced"),
        }
    }

    #[test]
    fn test_excluded_ignored_and_unnamed_are_unchanged() {
        let ctx = armed_context(Arc::new(FakeHost::default()));
        ctx.mark_active();

        for name in [Some("java/lang/String"), Some("com/example/Foo"), None] {
            assert!(ctx
                .handle_class_load(name, &[0xCA], &HeapAllocator)
                .is_unchanged());
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(AgentState::EventCallbacksArmed.to_string(), "event-callbacks-armed");
        assert!(AgentState::Active.accepts_load_events());
        assert!(!AgentState::ShuttingDown.accepts_load_events());
    }
}
