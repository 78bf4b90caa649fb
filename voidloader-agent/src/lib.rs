//! # voidloader-agent
//!
//! A JVMTI agent that intercepts class loading and lets installed mods
//! rewrite selected classes before the VM defines them.
//!
//! ## Flow
//!
//! ```text
//! Agent_OnLoad / nativeAgentInit
//!   -> config -> logging -> discovery (mods dir -> registry)
//!   -> freeze registry -> negotiate capabilities -> arm callbacks
//!
//! ClassFileLoadHook(name, bytes)
//!   -> gate: Excluded | Ignored  => unchanged
//!            Target              => pipeline (registry order) => new buffer
//! ```
//!
//! Everything except the `bridge::callbacks` shims and [`entry`] runs without
//! a VM, which is how the tests drive it.
//!
//! ## Packaging
//!
//! Cargo builds the cdylib as `libvoidloader_agent.so` (`voidloader_agent.dll`,
//! `libvoidloader_agent.dylib`). The Java wrapper resolves it with
//! `System.loadLibrary("VoidLoader_agent")`, so ship the artifact renamed to
//! `libVoidLoader_agent.so` (`VoidLoader_agent.dll`,
//! `libVoidLoader_agent.dylib`). `-agentpath:` and `System.load` take any
//! file name.

pub mod archive;
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod discovery;
pub mod entry;
pub mod gate;
pub mod logging;
pub mod pipeline;
pub mod registry;

pub use bridge::{AgentContext, AgentState, BridgeError, HostEvent, Instrumentation, LoadDecision};
pub use buffer::{AllocError, HeapAllocator, HostAllocator, HostBuffer};
pub use config::{AgentConfig, ConfigError};
pub use discovery::{parse_artifact_filename, DiscoveryError, DiscoveryReport, ModScanner};
pub use gate::{ClassGate, Classification, GateError};
pub use logging::{TracingConfig, TracingFormat};
pub use pipeline::{PipelineError, RuleFailure, TransformOutcome, TransformPipeline};
pub use registry::{
    Admission, DuplicatePolicy, ExtensionKind, ExtensionRecord, ExtensionRegistry, RegistryError,
};

pub use voidloader_api::{ClassTransformer, ModDescriptor, TransformError};
