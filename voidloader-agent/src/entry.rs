//! Exported native entry points
//!
//! - `Agent_OnLoad`: the VM loaded the library through `-agentpath:`.
//! - `Java_ru_faumaray_VoidLoaderAgent_*`: the Java-side wrapper loaded the
//!   library with `System.loadLibrary` and calls in through JNI.
//!
//! Both paths share [`activate`]. Nothing here lets a panic unwind into the
//! VM.

use crate::bridge::jvmti::Jvmti;
use crate::bridge::{self, AgentState, BridgeError, Instrumentation};
use crate::config::AgentConfig;
use crate::discovery::ModScanner;
use crate::logging;
use crate::pipeline::panic_message;
use crate::registry::ExtensionRegistry;
use jni::objects::{JClass, JObject, JString};
use jni::sys::{jint, JavaVM, JNI_ERR, JNI_OK};
use jni::JNIEnv;
use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

static ACTIVATION: Mutex<()> = Mutex::new(());

/// How an activation request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// This call armed the agent; carries the resulting state
    Armed(AgentState),
    /// An earlier call already did
    AlreadyActive(AgentState),
}

/// Configure, discover, negotiate and arm
///
/// # Safety
/// `vm` must be null or a valid `JavaVM*` for the life of the process.
pub unsafe fn activate(vm: *mut JavaVM, options: &str) -> Result<Activation, BridgeError> {
    let _serial = ACTIVATION.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    let ctx = bridge::global();
    match ctx.state() {
        AgentState::Uninitialized => {}
        state @ (AgentState::CapabilitiesNegotiated
        | AgentState::EventCallbacksArmed
        | AgentState::Active) => {
            tracing::info!(%state, "Agent already activated");
            return Ok(Activation::AlreadyActive(state));
        }
        state => {
            return Err(BridgeError::InvalidState {
                action: "activate",
                state,
            })
        }
    }

    let config = match AgentConfig::from_options(options) {
        Ok(config) => config,
        Err(e) => {
            logging::init(&Default::default());
            return Err(e.into());
        }
    };
    logging::init(&config.logging);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), options, "VoidLoader agent activating");

    let jvmti = Jvmti::from_vm(vm)?;
    let registry = discover(&config);
    if let Err(e) = ctx.publish(Arc::new(registry)) {
        Instrumentation::dispose(&jvmti);
        return Err(e);
    }

    let state = ctx.negotiate_and_arm(Arc::new(jvmti))?;
    Ok(Activation::Armed(state))
}

/// Discovery never fails activation; a broken directory yields no extensions
fn discover(config: &AgentConfig) -> ExtensionRegistry {
    let scanner = ModScanner::with_policy(config.duplicates);
    let registry = match scanner.discover(&config.mods_dir) {
        Ok((registry, _report)) => registry,
        Err(e) => {
            tracing::error!(dir = %config.mods_dir.display(), error = %e, "Mod discovery failed, continuing without mods");
            ExtensionRegistry::with_policy(config.duplicates)
        }
    };

    for name in &config.disabled {
        if !registry.set_enabled(name, false) {
            tracing::warn!(extension = %name, "Cannot disable unknown extension");
        }
    }
    registry
}

fn report(entry: &'static str, result: Result<Activation, BridgeError>) -> jint {
    match result {
        Ok(Activation::Armed(state)) => {
            tracing::info!(entry, %state, "Agent loaded");
            JNI_OK
        }
        Ok(Activation::AlreadyActive(_)) => JNI_OK,
        Err(e) => {
            tracing::error!(entry, error = %e, "Agent activation failed");
            JNI_ERR
        }
    }
}

/// `-agentpath:` entry point
///
/// # Safety
/// Called by the VM with a valid `JavaVM*` and a null or NUL-terminated
/// option string.
#[no_mangle]
pub unsafe extern "system" fn Agent_OnLoad(
    vm: *mut JavaVM,
    options: *mut c_char,
    _reserved: *mut c_void,
) -> jint {
    panic::catch_unwind(AssertUnwindSafe(|| {
        let options = if options.is_null() {
            String::new()
        } else {
            CStr::from_ptr(options).to_string_lossy().into_owned()
        };
        report("Agent_OnLoad", activate(vm, &options))
    }))
    .unwrap_or_else(|payload| {
        tracing::error!(panic = %panic_message(payload.as_ref()), "Agent_OnLoad panicked");
        JNI_ERR
    })
}

/// "Agent start" signal from the Java wrapper; returns immediately
#[no_mangle]
pub extern "system" fn Java_ru_faumaray_VoidLoaderAgent_nativeAgentStart<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
) {
    let _ = panic::catch_unwind(|| {
        tracing::info!("Native agent started from Java");
    });
}

/// "Agent init" from the Java wrapper: argument text plus the
/// `Instrumentation` handle
#[no_mangle]
pub extern "system" fn Java_ru_faumaray_VoidLoaderAgent_nativeAgentInit<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    args: JString<'local>,
    _instrumentation: JObject<'local>,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let options: String = if args.is_null() {
            String::new()
        } else {
            match env.get_string(&args) {
                Ok(text) => text.into(),
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable agent arguments, using defaults");
                    String::new()
                }
            }
        };

        let vm = match env.get_java_vm() {
            Ok(vm) => vm,
            Err(e) => {
                tracing::error!(error = %e, "Unable to get JavaVM from JNIEnv");
                return;
            }
        };

        // SAFETY: the pointer comes from a live JNIEnv and stays valid for
        // the life of the process.
        let result = unsafe { activate(vm.get_java_vm_pointer(), &options) };
        report("nativeAgentInit", result);
    }));

    if let Err(payload) = result {
        tracing::error!(panic = %panic_message(payload.as_ref()), "nativeAgentInit panicked");
    }
}

/// Shutdown hook from the Java wrapper
#[no_mangle]
pub extern "system" fn Java_ru_faumaray_VoidLoaderAgent_nativeCleanup<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
) {
    let _ = panic::catch_unwind(|| {
        let ctx = bridge::global();
        match ctx.registry() {
            Some(registry) if !registry.is_empty() => tracing::info!(
                state = %ctx.state(),
                "Native cleanup, mods loaded this session:\n{}",
                registry.summary()
            ),
            _ => tracing::info!(state = %ctx.state(), "Native cleanup"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_options_fail_activation() {
        // Config is checked before the VM handle is touched.
        let err = unsafe { activate(std::ptr::null_mut(), "color=yes") }.unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
        assert_eq!(report("test", Err(err)), JNI_ERR);
    }

    #[test]
    fn test_disable_option_applies_after_discovery() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("alpha.so"), b"\x7fELF").unwrap();
        std::fs::write(temp.path().join("beta.so"), b"\x7fELF").unwrap();

        let config = AgentConfig::parse("disable=alpha+ghost")
            .unwrap()
            .with_env(|_| None);
        let config = AgentConfig {
            mods_dir: temp.path().to_path_buf(),
            ..config
        };

        let registry = discover(&config);
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        let enabled: Vec<&str> = registry.enabled().map(|record| record.name()).collect();
        assert_eq!(enabled, vec!["beta"]);
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_unreadable_mods_dir_yields_empty_registry() {
        let temp = tempfile::TempDir::new().unwrap();
        let file = temp.path().join("mods");
        std::fs::write(&file, "not a directory").unwrap();

        let config = AgentConfig {
            mods_dir: file,
            ..AgentConfig::default()
        };
        assert!(discover(&config).is_empty());
    }
}
