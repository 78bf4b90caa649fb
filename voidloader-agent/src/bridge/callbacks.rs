//! JVMTI event callbacks
//!
//! Thin `extern "system"` shims around [`AgentContext`](super::AgentContext).
//! No panic may unwind into the VM, so every body runs under `catch_unwind`.

use super::jvmti::{JThread, Jvmti, JvmtiEnv};
use super::{global, LoadDecision};
use crate::pipeline::panic_message;
use jni::sys::{jclass, jint, jobject, JNIEnv};
use std::ffi::{c_char, c_uchar, CStr};
use std::panic::{self, AssertUnwindSafe};

/// `VMInit`: the VM finished initialization
pub unsafe extern "system" fn vm_init(_jvmti: *mut JvmtiEnv, _jni: *mut JNIEnv, _thread: JThread) {
    guard("VMInit", || {
        tracing::info!("VM initialized");
        global().mark_active();
    });
}

/// `VMDeath`: the VM is tearing down
pub unsafe extern "system" fn vm_death(_jvmti: *mut JvmtiEnv, _jni: *mut JNIEnv) {
    guard("VMDeath", || {
        global().shutdown();
    });
}

/// `ClassFileLoadHook`: a class is about to be defined
///
/// Leaves `new_class_data` untouched unless a replacement was produced.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "system" fn class_file_load_hook(
    jvmti: *mut JvmtiEnv,
    _jni: *mut JNIEnv,
    _class_being_redefined: jclass,
    _loader: jobject,
    name: *const c_char,
    _protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
) {
    guard("ClassFileLoadHook", || {
        let ctx = global();
        if !ctx.state().accepts_load_events() {
            return;
        }
        if class_data.is_null()
            || class_data_len <= 0
            || new_class_data.is_null()
            || new_class_data_len.is_null()
        {
            return;
        }
        let Some(env) = Jvmti::from_raw(jvmti) else {
            return;
        };

        // Modified UTF-8; every name we care about is plain ASCII.
        let name = if name.is_null() {
            None
        } else {
            CStr::from_ptr(name).to_str().ok()
        };
        let data = std::slice::from_raw_parts(class_data, class_data_len as usize);

        let decision = ctx.handle_class_load(name, data, &env);
        hand_over(decision, new_class_data_len, new_class_data);
    });
}

/// Move a replacement buffer into the hook's out-parameters
///
/// Returns false for `Unchanged`, in which case nothing is written.
///
/// # Safety
/// Both out-parameters must be valid for writes.
unsafe fn hand_over(
    decision: LoadDecision<'_>,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
) -> bool {
    match decision {
        LoadDecision::Replaced(buffer) => {
            let (ptr, len) = buffer.into_raw();
            *new_class_data = ptr.as_ptr();
            *new_class_data_len = len as jint;
            true
        }
        LoadDecision::Unchanged => false,
    }
}

fn guard(event: &'static str, body: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
        tracing::error!(event, panic = %panic_message(payload.as_ref()), "Callback panicked");
    }
}
