//! Raw JVMTI 1.2 interface
//!
//! Only the slots the agent calls are typed; every other function table entry
//! is opaque padding so that field offsets match `jvmti.h`. Slot `n` of the C
//! table (1-based function number) lives at index `n - 1`.

use super::{BridgeError, HostEvent, Instrumentation};
use crate::buffer::{AllocError, HostAllocator};
use jni::sys::{jclass, jint, jlong, jobject, JNIEnv, JavaVM, JNI_OK};
use std::ffi::{c_char, c_uchar, c_void};
use std::fmt;
use std::ptr::{self, NonNull};

/// `JVMTI_VERSION_1_2`
pub const JVMTI_VERSION_1_2: jint = 0x3001_0200;

/// `JVMTI_PHASE_LIVE`
pub const JVMTI_PHASE_LIVE: jint = 4;

const JVMTI_ENABLE: jint = 1;
const JVMTI_DISABLE: jint = 0;
const JVMTI_ERROR_NONE: jint = 0;

pub type JThread = jobject;

/// A `jvmtiEnv*` points at a pointer to the function table
pub type JvmtiEnv = *const JvmtiInterface;

type Opaque = *const c_void;

/// The JVMTI function table, up to `AddCapabilities` (142)
#[repr(C)]
pub struct JvmtiInterface {
    _reserved1: Opaque,
    set_event_notification_mode:
        unsafe extern "C" fn(env: *mut JvmtiEnv, mode: jint, event: jint, thread: JThread, ...) -> jint,
    _slots_3_to_45: [Opaque; 43],
    allocate: unsafe extern "system" fn(env: *mut JvmtiEnv, size: jlong, mem: *mut *mut c_uchar) -> jint,
    deallocate: unsafe extern "system" fn(env: *mut JvmtiEnv, mem: *mut c_uchar) -> jint,
    _slots_48_to_121: [Opaque; 74],
    set_event_callbacks: unsafe extern "system" fn(
        env: *mut JvmtiEnv,
        callbacks: *const EventCallbacks,
        size: jint,
    ) -> jint,
    _slots_123_to_126: [Opaque; 4],
    dispose_environment: unsafe extern "system" fn(env: *mut JvmtiEnv) -> jint,
    get_error_name:
        unsafe extern "system" fn(env: *mut JvmtiEnv, error: jint, name: *mut *mut c_char) -> jint,
    _slots_129_to_132: [Opaque; 4],
    get_phase: unsafe extern "system" fn(env: *mut JvmtiEnv, phase: *mut jint) -> jint,
    _slots_134_to_141: [Opaque; 8],
    add_capabilities:
        unsafe extern "system" fn(env: *mut JvmtiEnv, caps: *const Capabilities) -> jint,
}

/// `jvmtiCapabilities`: 128 one-bit fields in declaration order
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    bits: [u32; 4],
}

impl Capabilities {
    const CAN_GET_BYTECODES: (usize, u32) = (0, 3);
    const CAN_GENERATE_ALL_CLASS_HOOK_EVENTS: (usize, u32) = (0, 26);
    const CAN_RETRANSFORM_CLASSES: (usize, u32) = (1, 5);
    const CAN_RETRANSFORM_ANY_CLASS: (usize, u32) = (1, 6);

    /// What the agent needs to see and rewrite every class
    pub fn required() -> Self {
        let mut caps = Self::default();
        for (word, bit) in [
            Self::CAN_RETRANSFORM_CLASSES,
            Self::CAN_RETRANSFORM_ANY_CLASS,
            Self::CAN_GENERATE_ALL_CLASS_HOOK_EVENTS,
            Self::CAN_GET_BYTECODES,
        ] {
            caps.bits[word] |= 1 << bit;
        }
        caps
    }

    pub fn can_retransform_classes(&self) -> bool {
        self.has(Self::CAN_RETRANSFORM_CLASSES)
    }

    pub fn can_generate_all_class_hook_events(&self) -> bool {
        self.has(Self::CAN_GENERATE_ALL_CLASS_HOOK_EVENTS)
    }

    fn has(&self, (word, bit): (usize, u32)) -> bool {
        self.bits[word] & (1 << bit) != 0
    }
}

pub type VmInitFn = unsafe extern "system" fn(jvmti: *mut JvmtiEnv, jni: *mut JNIEnv, thread: JThread);
pub type VmDeathFn = unsafe extern "system" fn(jvmti: *mut JvmtiEnv, jni: *mut JNIEnv);
pub type ClassFileLoadHookFn = unsafe extern "system" fn(
    jvmti: *mut JvmtiEnv,
    jni: *mut JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
);

/// `jvmtiEventCallbacks`, one slot per event number from 50 (`VMInit`)
#[repr(C)]
pub struct EventCallbacks {
    pub vm_init: Option<VmInitFn>,
    pub vm_death: Option<VmDeathFn>,
    _thread_start: Opaque,
    _thread_end: Opaque,
    pub class_file_load_hook: Option<ClassFileLoadHookFn>,
    _events_55_to_85: [Opaque; 31],
}

impl Default for EventCallbacks {
    fn default() -> Self {
        Self {
            vm_init: None,
            vm_death: None,
            _thread_start: ptr::null(),
            _thread_end: ptr::null(),
            class_file_load_hook: None,
            _events_55_to_85: [ptr::null(); 31],
        }
    }
}

/// A `jvmtiError` other than `JVMTI_ERROR_NONE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JvmtiError(pub jint);

impl JvmtiError {
    pub fn name(self) -> &'static str {
        match self.0 {
            98 => "JVMTI_ERROR_NOT_AVAILABLE",
            99 => "JVMTI_ERROR_MUST_POSSESS_CAPABILITY",
            100 => "JVMTI_ERROR_NULL_POINTER",
            103 => "JVMTI_ERROR_ILLEGAL_ARGUMENT",
            110 => "JVMTI_ERROR_OUT_OF_MEMORY",
            112 => "JVMTI_ERROR_WRONG_PHASE",
            113 => "JVMTI_ERROR_INTERNAL",
            116 => "JVMTI_ERROR_INVALID_ENVIRONMENT",
            _ => "JVMTI_ERROR_UNKNOWN",
        }
    }
}

impl fmt::Display for JvmtiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl std::error::Error for JvmtiError {}

fn check(code: jint) -> Result<(), JvmtiError> {
    if code == JVMTI_ERROR_NONE {
        Ok(())
    } else {
        Err(JvmtiError(code))
    }
}

/// Handle to a JVMTI environment
///
/// JVMTI environments may be used from any thread.
#[derive(Debug, Clone, Copy)]
pub struct Jvmti {
    env: NonNull<JvmtiEnv>,
}

unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Obtain a JVMTI 1.2 environment from the VM
    ///
    /// # Safety
    /// `vm` must be null or a valid `JavaVM*` for the life of the process.
    pub unsafe fn from_vm(vm: *mut JavaVM) -> Result<Self, BridgeError> {
        if vm.is_null() {
            return Err(BridgeError::NoJavaVm);
        }
        let get_env = (**vm).GetEnv.ok_or(BridgeError::NoJavaVm)?;

        let mut env: *mut c_void = ptr::null_mut();
        let status = get_env(vm, &mut env, JVMTI_VERSION_1_2);
        if status != JNI_OK {
            return Err(BridgeError::EnvUnavailable(status));
        }
        Self::from_raw(env.cast()).ok_or(BridgeError::EnvUnavailable(status))
    }

    /// Wrap the environment pointer passed to an event callback
    ///
    /// # Safety
    /// `env` must be null or a live `jvmtiEnv*`.
    pub unsafe fn from_raw(env: *mut JvmtiEnv) -> Option<Self> {
        NonNull::new(env).map(|env| Self { env })
    }

    fn table(&self) -> &JvmtiInterface {
        // SAFETY: a live jvmtiEnv points at the VM's static function table.
        unsafe { &**self.env.as_ptr() }
    }

    pub fn request_capabilities(&self, caps: &Capabilities) -> Result<(), JvmtiError> {
        check(unsafe { (self.table().add_capabilities)(self.env.as_ptr(), caps) })
    }

    pub fn set_event_callbacks(&self, callbacks: &EventCallbacks) -> Result<(), JvmtiError> {
        let size = std::mem::size_of::<EventCallbacks>() as jint;
        check(unsafe { (self.table().set_event_callbacks)(self.env.as_ptr(), callbacks, size) })
    }

    pub fn set_event_enabled(&self, event: HostEvent, enabled: bool) -> Result<(), JvmtiError> {
        let mode = if enabled { JVMTI_ENABLE } else { JVMTI_DISABLE };
        check(unsafe {
            (self.table().set_event_notification_mode)(
                self.env.as_ptr(),
                mode,
                event.number(),
                ptr::null_mut(),
            )
        })
    }

    pub fn phase(&self) -> Result<jint, JvmtiError> {
        let mut phase = 0;
        check(unsafe { (self.table().get_phase)(self.env.as_ptr(), &mut phase) })?;
        Ok(phase)
    }

    /// The VM's own name for `error`, falling back to the built-in table
    pub fn error_name(&self, error: JvmtiError) -> String {
        let mut name: *mut c_char = ptr::null_mut();
        let status = unsafe { (self.table().get_error_name)(self.env.as_ptr(), error.0, &mut name) };
        if status != JVMTI_ERROR_NONE || name.is_null() {
            return error.to_string();
        }

        // SAFETY: GetErrorName returns a NUL-terminated string allocated with
        // Allocate, which we release right after copying.
        let text = unsafe { std::ffi::CStr::from_ptr(name) }
            .to_string_lossy()
            .into_owned();
        unsafe { (self.table().deallocate)(self.env.as_ptr(), name.cast()) };
        text
    }

    /// Release the environment and every capability it holds
    pub fn dispose_environment(&self) -> Result<(), JvmtiError> {
        check(unsafe { (self.table().dispose_environment)(self.env.as_ptr()) })
    }
}

unsafe impl HostAllocator for Jvmti {
    fn allocate(&self, len: usize) -> Result<NonNull<u8>, AllocError> {
        let size = jlong::try_from(len).map_err(|_| AllocError::TooLarge(len))?;
        if size == 0 {
            return Err(AllocError::ZeroLength);
        }

        let mut mem: *mut c_uchar = ptr::null_mut();
        let status = unsafe { (self.table().allocate)(self.env.as_ptr(), size, &mut mem) };
        if status != JVMTI_ERROR_NONE {
            return Err(AllocError::Refused { len, code: status });
        }
        NonNull::new(mem).ok_or(AllocError::Refused { len, code: status })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _len: usize) {
        let status = (self.table().deallocate)(self.env.as_ptr(), ptr.as_ptr());
        if status != JVMTI_ERROR_NONE {
            tracing::warn!(error = %JvmtiError(status), "Deallocate failed");
        }
    }
}

impl Instrumentation for Jvmti {
    fn add_capabilities(&self) -> Result<(), BridgeError> {
        self.request_capabilities(&Capabilities::required())
            .map_err(|e| BridgeError::Capabilities(self.error_name(e)))
    }

    fn register_callbacks(&self) -> Result<(), BridgeError> {
        let callbacks = EventCallbacks {
            vm_init: Some(super::callbacks::vm_init),
            vm_death: Some(super::callbacks::vm_death),
            class_file_load_hook: Some(super::callbacks::class_file_load_hook),
            ..Default::default()
        };
        self.set_event_callbacks(&callbacks)
            .map_err(|e| BridgeError::Callbacks(self.error_name(e)))
    }

    fn set_event(&self, event: HostEvent, enabled: bool) -> Result<(), BridgeError> {
        self.set_event_enabled(event, enabled)
            .map_err(|e| BridgeError::Event {
                event,
                reason: self.error_name(e),
            })
    }

    fn is_live(&self) -> Result<bool, BridgeError> {
        self.phase()
            .map(|phase| phase == JVMTI_PHASE_LIVE)
            .map_err(|e| BridgeError::Phase(self.error_name(e)))
    }

    fn dispose(&self) {
        if let Err(e) = self.dispose_environment() {
            tracing::warn!(error = %e, "DisposeEnvironment failed");
        }
    }
}
