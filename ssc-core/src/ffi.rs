//! C ABI for linking ssc-core as a static library into a native webview host.
//! Responses are delivered through the host's callback, on whichever thread completed them.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::slice;
use std::sync::Arc;

use crate::config::CoreConfig;
use crate::protocol::{Callback, Response};
use crate::Core;

/// `payload` is a JSON envelope.
pub const SSC_RESPONSE_ENVELOPE: c_int = 0;
/// `payload` is a script to evaluate in the webview.
pub const SSC_RESPONSE_SCRIPT: c_int = 1;
/// `payload` is the body of a cached post.
pub const SSC_RESPONSE_POST: c_int = 2;

/// Host callback: `(ctx, seq, kind, payload, len)`. `seq` and `payload` are only valid
/// for the duration of the call.
pub type SscResponseFn =
    extern "C" fn(ctx: *mut c_void, seq: *const c_char, kind: c_int, payload: *const u8, len: usize);

/// Host context pointer; the host guarantees it outlives the core and is usable from any thread.
struct HostContext(*mut c_void);

unsafe impl Send for HostContext {}
unsafe impl Sync for HostContext {}

impl HostContext {
    fn ptr(&self) -> *mut c_void {
        self.0
    }
}

fn host_callback(f: SscResponseFn, ctx: *mut c_void) -> Callback {
    let ctx = HostContext(ctx);
    Arc::new(move |response: Response| {
        let seq = c_seq(response.seq());
        match response {
            Response::Envelope { envelope, .. } => {
                let json = envelope.to_json();
                f(ctx.ptr(), seq.as_ptr(), SSC_RESPONSE_ENVELOPE, json.as_ptr(), json.len());
            }
            Response::Script { script, .. } => {
                f(ctx.ptr(), seq.as_ptr(), SSC_RESPONSE_SCRIPT, script.as_ptr(), script.len());
            }
            Response::Post { post, .. } => {
                let body = post.body.unwrap_or_default();
                f(ctx.ptr(), seq.as_ptr(), SSC_RESPONSE_POST, body.as_ptr(), body.len());
            }
        }
    })
}

/// `seq` as a C string. Interior NULs are stripped so the response is still delivered.
fn c_seq(seq: &str) -> CString {
    CString::new(seq).unwrap_or_else(|_| {
        tracing::warn!("response sequence contains a NUL byte; stripped");
        CString::new(seq.replace('\0', "")).unwrap_or_default()
    })
}

/// Byte count as a C return value, or -1 if it does not fit.
fn c_len(len: usize) -> c_int {
    c_int::try_from(len).unwrap_or(-1)
}

struct Handle {
    core: Core,
    callback: Callback,
}

/// Create a core with its own loop thread. Returns opaque handle, or null if `callback`
/// is null or the loop could not start.
#[no_mangle]
pub extern "C" fn ssc_core_create(callback: Option<SscResponseFn>, ctx: *mut c_void) -> *mut c_void {
    let Some(f) = callback else {
        return std::ptr::null_mut();
    };
    let core = match Core::new(CoreConfig::default()) {
        Ok(core) => core,
        Err(e) => {
            tracing::warn!(error = %e, "ssc_core_create failed");
            return std::ptr::null_mut();
        }
    };
    let handle = Handle {
        core,
        callback: host_callback(f, ctx),
    };
    Box::into_raw(Box::new(handle)) as *mut c_void
}

/// Shut the core down (pending requests are answered first) and free it. No-op if h is null.
#[no_mangle]
pub extern "C" fn ssc_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let handle = unsafe { Box::from_raw(h as *mut Handle) };
    if let Err(e) = handle.core.shutdown() {
        tracing::warn!(error = %e, "core shutdown failed");
    }
}

/// Submit an `ipc://` request with an optional body. The answer arrives through the
/// callback. Returns 0 when submitted, -1 on a null handle or non-UTF-8 uri.
#[no_mangle]
pub extern "C" fn ssc_core_invoke(
    h: *mut c_void,
    uri: *const c_char,
    body: *const u8,
    body_len: usize,
) -> c_int {
    if h.is_null() || uri.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const Handle) };
    let Ok(uri) = unsafe { CStr::from_ptr(uri) }.to_str() else {
        return -1;
    };
    let body = if body.is_null() {
        None
    } else {
        Some(unsafe { slice::from_raw_parts(body, body_len) }.to_vec())
    };
    handle.core.invoke_uri(uri, body, handle.callback.clone());
    0
}

/// Copy the body of post `id` into out_buf. With a null out_buf, returns the body length.
/// Returns bytes written, or -1 if the post is unknown, out_buf is too small, or the
/// length does not fit in a `c_int`.
#[no_mangle]
pub extern "C" fn ssc_core_get_post(h: *mut c_void, id: u64, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    if h.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const Handle) };
    let Some(post) = handle.core.get_post(id) else {
        return -1;
    };
    let body = post.body.unwrap_or_default();
    let len = c_len(body.len());
    if out_buf.is_null() || len < 0 {
        return len;
    }
    if body.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(body.as_ptr(), body.len());
    }
    len
}

/// Remove post `id`. Returns 1 if removed, 0 if there was none, -1 on a null handle.
#[no_mangle]
pub extern "C" fn ssc_core_remove_post(h: *mut c_void, id: u64) -> c_int {
    if h.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const Handle) };
    c_int::from(handle.core.remove_post(id))
}

/// Write the network interface envelope (JSON) to out_buf. Returns bytes written, or -1 on
/// error or if out_buf is too small.
#[no_mangle]
pub extern "C" fn ssc_core_network_interfaces(h: *mut c_void, out_buf: *mut u8, out_buf_len: usize) -> c_int {
    if h.is_null() || out_buf.is_null() {
        return -1;
    }
    let handle = unsafe { &*(h as *const Handle) };
    let json = handle.core.network_interfaces().to_json();
    let len = c_len(json.len());
    if len < 0 || json.len() > out_buf_len {
        return -1;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(json.as_ptr(), json.len());
    }
    len
}
