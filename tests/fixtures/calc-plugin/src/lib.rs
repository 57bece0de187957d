//! Calculator module built as a shared library for the native loader tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use native_plugin_host::{declare_export_table, HostCallbackTable, ModuleExports, RawHandle};

static ATTACHED: AtomicBool = AtomicBool::new(false);
static LAST_TOKEN: AtomicU64 = AtomicU64::new(0);

unsafe extern "C" fn attach(host: *const HostCallbackTable) -> i32 {
    if host.is_null() {
        return 1;
    }
    ATTACHED.store(true, Ordering::SeqCst);
    0
}

unsafe extern "C" fn detach() {
    ATTACHED.store(false, Ordering::SeqCst);
}

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn is_attached() -> bool {
    ATTACHED.load(Ordering::SeqCst)
}

extern "C" fn remember(token: RawHandle) {
    LAST_TOKEN.store(token.0, Ordering::SeqCst);
}

extern "C" fn recall() -> RawHandle {
    RawHandle(LAST_TOKEN.load(Ordering::SeqCst))
}

declare_export_table!(ModuleExports::new(c"Calculator")
    .export(c"Calculator.Ops", c"Add", add as extern "C" fn(i32, i32) -> i32)
    .export(c"Calculator.Ops", c"IsAttached", is_attached as extern "C" fn() -> bool)
    .export(c"Calculator.Tokens", c"Remember", remember as extern "C" fn(RawHandle))
    .export(c"Calculator.Tokens", c"Recall", recall as extern "C" fn() -> RawHandle)
    .on_attach(attach)
    .on_detach(detach)
    .build());
