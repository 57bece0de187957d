//! End-to-end tests against an in-process calculator module.

use std::path::PathBuf;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use native_plugin_host::{
    declare_export_table, ErrorKind, HostCallbackTable, HostConfig, HostError, HostLogger,
    LogLevel, LoggerFactory, ModuleExports, PluginHost, RawHandle, StaticRuntime,
};

// --- The calculator module, as a plugin crate would write it ---

const CALCULATOR: &str = "Calculator.Ops, Calculator";

static HOST: AtomicPtr<HostCallbackTable> = AtomicPtr::new(std::ptr::null_mut());
static LOGGER: AtomicU64 = AtomicU64::new(0);

unsafe extern "C" fn attach(host: *const HostCallbackTable) -> i32 {
    HOST.store(host as *mut HostCallbackTable, Ordering::SeqCst);
    0
}

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn subtract(a: i32, b: i32) -> i32 {
    a.wrapping_sub(b)
}

extern "C" fn hello() {
    let host = HOST.load(Ordering::SeqCst);
    let logger = LOGGER.load(Ordering::SeqCst);
    if host.is_null() || logger == 0 {
        return;
    }
    let message = "Hello from the calculator module";
    unsafe { ((*host).log)(logger, 2, message.as_ptr(), message.len()) };
}

extern "C" fn set_logger(logger: RawHandle) {
    LOGGER.store(logger.0, Ordering::SeqCst);
}

extern "C" fn set_logger_factory(factory: RawHandle) {
    let host = HOST.load(Ordering::SeqCst);
    if host.is_null() {
        return;
    }
    let category = "Calculator.Ops";
    let logger = unsafe { ((*host).create_logger)(factory.0, category.as_ptr(), category.len()) };
    LOGGER.store(logger, Ordering::SeqCst);
}

declare_export_table!(ModuleExports::new(c"Calculator")
    .export(c"Calculator.Ops", c"Add", add as extern "C" fn(i32, i32) -> i32)
    .export(c"Calculator.Ops", c"Subtract", subtract as extern "C" fn(i32, i32) -> i32)
    .export(c"Calculator.Ops", c"Hello", hello as extern "C" fn())
    .export(c"Calculator.Ops", c"SetLogger", set_logger as extern "C" fn(RawHandle))
    .export(
        c"Calculator.Ops",
        c"SetLoggerFactory",
        set_logger_factory as extern "C" fn(RawHandle)
    )
    .on_attach(attach)
    .build());

// --- Host side ---

type BinaryFn = extern "C" fn(i32, i32) -> i32;
type TokenFn = extern "C" fn(RawHandle);

struct Harness {
    dir: tempfile::TempDir,
    runtime: Arc<StaticRuntime>,
    host: Arc<PluginHost>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(
            StaticRuntime::new().with_module(dir.path().join("Calculator.so"), plugin_host_export_table),
        );
        std::fs::write(
            dir.path().join("Calculator.runtimeconfig.json"),
            r#"{
                "runtime": { "name": "static", "abiVersion": 1 },
                "properties": { "demo": "calculator" }
            }"#,
        )
        .unwrap();
        let host = Arc::new(PluginHost::new(runtime.clone(), HostConfig::new(dir.path())));
        Self { dir, runtime, host }
    }

    fn initialized() -> Self {
        let harness = Self::new();
        harness.host.initialize("Calculator.runtimeconfig.json").unwrap();
        harness
    }

    fn module_path(&self) -> PathBuf {
        self.dir.path().join("Calculator.so")
    }
}

#[derive(Default)]
struct RecordingLogger {
    category: String,
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl HostLogger for RecordingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }
}

#[derive(Default)]
struct RecordingFactory {
    created: Mutex<Vec<Arc<RecordingLogger>>>,
}

impl LoggerFactory for RecordingFactory {
    fn create_logger(&self, category: &str) -> Arc<dyn HostLogger> {
        let logger = Arc::new(RecordingLogger {
            category: category.to_string(),
            ..Default::default()
        });
        self.created.lock().unwrap().push(logger.clone());
        logger
    }
}

#[test]
fn test_arithmetic() {
    let harness = Harness::initialized();
    let add = harness
        .host
        .get_function::<BinaryFn>("Calculator.so", CALCULATOR, "Add")
        .unwrap();
    let subtract = harness
        .host
        .get_function::<BinaryFn>("Calculator.so", CALCULATOR, "Subtract")
        .unwrap();

    assert_eq!(add.invoke(2, 3).unwrap(), 5);
    assert_eq!(add.invoke(-1, 1).unwrap(), 0);
    assert_eq!(subtract.invoke(10, 4).unwrap(), 6);
}

#[test]
fn test_unknown_member() {
    let harness = Harness::initialized();
    let err = harness
        .host
        .get_function::<BinaryFn>("Calculator.so", CALCULATOR, "Multiply")
        .unwrap_err();
    assert!(matches!(err, HostError::SymbolNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::SymbolNotFound);

    let err = harness
        .host
        .get_function::<BinaryFn>("Calculator.so", "Calculator.Scientific, Calculator", "Add")
        .unwrap_err();
    assert!(matches!(err, HostError::SymbolNotFound(_)));
}

#[test]
fn test_missing_module_can_be_retried() {
    let harness = Harness::initialized();
    let err = harness
        .host
        .get_function::<BinaryFn>("Missing.so", CALCULATOR, "Add")
        .unwrap_err();
    assert!(err.is_retryable());

    let add = harness
        .host
        .get_function::<BinaryFn>(harness.module_path(), CALCULATOR, "Add")
        .unwrap();
    assert_eq!(add.invoke(1, 1).unwrap(), 2);
}

#[test]
fn test_signature_checked_at_bind_time() {
    let harness = Harness::initialized();
    let err = harness
        .host
        .get_function::<extern "C" fn(i32) -> i32>("Calculator.so", CALCULATOR, "Add")
        .unwrap_err();
    assert!(matches!(err, HostError::SignatureMismatch { .. }));

    let err = harness
        .host
        .get_function::<extern "C" fn(i32)>("Calculator.so", CALCULATOR, "SetLogger")
        .unwrap_err();
    assert!(matches!(err, HostError::SignatureMismatch { .. }));
}

#[test]
fn test_module_loads_once_for_many_members() {
    let harness = Harness::initialized();
    for member in ["Add", "Subtract"] {
        harness
            .host
            .get_function::<BinaryFn>("Calculator.so", CALCULATOR, member)
            .unwrap();
    }
    harness
        .host
        .get_function::<extern "C" fn()>(harness.module_path(), CALCULATOR, "Hello")
        .unwrap();
    harness
        .host
        .get_function::<TokenFn>("./Calculator.so", CALCULATOR, "SetLogger")
        .unwrap();

    assert_eq!(harness.runtime.load_count(), 1);
    assert_eq!(harness.host.context().unwrap().load_count(), 1);
}

#[test]
fn test_concurrent_first_load() {
    const CALLERS: usize = 16;
    let harness = Harness::initialized();
    let barrier = Arc::new(Barrier::new(CALLERS));

    let results: Vec<i32> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let host = harness.host.clone();
                let barrier = barrier.clone();
                scope.spawn(move || {
                    barrier.wait();
                    let member = if i % 2 == 0 { "Add" } else { "Subtract" };
                    let function = host
                        .get_function::<BinaryFn>("Calculator.so", CALCULATOR, member)
                        .unwrap();
                    function.invoke(i as i32, 1).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(harness.runtime.load_count(), 1);
    assert_eq!(harness.host.context().unwrap().load_count(), 1);
    for (i, result) in results.into_iter().enumerate() {
        let expected = if i % 2 == 0 { i as i32 + 1 } else { i as i32 - 1 };
        assert_eq!(result, expected);
    }
}

#[test]
fn test_republish_releases_previous_token() {
    let harness = Harness::initialized();
    let handles = harness.host.context().unwrap().handles().clone();

    let first = harness
        .host
        .publish_logger("calculator.logger", Arc::new(RecordingLogger::default()))
        .unwrap();
    assert_eq!(handles.pinned_count(), 1);

    for _ in 0..3 {
        harness
            .host
            .publish_logger("calculator.logger", Arc::new(RecordingLogger::default()))
            .unwrap();
        assert_eq!(handles.pinned_count(), 1);
    }
    assert!(!handles.contains(first));
    assert!(!harness.host.release(first));
}

#[test]
fn test_dispose_invalidates_bindings() {
    let harness = Harness::initialized();
    let add = harness
        .host
        .get_function::<BinaryFn>("Calculator.so", CALCULATOR, "Add")
        .unwrap();
    assert_eq!(add.invoke(2, 3).unwrap(), 5);

    harness.host.dispose();

    let err = add.invoke(2, 3).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    let err = harness
        .host
        .get_function::<BinaryFn>("Calculator.so", CALCULATOR, "Add")
        .unwrap_err();
    assert!(matches!(err, HostError::InvalidOperation(_)));
}

#[test]
fn test_initialize_dispose_cycle() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness.host.initialize("Calculator.runtimeconfig.json").unwrap();
        let context = harness.host.context().unwrap();
        assert_eq!(
            context.runtime_config().unwrap().property("demo"),
            Some("calculator")
        );
        harness
            .host
            .publish_logger_factory("factory", Arc::new(RecordingFactory::default()))
            .unwrap();

        harness.host.dispose();
        assert_eq!(context.handles().pinned_count(), 0);
        assert_eq!(harness.host.pinned_count(), 0);
    }
}

#[test]
fn test_plugin_logs_through_host_handles() {
    let harness = Harness::initialized();
    let host = &harness.host;

    let set_logger = host
        .get_function::<TokenFn>("Calculator.so", CALCULATOR, "SetLogger")
        .unwrap();
    let set_logger_factory = host
        .get_function::<TokenFn>("Calculator.so", CALCULATOR, "SetLoggerFactory")
        .unwrap();
    let hello = host
        .get_function::<extern "C" fn()>("Calculator.so", CALCULATOR, "Hello")
        .unwrap();

    // Logger handed over directly
    let logger = Arc::new(RecordingLogger::default());
    let token = host.publish_logger("calculator.logger", logger.clone()).unwrap();
    set_logger.invoke(token.into()).unwrap();
    hello.invoke().unwrap();
    assert!(logger
        .lines
        .lock()
        .unwrap()
        .contains(&(LogLevel::Info, "Hello from the calculator module".to_string())));

    // Logger created by the module from a published factory
    let factory = Arc::new(RecordingFactory::default());
    let token = host
        .publish_logger_factory("calculator.logger-factory", factory.clone())
        .unwrap();
    set_logger_factory.invoke(token.into()).unwrap();
    hello.invoke().unwrap();

    let created = factory.created.lock().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].category, "Calculator.Ops");
    assert_eq!(created[0].lines.lock().unwrap().len(), 1);
    // factory token + logger the module created + directly published logger
    assert_eq!(host.pinned_count(), 3);
    drop(created);

    host.dispose();
    assert_eq!(host.pinned_count(), 0);
    assert_eq!(factory.created.lock().unwrap()[0].lines.lock().unwrap().len(), 1);
}
