//! Loads a real shared library through the native runtime.
//!
//! The calculator fixture under `tests/fixtures/calc-plugin` is built once per
//! run into the integration-test scratch directory.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use native_plugin_host::{
    ContextState, HostConfig, HostError, NativeRuntime, PluginHost, RawHandle, TracingLogger,
};

const OPS: &str = "Calculator.Ops, Calculator";
const TOKENS: &str = "Calculator.Tokens, Calculator";

type AddFn = extern "C" fn(i32, i32) -> i32;

fn calc_plugin() -> &'static Path {
    static LIBRARY: OnceLock<PathBuf> = OnceLock::new();
    LIBRARY.get_or_init(|| {
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        let fixture = root.join("tests").join("fixtures").join("calc-plugin");
        let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("calc-plugin");

        // Pin the fixture to the versions the host was built with
        let lock = fixture.join("Cargo.lock");
        if !lock.exists() && root.join("Cargo.lock").exists() {
            std::fs::copy(root.join("Cargo.lock"), &lock).unwrap();
        }

        let status = Command::new(env!("CARGO"))
            .arg("build")
            .arg("--manifest-path")
            .arg(fixture.join("Cargo.toml"))
            .arg("--target-dir")
            .arg(&target_dir)
            .status()
            .unwrap();
        assert!(status.success(), "failed to build the calculator fixture");

        target_dir
            .join("debug")
            .join(NativeRuntime::library_file_name("calc_plugin"))
    })
}

/// Native contexts are process-exclusive, so these tests take turns.
fn exclusive() -> MutexGuard<'static, ()> {
    static NATIVE: Mutex<()> = Mutex::new(());
    NATIVE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn native_host(dir: &tempfile::TempDir) -> PluginHost {
    std::fs::write(
        dir.path().join("calc.runtimeconfig.json"),
        r#"{"runtime":{"name":"native","abiVersion":1}}"#,
    )
    .unwrap();
    PluginHost::native(HostConfig::new(dir.path()))
}

#[cfg(target_os = "linux")]
fn is_mapped(path: &Path) -> bool {
    use libc::RTLD_NOLOAD;
    use libloading::os::unix::{Library, RTLD_LAZY};
    unsafe { Library::open(Some(path), RTLD_LAZY | RTLD_NOLOAD) }.is_ok()
}

#[test]
fn test_native_module_round_trip() {
    let _turn = exclusive();
    let library = calc_plugin();
    let dir = tempfile::tempdir().unwrap();
    let host = native_host(&dir);
    host.initialize("calc.runtimeconfig.json").unwrap();

    let add = host.get_function::<AddFn>(library, OPS, "Add").unwrap();
    assert_eq!(add.invoke(2, 3).unwrap(), 5);
    assert_eq!(add.module_path(), library.canonicalize().unwrap());

    let is_attached = host
        .get_function::<extern "C" fn() -> bool>(library, OPS, "IsAttached")
        .unwrap();
    assert!(is_attached.invoke().unwrap());

    let remember = host
        .get_function::<extern "C" fn(RawHandle)>(library, TOKENS, "Remember")
        .unwrap();
    let recall = host
        .get_function::<extern "C" fn() -> RawHandle>(library, TOKENS, "Recall")
        .unwrap();
    let token = host
        .publish_logger("logger", Arc::new(TracingLogger::new("calc")))
        .unwrap();
    remember.invoke(token.into()).unwrap();
    assert_eq!(recall.invoke().unwrap().token(), Some(token));
    remember.invoke(RawHandle::NULL).unwrap();
    assert_eq!(recall.invoke().unwrap().token(), None);

    assert!(matches!(
        host.get_function::<extern "C" fn(i32) -> i32>(library, OPS, "Add"),
        Err(HostError::SignatureMismatch { .. })
    ));
    assert_eq!(host.context().unwrap().load_count(), 1);
}

#[test]
fn test_native_binding_after_dispose() {
    let _turn = exclusive();
    let library = calc_plugin();
    let dir = tempfile::tempdir().unwrap();
    let host = native_host(&dir);
    host.initialize("calc.runtimeconfig.json").unwrap();

    let add = host.get_function::<AddFn>(library, OPS, "Add").unwrap();
    let context = host.context().unwrap();
    host.dispose();
    drop(host);
    assert_eq!(context.state(), ContextState::Disposed);

    // The binding still holds the image, and refuses to call into it
    #[cfg(target_os = "linux")]
    assert!(is_mapped(&library.canonicalize().unwrap()));
    assert!(matches!(add.invoke(2, 3), Err(HostError::InvalidOperation(_))));
    assert!(unsafe { add.get() }.is_err());
}

#[test]
fn test_second_native_context_conflicts() {
    let _turn = exclusive();
    let library = calc_plugin();
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let first = native_host(&first_dir);
    let second = native_host(&second_dir);

    first.initialize("calc.runtimeconfig.json").unwrap();
    let err = second.initialize("calc.runtimeconfig.json").unwrap_err();
    assert!(matches!(err, HostError::ContextConflict(_)));
    assert!(second.context().is_none());

    first.dispose();
    second.initialize("calc.runtimeconfig.json").unwrap();
    let add = second.get_function::<AddFn>(library, OPS, "Add").unwrap();
    assert_eq!(add.invoke(20, 22).unwrap(), 42);
}
