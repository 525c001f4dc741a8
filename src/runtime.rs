use crate::bindings;
use crate::errors::JsError;
use crate::errors::LoadError;
use crate::event_loop::AppId;
use crate::event_loop::EventLoop;
use anyhow::bail;
use anyhow::Error;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

/// Upper bound on the size of an app's `index.js`.
pub const MAX_SCRIPT_SIZE: usize = 1024 * 1024;

/// Initial heap handed to every isolate; the configured cap is the max.
const INITIAL_HEAP_SIZE: usize = 4 * 1024 * 1024;

/// Core JavaScript environment built on top of the Rust bindings.
static BOOTSTRAP: &str = include_str!("./js/bootstrap.js");

/// The state stored per v8 isolate.
pub struct AppState {
    /// Tags loop resources (timers, fetches, sinks) with their owner.
    pub id: AppId,
    /// A non-owning reference to the process-shared event-loop. Absent in
    /// eval mode, where `fetch` falls back to a synchronous roundtrip.
    pub event_loop: Option<Rc<RefCell<EventLoop>>>,
    /// Cap applied to outbound fetch response bodies.
    pub max_buffer_size: usize,
}

/// Per-app settings coming from the config file or the admin API.
#[derive(Debug, Clone)]
pub struct AppOptions {
    pub name: String,
    pub hostname: String,
    pub timeout_ms: u64,
    pub memory_mb: usize,
    pub max_buffer_size_mb: usize,
    pub env: HashMap<String, String>,
}

impl Default for AppOptions {
    fn default() -> Self {
        AppOptions {
            name: "app".into(),
            hostname: "localhost".into(),
            timeout_ms: 5000,
            memory_mb: 128,
            max_buffer_size_mb: 10,
            env: HashMap::new(),
        }
    }
}

/// The handler state cached at load time and reused for every request.
struct CachedHandler {
    exports: v8::Global<v8::Object>,
    fetch: v8::Global<v8::Function>,
}

/// A loaded user handler confined to its own engine instance.
///
/// Field order doubles as the teardown order: the cached persistent
/// handles are released first, then the isolate is disposed, then the
/// shared allocator reference, the env map and the source buffer go.
pub struct App {
    pub id: AppId,
    pub name: String,
    pub path: String,
    pub hostname: String,
    pub timeout: Duration,
    pub memory_limit_mb: usize,
    context: v8::Global<v8::Context>,
    handler: Option<CachedHandler>,
    isolate: v8::OwnedIsolate,
    isolate_handle: v8::IsolateHandle,
    // Referenced by the near-heap-limit callback; must outlive the isolate.
    _heap_guard: Option<Box<v8::IsolateHandle>>,
    event_loop: Option<Rc<RefCell<EventLoop>>>,
    // Held for the App's lifetime, released at the tail of teardown.
    #[allow(dead_code)]
    allocator: v8::SharedRef<v8::Allocator>,
    pub env: HashMap<String, String>,
    #[allow(dead_code)]
    source: String,
}

/// Outcome of the pre-request heap inspection.
#[derive(Debug, PartialEq)]
pub enum MemoryVerdict {
    Ok,
    /// Heap stayed above the hard threshold even after an advisory GC.
    Rejected { used: usize, limit: usize },
}

/// Owns the process-wide pieces every App shares: the v8 platform, the
/// array-buffer allocator and the event-loop. Construct one per process,
/// before loading any App.
pub struct Host {
    allocator: v8::SharedRef<v8::Allocator>,
    event_loop: Rc<RefCell<EventLoop>>,
    next_app_id: Cell<AppId>,
}

impl Host {
    pub fn new() -> Host {
        init_v8();

        Host {
            allocator: v8::new_default_allocator().make_shared(),
            event_loop: Rc::new(RefCell::new(EventLoop::default())),
            next_app_id: Cell::new(1),
        }
    }

    pub fn event_loop(&self) -> Rc<RefCell<EventLoop>> {
        self.event_loop.clone()
    }

    fn next_id(&self) -> AppId {
        let id = self.next_app_id.get();
        self.next_app_id.set(id + 1);
        id
    }

    /// Loads `index.js` from the given path into a fresh engine instance,
    /// compiles it inside the module envelope, validates the exported
    /// handler and caches the execution state for the App's lifetime.
    pub fn load_app<P: AsRef<Path>>(
        &self,
        path: P,
        options: AppOptions,
    ) -> Result<App, LoadError> {
        // The App keeps the path as configured; reload diffing compares
        // it verbatim. The actual script file is resolved from it.
        let source_path = path.as_ref().display().to_string();
        let script_path = resolve_script_path(path.as_ref());
        let display_path = script_path.display().to_string();

        if !script_path.is_file() {
            return Err(LoadError::FileNotFound(display_path));
        }

        let source = fs::read_to_string(&script_path)
            .map_err(|e| LoadError::FileReadError(format!("{display_path}: {e}")))?;

        if source.len() > MAX_SCRIPT_SIZE {
            return Err(LoadError::ScriptTooLarge(MAX_SCRIPT_SIZE));
        }

        let envelope = wrap_envelope(&rewrite_default_export(&source));
        let mut app = self.new_instance(
            &options.name,
            &source_path,
            &options,
            Some(self.event_loop.clone()),
            source,
        );

        // Run the bootstrap first so the envelope sees the full surface.
        {
            let scope = &mut app.handle_scope();
            if let Err(e) = execute(scope, "nano:environment/bootstrap", BOOTSTRAP) {
                return Err(LoadError::ExecutionFailed(e.to_string()));
            }
        }

        // Compile and run the user's script, then pick the handler apart.
        let handler = {
            let scope = &mut app.handle_scope();
            let tc_scope = &mut v8::TryCatch::new(scope);

            let origin = create_origin(tc_scope, &display_path);
            let code = match v8::String::new(tc_scope, &envelope) {
                Some(code) => code,
                None => return Err(LoadError::ScriptTooLarge(MAX_SCRIPT_SIZE)),
            };

            let script = match v8::Script::compile(tc_scope, code, Some(&origin)) {
                Some(script) => script,
                None => return Err(LoadError::CompilationFailed(caught_message(tc_scope))),
            };

            let exports = match script.run(tc_scope) {
                Some(value) => value,
                None => return Err(LoadError::ExecutionFailed(caught_message(tc_scope))),
            };

            let exports: v8::Local<v8::Object> = match exports.to_object(tc_scope) {
                Some(object) if exports.is_object() => object,
                _ => return Err(LoadError::InvalidExports),
            };

            let key = v8::String::new(tc_scope, "fetch").unwrap();
            let fetch = match exports.get(tc_scope, key.into()) {
                Some(value) if !value.is_undefined() && !value.is_null() => value,
                _ => return Err(LoadError::MissingFetch),
            };

            let fetch: v8::Local<v8::Function> = match fetch.try_into() {
                Ok(function) => function,
                Err(_) => return Err(LoadError::FetchNotFunction),
            };

            CachedHandler {
                exports: v8::Global::new(tc_scope, exports),
                fetch: v8::Global::new(tc_scope, fetch),
            }
        };

        app.handler = Some(handler);

        // A script that ate its whole heap while loading is not servable.
        if options.memory_mb > 0 {
            let (used, limit) = app.heap_usage();
            if limit > 0 && used as f64 / limit as f64 > 0.95 {
                return Err(LoadError::OutOfMemory);
            }
        }

        Ok(app)
    }

    /// Builds a bare engine instance for `nano run` and the REPL. When
    /// `with_loop` is false the instance has no event-loop and `fetch`
    /// degrades to its synchronous fallback.
    pub fn eval_instance(&self, with_loop: bool) -> App {
        let event_loop = with_loop.then(|| self.event_loop.clone());
        let mut app = self.new_instance(
            "eval",
            "(eval)",
            &AppOptions::default(),
            event_loop,
            String::new(),
        );

        {
            let scope = &mut app.handle_scope();
            if let Err(e) = execute(scope, "nano:environment/bootstrap", BOOTSTRAP) {
                // The embedded bootstrap failing is a build defect, not a
                // user error.
                panic!("bootstrap failed: {e}");
            }
        }

        app
    }

    fn new_instance(
        &self,
        name: &str,
        path: &str,
        options: &AppOptions,
        event_loop: Option<Rc<RefCell<EventLoop>>>,
        source: String,
    ) -> App {
        let mut params = v8::CreateParams::default()
            .array_buffer_allocator(self.allocator.clone());

        if options.memory_mb > 0 {
            params = params.heap_limits(INITIAL_HEAP_SIZE, options.memory_mb * 1024 * 1024);
        }

        let mut isolate = v8::Isolate::new(params);

        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);
        isolate.set_capture_stack_trace_for_uncaught_exceptions(true, 10);

        let isolate_handle = isolate.thread_safe_handle();

        // When a script runs into its heap cap, terminate it and raise the
        // limit just enough to unwind. Without this v8 aborts the whole
        // process, taking every other App down with it.
        let heap_guard = (options.memory_mb > 0).then(|| {
            let guard = Box::new(isolate.thread_safe_handle());
            let data = &*guard as *const v8::IsolateHandle as *mut std::ffi::c_void;
            isolate.add_near_heap_limit_callback(near_heap_limit_cb, data);
            guard
        });

        let context = {
            let scope = &mut v8::HandleScope::new(&mut *isolate);
            let context = bindings::create_new_context(scope);
            v8::Global::new(scope, context)
        };

        let id = self.next_id();

        // Store state inside the v8 isolate slot so bindings can reach the
        // loop and the owner tag from any callback.
        isolate.set_slot(Rc::new(RefCell::new(AppState {
            id,
            event_loop: event_loop.clone(),
            max_buffer_size: options.max_buffer_size_mb * 1024 * 1024,
        })));

        App {
            id,
            name: name.into(),
            path: path.into(),
            hostname: options.hostname.clone(),
            timeout: Duration::from_millis(options.timeout_ms),
            memory_limit_mb: options.memory_mb,
            context,
            handler: None,
            isolate,
            isolate_handle,
            _heap_guard: heap_guard,
            event_loop,
            allocator: self.allocator.clone(),
            env: options.env.clone(),
            source,
        }
    }
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for App {
    fn drop(&mut self) {
        // Timers, fetch resolvers and sinks on the shared loop hold
        // persistent handles into this isolate; release them first, then
        // let the field order run the rest of the teardown.
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.borrow_mut().release_app(self.id);
        }
    }
}

impl App {
    /// Returns the state stored in the given isolate.
    pub fn state(isolate: &v8::Isolate) -> Rc<RefCell<AppState>> {
        isolate
            .get_slot::<Rc<RefCell<AppState>>>()
            .unwrap()
            .clone()
    }

    /// Returns a v8 handle scope entered into the App's cached context.
    pub fn handle_scope(&mut self) -> v8::HandleScope {
        let context = self.context.clone();
        v8::HandleScope::with_context(&mut self.isolate, context)
    }

    /// A thread-safe handle used by the watchdog to terminate execution.
    pub fn terminate_handle(&self) -> v8::IsolateHandle {
        self.isolate_handle.clone()
    }

    pub fn event_loop(&self) -> Option<Rc<RefCell<EventLoop>>> {
        self.event_loop.clone()
    }

    /// Clones of the cached exports object and `fetch` function.
    pub fn handler(&self) -> Option<(v8::Global<v8::Object>, v8::Global<v8::Function>)> {
        self.handler
            .as_ref()
            .map(|h| (h.exports.clone(), h.fetch.clone()))
    }

    /// Current used heap and heap limit in bytes.
    pub fn heap_usage(&mut self) -> (usize, usize) {
        let mut stats = v8::HeapStatistics::default();
        self.isolate.get_heap_statistics(&mut stats);
        (stats.used_heap_size(), stats.heap_size_limit())
    }

    /// Used heap as a share of the limit, for the admin listing.
    pub fn memory_percent(&mut self) -> f64 {
        let (used, limit) = self.heap_usage();
        if limit == 0 {
            return 0.0;
        }
        (used as f64 / limit as f64) * 100.0
    }

    /// Pre-request heap policy: above 0.80 utilization emit a low-memory
    /// hint and requery; still above 0.95 afterwards means the request is
    /// refused before entering JS.
    pub fn check_memory(&mut self) -> MemoryVerdict {
        if self.memory_limit_mb == 0 {
            return MemoryVerdict::Ok;
        }

        let (used, limit) = self.heap_usage();
        if limit == 0 || (used as f64 / limit as f64) <= 0.80 {
            return MemoryVerdict::Ok;
        }

        let before = used;
        self.isolate.low_memory_notification();

        let (used, limit) = self.heap_usage();
        tracing::warn!(
            app = %self.name,
            before_bytes = before,
            after_bytes = used,
            limit_bytes = limit,
            "heap pressure triggered advisory GC"
        );

        if (used as f64 / limit as f64) > 0.95 {
            return MemoryVerdict::Rejected { used, limit };
        }

        MemoryVerdict::Ok
    }

    /// Executes a plain script inside the App's context. Used by the REPL
    /// and `nano run`; request handling goes through the executor instead.
    pub fn execute_script(
        &mut self,
        filename: &str,
        source: &str,
    ) -> Result<v8::Global<v8::Value>, Error> {
        let scope = &mut self.handle_scope();
        execute(scope, filename, source)
    }
}

/// Compiles and runs a script, catching runtime errors rather than panicking.
fn execute(
    scope: &mut v8::HandleScope,
    filename: &str,
    source: &str,
) -> Result<v8::Global<v8::Value>, Error> {
    let origin = create_origin(scope, filename);
    let source = v8::String::new(scope, source).unwrap();

    let tc_scope = &mut v8::TryCatch::new(scope);

    let script = match v8::Script::compile(tc_scope, source, Some(&origin)) {
        Some(script) => script,
        None => {
            assert!(tc_scope.has_caught());
            let exception = tc_scope.exception().unwrap();
            bail!(JsError::from_v8_exception(tc_scope, exception));
        }
    };

    match script.run(tc_scope) {
        Some(value) => Ok(v8::Global::new(tc_scope, value)),
        None => {
            assert!(tc_scope.has_caught());
            let exception = tc_scope.exception().unwrap();
            bail!(JsError::from_v8_exception(tc_scope, exception));
        }
    }
}

/// Rewrites the `export default ` idiom into an assignment the envelope
/// recognizes, so idiomatic module sources work as plain scripts.
pub fn rewrite_default_export(source: &str) -> String {
    source.replace("export default ", "__default = ")
}

/// Wraps the (rewritten) user source into a self-invoking function that
/// yields the module's exports. `__setDefault` stays available as a legacy
/// fallback for pre-module-syntax sources.
pub fn wrap_envelope(source: &str) -> String {
    format!(
        "(function () {{\n\
         let __exports = {{}};\n\
         let __default;\n\
         globalThis.__setDefault = function (value) {{ __default = value; }};\n\
         {source}\n\
         ;return __default || __exports;\n\
         }})()"
    )
}

fn resolve_script_path(path: &Path) -> std::path::PathBuf {
    use path_clean::PathClean;

    let path = if path.is_dir() {
        path.join("index.js")
    } else {
        path.to_path_buf()
    };
    path.clean()
}

fn caught_message(tc_scope: &mut v8::TryCatch<v8::HandleScope>) -> String {
    match tc_scope.exception() {
        Some(exception) => {
            let error = JsError::from_v8_exception(tc_scope, exception);
            error.http_message()
        }
        None => "Unknown error".into(),
    }
}

pub fn create_origin<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    name: &str,
) -> v8::ScriptOrigin<'s> {
    let name = v8::String::new(scope, name).unwrap();
    let source_map = v8::undefined(scope);

    v8::ScriptOrigin::new(
        scope,
        name.into(),
        0,
        0,
        false,
        0,
        source_map.into(),
        false,
        false,
        false,
    )
}

extern "C" fn near_heap_limit_cb(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    let handle = unsafe { &*(data as *const v8::IsolateHandle) };
    handle.terminate_execution();
    current_heap_limit * 2
}

/// Fires up the v8 engine once per process.
pub fn init_v8() {
    static V8_INIT: Once = Once::new();
    V8_INIT.call_once(move || {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn host() -> Host {
        Host::new()
    }

    #[test]
    fn rewrite_replaces_default_export() {
        let source = "export default { fetch(req) { return new Response(\"ok\"); } }";
        let rewritten = rewrite_default_export(source);
        assert!(rewritten.starts_with("__default = {"));
        assert!(!rewritten.contains("export default"));
    }

    #[test]
    fn envelope_returns_default_or_exports() {
        let wrapped = wrap_envelope("__default = 1;");
        assert!(wrapped.contains("return __default || __exports"));
        assert!(wrapped.contains("__setDefault"));
    }

    #[test]
    fn load_rejects_missing_file() {
        let host = host();
        let err = host
            .load_app("/definitely/not/here", AppOptions::default())
            .unwrap_err();
        assert!(matches!(err, LoadError::FileNotFound(_)));
    }

    #[test]
    fn load_caches_fetch_handler() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js")
            .write_str("export default { fetch(req, env) { return new Response(\"hi\"); } }")
            .unwrap();

        let host = host();
        let app = host.load_app(dir.path(), AppOptions::default()).unwrap();
        assert!(app.handler().is_some());
    }

    #[test]
    fn load_supports_legacy_set_default() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js")
            .write_str("__setDefault({ fetch() { return new Response(\"legacy\"); } });")
            .unwrap();

        let host = host();
        let app = host.load_app(dir.path(), AppOptions::default()).unwrap();
        assert!(app.handler().is_some());
    }

    #[test]
    fn load_rejects_missing_fetch() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js")
            .write_str("export default { ping() { return 1; } }")
            .unwrap();

        let host = host();
        let err = host.load_app(dir.path(), AppOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::MissingFetch));
    }

    #[test]
    fn load_rejects_non_function_fetch() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js")
            .write_str("export default { fetch: 42 }")
            .unwrap();

        let host = host();
        let err = host.load_app(dir.path(), AppOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::FetchNotFunction));
    }

    #[test]
    fn load_rejects_compile_errors() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js").write_str("export default {").unwrap();

        let host = host();
        let err = host.load_app(dir.path(), AppOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::CompilationFailed(_)));
    }

    #[test]
    fn eval_instance_runs_scripts() {
        let host = host();
        let mut app = host.eval_instance(false);
        let value = app.execute_script("<test>", "21 * 2").unwrap();

        let scope = &mut app.handle_scope();
        let value = v8::Local::new(scope, value);
        assert_eq!(value.int32_value(scope), Some(42));
    }

    fn eval_string(app: &mut App, source: &str) -> String {
        let value = app.execute_script("<test>", source).unwrap();
        let scope = &mut app.handle_scope();
        let value = v8::Local::new(scope, value);
        value.to_rust_string_lossy(scope)
    }

    #[test]
    fn base64_round_trips_latin1_strings() {
        let host = host();
        let mut app = host.eval_instance(false);
        assert_eq!(
            eval_string(&mut app, "atob(btoa('Hello, nano!'))"),
            "Hello, nano!"
        );
        assert_eq!(eval_string(&mut app, "btoa('abc')"), "YWJj");
    }

    #[test]
    fn utf8_encode_decode_round_trips() {
        let host = host();
        let mut app = host.eval_instance(false);
        assert_eq!(
            eval_string(
                &mut app,
                "new TextDecoder().decode(new TextEncoder().encode('høst ✓ 日本'))"
            ),
            "høst ✓ 日本"
        );
    }

    #[test]
    fn url_accessors_expose_whatwg_components() {
        let host = host();
        let mut app = host.eval_instance(false);
        let parts = eval_string(
            &mut app,
            "const u = new URL('https://user@example.com:8443/a/b?q=1#frag');\
             [u.protocol, u.hostname, u.port, u.pathname, u.search, u.hash].join('|')",
        );
        assert_eq!(parts, "https:|example.com|8443|/a/b|?q=1|#frag");

        let params = eval_string(
            &mut app,
            "new URL('http://x.dev/p?a=1&b=two').searchParams.get('b')",
        );
        assert_eq!(params, "two");
    }

    #[test]
    fn headers_are_case_insensitive_and_append_joins() {
        let host = host();
        let mut app = host.eval_instance(false);
        assert_eq!(
            eval_string(
                &mut app,
                "const h = new Headers({ 'Content-Type': 'text/html' });\
                 h.get('content-type')"
            ),
            "text/html"
        );
        assert_eq!(
            eval_string(
                &mut app,
                "const v = new Headers();\
                 v.append('Accept', 'text/html');\
                 v.append('accept', 'application/json');\
                 v.get('ACCEPT')"
            ),
            "text/html, application/json"
        );
    }

    #[test]
    fn random_uuid_is_v4_shaped() {
        let host = host();
        let mut app = host.eval_instance(false);
        let uuid = eval_string(&mut app, "crypto.randomUUID()");
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.chars().nth(14), Some('4'));
        assert_eq!(uuid.chars().filter(|c| *c == '-').count(), 4);
    }

    #[test]
    fn abort_controller_flags_its_signal() {
        let host = host();
        let mut app = host.eval_instance(false);
        assert_eq!(
            eval_string(
                &mut app,
                "const c = new AbortController();\
                 c.abort();\
                 [c.signal.aborted, c.signal.reason.name].join('|')"
            ),
            "true|AbortError"
        );
    }

    #[test]
    fn memory_check_passes_under_pressure_threshold() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js")
            .write_str("export default { fetch() { return new Response(\"ok\"); } }")
            .unwrap();

        let host = host();
        let mut app = host.load_app(dir.path(), AppOptions::default()).unwrap();
        assert_eq!(app.check_memory(), MemoryVerdict::Ok);
    }
}
