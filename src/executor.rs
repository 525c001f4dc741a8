use crate::errors::JsError;
use crate::event_loop::AppId;
use crate::event_loop::EventLoop;
use crate::fetch;
use crate::runtime::App;
use crate::runtime::MemoryVerdict;
use crate::watchdog::Watchdog;
use std::cell::RefCell;
use std::rc::Rc;

/// Iteration bound of the promise wait loop. A handler that never settles
/// its promise is cut off with a 500 once this many ticks have passed.
const PROMISE_WAIT_BOUND: u32 = 10_000;

/// An HTTP request as the dispatcher hands it over.
#[derive(Debug, Clone, Default)]
pub struct HostRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// What comes back from a handler, ready for serialization.
#[derive(Debug, Clone, PartialEq)]
pub struct HostResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl HostResponse {
    pub fn plain(status: u16, body: impl Into<Vec<u8>>) -> Self {
        HostResponse {
            status,
            content_type: "text/plain".into(),
            body: body.into(),
        }
    }

    pub fn json(status: u16, body: impl Into<Vec<u8>>) -> Self {
        HostResponse {
            status,
            content_type: "application/json".into(),
            body: body.into(),
        }
    }
}

enum WaitError {
    Rejected(String),
    TimedOut,
    NeverResolved,
}

/// Runs one request through an App: enter the cached engine state, invoke
/// the cached handler with `(request, env)`, drive the promise wait loop,
/// and extract the host-side response.
pub fn handle_request(app: &mut App, request: &HostRequest) -> HostResponse {
    // The heap policy runs before any JS does.
    if let MemoryVerdict::Rejected { used, limit } = app.check_memory() {
        tracing::warn!(
            app = %app.name,
            used_bytes = used,
            limit_bytes = limit,
            "request refused by memory policy"
        );
        return HostResponse::plain(503, "Memory limit exceeded");
    }

    let (exports, fetch_fn) = match app.handler() {
        Some(handler) => handler,
        None => return HostResponse::plain(500, "App has no loaded handler"),
    };

    let app_id = app.id;
    let event_loop = app.event_loop();
    let env = app.env.clone();
    let timeout = app.timeout;
    let terminate_handle = app.terminate_handle();

    // The watchdog keeps running through the wait loop; its Drop is the
    // finally path that disarms it on every exit route.
    let mut watchdog = Watchdog::start(terminate_handle.clone(), timeout);

    let scope = &mut app.handle_scope();
    let tc_scope = &mut v8::TryCatch::new(scope);

    let request_value = build_request_object(tc_scope, request);
    let env_value = build_env_object(tc_scope, &env);

    let exports = v8::Local::new(tc_scope, exports);
    let fetch_fn = v8::Local::new(tc_scope, fetch_fn);

    let result = fetch_fn.call(tc_scope, exports.into(), &[request_value, env_value]);

    let mut value = match result {
        Some(value) => value,
        None => {
            // The call itself blew up: either the watchdog cut it off or
            // the handler threw synchronously. Clear any pending
            // termination so the isolate stays usable for later requests.
            terminate_handle.cancel_terminate_execution();
            if watchdog.fired() {
                return HostResponse::plain(408, "Script execution timed out");
            }
            return exception_response(tc_scope);
        }
    };

    if value.is_promise() {
        let promise: v8::Local<v8::Promise> = value.try_into().unwrap();
        value = match wait_for_promise(tc_scope, promise, &watchdog, app_id, event_loop.as_ref()) {
            Ok(value) => value,
            Err(e) => {
                watchdog.stop();
                return wait_error_response(&terminate_handle, e);
            }
        };
    }

    // Stream-bodied responses settle through a bootstrap helper that
    // drains the body; run the wait loop once more on its promise.
    if let Some(pending) = finalize_response(tc_scope, value) {
        value = match wait_for_promise(tc_scope, pending, &watchdog, app_id, event_loop.as_ref()) {
            Ok(value) => value,
            Err(e) => {
                watchdog.stop();
                return wait_error_response(&terminate_handle, e);
            }
        };
    }

    watchdog.stop();
    extract_response(tc_scope, value)
}

/// The promise wait loop: checkpoint microtasks, inspect the promise,
/// check the termination flag, tick the event-loop, bound the iterations.
fn wait_for_promise<'s>(
    scope: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
    promise: v8::Local<'s, v8::Promise>,
    watchdog: &Watchdog,
    app_id: AppId,
    event_loop: Option<&Rc<RefCell<EventLoop>>>,
) -> Result<v8::Local<'s, v8::Value>, WaitError> {
    let mut iterations: u32 = 0;

    loop {
        scope.perform_microtask_checkpoint();

        match promise.state() {
            v8::PromiseState::Fulfilled => return Ok(promise.result(scope)),
            v8::PromiseState::Rejected => {
                promise.mark_as_handled();
                let reason = promise.result(scope);
                let reason = JsError::from_v8_exception(scope, reason);
                return Err(WaitError::Rejected(reason.http_message()));
            }
            v8::PromiseState::Pending => {}
        }

        if watchdog.fired() {
            return Err(WaitError::TimedOut);
        }

        if let Some(event_loop) = event_loop {
            tick_event_loop(scope, app_id, event_loop);
        }

        iterations += 1;
        if iterations > PROMISE_WAIT_BOUND {
            return Err(WaitError::NeverResolved);
        }
    }
}

/// One cooperative tick, run inside the owning App's engine and context:
/// fire due timers, settle arrived fetches, poll async sinks, drain
/// microtasks, then yield briefly so worker threads make progress.
pub fn tick_event_loop(
    scope: &mut v8::HandleScope,
    app_id: AppId,
    event_loop: &Rc<RefCell<EventLoop>>,
) {
    // Microtasks queued before the tick run ahead of any timer callback.
    scope.perform_microtask_checkpoint();

    let due = event_loop.borrow_mut().poll_due_timers(app_id);
    let undefined: v8::Local<v8::Value> = v8::undefined(scope).into();

    for timer in due {
        let tc_scope = &mut v8::TryCatch::new(&mut *scope);
        let callback = v8::Local::new(tc_scope, timer.cb);

        callback.call(tc_scope, undefined, &[]);

        if tc_scope.has_caught() {
            let exception = tc_scope.exception().unwrap();
            let exception = JsError::from_v8_exception(tc_scope, exception);
            tracing::warn!(timer = timer.id, "timer callback threw: {exception}");
        }

        tc_scope.perform_microtask_checkpoint();
    }

    let completions = event_loop.borrow_mut().take_fetch_completions(app_id);
    for (completion, resolver) in completions {
        fetch::resolve_completion(scope, completion.result, resolver);
    }

    poll_sinks(scope, app_id, event_loop);

    scope.perform_microtask_checkpoint();
    event_loop.borrow().pause();
}

/// Step 4 of the tick: any sink promise that settled since the last pass
/// releases its queued write (or errors the stream).
fn poll_sinks(scope: &mut v8::HandleScope, app_id: AppId, event_loop: &Rc<RefCell<EventLoop>>) {
    let sinks = event_loop.borrow().pending_sinks(app_id);
    if sinks.is_empty() {
        return;
    }

    let mut settled = Vec::new();

    for sink in sinks {
        let promise = v8::Local::new(scope, sink.sink);
        let resolver = v8::Local::new(scope, sink.resolver);

        match promise.state() {
            v8::PromiseState::Pending => {}
            v8::PromiseState::Fulfilled => {
                settled.push(sink.id);
                let value = promise.result(scope);
                resolver.resolve(scope, value);
            }
            v8::PromiseState::Rejected => {
                settled.push(sink.id);
                promise.mark_as_handled();
                let reason = promise.result(scope);
                resolver.reject(scope, reason);
                tracing::debug!(stream = sink.stream_id, "async sink rejected");
            }
        }
    }

    event_loop.borrow_mut().remove_sinks(app_id, &settled);
}

/// Flushes callbacks that accumulated while a response was being written.
/// The dispatcher calls this once between requests.
pub fn tick_between_requests(app: &mut App) {
    let app_id = app.id;
    if let Some(event_loop) = app.event_loop() {
        let scope = &mut app.handle_scope();
        tick_event_loop(scope, app_id, &event_loop);
    }
}

/// Drives the loop until an App has no pending work left. `nano run` uses
/// this after evaluating the script.
pub fn run_to_completion(app: &mut App) {
    let app_id = app.id;
    let event_loop = match app.event_loop() {
        Some(event_loop) => event_loop,
        None => return,
    };

    let scope = &mut app.handle_scope();
    scope.perform_microtask_checkpoint();

    while event_loop.borrow_mut().has_pending_work(app_id) {
        tick_event_loop(scope, app_id, &event_loop);
    }
}

fn wait_error_response(
    terminate_handle: &v8::IsolateHandle,
    error: WaitError,
) -> HostResponse {
    match error {
        WaitError::Rejected(message) => HostResponse::plain(500, message),
        WaitError::NeverResolved => HostResponse::plain(500, "Promise did not resolve in time"),
        WaitError::TimedOut => {
            terminate_handle.cancel_terminate_execution();
            HostResponse::plain(408, "Script execution timed out")
        }
    }
}

fn exception_response(tc_scope: &mut v8::TryCatch<v8::HandleScope>) -> HostResponse {
    match tc_scope.exception() {
        Some(exception) => {
            let error = JsError::from_v8_exception(tc_scope, exception);
            HostResponse::plain(500, error.http_message())
        }
        None => HostResponse::plain(500, "Script execution failed"),
    }
}

/// Builds the raw request object the bootstrap wraps into a `Request`.
fn build_request_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    request: &HostRequest,
) -> v8::Local<'s, v8::Value> {
    let target = v8::Object::new(scope);

    let method = v8::String::new(scope, &request.method).unwrap();
    let url = v8::String::new(scope, &request.url).unwrap();

    let key = v8::String::new(scope, "method").unwrap();
    target.set(scope, key.into(), method.into());
    let key = v8::String::new(scope, "url").unwrap();
    target.set(scope, key.into(), url.into());

    let headers = v8::Array::new(scope, request.headers.len() as i32);
    for (i, (name, value)) in request.headers.iter().enumerate() {
        let pair = v8::Array::new(scope, 2);
        let name = v8::String::new(scope, name).unwrap();
        let value = v8::String::new(scope, value).unwrap();
        pair.set_index(scope, 0, name.into());
        pair.set_index(scope, 1, value.into());
        headers.set_index(scope, i as u32, pair.into());
    }
    let key = v8::String::new(scope, "headers").unwrap();
    target.set(scope, key.into(), headers.into());

    let store = request.body.clone().into_boxed_slice();
    let store = v8::ArrayBuffer::new_backing_store_from_boxed_slice(store).make_shared();
    let body = v8::ArrayBuffer::with_backing_store(scope, &store);
    let key = v8::String::new(scope, "body").unwrap();
    target.set(scope, key.into(), body.into());

    // Hand the raw data to the bootstrap's Request wrapper when present.
    let global = scope.get_current_context().global(scope);
    let key = v8::String::new(scope, "__nanoWrapRequest").unwrap();
    if let Some(wrap) = global.get(scope, key.into()) {
        if let Ok(wrap) = v8::Local::<v8::Function>::try_from(wrap) {
            let undefined = v8::undefined(scope);
            if let Some(wrapped) = wrap.call(scope, undefined.into(), &[target.into()]) {
                return wrapped;
            }
        }
    }

    target.into()
}

/// Builds the env object from the App's configured key/value map.
fn build_env_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    env: &std::collections::HashMap<String, String>,
) -> v8::Local<'s, v8::Value> {
    let target = v8::Object::new(scope);

    for (name, value) in env {
        let key = v8::String::new(scope, name).unwrap();
        let value = v8::String::new(scope, value).unwrap();
        target.set(scope, key.into(), value.into());
    }

    target.into()
}

/// Asks the bootstrap to settle stream-bodied responses. Returns a promise
/// to wait on, or None when the value is already extractable.
fn finalize_response<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Option<v8::Local<'s, v8::Promise>> {
    let global = scope.get_current_context().global(scope);
    let key = v8::String::new(scope, "__nanoFinalize").unwrap();
    let finalize = global.get(scope, key.into())?;
    let finalize = v8::Local::<v8::Function>::try_from(finalize).ok()?;

    let undefined = v8::undefined(scope);
    let result = finalize.call(scope, undefined.into(), &[value])?;

    if result.is_promise() {
        let promise: v8::Local<v8::Promise> = result.try_into().unwrap();
        // An already-settled promise short-circuits in the wait loop.
        return Some(promise);
    }

    None
}

/// Copies `_status`, `_body` and `_headers` out of the returned Response
/// shim into host buffers.
fn extract_response(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> HostResponse {
    if !value.is_object() {
        return HostResponse::plain(500, "Handler did not return a Response");
    }

    let object = value.to_object(scope).unwrap();

    let key = v8::String::new(scope, "_status").unwrap();
    let status = object
        .get(scope, key.into())
        .and_then(|v| v.number_value(scope))
        .map(|v| v as u16)
        .filter(|v| *v >= 100)
        .unwrap_or(200);

    let key = v8::String::new(scope, "_body").unwrap();
    let body = object
        .get(scope, key.into())
        .filter(|v| !v.is_null_or_undefined())
        .map(|v| v.to_rust_string_lossy(scope))
        .unwrap_or_default();

    let mut content_type = "text/plain".to_string();

    let key = v8::String::new(scope, "_headers").unwrap();
    if let Some(headers) = object
        .get(scope, key.into())
        .and_then(|v| v.to_object(scope))
    {
        if let Some(names) =
            headers.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
        {
            for i in 0..names.length() {
                let name = match names.get_index(scope, i) {
                    Some(name) => name,
                    None => continue,
                };
                let name_str = name.to_rust_string_lossy(scope);
                if name_str.eq_ignore_ascii_case("content-type") {
                    if let Some(value) = headers.get(scope, name) {
                        content_type = value.to_rust_string_lossy(scope);
                    }
                    break;
                }
            }
        }
    }

    HostResponse {
        status,
        content_type,
        body: body.into_bytes(),
    }
}
