use crate::bindings::new_error_with_name;
use crate::bindings::set_function_to;
use crate::bindings::set_property_to;
use crate::event_loop::AbortState;
use crate::event_loop::FetchFailure;
use crate::event_loop::FetchResponse;
use crate::runtime::App;
use crate::web::buffer_bytes;
use std::io::Read;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use url::Host;
use url::Url;

/// Hard ceiling on how long a worker may sit in a blocking roundtrip.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub fn initialize(scope: &mut v8::HandleScope) -> v8::Global<v8::Object> {
    // Create local JS object.
    let target = v8::Object::new(scope);

    set_function_to(scope, target, "dispatch", dispatch);
    set_function_to(scope, target, "abort", abort);

    // Return v8 global handle.
    v8::Global::new(scope, target)
}

/// Classifies hosts the fetch pool refuses to talk to: loopback, the
/// unspecified address, cloud metadata, RFC-1918 and link-local literals,
/// and the textual hostname `localhost`. The check runs before any DNS
/// lookup or socket work.
pub fn is_blocked_host(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => is_blocked_ipv4(ip),
        Some(Host::Ipv6(ip)) => {
            ip.is_loopback() || ip.to_ipv4_mapped().map(is_blocked_ipv4).unwrap_or(false)
        }
        None => false,
    }
}

fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_private()
        || ip.is_link_local()
        || ip == Ipv4Addr::new(169, 254, 169, 254)
}

/// The request half of a fetch as handed to a worker. Everything is owned
/// on the heap; nothing borrows engine state.
struct FetchTask {
    url: String,
    method: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    max_body_size: usize,
}

/// Starts an outbound HTTP request. Returns `{id, promise}` to the
/// bootstrap's `fetch` wrapper; the promise settles with raw response data
/// on a later event-loop tick (or immediately in eval mode).
fn dispatch(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let target = args.get(0).to_rust_string_lossy(scope);
    let method = match args.get(1).is_string() {
        true => args.get(1).to_rust_string_lossy(scope).to_ascii_uppercase(),
        false => "GET".into(),
    };

    let headers = header_pairs(scope, args.get(2));
    let body = buffer_bytes(scope, args.get(3));

    // Create a promise resolver and extract the actual promise.
    let resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise = resolver.get_promise(scope);

    // The SSRF filter runs before a fetch id is even allocated.
    let parsed = match Url::parse(&target) {
        Ok(url) => url,
        Err(_) => {
            let error = new_error_with_name(scope, "TypeError", &format!("Invalid URL: {target}"));
            resolver.reject(scope, error).unwrap();
            rv.set(wrap_dispatch_result(scope, 0, promise).into());
            return;
        }
    };

    if is_blocked_host(&parsed) {
        let message = format!("Refusing to fetch blocked host: {target}");
        let error = new_error_with_name(scope, "BlockedHost", &message);
        resolver.reject(scope, error).unwrap();
        rv.set(wrap_dispatch_result(scope, 0, promise).into());
        return;
    }

    let state_rc = App::state(scope);
    let state = state_rc.borrow();

    let task = FetchTask {
        url: target,
        method,
        headers,
        body,
        max_body_size: state.max_buffer_size,
    };

    match state.event_loop.as_ref() {
        Some(event_loop) => {
            let resolver = v8::Global::new(scope, resolver);
            let (id, abort) = event_loop.borrow_mut().register_fetch(state.id, resolver);

            event_loop
                .borrow_mut()
                .spawn_fetch(id, Box::new(move || perform(task, Some(abort))));

            rv.set(wrap_dispatch_result(scope, id, promise).into());
        }
        None => {
            // Sync fallback: no event-loop means nothing would ever drain
            // a completion queue, so resolve in place.
            match perform(task, None) {
                Ok(bytes) => {
                    let response: FetchResponse = bincode::deserialize(&bytes).unwrap();
                    let value = response_to_js(scope, &response);
                    resolver.resolve(scope, value).unwrap();
                }
                Err(failure) => {
                    let error = new_error_with_name(scope, &failure.name, &failure.message);
                    resolver.reject(scope, error).unwrap();
                }
            }
            rv.set(wrap_dispatch_result(scope, 0, promise).into());
        }
    }
}

/// Flags an in-flight fetch as aborted, with the signal's reason name.
fn abort(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, _: v8::ReturnValue) {
    let id = args.get(0).number_value(scope).unwrap_or(0.0) as u64;
    let reason = match args.get(1).is_string() {
        true => args.get(1).to_rust_string_lossy(scope),
        false => "AbortError".into(),
    };

    let state = App::state(scope);
    let state = state.borrow();

    if let Some(event_loop) = state.event_loop.as_ref() {
        event_loop.borrow_mut().abort_fetch(id, &reason);
    }
}

/// Blocking HTTP performed on a worker thread (or inline in eval mode).
/// The result ships as bincode bytes, mirroring how completed tasks cross
/// the thread boundary everywhere else in the loop.
fn perform(task: FetchTask, abort: Option<Arc<AbortState>>) -> Result<Vec<u8>, FetchFailure> {
    if let Some(reason) = abort.as_ref().and_then(|abort| abort.aborted()) {
        return Err(aborted_failure(&reason));
    }

    let agent = ureq::AgentBuilder::new().timeout(FETCH_TIMEOUT).build();

    let mut request = agent.request(&task.method, &task.url);
    for (name, value) in &task.headers {
        request = request.set(name, value);
    }

    let result = match task.body {
        Some(body) => request.send_bytes(&body),
        None => request.call(),
    };

    // 4xx/5xx statuses are ordinary responses in fetch semantics.
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(e) => {
            return Err(FetchFailure {
                name: "ConnectionFailed".into(),
                message: e.to_string(),
            })
        }
    };

    if let Some(reason) = abort.as_ref().and_then(|abort| abort.aborted()) {
        return Err(aborted_failure(&reason));
    }

    let status = response.status();
    let headers: Vec<(String, String)> = response
        .headers_names()
        .into_iter()
        .filter_map(|name| {
            response
                .header(&name)
                .map(|value| (name.to_lowercase(), value.to_string()))
        })
        .collect();

    let mut body = Vec::new();
    let limit = task.max_body_size as u64;
    response
        .into_reader()
        .take(limit + 1)
        .read_to_end(&mut body)
        .map_err(|e| FetchFailure {
            name: "ConnectionFailed".into(),
            message: e.to_string(),
        })?;

    if body.len() as u64 > limit {
        return Err(FetchFailure {
            name: "ConnectionFailed".into(),
            message: format!("Response body exceeds the {limit} byte buffer limit"),
        });
    }

    let response = FetchResponse {
        status,
        headers,
        body,
    };

    Ok(bincode::serialize(&response).unwrap())
}

fn aborted_failure(reason: &str) -> FetchFailure {
    let message = match reason {
        "TimeoutError" => "The operation timed out".into(),
        _ => "The operation was aborted".to_string(),
    };
    FetchFailure {
        name: reason.into(),
        message,
    }
}

/// Settles a fetch promise with a completion popped from the loop. Runs
/// inside the owning App's engine and context.
pub fn resolve_completion(
    scope: &mut v8::HandleScope,
    result: Result<Vec<u8>, FetchFailure>,
    resolver: v8::Global<v8::PromiseResolver>,
) {
    let resolver = v8::Local::new(scope, resolver);

    match result {
        Ok(bytes) => {
            let response: FetchResponse = match bincode::deserialize(&bytes) {
                Ok(response) => response,
                Err(e) => {
                    let error = new_error_with_name(scope, "ConnectionFailed", &e.to_string());
                    resolver.reject(scope, error).unwrap();
                    return;
                }
            };
            let value = response_to_js(scope, &response);
            resolver.resolve(scope, value).unwrap();
        }
        Err(failure) => {
            let error = new_error_with_name(scope, &failure.name, &failure.message);
            resolver.reject(scope, error).unwrap();
        }
    }
}

/// Builds the raw `{status, headers, body}` object the bootstrap's fetch
/// wrapper turns into a `Response`.
fn response_to_js<'s>(
    scope: &mut v8::HandleScope<'s>,
    response: &FetchResponse,
) -> v8::Local<'s, v8::Value> {
    let target = v8::Object::new(scope);

    let status = v8::Integer::new(scope, response.status as i32);
    set_property_to(scope, target, "status", status.into());

    let headers = v8::Array::new(scope, response.headers.len() as i32);
    for (i, (name, value)) in response.headers.iter().enumerate() {
        let pair = v8::Array::new(scope, 2);
        let name = v8::String::new(scope, name).unwrap();
        let value = v8::String::new(scope, value).unwrap();
        pair.set_index(scope, 0, name.into());
        pair.set_index(scope, 1, value.into());
        headers.set_index(scope, i as u32, pair.into());
    }
    set_property_to(scope, target, "headers", headers.into());

    let store = response.body.clone().into_boxed_slice();
    let store = v8::ArrayBuffer::new_backing_store_from_boxed_slice(store).make_shared();
    let body = v8::ArrayBuffer::with_backing_store(scope, &store);
    set_property_to(scope, target, "body", body.into());

    target.into()
}

fn wrap_dispatch_result<'s>(
    scope: &mut v8::HandleScope<'s>,
    id: u64,
    promise: v8::Local<'s, v8::Promise>,
) -> v8::Local<'s, v8::Object> {
    let target = v8::Object::new(scope);
    let id = v8::Number::new(scope, id as f64);
    set_property_to(scope, target, "id", id.into());
    set_property_to(scope, target, "promise", promise.into());
    target
}

fn header_pairs(
    scope: &mut v8::HandleScope,
    value: v8::Local<v8::Value>,
) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    let array: v8::Local<v8::Array> = match value.try_into() {
        Ok(array) => array,
        Err(_) => return pairs,
    };

    for i in 0..array.length() {
        let entry = match array.get_index(scope, i) {
            Some(entry) => entry,
            None => continue,
        };
        let entry: v8::Local<v8::Array> = match entry.try_into() {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let name = entry
            .get_index(scope, 0)
            .map(|v| v.to_rust_string_lossy(scope));
        let value = entry
            .get_index(scope, 1)
            .map(|v| v.to_rust_string_lossy(scope));
        if let (Some(name), Some(value)) = (name, value) {
            pairs.push((name, value));
        }
    }

    pairs
}
