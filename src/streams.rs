use crate::bindings::set_function_to;
use crate::runtime::App;

pub fn initialize(scope: &mut v8::HandleScope) -> v8::Global<v8::Object> {
    // Create local JS object.
    let target = v8::Object::new(scope);

    set_function_to(scope, target, "waitSink", wait_sink);

    // Return v8 global handle.
    v8::Global::new(scope, target)
}

/// Registers a WritableStream sink promise with the event-loop and returns
/// a promise that settles once the sink promise does. The loop polls the
/// sink on every tick, which keeps queued writes strictly ordered: the
/// next write starts only after the returned promise resolves.
fn wait_sink(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let stream_id = args.get(0).number_value(scope).unwrap_or(0.0) as u64;

    let sink: v8::Local<v8::Promise> = match args.get(1).try_into() {
        Ok(promise) => promise,
        Err(_) => {
            // A sink that returned a plain value counts as already settled.
            let resolver = v8::PromiseResolver::new(scope).unwrap();
            let value = args.get(1);
            resolver.resolve(scope, value).unwrap();
            rv.set(resolver.get_promise(scope).into());
            return;
        }
    };

    let state = App::state(scope);
    let state = state.borrow();

    let event_loop = match state.event_loop.as_ref() {
        Some(event_loop) => event_loop,
        None => {
            // Without a loop nothing drives the poll; hand the sink
            // promise straight back so microtasks settle it.
            rv.set(sink.into());
            return;
        }
    };

    let resolver = v8::PromiseResolver::new(scope).unwrap();
    let promise = resolver.get_promise(scope);

    let sink = v8::Global::new(scope, sink);
    let resolver = v8::Global::new(scope, resolver);

    event_loop
        .borrow_mut()
        .register_sink(state.id, stream_id, sink, resolver);

    rv.set(promise.into());
}
