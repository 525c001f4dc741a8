use crate::bindings::set_function_to;
use crate::bindings::throw_exception;
use crate::errors::generic_error;
use crate::event_loop::TimerKind;
use crate::runtime::App;

pub fn initialize(scope: &mut v8::HandleScope) -> v8::Global<v8::Object> {
    // A local object that we'll attach all methods to it.
    let target = v8::Object::new(scope);

    set_function_to(scope, target, "createTimer", create_timer);
    set_function_to(scope, target, "removeTimer", remove_timer);

    // Return it as a global reference.
    v8::Global::new(scope, target)
}

/// Schedules a timer on the shared event-loop and returns its id.
fn create_timer(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    // Get timer's callback.
    let callback = match v8::Local::<v8::Function>::try_from(args.get(0)) {
        Ok(callback) => v8::Global::new(scope, callback),
        Err(_) => {
            throw_exception(scope, &generic_error("Timer callback must be a function."));
            return;
        }
    };

    // Get timer's delay (clamped to zero for negative values).
    let delay = args.get(1).number_value(scope).unwrap_or(0.0).max(0.0) as u64;

    // Check if this is a recurring timer.
    let repeat = args.get(2).is_true();
    let kind = match repeat {
        true => TimerKind::Repeating,
        false => TimerKind::Oneshot,
    };

    let state = App::state(scope);
    let state = state.borrow();

    let event_loop = match state.event_loop.as_ref() {
        Some(event_loop) => event_loop,
        None => {
            throw_exception(scope, &generic_error("Timers are unavailable in eval mode."));
            return;
        }
    };

    let id = event_loop
        .borrow_mut()
        .create_timer(state.id, delay, kind, callback);

    rv.set(v8::Number::new(scope, id as f64).into());
}

/// Cancels a timer by its id.
fn remove_timer(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _: v8::ReturnValue,
) {
    let id = args.get(0).number_value(scope).unwrap_or(0.0) as u64;

    let state = App::state(scope);
    let state = state.borrow();

    if let Some(event_loop) = state.event_loop.as_ref() {
        event_loop.borrow_mut().remove_timer(id);
    }
}
