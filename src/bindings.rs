use crate::crypto;
use crate::fetch;
use crate::stdio;
use crate::streams;
use crate::timers;
use crate::web;
use anyhow::Error;
use lazy_static::lazy_static;
use std::collections::HashMap;

/// Function pointer for the bindings initializers.
type BindingInitFn = fn(&mut v8::HandleScope<'_>) -> v8::Global<v8::Object>;

lazy_static! {
    pub static ref BINDINGS: HashMap<&'static str, BindingInitFn> = {
        let bindings: Vec<(&'static str, BindingInitFn)> = vec![
            ("stdio", stdio::initialize),
            ("timers", timers::initialize),
            ("fetch", fetch::initialize),
            ("web", web::initialize),
            ("crypto", crypto::initialize),
            ("streams", streams::initialize),
        ];
        HashMap::from_iter(bindings)
    };
}

/// Populates a new JavaScript context with low-level Rust bindings.
pub fn create_new_context<'s>(scope: &mut v8::HandleScope<'s, ()>) -> v8::Local<'s, v8::Context> {
    // Here we need an EscapableHandleScope so V8 doesn't drop the
    // newly created HandleScope on return. (https://v8.dev/docs/embed#handles-and-garbage-collection)
    let scope = &mut v8::EscapableHandleScope::new(scope);

    // Create and enter a new JavaScript context.
    let context = v8::Context::new(scope);
    let global = context.global(scope);
    let scope = &mut v8::ContextScope::new(scope, context);

    // All low-level namespaces hang off a single internal object that the
    // bootstrap script consumes and then removes from the global.
    let nano = v8::Object::new(scope);

    for (name, initialize) in BINDINGS.iter() {
        let binding = initialize(scope);
        let binding = v8::Local::new(scope, binding);
        set_property_to(scope, nano, name, binding.into());
    }

    let key = v8::String::new(scope, "__nano").unwrap();
    global.set(scope, key.into(), nano.into());

    scope.escape(context)
}

/// Adds a property with the given name and value, into the given object.
pub fn set_property_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &str,
    value: v8::Local<v8::Value>,
) {
    let key = v8::String::new(scope, name).unwrap();
    target.set(scope, key.into(), value);
}

/// Adds a `Function` object which calls the given Rust function.
pub fn set_function_to(
    scope: &mut v8::HandleScope<'_>,
    target: v8::Local<v8::Object>,
    name: &'static str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    let key = v8::String::new(scope, name).unwrap();
    let template = v8::FunctionTemplate::new(scope, callback);
    let val = template.get_function(scope).unwrap();

    target.set(scope, key.into(), val.into());
}

/// Builds a JS Error value carrying a specific `name` (e.g. "BlockedHost").
pub fn new_error_with_name<'s>(
    scope: &mut v8::HandleScope<'s>,
    name: &str,
    message: &str,
) -> v8::Local<'s, v8::Value> {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::error(scope, message);

    let key = v8::String::new(scope, "name").unwrap();
    let value = v8::String::new(scope, name).unwrap();
    let object = exception.to_object(scope).unwrap();
    object.set(scope, key.into(), value.into());

    exception
}

/// Useful utility to throw v8 exceptions.
pub fn throw_exception(scope: &mut v8::HandleScope, err: &Error) {
    let message = err.to_string();
    let message = v8::String::new(scope, &message).unwrap();
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

/// Useful utility to throw v8 type errors.
pub fn throw_type_error(scope: &mut v8::HandleScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
}
