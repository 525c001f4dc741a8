use crate::bindings::set_function_to;
use crate::bindings::set_property_to;
use crate::bindings::throw_type_error;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use url::Url;

pub fn initialize(scope: &mut v8::HandleScope) -> v8::Global<v8::Object> {
    // Create local JS object.
    let target = v8::Object::new(scope);

    set_function_to(scope, target, "parseUrl", parse_url);
    set_function_to(scope, target, "base64Encode", base64_encode);
    set_function_to(scope, target, "base64Decode", base64_decode);
    set_function_to(scope, target, "utf8Encode", utf8_encode);
    set_function_to(scope, target, "utf8Decode", utf8_decode);

    // Return v8 global handle.
    v8::Global::new(scope, target)
}

/// Parses a WHATWG URL (optionally against a base) into its components.
/// The bootstrap's `URL` class wraps the result in read-only getters.
fn parse_url(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let input = args.get(0).to_rust_string_lossy(scope);

    let url = if args.get(1).is_string() {
        let base = args.get(1).to_rust_string_lossy(scope);
        Url::parse(&base).and_then(|base| base.join(&input))
    } else {
        Url::parse(&input)
    };

    let url = match url {
        Ok(url) => url,
        Err(_) => {
            throw_type_error(scope, &format!("Invalid URL: {input}"));
            return;
        }
    };

    let target = v8::Object::new(scope);

    let pairs: &[(&str, String)] = &[
        ("href", url.as_str().into()),
        ("protocol", format!("{}:", url.scheme())),
        ("username", url.username().into()),
        ("password", url.password().unwrap_or_default().into()),
        ("hostname", url.host_str().unwrap_or_default().into()),
        (
            "port",
            url.port().map(|p| p.to_string()).unwrap_or_default(),
        ),
        ("pathname", url.path().into()),
        (
            "search",
            url.query().map(|q| format!("?{q}")).unwrap_or_default(),
        ),
        (
            "hash",
            url.fragment().map(|f| format!("#{f}")).unwrap_or_default(),
        ),
        ("origin", url.origin().ascii_serialization()),
    ];

    for (name, value) in pairs {
        let value = v8::String::new(scope, value).unwrap();
        set_property_to(scope, target, name, value.into());
    }

    rv.set(target.into());
}

/// btoa: encodes a latin-1 string into base64.
fn base64_encode(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let input = args.get(0).to_rust_string_lossy(scope);

    let mut bytes = Vec::with_capacity(input.len());
    for c in input.chars() {
        let code = c as u32;
        if code > 0xFF {
            throw_type_error(scope, "btoa input contains characters outside latin-1");
            return;
        }
        bytes.push(code as u8);
    }

    let encoded = BASE64.encode(&bytes);
    let encoded = v8::String::new(scope, &encoded).unwrap();
    rv.set(encoded.into());
}

/// atob: decodes base64 into a latin-1 string.
fn base64_decode(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let input = args.get(0).to_rust_string_lossy(scope);

    let bytes = match BASE64.decode(input.trim()) {
        Ok(bytes) => bytes,
        Err(_) => {
            throw_type_error(scope, "atob input is not valid base64");
            return;
        }
    };

    let decoded: String = bytes.into_iter().map(|b| b as char).collect();
    let decoded = v8::String::new(scope, &decoded).unwrap();
    rv.set(decoded.into());
}

/// TextEncoder backend: UTF-8 bytes of the given string as an ArrayBuffer.
fn utf8_encode(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let input = args.get(0).to_rust_string_lossy(scope);

    let store = input.into_bytes().into_boxed_slice();
    let store = v8::ArrayBuffer::new_backing_store_from_boxed_slice(store).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);

    rv.set(buffer.into());
}

/// TextDecoder backend: decodes a buffer as UTF-8 (lossy).
fn utf8_decode(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let bytes = match buffer_bytes(scope, args.get(0)) {
        Some(bytes) => bytes,
        None => {
            throw_type_error(scope, "TextDecoder expects an ArrayBuffer or a view");
            return;
        }
    };

    let decoded = String::from_utf8_lossy(&bytes);
    let decoded = v8::String::new(scope, &decoded).unwrap();
    rv.set(decoded.into());
}

/// Copies the contents of an ArrayBuffer or any of its views.
pub fn buffer_bytes(_scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Option<Vec<u8>> {
    if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
        let mut data = vec![0; view.byte_length()];
        view.copy_contents(&mut data);
        return Some(data);
    }

    if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(value) {
        let store = buffer.get_backing_store();
        let data = match store.data() {
            Some(data) => data.as_ptr() as *const u8,
            None => return Some(Vec::new()),
        };
        let bytes = unsafe { std::slice::from_raw_parts(data, buffer.byte_length()) };
        return Some(bytes.to_vec());
    }

    None
}
