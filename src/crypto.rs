use crate::bindings::set_function_to;
use crate::bindings::throw_type_error;
use crate::web::buffer_bytes;
use hmac::Hmac;
use hmac::Mac;
use rand::RngCore;
use sha2::Digest;
use sha2::Sha256;
use sha2::Sha384;
use sha2::Sha512;
use uuid::Uuid;

pub fn initialize(scope: &mut v8::HandleScope) -> v8::Global<v8::Object> {
    // Create local JS object.
    let target = v8::Object::new(scope);

    set_function_to(scope, target, "randomUUID", random_uuid);
    set_function_to(scope, target, "getRandomValues", get_random_values);
    set_function_to(scope, target, "digest", digest);
    set_function_to(scope, target, "hmacSign", hmac_sign);
    set_function_to(scope, target, "hmacVerify", hmac_verify);

    // Return v8 global handle.
    v8::Global::new(scope, target)
}

/// Returns a version 4 UUID string.
fn random_uuid(
    scope: &mut v8::HandleScope,
    _: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let uuid = Uuid::new_v4().to_string();
    let uuid = v8::String::new(scope, &uuid).unwrap();
    rv.set(uuid.into());
}

/// Fills the caller's typed array with CSPRNG bytes and returns it.
fn get_random_values(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let view: v8::Local<v8::ArrayBufferView> = match args.get(0).try_into() {
        Ok(view) => view,
        Err(_) => {
            throw_type_error(scope, "getRandomValues expects a typed array");
            return;
        }
    };

    let buffer = match view.buffer(scope) {
        Some(buffer) => buffer,
        None => return,
    };

    let store = buffer.get_backing_store();
    let data = match store.data() {
        Some(data) => data.as_ptr() as *mut u8,
        None => return,
    };

    let mut bytes = vec![0u8; view.byte_length()];
    rand::thread_rng().fill_bytes(&mut bytes);

    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), data.add(view.byte_offset()), bytes.len());
    }

    rv.set(args.get(0));
}

fn algorithm_name(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    value.to_rust_string_lossy(scope).to_ascii_uppercase()
}

/// SHA digest of the given bytes. The bootstrap wraps the result in an
/// already-resolved promise to satisfy the SubtleCrypto contract.
fn digest(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let algorithm = algorithm_name(scope, args.get(0));

    let data = match buffer_bytes(scope, args.get(1)) {
        Some(data) => data,
        None => {
            throw_type_error(scope, "digest expects binary data");
            return;
        }
    };

    let hash: Vec<u8> = match algorithm.as_str() {
        "SHA-256" => Sha256::digest(&data).to_vec(),
        "SHA-384" => Sha384::digest(&data).to_vec(),
        "SHA-512" => Sha512::digest(&data).to_vec(),
        _ => {
            throw_type_error(scope, &format!("Unsupported digest algorithm: {algorithm}"));
            return;
        }
    };

    let store = hash.into_boxed_slice();
    let store = v8::ArrayBuffer::new_backing_store_from_boxed_slice(store).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);

    rv.set(buffer.into());
}

fn hmac_bytes(algorithm: &str, key: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    let mac = match algorithm {
        "SHA-256" => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).ok()?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        "SHA-384" => {
            let mut mac = Hmac::<Sha384>::new_from_slice(key).ok()?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        "SHA-512" => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).ok()?;
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        _ => return None,
    };
    Some(mac)
}

/// HMAC signature over the given bytes.
fn hmac_sign(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let algorithm = algorithm_name(scope, args.get(0));
    let key = buffer_bytes(scope, args.get(1));
    let data = buffer_bytes(scope, args.get(2));

    let (key, data) = match (key, data) {
        (Some(key), Some(data)) => (key, data),
        _ => {
            throw_type_error(scope, "sign expects binary key and data");
            return;
        }
    };

    let signature = match hmac_bytes(&algorithm, &key, &data) {
        Some(signature) => signature,
        None => {
            throw_type_error(scope, &format!("Unsupported HMAC algorithm: {algorithm}"));
            return;
        }
    };

    let store = signature.into_boxed_slice();
    let store = v8::ArrayBuffer::new_backing_store_from_boxed_slice(store).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);

    rv.set(buffer.into());
}

/// Constant-time-enough HMAC verification (recomputes and compares).
fn hmac_verify(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let algorithm = algorithm_name(scope, args.get(0));
    let key = buffer_bytes(scope, args.get(1));
    let signature = buffer_bytes(scope, args.get(2));
    let data = buffer_bytes(scope, args.get(3));

    let (key, signature, data) = match (key, signature, data) {
        (Some(key), Some(signature), Some(data)) => (key, signature, data),
        _ => {
            throw_type_error(scope, "verify expects binary key, signature and data");
            return;
        }
    };

    let valid = match algorithm.as_str() {
        "SHA-256" => Hmac::<Sha256>::new_from_slice(&key)
            .map(|mut mac| {
                mac.update(&data);
                mac.verify_slice(&signature).is_ok()
            })
            .unwrap_or(false),
        "SHA-384" => Hmac::<Sha384>::new_from_slice(&key)
            .map(|mut mac| {
                mac.update(&data);
                mac.verify_slice(&signature).is_ok()
            })
            .unwrap_or(false),
        "SHA-512" => Hmac::<Sha512>::new_from_slice(&key)
            .map(|mut mac| {
                mac.update(&data);
                mac.verify_slice(&signature).is_ok()
            })
            .unwrap_or(false),
        _ => {
            throw_type_error(scope, &format!("Unsupported HMAC algorithm: {algorithm}"));
            return;
        }
    };

    rv.set(v8::Boolean::new(scope, valid).into());
}

#[cfg(test)]
mod tests {
    use super::hmac_bytes;

    #[test]
    fn hmac_is_deterministic_per_algorithm() {
        let a = hmac_bytes("SHA-256", b"key", b"payload").unwrap();
        let b = hmac_bytes("SHA-256", b"key", b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        assert_eq!(hmac_bytes("SHA-384", b"key", b"payload").unwrap().len(), 48);
        assert_eq!(hmac_bytes("SHA-512", b"key", b"payload").unwrap().len(), 64);
    }

    #[test]
    fn hmac_rejects_unknown_algorithms() {
        assert!(hmac_bytes("MD5", b"key", b"payload").is_none());
    }
}
