use anyhow::Error;
use std::fmt::Display;
use thiserror::Error as ThisError;

pub fn generic_error(message: impl Into<String>) -> Error {
    Error::msg(message.into())
}

/// Everything that can go wrong while turning an `index.js` into a live App.
#[derive(Debug, ThisError)]
pub enum LoadError {
    #[error("Script not found: {0}")]
    FileNotFound(String),
    #[error("Failed to read script: {0}")]
    FileReadError(String),
    #[error("Script exceeds the {0} byte limit")]
    ScriptTooLarge(usize),
    #[error("Script compilation failed: {0}")]
    CompilationFailed(String),
    #[error("Script execution failed: {0}")]
    ExecutionFailed(String),
    #[error("Script did not export an object")]
    InvalidExports,
    #[error("Default export has no `fetch` property")]
    MissingFetch,
    #[error("`fetch` export is not a function")]
    FetchNotFunction,
    #[error("Engine ran out of memory while loading the script")]
    OutOfMemory,
}

/// An engine exception flattened into what the host actually forwards:
/// an HTTP error body, a structured log line, or a CLI diagnostic.
#[derive(Debug, PartialEq, Clone)]
pub struct JsError {
    pub message: String,
    pub resource_name: String,
    pub line_number: Option<i64>,
    pub start_column: Option<i64>,
    pub stack: Option<String>,
}

impl JsError {
    pub fn from_v8_exception<'a>(
        scope: &'a mut v8::HandleScope,
        exception: v8::Local<'a, v8::Value>,
    ) -> Self {
        // Create a new HandleScope so we can create local handles.
        let scope = &mut v8::HandleScope::new(scope);
        let message = v8::Exception::create_message(scope, exception);

        let exception_string = exception
            .to_string(scope)
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_else(|| "Unknown error".into());

        let resource_name = message
            .get_script_resource_name(scope)
            .map_or_else(|| "(unknown)".into(), |s| s.to_rust_string_lossy(scope));

        let line_number = message
            .get_line_number(scope)
            .and_then(|v| v.try_into().ok());

        let start_column = message.get_start_column().try_into().ok();

        // Access error.stack to ensure that prepareStackTrace() has been called.
        let stack = exception
            .to_object(scope)
            .and_then(|exception| {
                let key = v8::String::new(scope, "stack").unwrap();
                exception.get(scope, key.into())
            })
            .and_then(|stack| {
                let stack: Option<v8::Local<v8::String>> = stack.try_into().ok();
                stack.map(|s| s.to_rust_string_lossy(scope))
            });

        JsError {
            message: exception_string,
            resource_name,
            line_number,
            start_column,
            stack,
        }
    }

    /// The message a client should see: exception text plus location when known.
    pub fn http_message(&self) -> String {
        match self.line_number {
            Some(line) => format!("{} (line {})", self.message, line),
            None => self.message.clone(),
        }
    }
}

impl std::error::Error for JsError {}

// One shape for every consumer: message, script location when the engine
// reported one, then the stack for operators reading logs.
impl Display for JsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;

        if let Some(line) = self.line_number {
            let column = self.start_column.unwrap_or_default();
            write!(f, " ({}:{}:{})", self.resource_name, line, column)?;
        }

        if let Some(stack) = self.stack.as_ref() {
            write!(f, "\n{stack}")?;
        }

        Ok(())
    }
}

/// Prints the error chain and exits with the load/config failure code.
pub fn unwrap_or_exit<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
