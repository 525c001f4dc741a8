use std::env;
use tracing_subscriber::EnvFilter;

/// Output shapes selected through `NANO_LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    Text,
    Apache,
}

impl LogFormat {
    pub fn from_env() -> LogFormat {
        match env::var("NANO_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("apache") => LogFormat::Apache,
            _ => LogFormat::Text,
        }
    }
}

/// One served request, as the dispatcher saw it.
pub struct RequestLog<'a> {
    pub req_id: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub host: &'a str,
    pub status: u16,
    pub bytes: usize,
    pub latency_ms: f64,
}

/// Installs the global tracing subscriber for the chosen format. Defaults
/// to `info` unless `RUST_LOG` narrows it down.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        // Apache access lines are preformatted; keep the subscriber bare
        // so they come out unadorned.
        LogFormat::Apache => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_level(false)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Emits the access entry for one request in the configured shape.
pub fn access(format: LogFormat, entry: &RequestLog) {
    match format {
        LogFormat::Apache => {
            tracing::info!("{}", apache_line(entry));
        }
        _ => {
            tracing::info!(
                req_id = entry.req_id,
                method = entry.method,
                path = entry.path,
                host = entry.host,
                status = entry.status,
                bytes = entry.bytes,
                latency_ms = entry.latency_ms,
                "request"
            );
        }
    }
}

/// Common-log style line; the latency rides in a trailing comment the way
/// most access-log parsers tolerate.
fn apache_line(entry: &RequestLog) -> String {
    format!(
        "{} - - \"{} {} HTTP/1.1\" {} {} {:.1}ms",
        entry.host, entry.method, entry.path, entry.status, entry.bytes, entry.latency_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apache_line_shape() {
        let entry = RequestLog {
            req_id: "r-1",
            method: "GET",
            path: "/json",
            host: "a.local",
            status: 200,
            bytes: 12,
            latency_ms: 3.25,
        };
        assert_eq!(
            apache_line(&entry),
            "a.local - - \"GET /json HTTP/1.1\" 200 12 3.2ms"
        );
    }

    #[test]
    fn format_default_is_text() {
        assert_eq!(LogFormat::default(), LogFormat::Text);
    }
}
