use crate::config::Config;
use crate::executor;
use crate::executor::HostRequest;
use crate::executor::HostResponse;
use crate::logger;
use crate::logger::LogFormat;
use crate::metrics::Metrics;
use crate::registry::AppRegistry;
use crate::registry::RegistryError;
use crate::registry::DRAIN_DEADLINE;
use anyhow::Context;
use anyhow::Result;
use nanoid::nanoid;
use phf::phf_map;
use serde_json::json;
use std::io::Read;
use std::io::Write;
use std::net::TcpListener;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Cap on what is read from a connection: request line, headers and body.
const REQUEST_BUFFER_SIZE: usize = 8 * 1024;

/// How long a client may dribble its request before the read gives up.
const READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// Canonical reason phrases; everything else reports as "OK".
static REASON_PHRASES: phf::Map<u16, &'static str> = phf_map! {
    200u16 => "OK",
    201u16 => "Created",
    204u16 => "No Content",
    301u16 => "Moved Permanently",
    302u16 => "Found",
    304u16 => "Not Modified",
    400u16 => "Bad Request",
    401u16 => "Unauthorized",
    403u16 => "Forbidden",
    404u16 => "Not Found",
    405u16 => "Method Not Allowed",
    408u16 => "Request Timeout",
    409u16 => "Conflict",
    413u16 => "Payload Too Large",
    429u16 => "Too Many Requests",
    500u16 => "Internal Server Error",
    502u16 => "Bad Gateway",
    503u16 => "Service Unavailable",
    504u16 => "Gateway Timeout",
};

pub fn reason_phrase(status: u16) -> &'static str {
    REASON_PHRASES.get(&status).copied().unwrap_or("OK")
}

/// A request parsed off the wire, borrowed from the read buffer.
#[derive(Debug, PartialEq)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Parses the request line, the headers (Host in particular) and the body
/// following the blank line. Returns None for garbage or partial input.
pub fn parse_request(buffer: &[u8]) -> Option<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);

    let offset = match request.parse(buffer) {
        Ok(httparse::Status::Complete(offset)) => offset,
        _ => return None,
    };

    let method = request.method?.to_ascii_uppercase();
    let path = request.path.unwrap_or("/").to_string();

    let headers: Vec<(String, String)> = request
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect();

    let host = headers
        .iter()
        .find(|(name, _)| name == "host")
        .map(|(_, value)| value.clone())
        .unwrap_or_default();

    Some(ParsedRequest {
        method,
        path,
        host,
        headers,
        body: buffer[offset..].to_vec(),
    })
}

/// Pulls a single query parameter out of a request path.
pub fn query_param(path: &str, name: &str) -> Option<String> {
    let (_, query) = path.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

fn path_only(path: &str) -> &str {
    path.split_once('?').map(|(p, _)| p).unwrap_or(path)
}

/// The serving mode decides routing fallback and the admin surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServerMode {
    /// One app serves every hostname; no admin API.
    SingleApp,
    /// Hostname routing is strict and the admin API is live.
    MultiApp,
}

/// The HTTP front end: one blocking accept loop, one connection at a time.
pub struct Server {
    port: u16,
    mode: ServerMode,
    registry: AppRegistry,
    metrics: Metrics,
    log_format: LogFormat,
    config_path: Option<PathBuf>,
    running: Arc<AtomicBool>,
    reload_requested: Arc<AtomicBool>,
}

impl Server {
    pub fn new(
        registry: AppRegistry,
        port: u16,
        mode: ServerMode,
        config_path: Option<PathBuf>,
        log_format: LogFormat,
    ) -> Server {
        Server {
            port,
            mode,
            registry,
            metrics: Metrics::new(),
            log_format,
            config_path,
            running: Arc::new(AtomicBool::new(true)),
            reload_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Binds the port and serves until a shutdown signal flips the flag.
    /// Failure to bind is one of the two fatal startup conditions.
    pub fn run(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .with_context(|| format!("Failed to bind port {}", self.port))?;

        self.install_signal_handlers();

        tracing::info!(
            port = self.port,
            apps = self.registry.len(),
            "nano listening"
        );

        while self.running.load(Ordering::SeqCst) {
            if self.reload_requested.swap(false, Ordering::SeqCst) {
                self.reload_config();
            }

            let (stream, _) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    continue;
                }
            };

            // A shutdown self-connect lands here; the flag check at the
            // top of the loop takes care of exiting.
            if let Err(e) = self.handle_connection(stream) {
                tracing::debug!("connection error: {e}");
            }
        }

        tracing::info!("shutting down, draining apps");
        self.registry.drain_all();
        self.registry.wait_for_idle(DRAIN_DEADLINE);

        Ok(())
    }

    fn install_signal_handlers(&self) {
        #[cfg(unix)]
        {
            use signal_hook::consts::SIGHUP;
            use signal_hook::consts::SIGINT;
            use signal_hook::consts::SIGTERM;
            use signal_hook::iterator::Signals;

            let running = self.running.clone();
            let reload = self.reload_requested.clone();
            let port = self.port;
            let reload_enabled = self.mode == ServerMode::MultiApp;

            let mut signals = match Signals::new([SIGTERM, SIGINT, SIGHUP]) {
                Ok(signals) => signals,
                Err(e) => {
                    tracing::error!("failed to install signal handlers: {e}");
                    return;
                }
            };

            std::thread::spawn(move || {
                for signal in signals.forever() {
                    match signal {
                        SIGHUP if reload_enabled => {
                            reload.store(true, Ordering::SeqCst);
                        }
                        SIGHUP => continue,
                        _ => {
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                    // Unblock the accept loop so it notices the flag.
                    let _ = TcpStream::connect(("127.0.0.1", port));
                }
            });
        }
    }

    fn reload_config(&mut self) {
        let path = match self.config_path.as_ref() {
            Some(path) => path.clone(),
            None => return,
        };

        // A config that fails to parse must leave the registry untouched.
        match Config::from_file(&path) {
            Ok(config) => {
                let summary = self.registry.reload(&config);
                tracing::info!(
                    added = summary.added,
                    removed = summary.removed,
                    replaced = summary.replaced,
                    failed = summary.failed,
                    "configuration reloaded"
                );
            }
            Err(e) => {
                tracing::error!("config reload failed, keeping current apps: {e:#}");
            }
        }
    }

    fn handle_connection(&mut self, mut stream: TcpStream) -> Result<()> {
        let started = Instant::now();
        let _ = stream.set_read_timeout(Some(READ_TIMEOUT));

        let buffer = read_request(&mut stream);
        if buffer.is_empty() {
            return Ok(());
        }

        let request = match parse_request(&buffer) {
            Some(request) => request,
            None => {
                let response = HostResponse::plain(400, "Malformed HTTP request");
                return self.finish(&mut stream, started, None, "-", "-", response);
            }
        };

        let req_id = nanoid!(12);
        let method = request.method.clone();
        let path = request.path.clone();

        let response = self.dispatch(&request);
        let serving_slot = response.1;
        let response = response.0;

        self.finish(&mut stream, started, Some(&req_id), &method, &path, response)?;

        // Fire callbacks that queued up while the response was written,
        // inside the engine of the App that just served.
        if let Some(slot) = serving_slot {
            if let Some(app) = self.registry.app_mut(slot) {
                executor::tick_between_requests(app);
            }
        }

        Ok(())
    }

    /// Routes one parsed request: built-ins, admin, then apps by Host.
    fn dispatch(&mut self, request: &ParsedRequest) -> (HostResponse, Option<usize>) {
        let path = path_only(&request.path);

        // Shutdown mode keeps answering, with 503s.
        if !self.running.load(Ordering::SeqCst) {
            return (
                HostResponse::json(503, r#"{"error":"Server is shutting down"}"#),
                None,
            );
        }

        match path {
            "/health" | "/healthz" => {
                return (HostResponse::json(200, r#"{"status":"ok"}"#), None)
            }
            "/metrics" => return (HostResponse::plain(200, self.metrics.render()), None),
            _ => {}
        }

        if path.starts_with("/admin/") {
            return (self.admin(request), None);
        }

        self.route_to_app(request)
    }

    fn route_to_app(&mut self, request: &ParsedRequest) -> (HostResponse, Option<usize>) {
        let slot = match self.mode {
            ServerMode::SingleApp => self
                .registry
                .resolve_exact(&request.host)
                .or_else(|| self.registry.default_slot()),
            ServerMode::MultiApp => self.registry.resolve_exact(&request.host),
        };

        let slot = match slot {
            Some(slot) => slot,
            None if self.registry.is_empty() => {
                return (HostResponse::json(503, r#"{"error":"No apps loaded"}"#), None)
            }
            None => {
                return (
                    HostResponse::json(404, r#"{"error":"No app configured for this host"}"#),
                    None,
                )
            }
        };

        let hostname = match self.registry.app(slot) {
            Some(app) => app.hostname.clone(),
            None => {
                return (HostResponse::json(503, r#"{"error":"App unavailable"}"#), None)
            }
        };

        // Draining apps refuse new work while in-flight requests finish.
        let counter = match self.registry.drain_state(&hostname) {
            Some(drain) if drain.is_draining() => {
                return (
                    HostResponse::json(503, r#"{"error":"Service draining","retry_after_s":30}"#),
                    None,
                );
            }
            Some(drain) => drain.active_connections.clone(),
            None => Arc::default(),
        };

        let host_request = HostRequest {
            method: request.method.clone(),
            url: format!(
                "http://{}{}",
                if request.host.is_empty() {
                    "localhost"
                } else {
                    &request.host
                },
                request.path
            ),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };

        counter.fetch_add(1, Ordering::SeqCst);
        let response = match self.registry.app_mut(slot) {
            Some(app) => executor::handle_request(app, &host_request),
            None => HostResponse::json(503, r#"{"error":"App unavailable"}"#),
        };
        counter.fetch_sub(1, Ordering::SeqCst);

        (response, Some(slot))
    }

    //---------------------------------------------------------
    //  ADMIN API.
    //---------------------------------------------------------

    fn admin(&mut self, request: &ParsedRequest) -> HostResponse {
        if self.mode != ServerMode::MultiApp {
            return HostResponse::json(404, r#"{"error":"Admin API is not enabled"}"#);
        }

        let path = path_only(&request.path);

        match (request.method.as_str(), path) {
            ("GET", "/admin/health") => HostResponse::json(
                200,
                json!({ "status": "ok", "apps": self.registry.len() }).to_string(),
            ),
            ("GET", "/admin/apps") => self.admin_list_apps(),
            ("POST", "/admin/apps") => self.admin_add_app(&request.body),
            ("DELETE", "/admin/apps") => match query_param(&request.path, "hostname") {
                Some(hostname) => self.admin_remove_app(&hostname),
                None => HostResponse::json(400, r#"{"error":"Missing hostname parameter"}"#),
            },
            ("POST", "/admin/reload") => self.admin_reload(),
            _ => HostResponse::json(404, r#"{"error":"Unknown admin endpoint"}"#),
        }
    }

    fn admin_list_apps(&mut self) -> HostResponse {
        let mut apps = Vec::new();

        for hostname in self.registry.hostnames() {
            if let Some(slot) = self.registry.resolve_exact(&hostname) {
                if let Some(app) = self.registry.app_mut(slot) {
                    apps.push(json!({
                        "name": app.name,
                        "hostname": app.hostname,
                        "path": app.path,
                        "timeout_ms": app.timeout.as_millis() as u64,
                        "memory_percent": app.memory_percent(),
                    }));
                }
            }
        }

        HostResponse::json(200, json!({ "apps": apps }).to_string())
    }

    fn admin_add_app(&mut self, body: &[u8]) -> HostResponse {
        #[derive(serde::Deserialize)]
        struct AddRequest {
            hostname: String,
            path: String,
            name: Option<String>,
            timeout_ms: Option<u64>,
            memory_mb: Option<usize>,
        }

        let add: AddRequest = match serde_json::from_slice(body) {
            Ok(add) => add,
            Err(e) => {
                return HostResponse::json(400, json!({ "error": e.to_string() }).to_string())
            }
        };

        if add.hostname.trim().is_empty() || add.path.trim().is_empty() {
            return HostResponse::json(400, r#"{"error":"hostname and path are required"}"#);
        }

        let options = crate::runtime::AppOptions {
            name: add.name.unwrap_or_else(|| add.hostname.clone()),
            hostname: add.hostname,
            timeout_ms: add.timeout_ms.unwrap_or(crate::config::DEFAULT_TIMEOUT_MS),
            memory_mb: add.memory_mb.unwrap_or(crate::config::DEFAULT_MEMORY_MB),
            ..Default::default()
        };

        match self.registry.add_app(&add.path, options) {
            Ok(()) => HostResponse::json(201, r#"{"status":"created"}"#),
            Err(RegistryError::HostnameTaken(hostname)) => HostResponse::json(
                409,
                json!({ "error": format!("Hostname \"{hostname}\" already registered") })
                    .to_string(),
            ),
            Err(e) => HostResponse::json(500, json!({ "error": e.to_string() }).to_string()),
        }
    }

    fn admin_remove_app(&mut self, hostname: &str) -> HostResponse {
        // An unknown hostname is a 404 regardless of how many apps are
        // loaded; only a removal that would actually succeed can trip
        // the last-app guard.
        if self.registry.resolve_exact(hostname).is_none() {
            return HostResponse::json(
                404,
                json!({ "error": format!("No app for hostname \"{hostname}\"") }).to_string(),
            );
        }

        if self.registry.len() <= 1 {
            return HostResponse::json(400, r#"{"error":"Cannot remove the last app"}"#);
        }

        match self.registry.remove_app(hostname) {
            Ok(()) => HostResponse::json(200, r#"{"status":"removed"}"#),
            Err(e) => HostResponse::json(500, json!({ "error": e.to_string() }).to_string()),
        }
    }

    fn admin_reload(&mut self) -> HostResponse {
        let path = match self.config_path.as_ref() {
            Some(path) => path.clone(),
            None => {
                return HostResponse::json(400, r#"{"error":"No config file to reload"}"#);
            }
        };

        match Config::from_file(&path) {
            Ok(config) => {
                let summary = self.registry.reload(&config);
                HostResponse::json(
                    200,
                    json!({
                        "added": summary.added,
                        "removed": summary.removed,
                        "replaced": summary.replaced,
                        "failed": summary.failed,
                    })
                    .to_string(),
                )
            }
            Err(e) => HostResponse::json(500, json!({ "error": format!("{e:#}") }).to_string()),
        }
    }

    //---------------------------------------------------------
    //  RESPONSE WRITING.
    //---------------------------------------------------------

    fn finish(
        &mut self,
        stream: &mut TcpStream,
        started: Instant,
        req_id: Option<&str>,
        method: &str,
        path: &str,
        response: HostResponse,
    ) -> Result<()> {
        let latency = started.elapsed();
        let bytes = response.body.len();
        let status = response.status;

        write_response(stream, &response)?;

        self.metrics.record(status, latency.as_nanos() as u64);

        let host = stream
            .peer_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "-".into());

        logger::access(
            self.log_format,
            &logger::RequestLog {
                req_id: req_id.unwrap_or("-"),
                method,
                path,
                host: &host,
                status,
                bytes,
                latency_ms: latency.as_secs_f64() * 1000.0,
            },
        );

        Ok(())
    }
}

/// Reads until the request is complete (headers plus announced body), the
/// buffer cap is hit, or the client goes quiet.
fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() >= REQUEST_BUFFER_SIZE {
                    buffer.truncate(REQUEST_BUFFER_SIZE);
                    break;
                }
                if request_complete(&buffer) {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    buffer
}

/// A request is complete once the header block closed and the announced
/// Content-Length (if any) has arrived.
fn request_complete(buffer: &[u8]) -> bool {
    let marker = match find_header_end(buffer) {
        Some(marker) => marker,
        None => return false,
    };

    let headers = String::from_utf8_lossy(&buffer[..marker]);
    let content_length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    buffer.len() >= marker + content_length
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}

fn write_response(stream: &mut TcpStream, response: &HostResponse) -> Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len(),
    );

    stream.write_all(head.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AppRegistry;
    use crate::runtime::AppOptions;
    use crate::runtime::Host;
    use assert_fs::prelude::*;

    fn fixture(body: &str) -> assert_fs::TempDir {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("index.js")
            .write_str(&format!(
                "export default {{ fetch() {{ return new Response(\"{body}\"); }} }}"
            ))
            .unwrap();
        dir
    }

    fn options(hostname: &str) -> AppOptions {
        AppOptions {
            name: hostname.into(),
            hostname: hostname.into(),
            ..AppOptions::default()
        }
    }

    fn request(method: &str, path: &str, host: &str) -> ParsedRequest {
        ParsedRequest {
            method: method.into(),
            path: path.into(),
            host: host.into(),
            headers: vec![("host".into(), host.into())],
            body: Vec::new(),
        }
    }

    fn multi_app_server(apps: &[(&str, &assert_fs::TempDir)]) -> Server {
        let mut registry = AppRegistry::new(Host::new());
        for (hostname, dir) in apps {
            registry
                .add_app(dir.path().to_str().unwrap(), options(hostname))
                .unwrap();
        }
        Server::new(registry, 0, ServerMode::MultiApp, None, LogFormat::Text)
    }

    #[test]
    fn dispatch_serves_builtin_endpoints() {
        let a = fixture("a");
        let mut server = multi_app_server(&[("a.local", &a)]);

        let (health, _) = server.dispatch(&request("GET", "/health", "a.local"));
        assert_eq!(health.status, 200);
        assert_eq!(health.body, br#"{"status":"ok"}"#);

        let (healthz, _) = server.dispatch(&request("GET", "/healthz", "whatever"));
        assert_eq!(healthz.status, 200);

        let (metrics, _) = server.dispatch(&request("GET", "/metrics", "a.local"));
        assert_eq!(metrics.status, 200);
        let text = String::from_utf8(metrics.body).unwrap();
        assert!(text.contains("nano_requests_total"));
        assert!(text.contains("nano_uptime_seconds"));
    }

    #[test]
    fn dispatch_routes_by_hostname_and_404s_unknown() {
        let a = fixture("app-a");
        let b = fixture("app-b");
        let mut server = multi_app_server(&[("a.local", &a), ("b.local", &b)]);

        let (response, _) = server.dispatch(&request("GET", "/", "a.local"));
        assert_eq!(response.body, b"app-a");

        let (response, _) = server.dispatch(&request("GET", "/", "B.LOCAL:8080"));
        assert_eq!(response.body, b"app-b");

        // Multi-app serving has no default fallback.
        let (response, _) = server.dispatch(&request("GET", "/", "c.local"));
        assert_eq!(response.status, 404);
        assert_eq!(
            response.body,
            br#"{"error":"No app configured for this host"}"#
        );
    }

    #[test]
    fn single_app_mode_answers_for_any_host() {
        let a = fixture("solo");
        let mut registry = AppRegistry::new(Host::new());
        registry
            .add_app(a.path().to_str().unwrap(), options("localhost"))
            .unwrap();
        let mut server = Server::new(registry, 0, ServerMode::SingleApp, None, LogFormat::Text);

        let (response, _) = server.dispatch(&request("GET", "/", "anything.example"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"solo");

        // The admin surface stays off in single-app mode.
        let (response, _) = server.dispatch(&request("GET", "/admin/apps", "x"));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn draining_apps_answer_503_with_retry_hint() {
        let a = fixture("a");
        let b = fixture("b");
        let mut server = multi_app_server(&[("a.local", &a), ("b.local", &b)]);

        server
            .registry
            .drain_state("a.local")
            .unwrap()
            .draining
            .store(true, Ordering::SeqCst);

        let (response, slot) = server.dispatch(&request("GET", "/", "a.local"));
        assert_eq!(response.status, 503);
        assert_eq!(
            response.body,
            br#"{"error":"Service draining","retry_after_s":30}"#
        );
        assert!(slot.is_none());

        // The other app keeps serving.
        let (response, _) = server.dispatch(&request("GET", "/", "b.local"));
        assert_eq!(response.status, 200);
    }

    #[test]
    fn admin_add_conflict_and_remove_flow() {
        let a = fixture("a");
        let b = fixture("b");
        let mut server = multi_app_server(&[("a.local", &a)]);

        // Listing shows the configured app.
        let (response, _) = server.dispatch(&request("GET", "/admin/apps", "a.local"));
        assert_eq!(response.status, 200);
        let listing: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(listing["apps"].as_array().unwrap().len(), 1);
        assert_eq!(listing["apps"][0]["hostname"], "a.local");

        // An unknown hostname is a 404 even when only one app is loaded.
        let (response, _) =
            server.dispatch(&request("DELETE", "/admin/apps?hostname=ghost.local", "x"));
        assert_eq!(response.status, 404);

        // Removing the only app is refused.
        let (response, _) =
            server.dispatch(&request("DELETE", "/admin/apps?hostname=a.local", "x"));
        assert_eq!(response.status, 400);

        // Adding a second app succeeds; a duplicate hostname conflicts.
        let body = serde_json::json!({
            "hostname": "b.local",
            "path": b.path().to_str().unwrap(),
        })
        .to_string();
        let mut add = request("POST", "/admin/apps", "x");
        add.body = body.clone().into_bytes();
        let (response, _) = server.dispatch(&add);
        assert_eq!(response.status, 201);

        let mut duplicate = request("POST", "/admin/apps", "x");
        duplicate.body = body.into_bytes();
        let (response, _) = server.dispatch(&duplicate);
        assert_eq!(response.status, 409);

        // Now a removal goes through, and unknown hostnames are a 404.
        let (response, _) =
            server.dispatch(&request("DELETE", "/admin/apps?hostname=b.local", "x"));
        assert_eq!(response.status, 200);
        let (response, _) =
            server.dispatch(&request("DELETE", "/admin/apps?hostname=b.local", "x"));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn admin_add_validates_its_body() {
        let a = fixture("a");
        let mut server = multi_app_server(&[("a.local", &a)]);

        let mut bad = request("POST", "/admin/apps", "x");
        bad.body = b"{ not json".to_vec();
        let (response, _) = server.dispatch(&bad);
        assert_eq!(response.status, 400);

        let mut empty = request("POST", "/admin/apps", "x");
        empty.body = br#"{"hostname":"", "path":""}"#.to_vec();
        let (response, _) = server.dispatch(&empty);
        assert_eq!(response.status, 400);

        // A load failure on a valid body is a 500.
        let mut missing = request("POST", "/admin/apps", "x");
        missing.body = br#"{"hostname":"m.local","path":"/nope/nowhere"}"#.to_vec();
        let (response, _) = server.dispatch(&missing);
        assert_eq!(response.status, 500);
    }

    #[test]
    fn reason_phrases_cover_the_table() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(201), "Created");
        assert_eq!(reason_phrase(408), "Request Timeout");
        assert_eq!(reason_phrase(503), "Service Unavailable");
        // Unknown codes fall back to "OK".
        assert_eq!(reason_phrase(299), "OK");
    }

    #[test]
    fn parses_a_basic_request() {
        let raw = b"GET /json HTTP/1.1\r\nHost: a.local:8080\r\nX-Custom: yes\r\n\r\n";
        let request = parse_request(raw).unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/json");
        assert_eq!(request.host, "a.local:8080");
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "x-custom" && value == "yes"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn parses_body_after_blank_line() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 7\r\n\r\npayload";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, b"payload");
    }

    #[test]
    fn lowercases_header_names() {
        let raw = b"GET / HTTP/1.1\r\nHOST: Mixed.Case\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.host, "Mixed.Case");
    }

    #[test]
    fn rejects_partial_requests() {
        assert!(parse_request(b"GET / HT").is_none());
        assert!(parse_request(b"").is_none());
    }

    #[test]
    fn extracts_query_params() {
        assert_eq!(
            query_param("/admin/apps?hostname=a.local", "hostname"),
            Some("a.local".into())
        );
        assert_eq!(
            query_param("/admin/apps?x=1&hostname=b", "hostname"),
            Some("b".into())
        );
        assert_eq!(query_param("/admin/apps", "hostname"), None);
    }

    #[test]
    fn request_complete_honors_content_length() {
        let partial = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n12345";
        assert!(!request_complete(partial));

        let full = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\n12345";
        assert!(request_complete(full));

        let no_body = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(request_complete(no_body));
    }
}
