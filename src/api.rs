use std::io::Read;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};

use crate::github::{self, GitHubClient, GitHubError};

const MAX_SAVE_BODY_BYTES: u64 = 2 * 1024 * 1024;
const DEFAULT_SAVE_PATH: &str = "public/data.json";
const DEFAULT_SAVE_MESSAGE: &str = "update data [skip ci]";

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    pub bind_addr: String,
    pub port: u16,
}

/// The save/read edge in front of the GitHub Contents API. Serves browser
/// pages that must not hold the repository token themselves.
pub struct ProxyServer {
    stop: Arc<AtomicBool>,
    http_join: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ProxyServer {
    pub fn start(config: ProxyServerConfig) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_addr, config.port);
        let server = Server::http(&bind)
            .map_err(|err| anyhow::anyhow!("failed to start proxy server on {bind}: {err}"))?;
        let local_addr = server.server_addr().to_ip();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let http_join = thread::spawn(move || run_server_loop(server, stop_for_thread));

        Ok(Self {
            stop,
            http_join: Some(http_join),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Block until the serving thread exits. It only exits once `stop` is
    /// set, so in practice this parks the calling thread for the lifetime
    /// of the process.
    pub fn wait(mut self) {
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.http_join.take() {
            let _ = join.join();
        }
    }
}

fn run_server_loop(server: Server, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(request)) => handle_request(request),
            Ok(None) => continue,
            Err(_) => continue,
        }
    }
}

fn handle_request(request: Request) {
    let origin = header_value(&request, "Origin").unwrap_or_default();
    let cors = cors_headers(&github::allowed_origins_from_env(), &origin);

    if request.method() == &Method::Options {
        let _ = request.respond(with_headers(Response::empty(StatusCode(204)), &cors));
        return;
    }

    let url = request.url().to_string();
    let (path, query) = split_path_query(&url);

    match (request.method().clone(), path) {
        (Method::Get, "/api/health") => {
            let presence = github::env_presence();
            let payload = json!({
                "ok": true,
                "owner": presence.owner,
                "repo": presence.repo,
                "branch": presence.branch,
                "token_present": presence.token_present,
            });
            let _ = send_json(request, StatusCode(200), &payload, &cors);
        }
        (Method::Get, "/api/read") => handle_read(request, query, &cors),
        (Method::Post, "/api/save") => handle_save(request, &cors),
        _ => {
            let _ = send_json(
                request,
                StatusCode(404),
                &json!({"error": "Not found"}),
                &cors,
            );
        }
    }
}

fn handle_read(request: Request, query: &str, cors: &[Header]) {
    let path = query_param(query, "path")
        .unwrap_or_default()
        .trim()
        .to_string();
    if !github::is_allowed_path(&path) {
        let _ = send_json(
            request,
            StatusCode(403),
            &json!({"error": "Path not allowed", "path": path}),
            cors,
        );
        return;
    }

    let client = match GitHubClient::from_env() {
        Ok(client) => client,
        Err(err) => {
            let (status, payload) = error_payload(err);
            let _ = send_json(request, StatusCode(status), &payload, cors);
            return;
        }
    };

    match client.read(&path) {
        Ok(body) => {
            // Hand the file text through untouched so the pages always see
            // the freshest commit, never a cached copy.
            let _ = send_raw_json(request, StatusCode(200), body, cors);
        }
        Err(err) => {
            let (status, payload) = error_payload(err);
            let _ = send_json(request, StatusCode(status), &payload, cors);
        }
    }
}

fn handle_save(mut request: Request, cors: &[Header]) {
    let mut body = String::new();
    let read_result = request
        .as_reader()
        .take(MAX_SAVE_BODY_BYTES)
        .read_to_string(&mut body);
    let parsed = match read_result {
        Ok(_) => serde_json::from_str::<Value>(&body).ok(),
        Err(_) => None,
    };
    let Some(parsed) = parsed else {
        let _ = send_json(
            request,
            StatusCode(400),
            &json!({"error": "Invalid JSON body"}),
            cors,
        );
        return;
    };

    let path = parsed
        .get("path")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .unwrap_or(DEFAULT_SAVE_PATH)
        .to_string();
    let message = parsed
        .get("message")
        .and_then(Value::as_str)
        .filter(|message| !message.is_empty())
        .unwrap_or(DEFAULT_SAVE_MESSAGE)
        .to_string();
    let content = match parsed.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => serde_json::to_string_pretty(other).unwrap_or_default(),
        None => String::new(),
    };

    let client = match GitHubClient::from_env() {
        Ok(client) => client,
        Err(err) => {
            let (status, payload) = error_payload(err);
            let _ = send_json(request, StatusCode(status), &payload, cors);
            return;
        }
    };

    match client.save(&path, &content, &message) {
        Ok(outcome) => {
            let payload = json!({
                "ok": true,
                "path": outcome.path,
                "commit": outcome.commit,
            });
            let _ = send_json(request, StatusCode(200), &payload, cors);
        }
        Err(err) => {
            let (status, payload) = error_payload(err);
            let _ = send_json(request, StatusCode(status), &payload, cors);
        }
    }
}

fn error_payload(err: GitHubError) -> (u16, Value) {
    match err {
        GitHubError::PathNotAllowed { path } => {
            (403, json!({"error": "Path not allowed", "path": path}))
        }
        GitHubError::MissingConfig { missing } => {
            (500, json!({"error": "Missing env", "missing": missing}))
        }
        GitHubError::Upstream {
            step,
            status,
            detail,
        } => (
            502,
            json!({
                "step": step,
                "error": format!("GitHub {status}"),
                "body": try_parse(&detail),
            }),
        ),
        GitHubError::Transport(err) => (
            502,
            json!({"error": "github request failed", "detail": err.to_string()}),
        ),
    }
}

fn try_parse(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Echo a listed origin back, fall back to the first listed one, or allow
/// anything when no list is configured.
pub(crate) fn allow_origin(allowed: &[String], origin: &str) -> String {
    if allowed.is_empty() {
        "*".to_string()
    } else if allowed.iter().any(|candidate| candidate == origin) {
        origin.to_string()
    } else {
        allowed[0].clone()
    }
}

fn cors_headers(allowed: &[String], origin: &str) -> Vec<Header> {
    let pairs = [
        ("Access-Control-Allow-Origin", allow_origin(allowed, origin)),
        (
            "Access-Control-Allow-Methods",
            "GET, POST, OPTIONS".to_string(),
        ),
        (
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization".to_string(),
        ),
        ("Access-Control-Allow-Credentials", "true".to_string()),
        ("Vary", "Origin".to_string()),
    ];
    pairs
        .into_iter()
        .filter_map(|(name, value)| Header::from_str(&format!("{name}: {value}")).ok())
        .collect()
}

fn with_headers<R: Read>(mut response: Response<R>, headers: &[Header]) -> Response<R> {
    for header in headers {
        response.add_header(header.clone());
    }
    response
}

fn send_json(request: Request, status: StatusCode, body: &Value, cors: &[Header]) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    request.respond(with_headers(
        Response::from_data(payload)
            .with_status_code(status)
            .with_header(content_type),
        cors,
    ))?;
    Ok(())
}

fn send_raw_json(
    request: Request,
    status: StatusCode,
    body: String,
    cors: &[Header],
) -> Result<()> {
    let content_type = Header::from_str("Content-Type: application/json; charset=utf-8")
        .map_err(|_| anyhow::anyhow!("failed to build content-type header"))?;
    let cache_control = Header::from_str("Cache-Control: no-store")
        .map_err(|_| anyhow::anyhow!("failed to build cache-control header"))?;
    request.respond(with_headers(
        Response::from_string(body)
            .with_status_code(status)
            .with_header(content_type)
            .with_header(cache_control),
        cors,
    ))?;
    Ok(())
}

fn header_value(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|header| header.field.equiv(name))
        .map(|header| header.value.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_path_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (k, v) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        if k == key {
            return Some(v);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_local_proxy() -> ProxyServer {
        ProxyServer::start(ProxyServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
        })
        .expect("proxy starts on an ephemeral port")
    }

    fn base_url(server: &ProxyServer) -> String {
        let addr = server.local_addr().expect("bound address");
        format!("http://{addr}")
    }

    #[test]
    fn allow_origin_selection_follows_the_configured_list() {
        let open: Vec<String> = Vec::new();
        assert_eq!(allow_origin(&open, "https://anywhere.example"), "*");

        let listed = vec![
            "https://pages.example".to_string(),
            "https://preview.example".to_string(),
        ];
        assert_eq!(
            allow_origin(&listed, "https://preview.example"),
            "https://preview.example"
        );
        assert_eq!(
            allow_origin(&listed, "https://evil.example"),
            "https://pages.example"
        );
    }

    #[test]
    fn query_param_extracts_value() {
        let query = "path=public/data.json&x=1";
        assert_eq!(query_param(query, "path"), Some("public/data.json"));
        assert_eq!(query_param(query, "missing"), None);
    }

    #[test]
    fn split_path_query_handles_bare_paths() {
        assert_eq!(split_path_query("/api/read"), ("/api/read", ""));
        assert_eq!(
            split_path_query("/api/read?path=a.json"),
            ("/api/read", "path=a.json")
        );
    }

    #[test]
    fn health_endpoint_reports_ok() {
        let server = start_local_proxy();
        let body = reqwest::blocking::get(format!("{}/api/health", base_url(&server)))
            .expect("request")
            .json::<Value>()
            .expect("json body");
        assert_eq!(body.get("ok"), Some(&Value::Bool(true)));
        assert!(body.get("token_present").is_some());
    }

    #[test]
    fn preflight_gets_cors_headers() {
        let server = start_local_proxy();
        let client = reqwest::blocking::Client::new();
        let response = client
            .request(
                reqwest::Method::OPTIONS,
                format!("{}/api/save", base_url(&server)),
            )
            .header("Origin", "https://pages.example")
            .send()
            .expect("request");
        assert_eq!(response.status().as_u16(), 204);
        assert!(
            response
                .headers()
                .get("Access-Control-Allow-Origin")
                .is_some()
        );
    }

    #[test]
    fn read_rejects_paths_outside_the_allowlist() {
        let server = start_local_proxy();
        let response = reqwest::blocking::get(format!(
            "{}/api/read?path=secrets/token.json",
            base_url(&server)
        ))
        .expect("request");
        assert_eq!(response.status().as_u16(), 403);
        let body = response.json::<Value>().expect("json body");
        assert_eq!(
            body.get("error").and_then(Value::as_str),
            Some("Path not allowed")
        );
    }

    #[test]
    fn save_rejects_malformed_body() {
        let server = start_local_proxy();
        let client = reqwest::blocking::Client::new();
        let response = client
            .post(format!("{}/api/save", base_url(&server)))
            .header("Content-Type", "application/json")
            .body("{ not json ")
            .send()
            .expect("request");
        assert_eq!(response.status().as_u16(), 400);
    }

    #[test]
    fn unknown_route_is_a_json_404() {
        let server = start_local_proxy();
        let response =
            reqwest::blocking::get(format!("{}/nope", base_url(&server))).expect("request");
        assert_eq!(response.status().as_u16(), 404);
    }
}
