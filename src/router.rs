//! Host-based reverse proxy router
//!
//! The router listens on one address and forwards every request to an origin
//! chosen by the request's `Host`. Routes come from the host mapping table
//! and are snapshotted when the router starts; unmatched hosts go to the
//! default origin.
//!
//! At most one server runs at a time. Starting while running restarts on the
//! new address.

use crate::config::RouterSettings;
use crate::db::{HostMapping, MappingProtocol, Store};
use crate::error::{json_error_response, storage_message, ProxyBody, ProxyErrorCode, RouterError};
use crate::logs::{LogAggregator, LogLevel, LogSource};
use crate::pool::{PoolConfig, PoolError, UpstreamPool};
use crate::timeline::{format_duration, EventStatus, EventType, TimelineEventLog};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

const ACTOR: &str = "admin";

/// Bound on each `lsof`/`netstat`/`taskkill` call during port reclaim
const PORT_TOOL_TIMEOUT: Duration = Duration::from_secs(3);

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Connection-scoped headers that never cross the proxy
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterPhase {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub phase: RouterPhase,
    pub running: bool,
    /// Address as given to `start`, empty when stopped
    pub addr: String,
}

impl Default for RouterStatus {
    fn default() -> Self {
        Self {
            phase: RouterPhase::Stopped,
            running: false,
            addr: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Route {
    hostname: String,
    origin: String,
}

/// Host to origin lookup built from a mapping snapshot
#[derive(Debug, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    fallback: String,
}

impl RouteTable {
    /// Keep active HTTP/HTTPS mappings, in table order
    pub fn from_mappings(mappings: &[HostMapping], fallback: impl Into<String>) -> Self {
        let routes = mappings
            .iter()
            .filter(|m| m.active && m.protocol != MappingProtocol::Tcp)
            .map(|m| Route {
                hostname: m.hostname.clone(),
                origin: m.origin(),
            })
            .collect();
        Self {
            routes,
            fallback: fallback.into(),
        }
    }

    /// Origin for a request host; the first route whose hostname equals
    /// the host exactly wins.
    ///
    /// The host is compared as sent, port included, so a client reaching the
    /// router on `a.test:8080` needs a mapping for `a.test:8080`.
    pub fn resolve(&self, host: Option<&str>) -> &str {
        let Some(host) = host else {
            return &self.fallback;
        };
        self.routes
            .iter()
            .find(|r| r.hostname == host)
            .map(|r| r.origin.as_str())
            .unwrap_or(&self.fallback)
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub default_origin: String,
    pub shutdown_timeout: Duration,
    /// Pause between stopping an old server and starting a new one
    pub settle_delay: Duration,
    /// Terminate foreign processes holding the port before binding
    pub reclaim_port: bool,
    pub pool: PoolConfig,
}

impl RouterOptions {
    pub fn from_settings(settings: &RouterSettings) -> Self {
        Self {
            default_origin: settings.default_origin.clone(),
            shutdown_timeout: settings.shutdown_timeout(),
            settle_delay: settings.settle_delay(),
            reclaim_port: settings.reclaim_port,
            pool: PoolConfig::from_settings(settings),
        }
    }
}

struct ServerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct HostRouter {
    /// Serializes start and stop
    server: tokio::sync::Mutex<Option<ServerHandle>>,
    status: RwLock<RouterStatus>,
    pool: Arc<UpstreamPool>,
    store: Arc<dyn Store>,
    logs: Arc<LogAggregator>,
    timeline: Arc<TimelineEventLog>,
    options: RouterOptions,
}

impl HostRouter {
    pub fn new(
        store: Arc<dyn Store>,
        logs: Arc<LogAggregator>,
        timeline: Arc<TimelineEventLog>,
        options: RouterOptions,
    ) -> anyhow::Result<Self> {
        let pool = UpstreamPool::new(options.pool.clone())?;
        Ok(Self {
            server: tokio::sync::Mutex::new(None),
            status: RwLock::new(RouterStatus::default()),
            pool: Arc::new(pool),
            store,
            logs,
            timeline,
            options,
        })
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Start serving on `addr` (`:port` or `host:port`), restarting if running
    pub async fn start(&self, addr: &str) -> Result<(), RouterError> {
        let started = Instant::now();
        let mut server = self.server.lock().await;

        if server.is_some() {
            self.log(LogLevel::Info, "Stopping existing host router before starting new one");
            self.shutdown(&mut server).await;
            tokio::time::sleep(self.options.settle_delay).await;
        }

        let bind_addr = match resolve_listen_addr(addr).await {
            Ok(bind_addr) => bind_addr,
            Err(e) => {
                self.log(LogLevel::Error, format!("Failed to start host router: {}", e));
                return Err(e);
            }
        };
        self.set_status(RouterPhase::Starting, addr);

        if self.options.reclaim_port {
            reclaim_port(bind_addr.port(), &self.logs).await;
        }

        let table = match self.store.host_mappings() {
            Ok(mappings) => RouteTable::from_mappings(&mappings, &self.options.default_origin),
            Err(e) => {
                let message = storage_message(&e);
                self.log(
                    LogLevel::Error,
                    format!("Failed to load host mappings: {}", message),
                );
                self.set_status(RouterPhase::Stopped, "");
                return Err(RouterError::Storage(message));
            }
        };
        let routes = table.len();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(serve(
            bind_addr,
            Arc::new(table),
            Arc::clone(&self.pool),
            Arc::clone(&self.logs),
            shutdown_rx,
        ));
        *server = Some(ServerHandle { shutdown_tx, task });
        self.set_status(RouterPhase::Running, addr);

        self.timeline.append(
            EventType::HostMapping,
            "Host Router Started",
            format!("Custom host mapping router started on {}", addr),
            EventStatus::Success,
            ACTOR,
            format_duration(started.elapsed()),
            None,
        );
        self.log(LogLevel::Info, format!("Custom host router started on {}", addr));
        info!(addr, %bind_addr, routes, "Host router started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RouterError> {
        let mut server = self.server.lock().await;
        if server.is_none() {
            self.log(LogLevel::Warn, "Cannot stop host router: not running");
            return Err(RouterError::RouterNotRunning);
        }
        self.shutdown(&mut server).await;
        Ok(())
    }

    /// `(running, addr)`
    pub fn is_running(&self) -> (bool, String) {
        let status = self.status.read();
        (status.running, status.addr.clone())
    }

    pub fn status(&self) -> RouterStatus {
        self.status.read().clone()
    }

    /// Graceful stop bounded by the shutdown timeout, then abort
    async fn shutdown(&self, server: &mut Option<ServerHandle>) {
        let Some(mut handle) = server.take() else {
            return;
        };
        let started = Instant::now();

        let _ = handle.shutdown_tx.send(true);
        match tokio::time::timeout(self.options.shutdown_timeout, &mut handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.log(LogLevel::Warn, format!("Host router task failed: {}", e));
            }
            Err(_) => {
                handle.task.abort();
                let err = RouterError::ShutdownTimeout(self.options.shutdown_timeout);
                self.log(LogLevel::Warn, format!("{}; connections aborted", err));
            }
        }

        self.set_status(RouterPhase::Stopped, "");
        self.timeline.append(
            EventType::HostMapping,
            "Host Router Stopped",
            "Custom host mapping router stopped",
            EventStatus::Success,
            ACTOR,
            format_duration(started.elapsed()),
            None,
        );
        self.log(LogLevel::Info, "Host router stopped");
    }

    fn set_status(&self, phase: RouterPhase, addr: &str) {
        let mut status = self.status.write();
        status.phase = phase;
        status.running = phase == RouterPhase::Running;
        status.addr = addr.to_string();
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs.record(level, LogSource::Api, message);
    }
}

/// `:port` binds all interfaces; `host:port` may need a DNS lookup
pub async fn resolve_listen_addr(addr: &str) -> Result<SocketAddr, RouterError> {
    let invalid = |reason: String| RouterError::InvalidAddress {
        addr: addr.to_string(),
        reason,
    };

    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(invalid("address is empty".to_string()));
    }
    let candidate = match trimmed.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => trimmed.to_string(),
    };

    if let Ok(socket_addr) = candidate.parse::<SocketAddr>() {
        return Ok(socket_addr);
    }
    let resolved = match tokio::net::lookup_host(candidate.as_str()).await {
        Ok(mut addrs) => addrs
            .next()
            .ok_or_else(|| invalid("host resolved to no addresses".to_string())),
        Err(e) => Err(invalid(e.to_string())),
    };
    resolved
}

async fn serve(
    addr: SocketAddr,
    table: Arc<RouteTable>,
    pool: Arc<UpstreamPool>,
    logs: Arc<LogAggregator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            logs.record(LogLevel::Error, LogSource::Api, format!("Host router error: {}", e));
            return;
        }
    };
    info!(addr = %addr, routes = table.len(), "Host router listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            Arc::clone(&table),
                            Arc::clone(&pool),
                            Arc::clone(&logs),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);
    debug!(open = connections.len(), "Host router draining connections");
    while connections.join_next().await.is_some() {}
    debug!(addr = %addr, "Host router drained");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    table: Arc<RouteTable>,
    pool: Arc<UpstreamPool>,
    logs: Arc<LogAggregator>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let table = Arc::clone(&table);
        let pool = Arc::clone(&pool);
        let logs = Arc::clone(&logs);
        async move { Ok::<_, Infallible>(route_request(req, peer, &table, &pool, &logs).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    let mut draining = false;
    if *shutdown_rx.borrow_and_update() {
        conn.as_mut().graceful_shutdown();
        draining = true;
    }

    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    debug!(peer = %peer, error = %e, "Connection error");
                }
                break;
            }
            changed = shutdown_rx.changed(), if !draining => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    conn.as_mut().graceful_shutdown();
                    draining = true;
                }
            }
        }
    }
}

async fn route_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    table: &RouteTable,
    pool: &UpstreamPool,
    logs: &LogAggregator,
) -> Response<ProxyBody> {
    let host = request_host(&req);
    let origin = table.resolve(host.as_deref());

    let (parts, body) = req.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", origin, path);

    // Streamed through; a client that aborts mid-body fails the upstream call
    let body = reqwest::Body::wrap_stream(body.into_data_stream());

    debug!(host = ?host, method = %parts.method, url, "Routing request");
    let headers = forward_headers(parts.headers, peer, host.as_deref());

    match pool.send(parts.method, &url, headers, body).await {
        Ok(mut response) => {
            strip_hop_by_hop(response.headers_mut());
            response
        }
        Err(PoolError::Timeout(after)) => {
            logs.record(
                LogLevel::Warn,
                LogSource::Api,
                format!("Upstream {} timed out after {:?}", origin, after),
            );
            json_error_response(ProxyErrorCode::RequestTimeout, "Upstream request timed out")
        }
        Err(e) => {
            logs.record(
                LogLevel::Warn,
                LogSource::Api,
                format!("Upstream {} failed: {}", origin, e),
            );
            json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to connect to upstream")
        }
    }
}

/// Host header, else the authority of an absolute-form target
fn request_host(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are connection-scoped too
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Outbound headers: hop-by-hop removed, `Host` kept, `X-Forwarded-*` set
fn forward_headers(mut headers: HeaderMap, peer: SocketAddr, host: Option<&str>) -> HeaderMap {
    strip_hop_by_hop(&mut headers);

    // Overwritten rather than appended; this router is the first hop
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(value) = host.and_then(|h| HeaderValue::from_str(h).ok()) {
        if !headers.contains_key(hyper::header::HOST) {
            headers.insert(hyper::header::HOST, value.clone());
        }
        headers.insert(X_FORWARDED_HOST, value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    headers
}

/// Ask whoever holds `port` to exit. Never fails; outcomes are logged.
async fn reclaim_port(port: u16, logs: &LogAggregator) {
    let own_pid = std::process::id();
    let pids = match port_holders(port).await {
        Ok(pids) => pids,
        Err(e) => {
            logs.record(
                LogLevel::Warn,
                LogSource::Api,
                format!("Failed to kill processes on port {}: {}", port, e),
            );
            return;
        }
    };

    for pid in pids.into_iter().filter(|pid| *pid != own_pid) {
        match terminate_pid(pid).await {
            Ok(()) => logs.record(
                LogLevel::Info,
                LogSource::Api,
                format!("Killed process {} on port {}", pid, port),
            ),
            Err(e) => logs.record(
                LogLevel::Warn,
                LogSource::Api,
                format!("Failed to kill process {}: {}", pid, e),
            ),
        };
    }
}

/// Run a helper command, killing it if it outlives `bound`
async fn run_bounded(
    mut command: tokio::process::Command,
    bound: Duration,
) -> std::io::Result<std::process::Output> {
    command.stdin(Stdio::null()).kill_on_drop(true);
    match tokio::time::timeout(bound, command.output()).await {
        Ok(output) => output,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no answer within {:?}", bound),
        )),
    }
}

#[cfg(unix)]
async fn port_holders(port: u16) -> std::io::Result<Vec<u32>> {
    let mut command = tokio::process::Command::new("lsof");
    command.arg("-ti").arg(format!(":{}", port));
    let output = run_bounded(command, PORT_TOOL_TIMEOUT).await?;
    // lsof exits non-zero when nothing holds the port
    Ok(parse_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(not(unix))]
async fn port_holders(port: u16) -> std::io::Result<Vec<u32>> {
    let mut command = tokio::process::Command::new("netstat");
    command.arg("-ano");
    let output = run_bounded(command, PORT_TOOL_TIMEOUT).await?;
    Ok(parse_netstat_pids(&String::from_utf8_lossy(&output.stdout), port))
}

#[cfg(unix)]
async fn terminate_pid(pid: u32) -> std::io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
async fn terminate_pid(pid: u32) -> std::io::Result<()> {
    let mut command = tokio::process::Command::new("taskkill");
    command.args(["/F", "/PID", &pid.to_string()]);
    let status = run_bounded(command, PORT_TOOL_TIMEOUT).await?.status;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("taskkill exited with {}", status),
        ))
    }
}

/// One pid per line, blanks and junk skipped, duplicates removed
fn parse_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Pids of LISTENING sockets on `port` from `netstat -ano`
#[cfg_attr(unix, allow(dead_code))]
fn parse_netstat_pids(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{}", port);
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            if local.ends_with(&suffix) && state.eq_ignore_ascii_case("LISTENING") {
                fields.get(4)?.parse().ok()
            } else {
                None
            }
        })
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(hostname: &str, ip: &str, port: u16, protocol: MappingProtocol, active: bool) -> HostMapping {
        HostMapping {
            id: 0,
            hostname: hostname.to_string(),
            ip: ip.to_string(),
            port,
            protocol,
            active,
        }
    }

    const FALLBACK: &str = "http://127.0.0.1:8082";

    #[test]
    fn test_route_table_match_and_fallback() {
        let table = RouteTable::from_mappings(
            &[mapping("a.test", "10.0.0.1", 9000, MappingProtocol::Http, true)],
            FALLBACK,
        );
        assert_eq!(table.resolve(Some("a.test")), "http://10.0.0.1:9000");
        assert_eq!(table.resolve(Some("unknown.test")), FALLBACK);
        assert_eq!(table.resolve(None), FALLBACK);
    }

    #[test]
    fn test_route_table_matches_host_exactly() {
        let table = RouteTable::from_mappings(
            &[
                mapping("a.test", "10.0.0.1", 9000, MappingProtocol::Https, true),
                mapping("b.test:8080", "10.0.0.2", 9000, MappingProtocol::Http, true),
            ],
            FALLBACK,
        );
        assert_eq!(table.resolve(Some("a.test")), "https://10.0.0.1:9000");
        assert_eq!(table.resolve(Some("a.test:8080")), FALLBACK);
        assert_eq!(table.resolve(Some("A.TEST")), FALLBACK);
        assert_eq!(table.resolve(Some("b.test:8080")), "http://10.0.0.2:9000");
        assert_eq!(table.resolve(Some("b.test")), FALLBACK);
    }

    #[test]
    fn test_route_table_skips_inactive_and_tcp() {
        let table = RouteTable::from_mappings(
            &[
                mapping("off.test", "10.0.0.1", 1, MappingProtocol::Http, false),
                mapping("raw.test", "10.0.0.2", 2, MappingProtocol::Tcp, true),
                mapping("on.test", "10.0.0.3", 3, MappingProtocol::Http, true),
            ],
            FALLBACK,
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.resolve(Some("off.test")), FALLBACK);
        assert_eq!(table.resolve(Some("raw.test")), FALLBACK);
        assert_eq!(table.resolve(Some("on.test")), "http://10.0.0.3:3");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_port_lookup_is_bounded() {
        let mut command = tokio::process::Command::new("sleep");
        command.arg("10");

        let started = Instant::now();
        let err = run_bounded(command, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));

        let mut command = tokio::process::Command::new("echo");
        command.arg("4242");
        let output = run_bounded(command, Duration::from_secs(5)).await.unwrap();
        assert_eq!(parse_pids(&String::from_utf8_lossy(&output.stdout)), vec![4242]);
    }

    #[test]
    fn test_parse_pids() {
        assert_eq!(parse_pids("123\n456\n\n123\nnope\n"), vec![123, 456]);
        assert!(parse_pids("").is_empty());
    }

    #[test]
    fn test_parse_netstat_pids() {
        let output = "\
  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8080           0.0.0.0:0              LISTENING       4242
  TCP    127.0.0.1:18080        0.0.0.0:0              LISTENING       77
  TCP    10.0.0.5:8080          10.0.0.9:5123          ESTABLISHED     4242
";
        assert_eq!(parse_netstat_pids(output, 8080), vec![4242]);
        assert!(parse_netstat_pids(output, 9090).is_empty());
    }

    #[tokio::test]
    async fn test_resolve_listen_addr() {
        assert_eq!(
            resolve_listen_addr(":8081").await.unwrap(),
            "0.0.0.0:8081".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_listen_addr("127.0.0.1:9000").await.unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(resolve_listen_addr("localhost:9000").await.is_ok());

        for bad in ["", "   ", ":notaport", "no-port-here"] {
            let err = resolve_listen_addr(bad).await.unwrap_err();
            assert!(matches!(err, RouterError::InvalidAddress { .. }), "{:?}", bad);
        }
    }

    #[test]
    fn test_forward_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::HOST, HeaderValue::from_static("a.test"));
        headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("x-session", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("6.6.6.6"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        let peer: SocketAddr = "192.168.1.20:5555".parse().unwrap();
        let out = forward_headers(headers, peer, Some("a.test"));

        assert_eq!(out.get(hyper::header::HOST).unwrap(), "a.test");
        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "192.168.1.20");
        assert_eq!(out.get(X_FORWARDED_HOST).unwrap(), "a.test");
        assert_eq!(out.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(out.get("x-custom").unwrap(), "kept");
        assert!(out.get(hyper::header::CONNECTION).is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-session").is_none());
    }

    #[test]
    fn test_forward_headers_fills_missing_host() {
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let out = forward_headers(HeaderMap::new(), peer, Some("b.test:8080"));
        assert_eq!(out.get(hyper::header::HOST).unwrap(), "b.test:8080");

        let out = forward_headers(HeaderMap::new(), peer, None);
        assert!(out.get(hyper::header::HOST).is_none());
        assert!(out.get(X_FORWARDED_HOST).is_none());
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let store = Arc::new(crate::db::Database::open_in_memory().unwrap());
        let logs = Arc::new(LogAggregator::default());
        let timeline = Arc::new(TimelineEventLog::new());
        let router = HostRouter::new(
            store,
            logs.clone(),
            timeline.clone(),
            RouterOptions::from_settings(&RouterSettings::default()),
        )
        .unwrap();

        let err = router.stop().await.unwrap_err();
        assert!(matches!(err, RouterError::RouterNotRunning));
        assert_eq!(router.is_running(), (false, String::new()));
        assert!(timeline.is_empty());
        assert_eq!(logs.by_level("WARN").len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_address_leaves_router_stopped() {
        let store = Arc::new(crate::db::Database::open_in_memory().unwrap());
        let router = HostRouter::new(
            store,
            Arc::new(LogAggregator::default()),
            Arc::new(TimelineEventLog::new()),
            RouterOptions::from_settings(&RouterSettings::default()),
        )
        .unwrap();

        let err = router.start("").await.unwrap_err();
        assert!(matches!(err, RouterError::InvalidAddress { .. }));
        assert_eq!(router.status().phase, RouterPhase::Stopped);
    }
}
