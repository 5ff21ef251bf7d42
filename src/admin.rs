//! JSON control API
//!
//! Every route except `/health` and `/version` requires
//! `Authorization: Bearer <token>`. Failures come back as
//! `{"error": "..."}` with the status from [`AppError::status_code`].

use crate::app::Gostly;
use crate::db::{HostMapping, Profile};
use crate::error::AppError;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Default number of activity rows returned without `?limit=`
const DEFAULT_ACTIVITY_LIMIT: usize = 100;

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_value<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(status, body),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error_body(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        serde_json::json!({ "error": message }).to_string(),
    )
}

fn error_response(err: &AppError) -> Response<Full<Bytes>> {
    error_body(err.status_code(), &err.to_string())
}

fn result_response<T: Serialize>(status: StatusCode, result: Result<T, AppError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => json_value(status, &value),
        Err(e) => error_response(&e),
    }
}

/// Control API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    gostly: Arc<Gostly>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        gostly: Arc<Gostly>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            gostly,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Control API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gostly = Arc::clone(&self.gostly);
                            let auth_token = Arc::clone(&self.auth_token);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, gostly, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Control API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    gostly: Arc<Gostly>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let gostly = Arc::clone(&gostly);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, gostly, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

/// Value of `key` in a query string, percent-decoded
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| urlencoding::decode(v).ok())
        .map(|v| v.into_owned())
        .filter(|v| !v.is_empty())
}

fn parse_id(raw: &str) -> Result<i64, AppError> {
    raw.parse()
        .map_err(|_| AppError::Invalid(format!("'{}' is not a valid id", raw)))
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::Invalid(format!("invalid JSON body: {}", e)))
}

#[derive(Debug, Deserialize)]
struct RouterStartRequest {
    addr: String,
}

async fn handle_admin_request<B>(
    req: Request<B>,
    gostly: Arc<Gostly>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, B::Error>
where
    B: Body<Data = Bytes>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => return Ok(json_response(StatusCode::OK, r#"{"status":"ok"}"#)),
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            return Ok(json_response(StatusCode::OK, version_info.to_string()));
        }
        _ => {}
    }

    if !check_auth(&req, &auth_token) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(error_body(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let body = req.into_body().collect().await?.to_bytes();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let query = query.as_deref();

    let response = match (&method, segments.as_slice()) {
        // Profiles
        (&Method::GET, ["profiles"]) => result_response(StatusCode::OK, gostly.profiles()),
        (&Method::POST, ["profiles"]) => result_response(
            StatusCode::CREATED,
            parse_json::<Profile>(&body).and_then(|p| gostly.add_profile(p)),
        ),
        (&Method::GET, ["profiles", id]) => {
            result_response(StatusCode::OK, parse_id(id).and_then(|id| gostly.profile(id)))
        }
        (&Method::PUT, ["profiles", id]) => result_response(
            StatusCode::OK,
            parse_id(id).and_then(|id| {
                let mut profile = parse_json::<Profile>(&body)?;
                profile.id = id;
                gostly.update_profile(profile)
            }),
        ),
        (&Method::DELETE, ["profiles", id]) => result_response(
            StatusCode::OK,
            parse_id(id)
                .and_then(|id| gostly.delete_profile(id))
                .map(|()| serde_json::json!({ "deleted": true })),
        ),
        (&Method::POST, ["profiles", id, "start"]) => match parse_id(id) {
            Ok(id) => result_response(StatusCode::OK, gostly.start_profile(id).await),
            Err(e) => error_response(&e),
        },
        (&Method::POST, ["profiles", id, "stop"]) => match parse_id(id) {
            Ok(id) => result_response(
                StatusCode::OK,
                gostly
                    .stop_profile(id)
                    .await
                    .map(|()| serde_json::json!({ "stopped": true })),
            ),
            Err(e) => error_response(&e),
        },

        // Router
        (&Method::GET, ["router"]) => json_value(StatusCode::OK, &gostly.router_status()),
        (&Method::POST, ["router", "start"]) => match parse_json::<RouterStartRequest>(&body) {
            Ok(request) => match gostly.start_router(&request.addr).await {
                Ok(()) => json_value(StatusCode::OK, &gostly.router_status()),
                Err(e) => error_response(&e),
            },
            Err(e) => error_response(&e),
        },
        (&Method::POST, ["router", "stop"]) => match gostly.stop_router().await {
            Ok(()) => json_value(StatusCode::OK, &gostly.router_status()),
            Err(e) => error_response(&e),
        },

        // Host mappings
        (&Method::GET, ["mappings"]) => result_response(StatusCode::OK, gostly.host_mappings()),
        (&Method::PUT, ["mappings"]) => result_response(
            StatusCode::OK,
            parse_json::<HostMapping>(&body).and_then(|m| gostly.upsert_host_mapping(m)),
        ),
        (&Method::DELETE, ["mappings", "id", id]) => result_response(
            StatusCode::OK,
            parse_id(id)
                .and_then(|id| gostly.delete_host_mapping_by_id(id))
                .map(|()| serde_json::json!({ "deleted": true })),
        ),
        (&Method::DELETE, ["mappings", hostname]) => {
            let hostname = urlencoding::decode(hostname)
                .map(|h| h.into_owned())
                .unwrap_or_else(|_| hostname.to_string());
            result_response(
                StatusCode::OK,
                gostly
                    .delete_host_mapping_by_hostname(&hostname)
                    .map(|()| serde_json::json!({ "deleted": true })),
            )
        }

        // Logs, timeline, activity
        (&Method::GET, ["logs"]) => {
            let limit = query_param(query, "limit").and_then(|l| l.parse::<usize>().ok());
            let mut entries = match (query_param(query, "level"), query_param(query, "source")) {
                (None, None) => match limit {
                    Some(n) => gostly.recent_logs(n),
                    None => gostly.logs(),
                },
                (Some(level), None) => gostly.logs_by_level(&level),
                (None, Some(source)) => gostly.logs_by_source(&source),
                (Some(level), Some(source)) => {
                    let from_source: HashSet<i64> =
                        gostly.logs_by_source(&source).iter().map(|e| e.id).collect();
                    let mut entries = gostly.logs_by_level(&level);
                    entries.retain(|e| from_source.contains(&e.id));
                    entries
                }
            };
            if let Some(limit) = limit {
                let skip = entries.len().saturating_sub(limit);
                entries.drain(..skip);
            }
            json_value(StatusCode::OK, &entries)
        }
        (&Method::DELETE, ["logs"]) => {
            gostly.clear_logs();
            json_response(StatusCode::OK, r#"{"cleared":true}"#)
        }
        (&Method::GET, ["timeline"]) => json_value(StatusCode::OK, &gostly.timeline()),
        (&Method::GET, ["activity"]) => {
            let result = match query_param(query, "profile_id") {
                Some(raw) => parse_id(&raw).and_then(|id| gostly.profile_activity(id)),
                None => {
                    let limit = query_param(query, "limit")
                        .and_then(|l| l.parse().ok())
                        .unwrap_or(DEFAULT_ACTIVITY_LIMIT);
                    gostly.recent_activity(limit)
                }
            };
            result_response(StatusCode::OK, result)
        }

        // Worker executable
        (&Method::GET, ["worker"]) => {
            let diagnostics = gostly.worker_diagnostics();
            let body = serde_json::json!({
                "available": diagnostics.resolved.is_some(),
                "diagnostics": diagnostics,
                "workers": gostly.workers(),
            });
            json_value(StatusCode::OK, &body)
        }

        _ => error_body(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::resolver::testing::FixedResolver;
    use serde_json::Value;

    const TOKEN: &str = "test-token";

    fn gostly() -> Arc<Gostly> {
        let store = Arc::new(Database::open_in_memory().unwrap());
        Arc::new(
            Gostly::with_resolver(&Config::default(), store, Arc::new(FixedResolver(None))).unwrap(),
        )
    }

    async fn call(
        gostly: &Arc<Gostly>,
        method: Method,
        uri: &str,
        body: &str,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let req = builder.body(Full::new(Bytes::from(body.to_string()))).unwrap();

        let resp = handle_admin_request(req, Arc::clone(gostly), Arc::new(TOKEN.to_string()))
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_version_need_no_auth() {
        let g = gostly();
        let (status, body) = call(&g, Method::GET, "/health", "", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&g, Method::GET, "/version", "", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_auth_required() {
        let g = gostly();
        let (status, body) = call(&g, Method::GET, "/profiles", "", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = call(&g, Method::GET, "/profiles", "", Some("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_profile_routes() {
        let g = gostly();
        let (status, created) = call(
            &g,
            Method::POST,
            "/profiles",
            r#"{"name":"office","type":"forward","listen":":1080","remote":"10.0.0.1:22"}"#,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "stopped");
        let id = created["id"].as_i64().unwrap();

        let (status, listed) = call(&g, Method::GET, "/profiles", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, updated) = call(
            &g,
            Method::PUT,
            &format!("/profiles/{}", id),
            r#"{"name":"office","type":"http","listen":":8080","remote":"10.0.0.1:3128"}"#,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["type"], "http");

        let (status, body) =
            call(&g, Method::POST, &format!("/profiles/{}/start", id), "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("not available"));

        let (status, _) =
            call(&g, Method::POST, &format!("/profiles/{}/stop", id), "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&g, Method::DELETE, &format!("/profiles/{}", id), "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&g, Method::GET, &format!("/profiles/{}", id), "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bad_input() {
        let g = gostly();
        let (status, body) = call(&g, Method::POST, "/profiles", "{not json", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid JSON"));

        let (status, _) = call(&g, Method::GET, "/profiles/abc", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&g, Method::GET, "/nope", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_mapping_routes() {
        let g = gostly();
        let (status, saved) = call(
            &g,
            Method::PUT,
            "/mappings",
            r#"{"hostname":"a.test","ip":"10.0.0.1","port":9000,"protocol":"HTTP"}"#,
            Some(TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(saved["active"], true);

        let (_, listed) = call(&g, Method::GET, "/mappings", "", Some(TOKEN)).await;
        assert_eq!(listed[0]["hostname"], "a.test");

        let (status, _) = call(&g, Method::DELETE, "/mappings/a.test", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&g, Method::DELETE, "/mappings/a.test", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&g, Method::DELETE, "/mappings/id/5", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_router_and_log_routes() {
        let g = gostly();
        let (status, body) = call(&g, Method::GET, "/router", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);

        let (status, _) = call(&g, Method::POST, "/router/stop", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) =
            call(&g, Method::POST, "/router/start", r#"{"addr":""}"#, Some(TOKEN)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, logs) =
            call(&g, Method::GET, "/logs?level=warn&source=api", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(logs
            .as_array()
            .unwrap()
            .iter()
            .all(|e| e["level"] == "WARN" && e["source"] == "api"));
        assert!(!logs.as_array().unwrap().is_empty());

        let (_, limited) = call(&g, Method::GET, "/logs?limit=1", "", Some(TOKEN)).await;
        assert_eq!(limited.as_array().unwrap().len(), 1);

        let (_, by_source) = call(&g, Method::GET, "/logs?source=API", "", Some(TOKEN)).await;
        assert!(!by_source.as_array().unwrap().is_empty());
        assert!(by_source.as_array().unwrap().iter().all(|e| e["source"] == "api"));

        let (status, _) = call(&g, Method::DELETE, "/logs", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(g.logs().is_empty());

        let (_, timeline) = call(&g, Method::GET, "/timeline", "", Some(TOKEN)).await;
        assert_eq!(timeline[0]["action"], "Core Initialized");

        let (status, worker) = call(&g, Method::GET, "/worker", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(worker["available"], false);

        let (status, activity) = call(&g, Method::GET, "/activity?limit=5", "", Some(TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(activity.as_array().unwrap().is_empty());
    }

    #[test]
    fn test_query_param() {
        let q = Some("level=warn&source=&limit=10&name=a%20b");
        assert_eq!(query_param(q, "level").as_deref(), Some("warn"));
        assert_eq!(query_param(q, "source"), None);
        assert_eq!(query_param(q, "limit").as_deref(), Some("10"));
        assert_eq!(query_param(q, "name").as_deref(), Some("a b"));
        assert_eq!(query_param(None, "level"), None);
    }
}
