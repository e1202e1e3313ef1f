//! HTTP frontend serving the `/v1/docker-flow-proxy/*` endpoints

use crate::certs::{CertStore, CertsResponse};
use crate::config::InstanceConfig;
use crate::distribute::{Distributor, MutationRequest, DISTRIBUTED};
use crate::engine::EngineController;
use crate::error::ProxyError;
use crate::listener::{render_services_page, ListenerClient};
use crate::reconfigure::Reconfigure;
use crate::remove::{Remove, RemoveRequest};
use crate::service::{Query, ServiceDefinition, SERVICE_NAME_MANDATORY_MESSAGE};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const RECONFIGURE_PATH: &str = "/v1/docker-flow-proxy/reconfigure";
pub const REMOVE_PATH: &str = "/v1/docker-flow-proxy/remove";
pub const CERT_PATH: &str = "/v1/docker-flow-proxy/cert";
pub const CERTS_PATH: &str = "/v1/docker-flow-proxy/certs";
pub const CONFIG_PATH: &str = "/v1/docker-flow-proxy/config";
pub const SERVICES_PATH: &str = "/v1/docker-flow-proxy/services";

const CERT_NAME_MANDATORY_MESSAGE: &str = "The certName query is mandatory";
const SERVICES_UNAVAILABLE_PAGE: &str = "<h3>Unable to get registered services</h3>";

/// JSON envelope of every mutation response
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApiResponse {
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(flatten)]
    pub service: Option<ServiceDefinition>,
}

impl ApiResponse {
    fn ok(service: Option<ServiceDefinition>) -> Self {
        Self {
            status: "OK".to_string(),
            message: String::new(),
            service,
        }
    }

    fn nok(message: impl Into<String>, service: Option<ServiceDefinition>) -> Self {
        Self {
            status: "NOK".to_string(),
            message: message.into(),
            service,
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(json) => response(status, "application/json", json),
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "internal error")
        }
    }
}

fn html_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    response(status, "text/html", body)
}

fn not_found() -> Response<Full<Bytes>> {
    response(StatusCode::NOT_FOUND, "text/plain", "404 page not found")
}

fn error_response(err: &ProxyError, service: Option<ServiceDefinition>) -> Response<Full<Bytes>> {
    if matches!(err, ProxyError::InvalidDefinition(_)) {
        debug!(error = %err, "Rejected request");
    } else {
        warn!(stage = err.stage().as_str(), error = %err, "Request failed");
    }
    json_response(err.status_code(), &ApiResponse::nok(err.to_string(), service))
}

/// Everything a request handler needs
pub struct AppState {
    pub config: Arc<InstanceConfig>,
    pub reconfigure: Arc<Reconfigure>,
    pub remove: Arc<Remove>,
    pub distributor: Arc<Distributor>,
    pub certs: Arc<dyn CertStore>,
    pub engine: Arc<dyn EngineController>,
}

impl AppState {
    async fn distribute(&self, request: MutationRequest) -> Result<(), ProxyError> {
        self.distributor
            .distribute(&request, self.config.port, &self.config.service_name)
            .await?
            .into_result()
            .map(|_| ())
    }
}

/// HTTP frontend of one proxy instance
pub struct ApiServer {
    bind_addr: SocketAddr,
    state: Arc<AppState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(bind_addr: SocketAddr, state: Arc<AppState>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept API connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, state: Arc<AppState>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("API connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let body = req.into_body().collect().await?.to_bytes();

    Ok(route(&state, method, &path, &query, body).await)
}

/// Dispatch one request
pub async fn route(
    state: &AppState,
    method: Method,
    path: &str,
    raw_query: &str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    if path != "/v1/test" && path != "/v2/test" {
        info!(%method, path, "API request");
    }
    let query = Query::parse(raw_query);

    match path {
        "/v1/test" | "/v2/test" => json_response(StatusCode::OK, &ApiResponse::ok(None)),
        RECONFIGURE_PATH => reconfigure(state, method, query, body).await,
        REMOVE_PATH => remove(state, method, query, body).await,
        CERT_PATH if method == Method::PUT => put_cert(state, method, query, body).await,
        CERT_PATH => {
            warn!(%method, "{} allows only PUT requests", CERT_PATH);
            not_found()
        }
        CERTS_PATH => list_certs(state),
        CONFIG_PATH => match state.engine.read_config().await {
            Ok(config) => html_response(StatusCode::OK, config),
            Err(e) => {
                warn!(error = %e, "Failed to read the configuration");
                html_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        },
        SERVICES_PATH => services(state).await,
        _ => not_found(),
    }
}

fn mutation(method: Method, path: &str, query: Query, body: Bytes) -> MutationRequest {
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::PUT);
    MutationRequest::new(method, path, query).with_body(body.to_vec())
}

async fn reconfigure(state: &AppState, method: Method, query: Query, body: Bytes) -> Response<Full<Bytes>> {
    let mut service = match ServiceDefinition::from_query(&query, state.config.mode) {
        Ok(service) => service,
        Err(e) => return error_response(&e, None),
    };
    service.normalize();
    if let Err(e) = service.validate(state.config.mode) {
        return error_response(&e, Some(service));
    }

    if service.distribute {
        let request = mutation(method, RECONFIGURE_PATH, query, body);
        return match state.distribute(request).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &ApiResponse::ok(Some(service)).with_message(DISTRIBUTED),
            ),
            Err(e) => error_response(&e, Some(service)),
        };
    }

    match state.reconfigure.reconfigure(service.clone()).await {
        Ok(stored) => json_response(StatusCode::OK, &ApiResponse::ok(Some(stored))),
        Err(e) => error_response(&e, Some(service)),
    }
}

async fn remove(state: &AppState, method: Method, query: Query, body: Bytes) -> Response<Full<Bytes>> {
    let request = RemoveRequest {
        service_name: query.get("serviceName").to_string(),
        acl_name: query.get("aclName").to_string(),
    };
    let distribute = query.get_bool("distribute");
    let mut echo = ServiceDefinition::named(&request.service_name);
    echo.acl_name = request.acl_name.clone();
    echo.distribute = distribute;

    if request.service_name.trim().is_empty() {
        let err = ProxyError::invalid(SERVICE_NAME_MANDATORY_MESSAGE);
        return error_response(&err, Some(echo));
    }

    if distribute {
        let request = mutation(method, REMOVE_PATH, query, body);
        return match state.distribute(request).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &ApiResponse::ok(Some(echo)).with_message(DISTRIBUTED),
            ),
            Err(e) => error_response(&e, Some(echo)),
        };
    }

    match state.remove.remove(&request).await {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok(Some(echo))),
        Err(e) => error_response(&e, Some(echo)),
    }
}

async fn put_cert(state: &AppState, method: Method, query: Query, body: Bytes) -> Response<Full<Bytes>> {
    let name = query.get("certName").to_string();
    if name.is_empty() {
        return error_response(&ProxyError::invalid(CERT_NAME_MANDATORY_MESSAGE), None);
    }

    if query.get_bool("distribute") {
        let request = mutation(method, CERT_PATH, query, body);
        return match state.distribute(request).await {
            Ok(()) => json_response(StatusCode::OK, &ApiResponse::ok(None).with_message(DISTRIBUTED)),
            Err(e) => error_response(&e, None),
        };
    }

    match state.reconfigure.install_cert(&name, &body).await {
        Ok(path) => json_response(
            StatusCode::OK,
            &ApiResponse::ok(None).with_message(format!("Certificate stored as {}", path.display())),
        ),
        Err(e) => error_response(&e, None),
    }
}

fn list_certs(state: &AppState) -> Response<Full<Bytes>> {
    let listing = CertsResponse {
        status: "OK".to_string(),
        certs_dir: state.certs.dir().display().to_string(),
        proxy_service_name: state.config.service_name.clone(),
        certs: state.certs.list_certs(),
    };
    json_response(StatusCode::OK, &listing)
}

async fn services(state: &AppState) -> Response<Full<Bytes>> {
    let Some(url) = state.config.listener_url() else {
        warn!("No service listener configured");
        return html_response(StatusCode::INTERNAL_SERVER_ERROR, SERVICES_UNAVAILABLE_PAGE);
    };
    let listed = match ListenerClient::new(url, state.config.distribute.timeout()) {
        Ok(client) => client.services().await,
        Err(e) => Err(e),
    };
    match listed {
        Ok(services) => html_response(StatusCode::OK, render_services_page(&services)),
        Err(e) => {
            warn!(error = %e, "Unable to get registered services");
            html_response(StatusCode::INTERNAL_SERVER_ERROR, SERVICES_UNAVAILABLE_PAGE)
        }
    }
}
