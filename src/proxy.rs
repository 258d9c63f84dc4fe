use crate::error::{method_not_allowed, text_error_response, ProxyErrorCode, SupervisorError};
use crate::supervisor::Supervisor;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderName, ACCEPT_ENCODING, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST,
    TRANSFER_ENCODING,
};
use hyper::http::uri::InvalidUri;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Methods forwarded to the backend. HEAD follows GET.
pub const FORWARDED_METHODS: [Method; 7] = [
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::OPTIONS,
];

/// Value of the Allow header on 405 responses
const ALLOW_METHODS: &str = "GET, HEAD, POST, PUT, DELETE, PATCH, OPTIONS";

/// Body returned when the backend cannot be confirmed healthy
pub const BACKEND_UNAVAILABLE_MESSAGE: &str =
    "Backend server is not available. Please check server logs.";

/// Inbound headers never copied to the backend request.
///
/// `accept-encoding` is dropped so the backend answers in identity encoding,
/// which is what makes removing `content-encoding` on the way back sound.
const REQUEST_HEADER_DENYLIST: [HeaderName; 7] = [
    HOST,
    CONNECTION,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    ACCEPT_ENCODING,
];

/// Backend response headers never copied to the client
const RESPONSE_HEADER_DENYLIST: [HeaderName; 4] =
    [CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];

/// Forwards requests to the supervised backend.
///
/// Holds the supervisor by reference and a single HTTP client; requests
/// are otherwise stateless.
pub struct Gateway {
    supervisor: Arc<Supervisor>,
    client: Client<HttpConnector, Incoming>,
    fatal_tx: Option<mpsc::UnboundedSender<SupervisorError>>,
}

impl Gateway {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            supervisor,
            client,
            fatal_tx: None,
        }
    }

    /// Report spawn failures seen while serving requests on this channel
    pub fn with_fatal_errors(mut self, tx: mpsc::UnboundedSender<SupervisorError>) -> Self {
        self.fatal_tx = Some(tx);
        self
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Handle one inbound request. Never fails: every error becomes a response.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        debug!(%method, %uri, "Incoming request");

        if !is_forwarded_method(&method) {
            debug!(%method, "Rejecting unsupported method");
            return method_not_allowed(ALLOW_METHODS);
        }

        match self.supervisor.ensure_started().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%method, %uri, "Backend not healthy, rejecting request");
                return text_error_response(
                    ProxyErrorCode::BackendUnavailable,
                    BACKEND_UNAVAILABLE_MESSAGE,
                );
            }
            Err(e) => {
                error!(error = %e, "Backend could not be launched");
                if let Some(ref tx) = self.fatal_tx {
                    let _ = tx.send(e);
                }
                return text_error_response(
                    ProxyErrorCode::BackendUnavailable,
                    BACKEND_UNAVAILABLE_MESSAGE,
                );
            }
        }

        let target = match upstream_uri(self.supervisor.port(), &uri) {
            Ok(target) => target,
            Err(e) => {
                error!(%uri, error = %e, "Failed to build upstream URI");
                return upstream_error_response(&e);
            }
        };

        let (parts, body) = req.into_parts();
        let mut upstream = Request::new(body);
        *upstream.method_mut() = parts.method;
        *upstream.uri_mut() = target;
        *upstream.headers_mut() = filter_request_headers(&parts.headers);

        match self.client.request(upstream).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                debug!(%method, %uri, status = %parts.status, "Relaying backend response");

                let mut relayed = Response::new(body.boxed());
                *relayed.status_mut() = parts.status;
                *relayed.headers_mut() = filter_response_headers(&parts.headers);
                relayed
            }
            Err(e) => {
                error!(%method, %uri, error = %error_chain(&e), "Error forwarding request");
                upstream_error_response(&e)
            }
        }
    }
}

fn upstream_error_response(e: &dyn std::error::Error) -> Response<BoxBody<Bytes, hyper::Error>> {
    text_error_response(
        ProxyErrorCode::UpstreamFailed,
        format!("Error connecting to backend server: {}", error_chain(e)),
    )
}

/// Render an error with its sources, outermost first
fn error_chain(e: &dyn std::error::Error) -> String {
    let mut message = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

pub fn is_forwarded_method(method: &Method) -> bool {
    FORWARDED_METHODS.contains(method)
}

/// Backend URI for an inbound URI: loopback base plus the path and query verbatim
pub fn upstream_uri(port: u16, inbound: &Uri) -> Result<Uri, InvalidUri> {
    let path = inbound
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("http://127.0.0.1:{}{}", port, path).parse()
}

/// Copy inbound headers minus the request denylist, values untouched
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, &REQUEST_HEADER_DENYLIST)
}

/// Copy backend response headers minus the response denylist
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter_headers(headers, &RESPONSE_HEADER_DENYLIST)
}

fn filter_headers(headers: &HeaderMap, denylist: &[HeaderName]) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if denylist.contains(name) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// The inbound HTTP listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, hyper::Error>(gateway.handle(req).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
