//! Proxy server implementation

use parking_lot::Mutex;
use rustls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::history::ProxyHistory;
use super::intercept::{InterceptDecision, InterceptQueue};
use super::tls::CertificateProvider;
use crate::app::{AppEvent, EventSink, ProxyConfig};
use crate::error::{GleipError, ProxyError, Result};
use crate::http::wire::{self, ParsedRequest};
use crate::http::{HttpRequest, HttpSender, HttpTransaction, SendOptions};

/// Intercepting proxy server
pub struct ProxyServer {
    shared: Arc<Shared>,
    state: Mutex<Option<Running>>,
}

/// State every connection task reads
struct Shared {
    config: ProxyConfig,
    provider: Arc<CertificateProvider>,
    tls_config: Arc<ServerConfig>,
    queue: Arc<InterceptQueue>,
    history: Arc<ProxyHistory>,
    sender: HttpSender,
    events: EventSink,
    intercept_enabled: AtomicBool,
}

struct Running {
    addr: SocketAddr,
    /// Closes the listener and idle connections
    shutdown: CancellationToken,
    /// Tears down connections still busy after the grace period
    abort: CancellationToken,
    tracker: TaskTracker,
    accept_loop: JoinHandle<()>,
}

/// Where requests on a connection are headed
enum Origin {
    /// Plain proxy request, absolute URL or Host header
    Plain,
    /// Decrypted CONNECT tunnel
    Tunnel { host: String, port: u16 },
}

impl Origin {
    fn url_for(&self, request: &ParsedRequest) -> Option<String> {
        let target = &request.target;
        if target.starts_with("http://") || target.starts_with("https://") {
            return Some(target.clone());
        }
        if !target.starts_with('/') {
            return None;
        }
        match self {
            Origin::Plain => request
                .headers
                .get("host")
                .map(|host| format!("http://{}{}", host, target)),
            Origin::Tunnel { host, port: 443 } => Some(format!("https://{}{}", host, target)),
            Origin::Tunnel { host, port } => Some(format!("https://{}:{}{}", host, port, target)),
        }
    }
}

impl ProxyServer {
    /// Create a new proxy server. The certificate provider must already hold its CA.
    pub fn new(
        config: &ProxyConfig,
        provider: Arc<CertificateProvider>,
        queue: Arc<InterceptQueue>,
        history: Arc<ProxyHistory>,
        sender: HttpSender,
        events: EventSink,
    ) -> Result<Self> {
        let tls_config = provider.server_config()?;

        Ok(Self {
            shared: Arc::new(Shared {
                config: config.clone(),
                provider,
                tls_config,
                queue,
                history,
                sender,
                events,
                intercept_enabled: AtomicBool::new(config.intercept_enabled),
            }),
            state: Mutex::new(None),
        })
    }

    /// Start the proxy server; returns the bound address. Calling it again is a no-op.
    pub async fn start(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let bind = format!("{}:{}", self.shared.config.listen_addr, self.shared.config.listen_port);
        let listener = TcpListener::bind(&bind).await.map_err(|e| ProxyError::StartError {
            addr: bind.clone(),
            reason: e.to_string(),
        })?;
        let addr = listener.local_addr()?;

        let started = {
            let mut state = self.state.lock();
            if let Some(running) = state.as_ref() {
                // Lost a race with another start(); our listener is dropped here
                return Ok(running.addr);
            }

            let shutdown = CancellationToken::new();
            let abort = CancellationToken::new();
            let tracker = TaskTracker::new();
            let accept_loop = tokio::spawn(accept_loop(
                listener,
                self.shared.clone(),
                shutdown.clone(),
                abort.clone(),
                tracker.clone(),
            ));

            *state = Some(Running {
                addr,
                shutdown,
                abort,
                tracker,
                accept_loop,
            });
            addr
        };

        tracing::info!("Proxy server listening on {}", started);
        self.shared.events.emit(AppEvent::ProxyStarted { addr: started }).await;
        Ok(started)
    }

    /// Stop the proxy server
    ///
    /// Closes the listener, lets in-flight exchanges finish for up to
    /// `shutdown_grace_secs`, then drops whatever is left.
    pub async fn stop(&self) {
        let Some(running) = self.state.lock().take() else {
            return;
        };

        running.shutdown.cancel();
        if let Err(e) = running.accept_loop.await {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }

        running.tracker.close();
        let grace = Duration::from_secs(self.shared.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, running.tracker.wait()).await.is_err() {
            tracing::warn!(
                remaining = running.tracker.len(),
                "Grace period elapsed, closing remaining connections"
            );
            running.abort.cancel();
            running.tracker.wait().await;
        }

        tracing::info!("Proxy server stopped");
        self.shared.events.emit(AppEvent::ProxyStopped).await;
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().as_ref().map(|r| r.addr)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn set_intercept_enabled(&self, enabled: bool) {
        self.shared.intercept_enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "Interception toggled");
    }

    pub fn intercept_enabled(&self) -> bool {
        self.shared.intercept_enabled.load(Ordering::SeqCst)
    }

    pub fn intercept_queue(&self) -> Arc<InterceptQueue> {
        self.shared.queue.clone()
    }

    pub fn history(&self) -> Arc<ProxyHistory> {
        self.shared.history.clone()
    }

    pub fn certificate_provider(&self) -> Arc<CertificateProvider> {
        self.shared.provider.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Proxy: new connection from {}", peer);

                    let shared = shared.clone();
                    let shutdown = shutdown.clone();
                    let abort = abort.clone();

                    tracker.spawn(async move {
                        tokio::select! {
                            _ = abort.cancelled() => {
                                tracing::debug!(%peer, "Connection closed at shutdown");
                            }
                            result = handle_connection(stream, peer, &shared, &shutdown) => {
                                if let Err(e) = result {
                                    tracing::warn!("Proxy connection error from {}: {}", peer, e);
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

/// Handle a single connection
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let Some(first) = next_request(&mut reader, peer, shutdown).await? else {
        return Ok(());
    };

    if first.is_connect() {
        handle_connect(reader, first, peer, shared, shutdown).await
    } else {
        serve_requests(reader, Origin::Plain, Some(first), peer, shared, shutdown).await
    }
}

/// Read the next request, stopping early if the proxy is shutting down.
/// Malformed input is answered with a 400 before the error is returned.
async fn next_request<S>(
    stream: &mut BufReader<S>,
    peer: SocketAddr,
    shutdown: &CancellationToken,
) -> Result<Option<ParsedRequest>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let parsed = tokio::select! {
        _ = shutdown.cancelled() => return Ok(None),
        parsed = wire::read_request(stream) => parsed,
    };

    match parsed {
        Ok(request) => Ok(request),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            let _ = wire::write_simple_response(stream, 400, "Bad Request").await;
            Err(ProxyError::InvalidRequest {
                peer: peer.to_string(),
                reason: e.to_string(),
            }
            .into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Handle CONNECT method (HTTPS tunnel)
async fn handle_connect(
    mut stream: BufReader<TcpStream>,
    request: ParsedRequest,
    peer: SocketAddr,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Result<()> {
    let Some((host, port)) = split_authority(&request.target, 443) else {
        let _ = wire::write_simple_response(&mut stream, 400, "Bad CONNECT target").await;
        return Err(ProxyError::InvalidRequest {
            peer: peer.to_string(),
            reason: format!("bad CONNECT target {:?}", request.target),
        }
        .into());
    };

    tracing::debug!("Proxy: handling CONNECT to {}:{}", host, port);

    if !shared.config.https_intercept {
        // Pure tunnel (no interception)
        let mut upstream = match TcpStream::connect((host.trim_matches(['[', ']']), port)).await {
            Ok(s) => s,
            Err(e) => {
                let _ = wire::write_simple_response(&mut stream, 502, "Upstream unreachable").await;
                return Err(GleipError::network(&request.target, e));
            }
        };
        stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        stream.flush().await?;
        tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        return Ok(());
    }

    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;

    let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
        .await
        .map_err(|e| GleipError::tls(&host, e))?;

    // Issue (or fetch) the leaf before the resolver is consulted. Without SNI
    // the CONNECT target is the best identity we have.
    let server_name = start.client_hello().server_name().map(str::to_string);
    let tls_config = match server_name.as_deref() {
        Some(_) => {
            shared
                .provider
                .certificate_for_conn(server_name.as_deref())
                .await?;
            shared.tls_config.clone()
        }
        None => {
            let identity = host.trim_start_matches('[').trim_end_matches(']');
            shared.provider.server_config_for_host(identity).await?
        }
    };

    let tls = start
        .into_stream(tls_config)
        .await
        .map_err(|e| GleipError::tls(&host, e))?;
    tracing::debug!(host = %host, sni = server_name.as_deref().unwrap_or(""), "TLS handshake complete");

    serve_requests(
        BufReader::new(tls),
        Origin::Tunnel { host, port },
        None,
        peer,
        shared,
        shutdown,
    )
    .await
}

/// Request/response loop over one (possibly decrypted) client stream
async fn serve_requests<S>(
    mut stream: BufReader<S>,
    origin: Origin,
    mut pending: Option<ParsedRequest>,
    peer: SocketAddr,
    shared: &Shared,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let request = match pending.take() {
            Some(request) => request,
            None => match next_request(&mut stream, peer, shutdown).await? {
                Some(request) => request,
                None => return Ok(()),
            },
        };

        let Some(url) = origin.url_for(&request).filter(|_| !request.is_connect()) else {
            let _ = wire::write_simple_response(&mut stream, 400, "Bad Request").await;
            return Err(ProxyError::InvalidRequest {
                peer: peer.to_string(),
                reason: format!("cannot route {} {}", request.method, request.target),
            }
            .into());
        };

        let close = request.wants_close();
        let keep_open = exchange(&mut stream, request, url, close, shared).await?;
        if close || !keep_open {
            let _ = stream.shutdown().await;
            return Ok(());
        }
    }
}

/// Capture, gate, forward and relay one request. History is updated before
/// the client sees the response. Returns whether the connection may carry
/// another request.
async fn exchange<S>(
    stream: &mut S,
    parsed: ParsedRequest,
    url: String,
    close: bool,
    shared: &Shared,
) -> Result<bool>
where
    S: AsyncWrite + Unpin,
{
    let request = HttpRequest {
        method: parsed.method.to_uppercase(),
        url,
        headers: parsed.headers,
        body: parsed.body,
    };

    let mut transaction = HttpTransaction::new(request);
    tracing::debug!(
        id = %transaction.id,
        method = %transaction.request.method,
        url = %transaction.request.url,
        "Proxy: captured request"
    );
    shared.history.add(transaction.clone());
    shared
        .events
        .emit(AppEvent::NewTransaction(transaction.clone()))
        .await;

    let Some(outbound) = intercept_gate(shared, &mut transaction).await else {
        tracing::info!(url = %transaction.request.url, "Intercept: dropping request");
        transaction.fail("dropped by operator");
        record(shared, &transaction).await;
        wire::write_simple_response(stream, 444, "Request blocked by operator").await?;
        return Ok(false);
    };

    match shared.sender.execute(&outbound, &SendOptions::default()).await {
        Ok((response, duration_ms)) => {
            transaction.complete(response, duration_ms);
            record(shared, &transaction).await;
            if let Some(response) = &transaction.response {
                wire::write_response(stream, response, close).await?;
            }
            Ok(true)
        }
        Err(e) => {
            tracing::warn!(url = %outbound.url, "Forwarding failed: {}", e);
            transaction.fail(&e);
            record(shared, &transaction).await;
            wire::write_simple_response(stream, 502, &e.to_string()).await?;
            Ok(false)
        }
    }
}

async fn record(shared: &Shared, transaction: &HttpTransaction) {
    shared.history.update(transaction);
    shared
        .events
        .emit(AppEvent::TransactionUpdate(transaction.clone()))
        .await;
}

/// Discards a queue entry if its waiting connection goes away first
struct PendingIntercept<'a> {
    queue: &'a InterceptQueue,
    id: u64,
}

impl Drop for PendingIntercept<'_> {
    fn drop(&mut self) {
        self.queue.discard(self.id);
    }
}

/// Pause the transaction for the operator when interception is on.
/// Returns the request to send, or `None` to drop it.
async fn intercept_gate(shared: &Shared, transaction: &mut HttpTransaction) -> Option<HttpRequest> {
    if !shared.intercept_enabled.load(Ordering::SeqCst) {
        return Some(transaction.request.clone());
    }

    let (id, decision) = shared.queue.add(transaction.clone());
    let _pending = PendingIntercept {
        queue: &shared.queue,
        id,
    };
    shared
        .events
        .emit(AppEvent::InterceptQueued {
            id,
            transaction: transaction.clone(),
        })
        .await;
    tracing::info!("Intercept: waiting for operator decision on request {}", id);

    let timeout = Duration::from_secs(shared.config.intercept_timeout_secs);
    match tokio::time::timeout(timeout, decision).await {
        Ok(Ok(InterceptDecision::Forward { edited: Some(request) })) => {
            transaction.request = request;
            transaction.intercepted = true;
            Some(transaction.request.clone())
        }
        Ok(Ok(InterceptDecision::Forward { edited: None })) => Some(transaction.request.clone()),
        Ok(Ok(InterceptDecision::Drop)) => None,
        Ok(Err(_)) => {
            tracing::debug!(id, "Intercept queue cleared, forwarding original request");
            Some(transaction.request.clone())
        }
        Err(_) => {
            tracing::warn!(id, "Intercept: timeout waiting for decision, forwarding original request");
            Some(transaction.request.clone())
        }
    }
}

/// Split `host:port`, keeping IPv6 brackets on the host
fn split_authority(target: &str, default_port: u16) -> Option<(String, u16)> {
    match target.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.contains(']') => {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ if !target.is_empty() => Some((target.to_string(), default_port)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Config;
    use crate::http::HttpResponse;
    use crate::proxy::tls::CertificateAuthority;
    use crate::test_support::{spawn_origin, spawn_tls_origin};
    use tokio::sync::mpsc;

    struct Harness {
        proxy: ProxyServer,
        queue: Arc<InterceptQueue>,
        addr: SocketAddr,
        _events: mpsc::Receiver<AppEvent>,
    }

    async fn start_proxy(intercept: bool) -> Harness {
        let mut config = Config::default();
        config.proxy.listen_port = 0;
        config.proxy.intercept_enabled = intercept;
        config.proxy.shutdown_grace_secs = 1;

        let provider = Arc::new(CertificateProvider::new(
            CertificateAuthority::new().unwrap(),
            "/tmp/gleip-test-ca.pem",
            "localhost",
        ));
        let queue = Arc::new(InterceptQueue::new());
        let (events, rx) = EventSink::channel(1024);
        let proxy = ProxyServer::new(
            &config.proxy,
            provider,
            queue.clone(),
            Arc::new(ProxyHistory::new(100)),
            HttpSender::new(&config).unwrap(),
            events,
        )
        .unwrap();
        let addr = proxy.start().await.unwrap();

        Harness {
            proxy,
            queue,
            addr,
            _events: rx,
        }
    }

    fn client_via(addr: SocketAddr) -> reqwest::Client {
        reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", addr)).unwrap())
            .build()
            .unwrap()
    }

    async fn echo_path_origin() -> String {
        spawn_origin(|req| {
            let mut resp = HttpResponse::new(200);
            resp.body = req.target.clone().into_bytes();
            resp
        })
        .await
    }

    async fn wait_for_entry(queue: &InterceptQueue) -> u64 {
        for _ in 0..500 {
            if let Some(entry) = queue.get_all().first() {
                return entry.id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nothing was intercepted");
    }

    #[tokio::test]
    async fn test_plain_request_is_forwarded_and_recorded() {
        let h = start_proxy(false).await;
        let origin = echo_path_origin().await;

        let resp = client_via(h.addr)
            .get(format!("{}/hello", origin))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().await.unwrap(), "/hello");

        let history = h.proxy.history().all();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status(), Some(200));
        h.proxy.stop().await;
    }

    #[tokio::test]
    async fn test_intercept_release_with_edit() {
        let h = start_proxy(true).await;
        let origin = echo_path_origin().await;
        let client = client_via(h.addr);

        let url = format!("{}/original", origin);
        let request = tokio::spawn(async move { client.get(url).send().await.unwrap().text().await.unwrap() });

        let id = wait_for_entry(&h.queue).await;
        let mut edited = h.queue.get(id).unwrap().transaction.request;
        edited.url = format!("{}/edited", origin);
        assert!(h.queue.remove(id, InterceptDecision::forward_edited(edited)).is_some());

        assert_eq!(request.await.unwrap(), "/edited");
        assert!(h.queue.is_empty());
        assert!(h.proxy.history().all()[0].intercepted);
        h.proxy.stop().await;
    }

    #[tokio::test]
    async fn test_intercept_drop_blocks_request() {
        let h = start_proxy(true).await;
        let origin = echo_path_origin().await;
        let client = client_via(h.addr);

        let url = format!("{}/secret", origin);
        let request = tokio::spawn(async move { client.get(url).send().await.unwrap().status().as_u16() });

        let id = wait_for_entry(&h.queue).await;
        assert!(h.queue.remove(id, InterceptDecision::Drop).is_some());
        assert_eq!(request.await.unwrap(), 444);
        h.proxy.stop().await;
    }

    #[tokio::test]
    async fn test_toggle_intercept_at_runtime() {
        let h = start_proxy(true).await;
        assert!(h.proxy.intercept_enabled());
        h.proxy.set_intercept_enabled(false);

        let origin = echo_path_origin().await;
        let resp = client_via(h.addr).get(format!("{}/through", origin)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(h.queue.is_empty());
        h.proxy.stop().await;
    }

    #[tokio::test]
    async fn test_connect_is_intercepted_with_forged_certificate() {
        let h = start_proxy(false).await;
        let port = spawn_tls_origin(|req| {
            let mut resp = HttpResponse::new(200);
            resp.body = format!("tls:{}", req.target).into_bytes();
            resp
        })
        .await;

        let provider = h.proxy.certificate_provider();
        let ca = reqwest::Certificate::from_pem(provider.ca().cert_pem().as_bytes()).unwrap();
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", h.addr)).unwrap())
            .add_root_certificate(ca)
            .build()
            .unwrap();

        let resp = client
            .get(format!("https://localhost:{}/secure", port))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), "tls:/secure");
        assert_eq!(provider.issued_count(), 1);

        let history = h.proxy.history().all();
        assert_eq!(history[0].request.url, format!("https://localhost:{}/secure", port));
        h.proxy.stop().await;
    }

    #[tokio::test]
    async fn test_connect_to_ip_literal_serves_ip_certificate() {
        let h = start_proxy(false).await;
        let port = spawn_tls_origin(|req| {
            let mut resp = HttpResponse::new(200);
            resp.body = format!("ip:{}", req.target).into_bytes();
            resp
        })
        .await;

        let provider = h.proxy.certificate_provider();
        let ca = reqwest::Certificate::from_pem(provider.ca().cert_pem().as_bytes()).unwrap();
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(format!("http://{}", h.addr)).unwrap())
            .add_root_certificate(ca)
            .build()
            .unwrap();

        // No SNI is sent for an IP host, so the leaf must come from the CONNECT target
        let resp = client
            .get(format!("https://127.0.0.1:{}/raw", port))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.text().await.unwrap(), "ip:/raw");
        assert_eq!(provider.issued_count(), 1);
        assert_eq!(provider.generate_certificate("127.0.0.1").await.unwrap().hostname, "127.0.0.1");
        assert_eq!(provider.issued_count(), 1);
        h.proxy.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let h = start_proxy(false).await;
        assert_eq!(h.proxy.start().await.unwrap(), h.addr);

        h.proxy.stop().await;
        h.proxy.stop().await;
        assert!(!h.proxy.is_running());
        assert!(TcpStream::connect(h.addr).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_gets_bad_request() {
        use tokio::io::AsyncReadExt;

        let h = start_proxy(false).await;
        let mut conn = TcpStream::connect(h.addr).await.unwrap();
        conn.write_all(b"garbage\r\n\r\n").await.unwrap();

        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 400"));
        h.proxy.stop().await;
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(split_authority("example.com:8443", 443), Some(("example.com".into(), 8443)));
        assert_eq!(split_authority("example.com", 443), Some(("example.com".into(), 443)));
        assert_eq!(split_authority("[::1]:443", 80), Some(("[::1]".into(), 443)));
        assert_eq!(split_authority("host:abc", 443), None);
    }
}
