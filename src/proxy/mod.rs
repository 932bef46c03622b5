//! Proxy Server (spec component C4): accepts TCP, classifies TLS vs
//! plain HTTP, terminates TLS through the shared certificate authority,
//! parses HTTP/1.1 requests incrementally, consults the rule engine,
//! forwards or blocks, and records every decision with the auditor.
//!
//! Grounded in the teacher's `handle_connection` (byte-peek SNI
//! detection, upstream `TlsConnector` dial) and `prison-network`'s
//! explicit CONNECT parser, unified into the single state machine this
//! module's connection handler implements.

mod http;
mod peek;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::audit::{AuditRecord, Auditor};
use crate::error::{BoundaryError, Result};
use crate::rules::RuleSet;
use http::{BodyFraming, RequestHead};
use peek::PeekableStream;

/// Soft ceiling on how long `stop()` waits for in-flight handlers to
/// drain, per spec section 5's recommended 5s shutdown deadline.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
/// Soft upstream connect timeout, per spec section 5's recommended 10s.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-connection idle read timeout, per spec section 5's recommended 120s.
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ProxyServer {
    listen_addr: SocketAddr,
    rules: Arc<RuleSet>,
    auditor: Arc<Auditor>,
    server_tls: Arc<rustls::ServerConfig>,
    client_tls: Arc<ClientConfig>,
    started: AtomicBool,
    shutdown: Notify,
    inflight: AtomicUsize,
    drained: Notify,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    pub fn new(
        listen_addr: SocketAddr,
        rules: Arc<RuleSet>,
        auditor: Arc<Auditor>,
        server_tls: Arc<rustls::ServerConfig>,
    ) -> Self {
        let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let client_tls = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        );
        Self {
            listen_addr,
            rules,
            auditor,
            server_tls,
            client_tls,
            started: AtomicBool::new(false),
            shutdown: Notify::new(),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            accept_task: std::sync::Mutex::new(None),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Binds the listener and spawns the accept loop, returning once the
    /// socket is listening. Calling `start` twice is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|source| BoundaryError::UpstreamConnectError {
                host: self.listen_addr.ip().to_string(),
                port: self.listen_addr.port(),
                source,
            })?;
        let server = self.clone();
        let handle = tokio::spawn(async move { server.accept_loop(listener).await });
        *self.accept_task.lock().expect("accept task mutex poisoned") = Some(handle);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("proxy accept loop shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.inflight.fetch_add(1, Ordering::SeqCst);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(err) = server.handle_connection(stream, peer).await {
                                    debug!(%peer, error = %err, "connection handler ended with error");
                                }
                                server.inflight.fetch_sub(1, Ordering::SeqCst);
                                server.drained.notify_waiters();
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Idempotent: closes the listener and waits (bounded) for in-flight
    /// handlers to drain. A second call returns immediately.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        if let Some(handle) = self.accept_task.lock().expect("accept task mutex poisoned").take() {
            handle.abort();
        }
        let start = Instant::now();
        while self.inflight.load(Ordering::SeqCst) > 0 && start.elapsed() < SHUTDOWN_DEADLINE {
            let wait = tokio::time::sleep(Duration::from_millis(25));
            tokio::select! {
                _ = self.drained.notified() => {}
                _ = wait => {}
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let _ = stream.set_nodelay(true);
        let mut peekable = PeekableStream::new(stream);
        let first_byte = peekable
            .peek_first_byte()
            .await
            .map_err(|source| BoundaryError::UpstreamReadError {
                host: peer.to_string(),
                source,
            })?;
        let Some(first_byte) = first_byte else {
            return Ok(());
        };

        if first_byte == 0x16 {
            let acceptor = tokio_rustls::TlsAcceptor::from(self.server_tls.clone());
            let tls_stream = acceptor
                .accept(peekable)
                .await
                .map_err(|err| BoundaryError::TlsHandshakeError(err.to_string()))?;
            let sni = tls_stream
                .get_ref()
                .1
                .server_name()
                .map(|s| s.to_string());
            self.serve_requests(tls_stream, sni, "https").await
        } else {
            self.handle_plain(peekable, peer).await
        }
    }

    async fn handle_plain(self: Arc<Self>, mut stream: PeekableStream<TcpStream>, peer: SocketAddr) -> Result<()> {
        let mut carry = Vec::new();
        let Some(head) = http::read_request_head(&mut stream, &mut carry).await? else {
            return Ok(());
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            let (host, _port) = split_authority(&head.target)?;
            stream
                .write_all(http::CONNECT_ESTABLISHED)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: peer.to_string(),
                    source,
                })?;
            stream.unread(carry);
            let acceptor = tokio_rustls::TlsAcceptor::from(self.server_tls.clone());
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|err| BoundaryError::TlsHandshakeError(err.to_string()))?;
            let sni = tls_stream
                .get_ref()
                .1
                .server_name()
                .map(|s| s.to_string())
                .or(Some(host));
            return self.serve_requests(tls_stream, sni, "https").await;
        }

        self.serve_plain_requests(stream, head, carry).await
    }

    /// Keep-alive loop over a decrypted MITM stream (either a natively
    /// redirected TLS connection or the inner half of a CONNECT tunnel).
    /// Per spec 4.4, every sequential request on this stream is
    /// independently rule-checked and audited until the client closes or
    /// an error occurs.
    async fn serve_requests<S>(&self, mut stream: S, sni: Option<String>, scheme: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut carry = Vec::new();
        loop {
            let head = match tokio::time::timeout(
                CLIENT_IDLE_TIMEOUT,
                http::read_request_head(&mut stream, &mut carry),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Ok(()),
            };
            let Some(head) = head else {
                return Ok(());
            };
            let host = sni.clone().or_else(|| host_from_request(&head)).unwrap_or_default();
            let should_continue = self
                .serve_one_request(&mut stream, &head, &host, scheme, &mut carry)
                .await?;
            if !should_continue {
                return Ok(());
            }
        }
    }

    /// Keep-alive loop for plain (non-TLS, non-CONNECT) HTTP proxying:
    /// the first request head is already parsed by the caller, every
    /// subsequent one is read the same way as the TLS path.
    async fn serve_plain_requests(
        &self,
        mut stream: PeekableStream<TcpStream>,
        mut head: RequestHead,
        mut carry: Vec<u8>,
    ) -> Result<()> {
        loop {
            let host = host_from_request(&head).unwrap_or_default();
            let should_continue = self
                .serve_one_request(&mut stream, &head, &host, "http", &mut carry)
                .await?;
            if !should_continue {
                return Ok(());
            }
            let next = match tokio::time::timeout(
                CLIENT_IDLE_TIMEOUT,
                http::read_request_head(&mut stream, &mut carry),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Ok(()),
            };
            let Some(next) = next else {
                return Ok(());
            };
            head = next;
        }
    }

    /// Evaluate, audit, and either block or forward one request. Returns
    /// whether the caller should keep looping for another request on the
    /// same connection.
    async fn serve_one_request<S>(
        &self,
        client: &mut S,
        head: &RequestHead,
        host: &str,
        scheme: &str,
        carry: &mut Vec<u8>,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let path = request_path(&head.target);
        let full_url = format!("{scheme}://{host}{path}");
        let decision = self.rules.evaluate(&head.method, &full_url);

        self.auditor.record(AuditRecord {
            method: head.method.clone(),
            url: full_url.clone(),
            host: host.to_string(),
            allowed: decision.allowed,
            rule: decision.rule.clone(),
        });

        if !decision.allowed {
            let keep_alive = http::request_keep_alive(head);
            http::drain_request_body(client, head, carry)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: host.to_string(),
                    source,
                })?;
            let body = http::blocked_response(&head.method, &path, host, keep_alive);
            client
                .write_all(&body)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: host.to_string(),
                    source,
                })?;
            let _ = client.flush().await;
            return Ok(keep_alive);
        }

        match self.forward(client, head, host, scheme, carry).await {
            Ok(keep_alive) => Ok(keep_alive),
            Err(err) => {
                let body = match &err {
                    BoundaryError::UpstreamConnectError { .. } | BoundaryError::UpstreamReadError { .. } => {
                        http::bad_gateway_response(&err.to_string())
                    }
                    _ => http::internal_error_response(&err.to_string()),
                };
                let _ = client.write_all(&body).await;
                warn!(host, method = %head.method, error = %err, "request forwarding failed");
                Ok(false)
            }
        }
    }

    async fn forward<S>(
        &self,
        client: &mut S,
        head: &RequestHead,
        host: &str,
        scheme: &str,
        carry: &mut Vec<u8>,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let port = if scheme == "https" { 443 } else { 80 };
        let upstream_addr = format!("{host}:{port}");
        let tcp = tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, TcpStream::connect(&upstream_addr))
            .await
            .map_err(|_| BoundaryError::UpstreamConnectError {
                host: host.to_string(),
                port,
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| BoundaryError::UpstreamConnectError {
                host: host.to_string(),
                port,
                source,
            })?;

        if scheme == "https" {
            let connector = tokio_rustls::TlsConnector::from(self.client_tls.clone());
            let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
                BoundaryError::UpstreamConnectError {
                    host: host.to_string(),
                    port,
                    source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid SNI"),
                }
            })?;
            let mut upstream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|source| BoundaryError::UpstreamConnectError {
                    host: host.to_string(),
                    port,
                    source,
                })?;
            relay(client, &mut upstream, head, host, carry).await
        } else {
            let mut upstream = tcp;
            relay(client, &mut upstream, head, host, carry).await
        }
    }
}

/// Write the request line and forwarding-safe headers to `upstream`,
/// stream the body across, then stream the response back, returning
/// whether the client connection should stay open for another request.
async fn relay<C, U>(
    client: &mut C,
    upstream: &mut U,
    head: &RequestHead,
    host: &str,
    carry: &mut Vec<u8>,
) -> Result<bool>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let request_line = format!("{} {} HTTP/1.1\r\n", head.method, request_path(&head.target));
    let mut out = request_line.into_bytes();
    let mut saw_host = false;
    for (name, value) in &head.headers {
        if http::is_hop_by_hop(name) {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            saw_host = true;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !saw_host {
        out.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");

    upstream
        .write_all(&out)
        .await
        .map_err(|source| BoundaryError::UpstreamConnectError {
            host: host.to_string(),
            port: 0,
            source,
        })?;

    match http::request_framing(head) {
        BodyFraming::ContentLength(len) if len > 0 => {
            http::copy_bounded(client, upstream, len, carry)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: host.to_string(),
                    source,
                })?;
        }
        BodyFraming::Chunked => {
            http::copy_chunked(client, upstream, carry)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: host.to_string(),
                    source,
                })?;
        }
        _ => {
            if !carry.is_empty() {
                upstream
                    .write_all(carry)
                    .await
                    .map_err(|source| BoundaryError::UpstreamReadError {
                        host: host.to_string(),
                        source,
                    })?;
                carry.clear();
            }
        }
    }
    upstream
        .flush()
        .await
        .map_err(|source| BoundaryError::UpstreamReadError {
            host: host.to_string(),
            source,
        })?;

    let mut response_carry = Vec::new();
    let response_head = http::read_response_head(upstream, &mut response_carry)
        .await
        .map_err(|err| BoundaryError::UpstreamReadError {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()),
        })?;
    let Some(response_head) = response_head else {
        return Err(BoundaryError::UpstreamReadError {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "upstream closed before responding"),
        });
    };

    // The client side of this connection only stays open for another
    // request if both the client asked for it and the upstream response
    // didn't demand a close; the upstream leg itself is always closed
    // (we dial a fresh one per request, see `ProxyServer::forward`).
    let keep_alive = http::request_keep_alive(head)
        && !response_head
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("close"))
            .unwrap_or(false);

    let mut status_line = format!(
        "{} {} {}\r\n",
        response_head.version, response_head.status, response_head.reason
    );
    for (name, value) in &response_head.headers {
        if http::is_hop_by_hop(name) {
            continue;
        }
        status_line.push_str(&format!("{name}: {value}\r\n"));
    }
    status_line.push_str(&format!("Connection: {}\r\n", if keep_alive { "keep-alive" } else { "close" }));
    status_line.push_str("\r\n");
    client
        .write_all(status_line.as_bytes())
        .await
        .map_err(|source| BoundaryError::UpstreamReadError {
            host: host.to_string(),
            source,
        })?;

    match http::response_framing(&response_head) {
        BodyFraming::ContentLength(len) if len > 0 => {
            http::copy_bounded(upstream, client, len, &mut response_carry)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: host.to_string(),
                    source,
                })?;
        }
        BodyFraming::Chunked => {
            http::copy_chunked(upstream, client, &mut response_carry)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: host.to_string(),
                    source,
                })?;
        }
        _ => {
            http::copy_until_eof(upstream, client, &mut response_carry)
                .await
                .map_err(|source| BoundaryError::UpstreamReadError {
                    host: host.to_string(),
                    source,
                })?;
        }
    }
    let _ = client.flush().await;

    Ok(keep_alive)
}

fn request_path(target: &str) -> String {
    if let Ok(url) = url::Url::parse(target) {
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        return path;
    }
    target.to_string()
}

fn host_from_request(head: &RequestHead) -> Option<String> {
    if let Ok(url) = url::Url::parse(&head.target) {
        if let Some(host) = url.host_str() {
            return Some(host.to_string());
        }
    }
    head.header("host")
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
}

fn split_authority(target: &str) -> Result<(String, u16)> {
    let mut parts = target.rsplitn(2, ':');
    let port_str = parts.next().unwrap_or_default();
    let host = parts.next().unwrap_or(target).to_string();
    let port: u16 = port_str
        .parse()
        .map_err(|_| BoundaryError::RuleEvalError(format!("malformed CONNECT target {target:?}")))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_connect_authority() {
        let (host, port) = split_authority("example.com:443").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn request_path_handles_absolute_and_origin_form() {
        assert_eq!(request_path("/a/b?x=1"), "/a/b?x=1");
        assert_eq!(request_path("https://example.com/a/b?x=1"), "/a/b?x=1");
    }
}
