use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use chrono::Utc;
use openssl::ssl::{Ssl, SslConnector};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::debug;
use url::Url;
use wiretap_net::{Limits, build_connector};

use crate::config::PoolConfig;
use crate::error::ProxyError;
use crate::stream::BufferedStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals. Brackets are
/// removed from the returned host.
pub fn split_authority(authority: &str) -> (String, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|port| port.parse().ok());
            return (host.to_string(), port);
        }
        return (rest.to_string(), None);
    }
    if authority.matches(':').count() > 1 {
        return (authority.to_string(), None);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (authority.to_string(), None),
        },
        None => (authority.to_string(), None),
    }
}

/// What a caller wants a connection to. The pool key is `scheme:host` where
/// host is the authority exactly as the caller supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTarget {
    pub scheme: Scheme,
    pub host: String,
    pub force_new: bool,
}

impl PoolTarget {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            force_new: false,
        }
    }

    pub fn with_force_new(mut self, force_new: bool) -> Self {
        self.force_new = force_new;
        self
    }

    pub fn from_url(url: &Url) -> Result<Self, ProxyError> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(ProxyError::InvalidTarget(format!(
                    "unsupported scheme {other}"
                )));
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ProxyError::InvalidTarget(format!("{url} has no host")))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        Ok(Self::new(scheme, host))
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.scheme.as_str(), self.host)
    }

    pub fn hostname(&self) -> String {
        split_authority(&self.host).0
    }

    pub fn dial_addr(&self) -> String {
        let (host, port) = split_authority(&self.host);
        let port = port.unwrap_or(self.scheme.default_port());
        if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }
}

#[derive(Debug)]
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(SslStream<TcpStream>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// An upstream connection checked out of the pool. Hand it back with
/// [`ConnectionPool::put`] once the exchange is over.
#[derive(Debug)]
pub struct PooledConnection {
    stream: BufferedStream<UpstreamStream>,
    key: String,
    idle_key: String,
    force_new: bool,
    reusable: bool,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    pub fn stream(&mut self) -> &mut BufferedStream<UpstreamStream> {
        &mut self.stream
    }

    /// Unique per connection: pool key, creation time and a sequence number.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn idle_key(&self) -> &str {
        &self.idle_key
    }

    pub fn is_force_new(&self) -> bool {
        self.force_new
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub fn mark_unreusable(&mut self) {
        self.reusable = false;
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub dialed: u64,
    pub idle: usize,
    pub running: usize,
}

#[derive(Default)]
struct PoolInner {
    idle: HashMap<String, VecDeque<PooledConnection>>,
    running: HashMap<String, String>,
}

pub struct ConnectionPool {
    inner: Mutex<PoolInner>,
    connector: SslConnector,
    config: PoolConfig,
    limits: Limits,
    dialed: AtomicU64,
    sequence: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, limits: Limits) -> Result<Self, ProxyError> {
        let connector = build_connector()?;
        Ok(Self {
            inner: Mutex::new(PoolInner::default()),
            connector,
            config,
            limits,
            dialed: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Reuses the oldest live idle connection for the target, or dials a new
    /// one. Dialing happens outside the pool lock.
    pub async fn get_or_create(&self, target: &PoolTarget) -> Result<PooledConnection, ProxyError> {
        if !target.force_new {
            let idle_key = target.key();
            let mut discarded = 0usize;
            let mut inner = self.inner.lock().await;
            loop {
                let next = inner.idle.get_mut(&idle_key).and_then(VecDeque::pop_front);
                let Some(mut conn) = next else {
                    break;
                };
                if conn.last_used.elapsed() >= self.config.idle_timeout() || conn.stream.is_stale() {
                    discarded += 1;
                    continue;
                }
                inner.running.insert(conn.key.clone(), idle_key.clone());
                prune_empty(&mut inner.idle, &idle_key);
                debug!(key = %conn.key, discarded, "reusing idle upstream connection");
                return Ok(conn);
            }
            prune_empty(&mut inner.idle, &idle_key);
            drop(inner);
            if discarded > 0 {
                debug!(key = %idle_key, discarded, "dropped stale idle connections");
            }
        }

        let conn = self.dial(target).await?;
        if !conn.force_new {
            self.inner
                .lock()
                .await
                .running
                .insert(conn.key.clone(), conn.idle_key.clone());
        }
        Ok(conn)
    }

    /// Returns a connection. Force-new and non-reusable connections are
    /// closed; others go to the back of their idle list, evicting the oldest
    /// past the per-key cap.
    pub async fn put(&self, mut conn: PooledConnection) {
        let mut inner = self.inner.lock().await;
        inner.running.remove(&conn.key);
        if conn.force_new || !conn.reusable {
            debug!(key = %conn.key, "closing upstream connection");
            return;
        }
        conn.last_used = Instant::now();
        let max_idle = self.config.max_idle_per_key;
        let idle_key = conn.idle_key.clone();
        let list = inner.idle.entry(idle_key.clone()).or_default();
        list.push_back(conn);
        while list.len() > max_idle {
            if let Some(evicted) = list.pop_front() {
                debug!(key = %evicted.key, "idle cap reached, closing oldest");
            }
        }
        prune_empty(&mut inner.idle, &idle_key);
    }

    /// Closes every idle connection for `idle_key`.
    pub async fn evict(&self, idle_key: &str) -> usize {
        let mut inner = self.inner.lock().await;
        inner
            .idle
            .remove(idle_key)
            .map(|list| list.len())
            .unwrap_or_default()
    }

    pub async fn idle_len(&self, idle_key: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.idle.get(idle_key).map(VecDeque::len).unwrap_or_default()
    }

    pub async fn running_len(&self) -> usize {
        self.inner.lock().await.running.len()
    }

    pub fn dialed(&self) -> u64 {
        self.dialed.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            dialed: self.dialed(),
            idle: inner.idle.values().map(VecDeque::len).sum(),
            running: inner.running.len(),
        }
    }

    async fn dial(&self, target: &PoolTarget) -> Result<PooledConnection, ProxyError> {
        let addr = target.dial_addr();
        let connect_timeout = self.config.connect_timeout();
        let tcp = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::UpstreamDial {
                addr: addr.clone(),
                message: "connect timed out".to_string(),
            })?
            .map_err(|err| ProxyError::UpstreamDial {
                addr: addr.clone(),
                message: err.to_string(),
            })?;
        let _ = tcp.set_nodelay(true);

        let stream = match target.scheme {
            Scheme::Http => UpstreamStream::Plain(tcp),
            Scheme::Https => {
                let ssl = self.upstream_ssl(&target.hostname()).map_err(|err| {
                    ProxyError::UpstreamTls {
                        addr: addr.clone(),
                        message: err.to_string(),
                    }
                })?;
                let mut tls = SslStream::new(ssl, tcp).map_err(|err| ProxyError::UpstreamTls {
                    addr: addr.clone(),
                    message: err.to_string(),
                })?;
                timeout(connect_timeout, Pin::new(&mut tls).connect())
                    .await
                    .map_err(|_| ProxyError::UpstreamTls {
                        addr: addr.clone(),
                        message: "handshake timed out".to_string(),
                    })?
                    .map_err(|err| ProxyError::UpstreamTls {
                        addr: addr.clone(),
                        message: err.to_string(),
                    })?;
                UpstreamStream::Tls(tls)
            }
        };

        self.dialed.fetch_add(1, Ordering::Relaxed);
        let idle_key = target.key();
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let now = Instant::now();
        debug!(%addr, key = %idle_key, force_new = target.force_new, "dialed upstream");
        Ok(PooledConnection {
            stream: BufferedStream::with_limits(stream, self.limits),
            key: format!("{idle_key}:{nanos}:{sequence}"),
            idle_key,
            force_new: target.force_new,
            reusable: true,
            created_at: now,
            last_used: now,
        })
    }

    fn upstream_ssl(&self, hostname: &str) -> Result<Ssl, openssl::error::ErrorStack> {
        let sni = hostname.parse::<IpAddr>().is_err();
        self.connector
            .configure()?
            .verify_hostname(false)
            .use_server_name_indication(sni)
            .into_ssl(hostname)
    }
}

fn prune_empty(idle: &mut HashMap<String, VecDeque<PooledConnection>>, idle_key: &str) {
    if idle.get(idle_key).is_some_and(VecDeque::is_empty) {
        idle.remove(idle_key);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("dialed", &self.dialed())
            .finish_non_exhaustive()
    }
}
