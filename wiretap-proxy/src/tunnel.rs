use std::net::SocketAddr;
use std::pin::Pin;

use openssl::ssl::Ssl;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy_bidirectional};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_openssl::SslStream;
use tracing::{debug, warn};
use wiretap_net::{TlsConfig, build_acceptor};

use crate::error::ProxyError;
use crate::exchange::{ExchangeContext, forward_exchange};
use crate::pool::{PoolTarget, PooledConnection, Scheme, split_authority};
use crate::proxy::ProxyState;
use crate::stream::BufferedStream;

/// Literal status line sent once a CONNECT tunnel is taken over.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established!\r\n\r\n";

/// How a CONNECT tunnel is served after the established line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Copy bytes both ways without looking at them.
    RawRelay,
    /// Terminate TLS with a signed leaf and forward each request through the pool.
    Intercept,
}

impl TunnelMode {
    pub fn from_intercept(intercept: bool) -> Self {
        if intercept {
            TunnelMode::Intercept
        } else {
            TunnelMode::RawRelay
        }
    }
}

pub(crate) async fn serve_tunnel<S>(
    state: &ProxyState,
    mut client: BufferedStream<S>,
    authority: String,
    peer: SocketAddr,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if split_authority(&authority).0.is_empty() {
        client
            .write_response(400, "Bad Request", "text/plain", b"bad CONNECT target", true)
            .await?;
        return Err(ProxyError::InvalidTarget(authority));
    }

    match state.mode {
        TunnelMode::RawRelay => {
            let upstream = match dial_raw(state, &authority).await {
                Ok(upstream) => upstream,
                Err(err) => {
                    client
                        .write_response(502, "Bad Gateway", "text/plain", b"bad gateway", true)
                        .await?;
                    return Err(err);
                }
            };
            establish(&mut client).await?;
            raw_relay(client, upstream, &authority).await
        }
        TunnelMode::Intercept => {
            establish(&mut client).await?;
            intercept(state, client, authority, peer).await
        }
    }
}

async fn establish<S>(client: &mut BufferedStream<S>) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client.write_all(CONNECT_ESTABLISHED).await?;
    client.flush().await?;
    Ok(())
}

async fn dial_raw(state: &ProxyState, authority: &str) -> Result<TcpStream, ProxyError> {
    let addr = PoolTarget::new(Scheme::Https, authority).dial_addr();
    timeout(state.config.pool.connect_timeout(), TcpStream::connect(&addr))
        .await
        .map_err(|_| ProxyError::UpstreamDial {
            addr: addr.clone(),
            message: "connect timed out".to_string(),
        })?
        .map_err(|err| ProxyError::UpstreamDial {
            addr: addr.clone(),
            message: err.to_string(),
        })
}

async fn raw_relay<S>(
    mut client: BufferedStream<S>,
    mut upstream: TcpStream,
    authority: &str,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (up, down) = copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(%authority, up, down, "raw tunnel closed");
    Ok(())
}

async fn intercept<S>(
    state: &ProxyState,
    client: BufferedStream<S>,
    authority: String,
    peer: SocketAddr,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (hostname, port) = split_authority(&authority);
    let leaf = state.signer.sign(&[hostname.as_str()])?;
    let acceptor = build_acceptor(
        &TlsConfig {
            allow_legacy: state.config.tls.allow_legacy,
        },
        &leaf,
    )?;
    let ssl = Ssl::new(acceptor.context())
        .map_err(|err| ProxyError::ClientHandshake(err.to_string()))?;
    let mut tls = SslStream::new(ssl, client)
        .map_err(|err| ProxyError::ClientHandshake(err.to_string()))?;
    Pin::new(&mut tls)
        .accept()
        .await
        .map_err(|err| ProxyError::ClientHandshake(err.to_string()))?;
    debug!(%authority, serial = %leaf.serial_hex().unwrap_or_default(), "client handshake complete");

    let mut client = BufferedStream::with_limits(tls, state.config.limits.parser_limits());
    let origin = match port {
        None | Some(443) => format!("https://{}", bracketed(&hostname)),
        Some(port) => format!("https://{}:{port}", bracketed(&hostname)),
    };
    let ctx = ExchangeContext {
        recorder: &state.recorder,
        origin,
        authority: authority.clone(),
        remote_addr: peer.to_string(),
        is_https: true,
    };
    let target = PoolTarget::new(Scheme::Https, authority);

    let mut upstream: Option<PooledConnection> = None;
    let result = forward_loop(state, &ctx, &target, &mut client, &mut upstream).await;

    if let Some(conn) = upstream.take() {
        state.pool.put(conn).await;
    }
    if let Err(err) = client.shutdown().await {
        debug!(error = %err, "client shutdown failed");
    }
    result
}

async fn forward_loop<C>(
    state: &ProxyState,
    ctx: &ExchangeContext<'_>,
    target: &PoolTarget,
    client: &mut BufferedStream<C>,
    upstream: &mut Option<PooledConnection>,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let Some(request) = client.read_request_head().await? else {
            return Ok(());
        };
        if request.is_connect() {
            warn!(request_target = %request.line.target, "CONNECT inside an intercepted tunnel");
            return Err(ProxyError::HijackUnsupported);
        }

        let conn = match upstream.take() {
            Some(conn) => conn,
            None => state.pool.get_or_create(target).await?,
        };
        let conn = upstream.insert(conn);
        let outcome = match forward_exchange(ctx, client, conn.stream(), request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                conn.mark_unreusable();
                state.stats.exchange_finished(false);
                return Err(err);
            }
        };
        state.stats.exchange_finished(true);

        if !outcome.upstream_reusable {
            if let Some(mut conn) = upstream.take() {
                conn.mark_unreusable();
                state.pool.put(conn).await;
            }
        }
        if !outcome.client_keep_alive {
            debug!(origin = %ctx.origin, "tunnel closing after final exchange");
            return Ok(());
        }
    }
}

fn bracketed(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}
