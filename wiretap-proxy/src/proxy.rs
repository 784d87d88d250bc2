use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{Instrument, debug, info, info_span, warn};
use wiretap_net::{RootCa, Signer};
use wiretap_storage::Recorder;

use crate::admin::serve_admin;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::forward::forward_plain;
use crate::pool::ConnectionPool;
use crate::stats::{ProxyStats, log_periodically};
use crate::stream::BufferedStream;
use crate::tunnel::{TunnelMode, serve_tunnel};

/// The proxy server. Cloning shares the same signer, pool, history and
/// counters.
#[derive(Debug, Clone)]
pub struct Proxy {
    state: Arc<ProxyState>,
}

#[derive(Debug)]
pub(crate) struct ProxyState {
    pub(crate) config: ProxyConfig,
    pub(crate) signer: Arc<Signer>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) recorder: Recorder,
    pub(crate) stats: Arc<ProxyStats>,
    pub(crate) mode: TunnelMode,
}

impl Proxy {
    /// Builds every component from `config`. The embedded root CA signs leaves
    /// unless a CA pair is configured.
    pub fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        config.validate()?;
        let root = match (&config.tls.ca_cert_path, &config.tls.ca_key_path) {
            (Some(cert), Some(key)) => RootCa::from_files(cert, key)?,
            _ => RootCa::embedded()?,
        };
        let pool = ConnectionPool::new(config.pool.clone(), config.limits.parser_limits())?;
        let recorder = Recorder::in_memory(config.history);
        Ok(Self::with_components(
            config,
            Arc::new(Signer::new(root)),
            Arc::new(pool),
            recorder,
        ))
    }

    pub fn with_components(
        config: ProxyConfig,
        signer: Arc<Signer>,
        pool: Arc<ConnectionPool>,
        recorder: Recorder,
    ) -> Self {
        let mode = TunnelMode::from_intercept(config.tls.intercept);
        Self {
            state: Arc::new(ProxyState {
                config,
                signer,
                pool,
                recorder,
                stats: Arc::new(ProxyStats::new()),
                mode,
            }),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.state.config
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.state.signer
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.state.pool
    }

    pub fn recorder(&self) -> &Recorder {
        &self.state.recorder
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.state.stats
    }

    pub fn mode(&self) -> TunnelMode {
        self.state.mode
    }

    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let addr = self.state.config.listen.addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|err| ProxyError::Runtime(format!("bind {addr}: {err}")))
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// running are left to finish on their own.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        info!(addr = %local, mode = ?self.state.mode, "proxy listening");

        let interval = self.state.config.statistics.log_interval_secs;
        let ticker = (interval > 0).then(|| {
            tokio::spawn(log_periodically(
                Arc::clone(&self.state.stats),
                Arc::clone(&self.state.pool),
                Duration::from_secs(interval),
            ))
        });

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(handle_connection(state, stream, peer));
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }

        if let Some(ticker) = ticker {
            ticker.abort();
        }
        info!(addr = %local, "proxy stopped");
        Ok(())
    }

    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), ProxyError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    pub async fn run(&self) -> Result<(), ProxyError> {
        self.run_until(std::future::pending()).await
    }
}

async fn handle_connection(state: Arc<ProxyState>, stream: TcpStream, peer: SocketAddr) {
    let _guard = state.stats.connection_opened();
    let span = info_span!("conn", %peer);
    async move {
        match dispatch(&state, stream, peer).await {
            Ok(()) => debug!("connection closed"),
            Err(ProxyError::Protocol(err)) => debug!(error = %err, "dropping malformed request"),
            Err(err) => warn!(error = %err, "connection ended with error"),
        }
    }
    .instrument(span)
    .await;
}

/// Reads requests off a client connection and routes each one: CONNECT
/// takes the connection over, absolute-form targets are forwarded, and
/// anything else is for the admin endpoints. Malformed requests close the
/// connection without a response.
async fn dispatch(state: &ProxyState, stream: TcpStream, peer: SocketAddr) -> Result<(), ProxyError> {
    let _ = stream.set_nodelay(true);
    let mut client = BufferedStream::with_limits(stream, state.config.limits.parser_limits());
    loop {
        let Some(request) = client.read_request_head().await? else {
            return Ok(());
        };

        if request.is_connect() {
            let authority = request.line.target.clone();
            debug!(%authority, "CONNECT");
            return serve_tunnel(state, client, authority, peer).await;
        }

        let keep_alive = if request.line.target.contains("://") {
            forward_plain(state, &mut client, request, peer).await?
        } else {
            serve_admin(state, &mut client, &request).await?
        };
        if !keep_alive {
            return Ok(());
        }
    }
}
