use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};
use url::Url;
use wiretap_net::RequestHead;

use crate::error::ProxyError;
use crate::exchange::{ExchangeContext, forward_exchange};
use crate::pool::PoolTarget;
use crate::proxy::ProxyState;
use crate::stream::BufferedStream;

/// Rewrites an absolute-form request for the origin: origin-form target,
/// `Host` filled in, hop-by-hop proxy headers dropped.
pub fn to_origin_form(request: &mut RequestHead) -> Result<(Url, String), ProxyError> {
    let url = Url::parse(&request.line.target)
        .map_err(|err| ProxyError::InvalidTarget(format!("{}: {err}", request.line.target)))?;
    let target = PoolTarget::from_url(&url)?;

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    request.line.target = path;
    if request.header("host").is_none() {
        request.set_header("Host", target.host.clone());
    }
    request.remove_header("proxy-connection");
    request.remove_header("proxy-authorization");
    Ok((url, target.host))
}

/// Forwards one plain proxy request. Returns whether the client connection
/// stays open.
pub(crate) async fn forward_plain<S>(
    state: &ProxyState,
    client: &mut BufferedStream<S>,
    mut request: RequestHead,
    peer: SocketAddr,
) -> Result<bool, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (url, authority) = match to_origin_form(&mut request) {
        Ok(parts) => parts,
        Err(err) => {
            warn!(error = %err, "rejecting proxy request");
            client
                .write_response(400, "Bad Request", "text/plain", b"bad request target", true)
                .await?;
            return Ok(false);
        }
    };
    let target = PoolTarget::from_url(&url)?;

    let mut conn = match state.pool.get_or_create(&target).await {
        Ok(conn) => conn,
        Err(err) => {
            warn!(url = %url, error = %err, "upstream unavailable");
            client
                .write_response(502, "Bad Gateway", "text/plain", b"bad gateway", true)
                .await?;
            return Ok(false);
        }
    };

    let ctx = ExchangeContext {
        recorder: &state.recorder,
        origin: format!("{}://{}", url.scheme(), authority),
        authority,
        remote_addr: peer.to_string(),
        is_https: false,
    };
    let result = forward_exchange(&ctx, client, conn.stream(), request).await;
    let keep_alive = match &result {
        Ok(outcome) => {
            if !outcome.upstream_reusable {
                conn.mark_unreusable();
            }
            outcome.client_keep_alive
        }
        Err(_) => {
            conn.mark_unreusable();
            false
        }
    };
    state.stats.exchange_finished(result.is_ok());
    state.pool.put(conn).await;
    debug!(%url, keep_alive, "plain exchange done");
    result.map(|_| keep_alive)
}
