use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, sink};
use tracing::debug;
use wiretap_net::{BodyDecoder, BodyFraming, RequestHead};
use wiretap_storage::BodyCapture;

use crate::error::ProxyError;
use crate::proxy::ProxyState;
use crate::stats::StatisticsReport;
use crate::stream::BufferedStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminRoute {
    History,
    ClearHistory,
    Statistics,
    NotFound,
}

impl AdminRoute {
    pub fn resolve(method: &str, target: &str) -> Self {
        let path = target.split(['?', '#']).next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        match (method.to_ascii_uppercase().as_str(), path) {
            ("GET", "/history") => AdminRoute::History,
            ("GET" | "POST" | "DELETE", "/history/clear") => AdminRoute::ClearHistory,
            ("DELETE", "/history") => AdminRoute::ClearHistory,
            ("GET", "/statistics") => AdminRoute::Statistics,
            _ => AdminRoute::NotFound,
        }
    }
}

#[derive(Debug, Serialize)]
struct Cleared {
    cleared: usize,
}

/// Serves requests addressed to the proxy itself. Returns whether the
/// client connection stays open.
pub(crate) async fn serve_admin<S>(
    state: &ProxyState,
    client: &mut BufferedStream<S>,
    request: &RequestHead,
) -> Result<bool, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = BodyDecoder::new(BodyFraming::for_request(request)?);
    client
        .relay_body(&mut decoder, &mut sink(), &mut BodyCapture::new(0))
        .await?;

    let keep_alive = request.keep_alive();
    let route = AdminRoute::resolve(&request.line.method, &request.line.target);
    debug!(?route, path = %request.line.target, "admin request");

    let body = match route {
        AdminRoute::History => to_json(&state.recorder.snapshot()?)?,
        AdminRoute::ClearHistory => {
            let cleared = state.recorder.clear()?;
            to_json(&Cleared { cleared })?
        }
        AdminRoute::Statistics => {
            let report = StatisticsReport {
                proxy: state.stats.snapshot(),
                history_records: state.recorder.len()?,
                pool: state.pool.stats().await,
            };
            to_json(&report)?
        }
        AdminRoute::NotFound => {
            client
                .write_response(404, "Not Found", "text/plain", b"not found", !keep_alive)
                .await?;
            return Ok(keep_alive);
        }
    };
    client
        .write_response(200, "OK", "application/json", &body, !keep_alive)
        .await?;
    Ok(keep_alive)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, ProxyError> {
    serde_json::to_vec(value).map_err(|err| ProxyError::Runtime(err.to_string()))
}
