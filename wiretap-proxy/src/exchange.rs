use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, copy_bidirectional};
use tracing::{debug, warn};
use wiretap_net::{BodyDecoder, BodyFraming, Header, RequestHead, ResponseHead};
use wiretap_storage::{
    BodyCapture, HistoryRecord, RecordedHeader, Recorder, RequestSnapshot, ResponseSnapshot,
};

use crate::error::ProxyError;
use crate::stream::BufferedStream;

/// Where an exchange came from, for the history record.
#[derive(Debug, Clone)]
pub struct ExchangeContext<'a> {
    pub recorder: &'a Recorder,
    /// `scheme://authority` prefixed to origin-form targets.
    pub origin: String,
    pub authority: String,
    pub remote_addr: String,
    pub is_https: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub client_keep_alive: bool,
    pub upstream_reusable: bool,
    pub upgraded: bool,
    pub responded: bool,
}

impl ExchangeOutcome {
    fn closed() -> Self {
        Self {
            client_keep_alive: false,
            upstream_reusable: false,
            upgraded: false,
            responded: false,
        }
    }
}

/// Sends `request` upstream, relays the response back to the client and
/// appends one history record whether or not the exchange succeeds.
/// `Accept-Encoding` is dropped so recorded response bodies stay readable.
pub async fn forward_exchange<C, U>(
    ctx: &ExchangeContext<'_>,
    client: &mut BufferedStream<C>,
    upstream: &mut BufferedStream<U>,
    mut request: RequestHead,
) -> Result<ExchangeOutcome, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    request.remove_header("accept-encoding");

    let mut record = HistoryRecord {
        request: request_snapshot(ctx, &request),
        response: None,
        time_start: Utc::now(),
        time_req_finish: None,
        time_resp_finish: None,
        is_https: ctx.is_https,
    };
    let mut request_body = ctx.recorder.request_capture();
    let mut response_body = ctx.recorder.response_capture();

    let result = relay(
        client,
        upstream,
        &request,
        &mut record,
        &mut request_body,
        &mut response_body,
    )
    .await;

    let (body, size, truncated) = request_body.into_parts();
    record.request.body = body;
    record.request.body_size = size;
    record.request.body_truncated = truncated;
    if let Some(response) = record.response.as_mut() {
        let (body, size, truncated) = response_body.into_parts();
        response.body = body;
        response.body_size = size;
        response.body_truncated = truncated;
    }

    match &result {
        Ok(outcome) => debug!(
            method = %record.request.method,
            url = %record.request.url,
            status = record.response.as_ref().map(|response| response.status),
            upgraded = outcome.upgraded,
            "exchange complete"
        ),
        Err(err) => warn!(url = %record.request.url, error = %err, "exchange failed"),
    }
    if let Err(err) = ctx.recorder.add(record) {
        warn!(error = %err, "dropping history record");
    }
    result
}

async fn relay<C, U>(
    client: &mut BufferedStream<C>,
    upstream: &mut BufferedStream<U>,
    request: &RequestHead,
    record: &mut HistoryRecord,
    request_body: &mut BodyCapture,
    response_body: &mut BodyCapture,
) -> Result<ExchangeOutcome, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let framing = BodyFraming::for_request(request)?;
    upstream.write_all(&request.encode()).await?;
    let mut decoder = BodyDecoder::new(framing);
    client.relay_body(&mut decoder, upstream, request_body).await?;
    record.time_req_finish = Some(Utc::now());

    let response = loop {
        let Some(head) = upstream.read_response_head().await? else {
            debug!("upstream closed before responding");
            return Ok(ExchangeOutcome::closed());
        };
        if head.is_interim() {
            client.write_all(&head.encode()).await?;
            client.flush().await?;
            continue;
        }
        break head;
    };

    record.response = Some(response_snapshot(&response));
    client.write_all(&response.encode()).await?;

    if response.line.status_code == 101 {
        client.flush().await?;
        let (up, down) = copy_bidirectional(client, upstream).await?;
        debug!(up, down, "upgraded connection closed");
        record.time_resp_finish = Some(Utc::now());
        return Ok(ExchangeOutcome {
            upgraded: true,
            responded: true,
            ..ExchangeOutcome::closed()
        });
    }

    let framing = BodyFraming::for_response(&response, &request.line.method)?;
    let mut decoder = BodyDecoder::new(framing);
    upstream.relay_body(&mut decoder, client, response_body).await?;
    record.time_resp_finish = Some(Utc::now());

    let persistent = request.keep_alive() && response.keep_alive() && !framing.is_close_delimited();
    Ok(ExchangeOutcome {
        client_keep_alive: persistent,
        upstream_reusable: persistent,
        upgraded: false,
        responded: true,
    })
}

fn recorded_headers(headers: &[Header]) -> Vec<RecordedHeader> {
    headers
        .iter()
        .map(|header| RecordedHeader::new(header.name.clone(), header.value.clone()))
        .collect()
}

fn request_snapshot(ctx: &ExchangeContext<'_>, request: &RequestHead) -> RequestSnapshot {
    let target = &request.line.target;
    let url = if target.starts_with('/') {
        format!("{}{}", ctx.origin, target)
    } else {
        target.clone()
    };
    RequestSnapshot {
        method: request.line.method.clone(),
        url,
        proto: request.line.version.as_str().to_string(),
        headers: recorded_headers(&request.headers),
        content_length: request.content_length(),
        host: request
            .header("host")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.authority.clone()),
        remote_addr: ctx.remote_addr.clone(),
        body: Vec::new(),
        body_size: 0,
        body_truncated: false,
    }
}

fn response_snapshot(response: &ResponseHead) -> ResponseSnapshot {
    ResponseSnapshot {
        status: response.line.status_code,
        reason: response.line.reason.clone(),
        proto: response.line.version.as_str().to_string(),
        headers: recorded_headers(&response.headers),
        content_length: response.content_length(),
        body: Vec::new(),
        body_size: 0,
        body_truncated: false,
    }
}
