//! Server-sent-events passthrough with incremental token accounting.
//!
//! The upstream reply is exposed as a pull-based stream of parsed `data:`
//! frames. The relay body forwards each frame to the client as soon as it is
//! complete while counting the delta content, so no second parse of the wire
//! bytes is needed. Settlement is bound to the body's lifetime: normal EOF
//! and upstream errors settle inline, a dropped body (client disconnect)
//! settles through the [`Drop`] finalizer with whatever was accumulated.

use std::io;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, TRANSFER_ENCODING};
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;

use super::context::RelayContext;
use super::cost::completion_quota;
use super::envelope::StreamChunk;
use super::ledger::{QuotaCharge, QuotaLedger};
use super::token_count::TokenCounter;

pub const SSE_DONE_FRAME: &str = "[DONE]";

#[derive(Clone, Copy, Debug)]
pub struct SseLimits {
    pub max_line_bytes: usize,
    pub max_event_bytes: usize,
}

impl Default for SseLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 256 * 1024,
            max_event_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Read one line into `out`, including the trailing newline. Returns `false`
/// on EOF with nothing read.
async fn read_line_bounded<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_bytes: usize,
) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }
        let newline = buf.iter().position(|b| *b == b'\n');
        let take = newline.map(|pos| pos + 1).unwrap_or(buf.len());
        if out.len().saturating_add(take) > max_bytes {
            return Err(io::Error::other(format!(
                "sse line exceeds max_line_bytes={max_bytes}"
            )));
        }
        out.extend_from_slice(&buf[..take]);
        reader.consume(take);
        if newline.is_some() {
            return Ok(true);
        }
    }
}

/// Read the next complete SSE frame: the concatenated payload of its `data:`
/// lines. Returns `None` at upstream EOF.
async fn read_frame<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    buffer: &mut String,
    limits: SseLimits,
) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buffer.clear();
    loop {
        if !read_line_bounded(reader, line, limits.max_line_bytes).await? {
            if buffer.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        let text = std::str::from_utf8(line).map_err(io::Error::other)?;
        let text = text.trim_end_matches(['\r', '\n']);

        if text.is_empty() {
            if buffer.is_empty() {
                continue;
            }
            return Ok(Some(std::mem::take(buffer)));
        }

        if let Some(rest) = text.strip_prefix("data:") {
            let rest = rest.trim_start();
            let separator = usize::from(!buffer.is_empty());
            if buffer.len().saturating_add(separator).saturating_add(rest.len())
                > limits.max_event_bytes
            {
                return Err(io::Error::other(format!(
                    "sse event exceeds max_event_bytes={}",
                    limits.max_event_bytes
                )));
            }
            if separator == 1 {
                buffer.push('\n');
            }
            buffer.push_str(rest);
        }
    }
}

/// Pull-based stream of SSE frame payloads from any buffered reader.
pub fn sse_frame_stream_from_reader<R>(
    reader: R,
    limits: SseLimits,
) -> BoxStream<'static, io::Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(futures_util::stream::try_unfold(
        (reader, Vec::new(), String::new(), limits),
        |(mut reader, mut line, mut buffer, limits)| async move {
            match read_frame(&mut reader, &mut line, &mut buffer, limits).await? {
                Some(frame) => Ok(Some((frame, (reader, line, buffer, limits)))),
                None => Ok(None),
            }
        },
    ))
}

/// Pull-based stream of SSE frame payloads from an upstream response.
pub fn sse_frame_stream(
    response: reqwest::Response,
    limits: SseLimits,
) -> BoxStream<'static, io::Result<String>> {
    let byte_stream = response.bytes_stream().map_err(io::Error::other);
    let reader = BufReader::new(StreamReader::new(byte_stream));
    sse_frame_stream_from_reader(reader, limits)
}

/// SSE response headers for the client side of a streamed relay.
pub fn set_event_stream_headers(headers: &mut HeaderMap) {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}

/// How a [`Committer`] turns observed tokens into a quota delta.
enum ChargeKind {
    /// Token-based relays: quota is `ratio × (prompt + completion)`.
    PerToken { prompt_tokens: usize },
    /// Image relays: the cost was fixed at admission time.
    Fixed { quota: i64 },
}

/// Deferred commit of one relay, consumed exactly once on whichever exit path
/// the response takes.
pub struct Committer {
    ledger: QuotaLedger,
    enabled: bool,
    user_id: i64,
    token_id: i64,
    channel_id: i64,
    token_name: String,
    model: String,
    model_ratio: f64,
    group_ratio: f64,
    kind: ChargeKind,
}

impl Committer {
    pub fn per_token(
        ledger: QuotaLedger,
        ctx: &RelayContext,
        model: &str,
        model_ratio: f64,
        group_ratio: f64,
        prompt_tokens: usize,
    ) -> Self {
        Self::new(
            ledger,
            ctx,
            model,
            model_ratio,
            group_ratio,
            ChargeKind::PerToken { prompt_tokens },
        )
    }

    pub fn fixed(
        ledger: QuotaLedger,
        ctx: &RelayContext,
        model: &str,
        model_ratio: f64,
        group_ratio: f64,
        quota: i64,
    ) -> Self {
        Self::new(ledger, ctx, model, model_ratio, group_ratio, ChargeKind::Fixed { quota })
    }

    fn new(
        ledger: QuotaLedger,
        ctx: &RelayContext,
        model: &str,
        model_ratio: f64,
        group_ratio: f64,
        kind: ChargeKind,
    ) -> Self {
        Self {
            ledger,
            enabled: ctx.consume_quota,
            user_id: ctx.user_id,
            token_id: ctx.token_id,
            channel_id: ctx.channel_id,
            token_name: ctx.token_name.clone(),
            model: model.to_string(),
            model_ratio,
            group_ratio,
            kind,
        }
    }

    /// Override the counted prompt with the upstream-reported figure.
    pub fn set_prompt_tokens(&mut self, prompt_tokens: usize) {
        if let ChargeKind::PerToken { prompt_tokens: counted } = &mut self.kind {
            *counted = prompt_tokens;
        }
    }

    /// Settle the relay with the observed completion tokens.
    pub async fn settle(self, completion_tokens: usize) {
        if !self.enabled {
            return;
        }
        let ratio = self.model_ratio * self.group_ratio;
        let (quota, prompt_tokens, completion_tokens) = match self.kind {
            ChargeKind::PerToken { prompt_tokens } => (
                completion_quota(ratio, prompt_tokens, completion_tokens),
                prompt_tokens,
                completion_tokens,
            ),
            ChargeKind::Fixed { quota } => (quota, 0, 0),
        };
        self.ledger
            .commit(QuotaCharge {
                user_id: self.user_id,
                token_id: self.token_id,
                channel_id: self.channel_id,
                token_name: self.token_name.clone(),
                model: self.model.clone(),
                prompt_tokens,
                completion_tokens,
                quota,
                model_ratio: self.model_ratio,
                group_ratio: self.group_ratio,
            })
            .await;
    }

    /// Settle off the response path; used when the body is dropped before
    /// EOF. Falls back to a throwaway runtime when no tokio handle is live.
    fn settle_detached(self, completion_tokens: usize) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(self.settle(completion_tokens));
            }
            Err(_) => {
                std::thread::spawn(move || {
                    let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    else {
                        return;
                    };
                    runtime.block_on(self.settle(completion_tokens));
                });
            }
        }
    }
}

struct StreamingRelayState {
    frames: BoxStream<'static, io::Result<String>>,
    counter: Arc<TokenCounter>,
    model: String,
    completion_tokens: usize,
    committer: Option<Committer>,
}

impl Drop for StreamingRelayState {
    fn drop(&mut self) {
        if let Some(committer) = self.committer.take() {
            committer.settle_detached(self.completion_tokens);
        }
    }
}

fn frame_completion_tokens(counter: &TokenCounter, model: &str, frame: &str) -> usize {
    let Ok(chunk) = serde_json::from_str::<StreamChunk>(frame) else {
        return 0;
    };
    chunk
        .choices
        .iter()
        .filter_map(|choice| choice.delta.content.as_deref().or(choice.text.as_deref()))
        .map(|text| counter.count_text(text, model))
        .sum()
}

/// Client body for a streamed relay: forwards each upstream frame as soon as
/// it is complete, counts delta content along the way, and settles at EOF.
pub fn streaming_relay_body(
    upstream: reqwest::Response,
    counter: Arc<TokenCounter>,
    model: String,
    committer: Committer,
    limits: SseLimits,
) -> Body {
    let state = StreamingRelayState {
        frames: sse_frame_stream(upstream, limits),
        counter,
        model,
        completion_tokens: 0,
        committer: Some(committer),
    };

    Body::from_stream(futures_util::stream::try_unfold(state, |mut state| async move {
        match state.frames.next().await {
            Some(Ok(frame)) => {
                if frame != SSE_DONE_FRAME {
                    state.completion_tokens +=
                        frame_completion_tokens(&state.counter, &state.model, &frame);
                }
                let chunk = Bytes::from(format!("data: {frame}\n\n"));
                Ok::<_, io::Error>(Some((chunk, state)))
            }
            Some(Err(err)) => {
                if let Some(committer) = state.committer.take() {
                    committer.settle(state.completion_tokens).await;
                }
                Err(err)
            }
            None => {
                if let Some(committer) = state.committer.take() {
                    committer.settle(state.completion_tokens).await;
                }
                Ok(None)
            }
        }
    }))
}

struct BufferedRelayState {
    chunk: Option<Bytes>,
    completion_tokens: usize,
    committer: Option<Committer>,
}

impl Drop for BufferedRelayState {
    fn drop(&mut self) {
        if let Some(committer) = self.committer.take() {
            committer.settle_detached(self.completion_tokens);
        }
    }
}

/// Client body for a buffered relay: one chunk, settled after it is written.
pub fn buffered_relay_body(bytes: Bytes, completion_tokens: usize, committer: Committer) -> Body {
    let state = BufferedRelayState {
        chunk: Some(bytes),
        completion_tokens,
        committer: Some(committer),
    };

    Body::from_stream(futures_util::stream::try_unfold(state, |mut state| async move {
        match state.chunk.take() {
            Some(chunk) => Ok::<_, io::Error>(Some((chunk, state))),
            None => {
                if let Some(committer) = state.committer.take() {
                    committer.settle(state.completion_tokens).await;
                }
                Ok(None)
            }
        }
    }))
}
