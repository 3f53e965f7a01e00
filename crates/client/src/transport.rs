//! Event stream transports

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use crate::config::ClientConfig;
use crate::error::{MuxError, Result};
use crate::sse::{SseDecoder, SseFrame};

/// Decoded frames of one open event stream, in arrival order
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// Opens the physical connection the multiplexer reads from
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, endpoint: &str) -> Result<FrameStream>;
}

/// SSE over HTTP via reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, endpoint: &str) -> Result<FrameStream> {
        let mut request = self
            .client
            .get(endpoint)
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = tokio::time::timeout(self.config.connect_timeout, request.send())
            .await
            .map_err(|_| MuxError::Transport(format!("timed out connecting to {}", endpoint)))?
            .map_err(|e| MuxError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MuxError::Transport(format!(
                "server answered {} for {}",
                status, endpoint
            )));
        }

        tracing::debug!(endpoint = %endpoint, "Event stream opened");
        Ok(decode_stream(Box::pin(response.bytes_stream())))
    }
}

/// Turn a byte stream into SSE frames.
///
/// A read error is yielded once as a transport error, then the stream ends.
pub fn decode_stream<S, B, E>(bytes: S) -> FrameStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    let stream = futures::stream::unfold(
        (bytes, SseDecoder::new(), VecDeque::new(), false),
        |(mut bytes, mut decoder, mut ready, done)| async move {
            loop {
                if let Some(frame) = ready.pop_front() {
                    return Some((Ok(frame), (bytes, decoder, ready, done)));
                }
                if done {
                    return None;
                }

                match bytes.next().await {
                    Some(Ok(chunk)) => ready.extend(decoder.push(chunk.as_ref())),
                    Some(Err(e)) => {
                        let err = MuxError::Transport(format!("event stream read failed: {}", e));
                        return Some((Err(err), (bytes, decoder, ready, true)));
                    }
                    None => return None,
                }
            }
        },
    );
    Box::pin(stream)
}
