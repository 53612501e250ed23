//! Client library for streaming blocks from an SQD portal.
//!
//! [`Client::stream`] gives a raw, self-advancing block stream. [`ResumableStream`] layers
//! durable offsets and fork recovery on top of it through a [`State`] implementation.
use std::{
    num::NonZeroU64,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use portal_format::{BlockRef, PortalBlock};
use portal_net_types::{
    ForkResponse, Query, FINALIZED_HEAD_HASH_HEADER, FINALIZED_HEAD_NUMBER_HEADER,
};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode,
};
use tokio_util::sync::CancellationToken;
use url::Url;

mod buffer;
mod config;
mod error;
mod line_split;
mod progress;
mod resumable;
mod state;
mod stream;
mod target;
mod util;

pub use portal_format as format;
pub use portal_net_types as net_types;

pub use config::{
    ClientConfig, StreamConfig, StreamSettings, DEFAULT_RETRY_SCHEDULE_MS,
};
pub use error::{ForkDetected, HttpStatusError, IngestError};
pub use progress::{
    log_progress, ProgressHistory, ProgressHook, ProgressState, ProgressTracker, Rate,
};
pub use resumable::{
    Acker, Batch, OffsetHandle, ResumableStream, ResumableStreamOptions, StartState, StreamHooks,
};
pub use state::{MemoryState, RollbackEvent, State};
pub use stream::{PortalStream, PortalStreamData};
pub use target::Target;
pub use util::{display_estimated_time, format_number, human_bytes, WarnOnce};

/// Counters shared by every request the client makes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortalStats {
    /// Total size of NDJSON lines received by streams of this client.
    pub bytes_received: u64,
}

pub(crate) enum StreamResponse {
    Data {
        finalized_head: Option<BlockRef>,
        response: reqwest::Response,
    },
    NoData,
    Fork(ForkDetected),
}

/// Handles http requests and retries against a single portal dataset.
#[derive(Clone, Debug)]
pub struct Client {
    /// Initialized reqwest instance for client url.
    http_client: reqwest::Client,
    /// Portal dataset URL.
    url: Url,
    /// Headers attached to every request.
    headers: HeaderMap,
    /// Timeout for receiving response headers.
    http_req_timeout: Duration,
    /// Timeout between two chunks of a streamed body.
    body_timeout: Duration,
    /// Number of retries to attempt before returning error.
    retry_attempts: usize,
    retry_schedule: Vec<Duration>,
    bytes_received: Arc<AtomicU64>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        let user_agent = format!("portal-stream/{}", env!("CARGO_PKG_VERSION"));

        let http_client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .context("build http client")?;

        let mut headers = HeaderMap::new();
        for (name, value) in cfg.headers.iter() {
            let name = HeaderName::from_str(name).with_context(|| format!("header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(|| format!("value of header {name}"))?;
            headers.insert(name, value);
        }

        let retry_schedule: Vec<Duration> = cfg
            .retry_schedule_ms
            .unwrap_or_else(|| DEFAULT_RETRY_SCHEDULE_MS.to_vec())
            .into_iter()
            .map(Duration::from_millis)
            .collect();
        if retry_schedule.is_empty() {
            return Err(anyhow!("retry schedule must have at least one entry"));
        }

        Ok(Self {
            http_client,
            url: cfg.url.context("portal url is required")?,
            headers,
            http_req_timeout: millis_or(cfg.http_req_timeout_millis, 30_000),
            body_timeout: millis_or(cfg.body_timeout_millis, 60_000),
            retry_attempts: cfg.retry_attempts.unwrap_or(10),
            retry_schedule,
            bytes_received: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn stats(&self) -> PortalStats {
        PortalStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Latest block the portal knows about, `None` if the dataset is empty.
    pub async fn get_head(&self) -> Result<Option<BlockRef>> {
        self.get_head_impl("head").await.context("get head")
    }

    /// Latest finalized block, `None` if the portal does not track finality for the dataset.
    pub async fn get_finalized_head(&self) -> Result<Option<BlockRef>> {
        self.get_head_impl("finalized-head")
            .await
            .context("get finalized head")
    }

    /// Runs a query to completion of a single response and returns its blocks.
    ///
    /// The portal may stop the response before `query.to_block`; the caller continues from
    /// the last returned block.
    pub async fn get_query<B: PortalBlock>(&self, query: &Query) -> Result<Vec<B>> {
        self.get_query_impl("stream", query).await
    }

    /// Same as [`Client::get_query`] but restricted to finalized blocks.
    pub async fn get_finalized_query<B: PortalBlock>(&self, query: &Query) -> Result<Vec<B>> {
        self.get_query_impl("finalized-stream", query).await
    }

    /// Starts ingesting `query` in a background task.
    ///
    /// The returned stream advances its own cursor through the range and follows the head
    /// until cancelled, unless `stop_on_head` is set.
    pub fn stream<B: PortalBlock>(&self, query: Query, config: &StreamConfig) -> PortalStream<B> {
        PortalStream::spawn(self.clone(), "stream", query, config.settings())
    }

    /// Same as [`Client::stream`] but restricted to finalized blocks.
    pub fn finalized_stream<B: PortalBlock>(
        &self,
        query: Query,
        config: &StreamConfig,
    ) -> PortalStream<B> {
        PortalStream::spawn(self.clone(), "finalized-stream", query, config.settings())
    }

    pub(crate) fn retry_attempts(&self) -> usize {
        self.retry_attempts
    }

    pub(crate) fn body_timeout(&self) -> Duration {
        self.body_timeout
    }

    /// Delay before retry number `attempt` (zero based). The last schedule entry repeats.
    pub(crate) fn retry_delay(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.retry_schedule.len() - 1);
        self.retry_schedule[idx]
    }

    pub(crate) fn dataset_url(&self, path: &str) -> Result<Url> {
        let mut url = self.url.clone();
        let mut segments = url.path_segments_mut().ok().context("get path segments")?;
        segments.pop_if_empty();
        segments.push(path);
        std::mem::drop(segments);
        Ok(url)
    }

    async fn get_head_impl(&self, path: &str) -> Result<Option<BlockRef>> {
        let url = self.dataset_url(path)?;
        let res = self
            .send_with_retry(Method::GET, &url, None, &CancellationToken::new())
            .await?
            .context("request was cancelled")?;

        let status = res.status();
        if status != StatusCode::OK {
            return Err(status_error(res, url).await.into());
        }

        let body = res.text().await.context("read response body")?;
        if body.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str::<Option<BlockRef>>(&body).context("parse head")
    }

    async fn get_query_impl<B: PortalBlock>(&self, path: &str, query: &Query) -> Result<Vec<B>> {
        let url = self.dataset_url(path)?;
        let res = self
            .stream_request(&url, query, &CancellationToken::new())
            .await?
            .context("request was cancelled")?;

        let response = match res {
            StreamResponse::NoData => return Ok(Vec::new()),
            StreamResponse::Fork(fork) => return Err(fork.into()),
            StreamResponse::Data { response, .. } => response,
        };

        let body = response.bytes().await.context("read response body")?;
        self.bytes_received
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        body.split(|b| *b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| serde_json::from_slice(line).context("decode block record"))
            .collect()
    }

    /// Posts a query and classifies the response. `None` if cancelled.
    pub(crate) async fn stream_request(
        &self,
        url: &Url,
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<Option<StreamResponse>> {
        let body = serde_json::to_vec(query).context("serialize query")?;
        let res = match self
            .send_with_retry(Method::POST, url, Some(&body), cancel)
            .await?
        {
            Some(res) => res,
            None => return Ok(None),
        };

        match res.status() {
            StatusCode::OK => {
                let finalized_head = finalized_head(res.headers());
                Ok(Some(StreamResponse::Data {
                    finalized_head,
                    response: res,
                }))
            }
            StatusCode::NO_CONTENT => Ok(Some(StreamResponse::NoData)),
            StatusCode::CONFLICT => {
                let text = res.text().await.context("read conflict response body")?;
                match serde_json::from_str::<ForkResponse>(&text) {
                    Ok(fork) if !fork.previous_blocks.is_empty() => {
                        Ok(Some(StreamResponse::Fork(ForkDetected {
                            previous_blocks: fork.previous_blocks,
                            from_block: Some(query.from_block),
                            parent_block_hash: query.parent_block_hash.clone(),
                        })))
                    }
                    _ => Err(HttpStatusError {
                        status: StatusCode::CONFLICT,
                        url: url.clone(),
                        body: Some(text),
                    }
                    .into()),
                }
            }
            _ => Err(status_error(res, url.clone()).await.into()),
        }
    }

    /// Sends a request, retrying network failures and overload statuses on the configured
    /// schedule. Any other response is returned to the caller. `None` if cancelled.
    async fn send_with_retry(
        &self,
        method: Method,
        url: &Url,
        body: Option<&[u8]>,
        cancel: &CancellationToken,
    ) -> Result<Option<reqwest::Response>> {
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let mut req = self
                .http_client
                .request(method.clone(), url.clone())
                .headers(self.headers.clone());
            if let Some(body) = body {
                req = req
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .body(body.to_vec());
            }

            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                res = tokio::time::timeout(self.http_req_timeout, req.send()) => res,
            };

            let err = match res {
                Ok(Ok(res)) if is_retryable(res.status()) => anyhow::Error::new(HttpStatusError {
                    status: res.status(),
                    url: url.clone(),
                    body: None,
                }),
                Ok(Ok(res)) => return Ok(Some(res)),
                Ok(Err(e)) => anyhow::Error::new(e).context(format!("execute http req to {url}")),
                Err(_) => anyhow!(
                    "no response from {url} within {:?}",
                    self.http_req_timeout
                ),
            };

            if attempt >= self.retry_attempts {
                return Err(err);
            }

            let delay = self.retry_delay(attempt);
            attempt += 1;
            log::warn!(
                "portal request failed, retrying in {delay:?} ({attempt}/{}). The error was: {err:?}",
                self.retry_attempts
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn millis_or(value: Option<NonZeroU64>, default: u64) -> Duration {
    Duration::from_millis(value.map(NonZeroU64::get).unwrap_or(default))
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

async fn status_error(res: reqwest::Response, url: Url) -> HttpStatusError {
    let status = res.status();
    let body = res.text().await.ok().filter(|b| !b.is_empty());
    HttpStatusError { status, url, body }
}

fn finalized_head(headers: &HeaderMap) -> Option<BlockRef> {
    let number = headers
        .get(FINALIZED_HEAD_NUMBER_HEADER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()?;
    let hash = headers.get(FINALIZED_HEAD_HASH_HEADER)?.to_str().ok()?;

    Some(BlockRef::new(number, hash))
}
