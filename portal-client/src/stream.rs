use std::{
    sync::{atomic::Ordering, Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Context};
use futures::StreamExt;
use portal_format::{BlockRef, PortalBlock};
use portal_net_types::Query;
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use crate::{
    buffer::StreamBuffer,
    config::StreamSettings,
    error::IngestError,
    line_split::LineSplitter,
    Client, StreamResponse,
};

/// One chunk of blocks handed to the consumer.
#[derive(Debug, Clone)]
pub struct PortalStreamData<B> {
    pub blocks: Vec<B>,
    /// Finalized head reported with the most recent response, if the portal sent one.
    pub finalized_head: Option<BlockRef>,
    /// Size of the NDJSON lines the blocks were decoded from.
    pub bytes: u64,
}

/// Consumer side of a running ingestion.
///
/// Dropping it cancels the network reader.
pub struct PortalStream<B> {
    buffer: StreamBuffer<B>,
    finalized_head: Arc<Mutex<Option<BlockRef>>>,
    cancel: CancellationToken,
    finished: bool,
    _guard: DropGuard,
}

impl<B: PortalBlock> PortalStream<B> {
    pub(crate) fn spawn(client: Client, endpoint: &'static str, query: Query, settings: StreamSettings) -> Self {
        let buffer = StreamBuffer::new(settings);
        let finalized_head = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let ingest = Ingest {
            client,
            endpoint,
            query,
            settings,
            buffer: buffer.clone(),
            finalized_head: finalized_head.clone(),
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            let buffer = ingest.buffer.clone();
            match ingest.run().await {
                Ok(()) => buffer.close(),
                Err(e) => buffer.fail(e),
            }
        });

        Self {
            buffer,
            finalized_head,
            _guard: cancel.clone().drop_guard(),
            cancel,
            finished: false,
        }
    }

    /// Waits for the next chunk. `None` once the range is fully delivered, the head was
    /// reached with `stop_on_head`, or the stream was cancelled.
    ///
    /// After an error the stream is finished.
    pub async fn next(&mut self) -> Option<Result<PortalStreamData<B>, IngestError>> {
        if self.finished {
            return None;
        }

        match self.buffer.take().await {
            Ok(Some(chunk)) => Some(Ok(PortalStreamData {
                blocks: chunk.blocks,
                finalized_head: lock(&self.finalized_head).clone(),
                bytes: chunk.bytes,
            })),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    /// Aborts the network read and wakes any waiting consumer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

enum BodyOutcome {
    Ended { lines: usize },
    Interrupted { lines: usize, err: anyhow::Error },
    Cancelled,
}

struct Ingest<B> {
    client: Client,
    endpoint: &'static str,
    query: Query,
    settings: StreamSettings,
    buffer: StreamBuffer<B>,
    finalized_head: Arc<Mutex<Option<BlockRef>>>,
    cancel: CancellationToken,
}

impl<B: PortalBlock> Ingest<B> {
    async fn run(mut self) -> Result<(), IngestError> {
        let url = self.client.dataset_url(self.endpoint)?;
        let mut failures = 0;

        loop {
            if self.cancel.is_cancelled() || self.query.is_exhausted() || !self.buffer.is_open() {
                break;
            }

            let res = self
                .client
                .stream_request(&url, &self.query, &self.cancel)
                .await
                .inspect_err(|e| {
                    log::debug!("query from block {} failed: {e:#}", self.query.from_block)
                })?;

            let (finalized_head, response) = match res {
                None => break,
                Some(StreamResponse::Fork(fork)) => return Err(fork.into()),
                Some(StreamResponse::NoData) => {
                    if self.settings.stop_on_head || !self.wait_head().await {
                        break;
                    }
                    continue;
                }
                Some(StreamResponse::Data {
                    finalized_head,
                    response,
                }) => (finalized_head, response),
            };

            *lock(&self.finalized_head) = finalized_head;

            match self.read_body(response, &url).await? {
                BodyOutcome::Cancelled => break,
                BodyOutcome::Ended { lines: 0 } => {
                    // nothing beyond the head yet
                    if self.settings.stop_on_head || !self.wait_head().await {
                        break;
                    }
                }
                BodyOutcome::Ended { .. } => failures = 0,
                BodyOutcome::Interrupted { lines, err } => {
                    if lines > 0 {
                        failures = 0;
                    } else {
                        failures += 1;
                        if failures > self.client.retry_attempts() {
                            return Err(err
                                .context(format!("read stream body from {url}"))
                                .into());
                        }
                    }

                    let delay = self.client.retry_delay(failures.saturating_sub(1));
                    log::warn!(
                        "stream body from {url} was interrupted at block {}, reconnecting in {delay:?}. The error was: {err:?}",
                        self.query.from_block
                    );
                    if !self.sleep(delay).await {
                        break;
                    }
                }
            }

            self.buffer.ready();
        }

        Ok(())
    }

    async fn read_body(
        &mut self,
        response: reqwest::Response,
        url: &Url,
    ) -> Result<BodyOutcome, IngestError> {
        let body_timeout = self.client.body_timeout();
        let mut body = response.bytes_stream();
        let mut splitter = LineSplitter::new();
        let mut lines = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(BodyOutcome::Cancelled),
                next = tokio::time::timeout(body_timeout, body.next()) => next,
            };

            if !matches!(next, Ok(Some(Ok(_)))) && splitter.has_partial() {
                log::debug!("dropping unterminated line at block {}", self.query.from_block);
            }

            let chunk = match next {
                Err(_) => {
                    return Ok(BodyOutcome::Interrupted {
                        lines,
                        err: anyhow!("no data received for {body_timeout:?}"),
                    })
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Ok(BodyOutcome::Interrupted {
                        lines,
                        err: anyhow::Error::new(e),
                    })
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            let complete = splitter.push(&chunk);
            match self.push_lines(complete, url).await? {
                Some(n) => lines += n,
                None => return Ok(BodyOutcome::Cancelled),
            }
        }

        if let Some(tail) = splitter.finish() {
            match self.push_lines(vec![tail], url).await? {
                Some(n) => lines += n,
                None => return Ok(BodyOutcome::Cancelled),
            }
        }

        Ok(BodyOutcome::Ended { lines })
    }

    /// Decodes lines, advances the cursor after each one and hands the blocks to the buffer.
    /// Returns `None` if cancelled while waiting for buffer space.
    async fn push_lines(&mut self, lines: Vec<Vec<u8>>, url: &Url) -> Result<Option<usize>, IngestError> {
        if lines.is_empty() {
            return Ok(Some(0));
        }

        let count = lines.len();
        let mut blocks = Vec::with_capacity(count);
        let mut bytes = 0u64;

        for line in lines {
            let block: B = serde_json::from_slice(&line).with_context(|| {
                format!(
                    "decode block record from {url} after block {} ({} bytes): {}",
                    self.query.from_block.saturating_sub(1),
                    line.len(),
                    String::from_utf8_lossy(&line[..line.len().min(256)])
                )
            })?;

            let len = line.len() as u64;
            bytes += len;
            self.client.bytes_received.fetch_add(len, Ordering::Relaxed);

            self.query.advance(block.number(), block.hash());
            blocks.push(block);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            res = self.buffer.put(blocks, bytes) => {
                res.context("push blocks to stream buffer")?;
                Ok(Some(count))
            }
        }
    }

    /// Waits for the head poll interval. Returns `false` if cancelled.
    async fn wait_head(&self) -> bool {
        log::trace!(
            "no new blocks after {}, polling again in {:?} ({} bytes buffered)",
            self.query.from_block,
            self.settings.head_poll_interval,
            self.buffer.pending_bytes()
        );
        self.buffer.ready();
        self.sleep(self.settings.head_poll_interval).await
    }

    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
