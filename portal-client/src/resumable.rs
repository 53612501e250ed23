use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use portal_format::{BlockRef, Offset, PendingOffset, PortalBlock, PortalRange};
use portal_net_types::Query;
use tokio::sync::watch;

use crate::{
    config::{ClientConfig, StreamConfig},
    error::IngestError,
    progress::{log_progress, LastBlock, ProgressHook, ProgressState, ProgressTracker},
    state::{RollbackEvent, State},
    stream::PortalStream,
    util::{format_number, WarnOnce},
    Client,
};

/// Passed to the start hook once the starting offset is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartState {
    /// Offset the stream continues after when `resume` is set, or starts at otherwise.
    pub current: Offset,
    pub initial: Offset,
    /// Whether the offset came from the state.
    pub resume: bool,
}

/// Notification callbacks. Unset hooks log.
#[derive(Clone, Default)]
pub struct StreamHooks {
    pub on_start: Option<Arc<dyn Fn(&StartState) + Send + Sync>>,
    pub on_progress: Option<ProgressHook>,
}

pub struct ResumableStreamOptions {
    pub portal: ClientConfig,
    pub stream: StreamConfig,
    pub query: Query,
    pub block_range: PortalRange,
    pub state: Option<Arc<dyn State>>,
    pub hooks: StreamHooks,
    /// Read only finalized blocks.
    pub finalized: bool,
    pub progress_interval: Duration,
}

impl ResumableStreamOptions {
    pub fn new(portal: ClientConfig, query: Query, block_range: PortalRange) -> Self {
        Self {
            portal,
            stream: StreamConfig::default(),
            query,
            block_range,
            state: None,
            hooks: StreamHooks::default(),
            finalized: false,
            progress_interval: Duration::from_secs(5),
        }
    }

    pub fn with_state(mut self, state: Arc<dyn State>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_stream_config(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn on_start(mut self, hook: impl Fn(&StartState) + Send + Sync + 'static) -> Self {
        self.hooks.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_progress(mut self, hook: impl Fn(&ProgressState) + Send + Sync + 'static) -> Self {
        self.hooks.on_progress = Some(Arc::new(hook));
        self
    }
}

/// Identifies a delivered batch when acknowledging it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetHandle {
    seq: u64,
    latest: Offset,
}

impl OffsetHandle {
    /// Offset of the last block of the batch.
    pub fn latest(&self) -> &Offset {
        &self.latest
    }
}

#[derive(Debug)]
pub struct Batch<B> {
    pub blocks: Vec<B>,
    pub finalized_head: Option<BlockRef>,
    pub offset: OffsetHandle,
}

struct Pending {
    seq: u64,
    offset: PendingOffset,
}

struct Shared {
    queue: Mutex<VecDeque<Pending>>,
    pending: watch::Sender<usize>,
    state: Option<Arc<dyn State>>,
    progress: Mutex<Option<ProgressTracker>>,
    warn_once: WarnOnce,
    client: Client,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn progress(&self) -> MutexGuard<'_, Option<ProgressTracker>> {
        match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Acknowledges delivered batches. Clones share the same queue.
#[derive(Clone)]
pub struct Acker {
    shared: Arc<Shared>,
}

impl Acker {
    /// Commits the offset of the oldest unacknowledged batch to the state.
    ///
    /// Batches must be acknowledged in delivery order. Acknowledging with nothing pending or
    /// out of order is an error.
    pub async fn ack(&self, handle: &OffsetHandle) -> Result<()> {
        let (pending, remaining) = {
            let mut queue = self.shared.queue();
            let front = queue.front().ok_or_else(|| {
                anyhow!(
                    "Failed to acknowledge offset: no pending offsets in the queue.\n\
                     This usually means ack() was called more times than data was processed."
                )
            })?;
            if front.seq != handle.seq {
                bail!(
                    "Failed to acknowledge offset: expected the batch ending at block {} but got the one ending at {}. Batches must be acknowledged in the order they were delivered.",
                    format_number(front.offset.latest.number),
                    format_number(handle.latest.number)
                );
            }

            let pending = queue.pop_front().context("pop pending offset")?;
            (pending, queue.len())
        };

        if let Some(progress) = self.shared.progress().as_ref() {
            progress.track(
                pending.offset.latest.number,
                self.shared.client.stats().bytes_received,
            );
        }

        let res = match &self.shared.state {
            Some(state) => state
                .commit_offset(&pending.offset)
                .await
                .with_context(|| {
                    format!("commit offset {}", pending.offset.latest.number)
                }),
            None => {
                self.shared.warn_once.warn(
                    "====================================\n\
                     State is not defined. Please set a state to make a stream resumable\n\
                     ====================================",
                );
                Ok(())
            }
        };

        self.shared.pending.send_replace(remaining);
        res?;

        log::debug!("Acked blocks {}", format_number(pending.offset.latest.number));

        Ok(())
    }

    /// Number of delivered batches waiting for acknowledgement.
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }
}

/// Pulls blocks from the portal, keeps track of unacknowledged batches and recovers from
/// forks through the configured [`State`].
///
/// Fork recovery waits until every delivered batch is acknowledged. Callers that keep
/// batches around while pulling the next one must acknowledge them from another task
/// through [`ResumableStream::acker`].
pub struct ResumableStream<B> {
    client: Client,
    query: Query,
    from_block: u64,
    to_block: Option<u64>,
    stream_config: StreamConfig,
    finalized: bool,
    hooks: StreamHooks,
    progress_interval: Duration,
    shared: Arc<Shared>,
    source: Option<PortalStream<B>>,
    next_seq: u64,
    started: bool,
    done: bool,
}

impl<B: PortalBlock> ResumableStream<B> {
    pub fn new(options: ResumableStreamOptions) -> Result<Self> {
        let mut portal = options.portal;
        portal.retry_attempts.get_or_insert(10);
        let client = Client::new(portal).context("create portal client")?;

        let range = options.block_range.parse().context("parse block range")?;

        let mut query = options.query;
        query.fields = std::mem::take(&mut query.fields).with_block_cursor_fields();

        let (pending, _) = watch::channel(0);

        Ok(Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                pending,
                state: options.state,
                progress: Mutex::new(None),
                warn_once: WarnOnce::default(),
                client: client.clone(),
            }),
            client,
            query,
            from_block: range.from,
            to_block: range.to,
            stream_config: options.stream,
            finalized: options.finalized,
            hooks: options.hooks,
            progress_interval: options.progress_interval,
            source: None,
            next_seq: 0,
            started: false,
            done: false,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn acker(&self) -> Acker {
        Acker {
            shared: self.shared.clone(),
        }
    }

    /// See [`Acker::ack`].
    pub async fn ack(&self, handle: &OffsetHandle) -> Result<()> {
        self.acker().ack(handle).await
    }

    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }

    /// Resolves the starting offset and opens the portal stream.
    ///
    /// Called by the first [`ResumableStream::next`] if not called before.
    ///
    /// A failed start ends the stream: later calls to `next` return `None`.
    pub async fn start(&mut self) -> Result<StartState> {
        if self.started {
            bail!("stream is already started");
        }
        self.started = true;

        let res = self.open_at_stored_offset().await;
        if res.is_err() {
            self.done = true;
        }
        res
    }

    async fn open_at_stored_offset(&mut self) -> Result<StartState> {
        let default = Offset::at(self.from_block);
        let stored = match &self.shared.state {
            Some(state) => state
                .get_offset(&default)
                .await
                .context("get stored offset")?,
            None => None,
        };

        let start = match stored {
            Some(stored) => StartState {
                current: stored.latest,
                initial: stored.initial,
                resume: true,
            },
            None => StartState {
                current: default.clone(),
                initial: default,
                resume: false,
            },
        };

        match &self.hooks.on_start {
            Some(hook) => hook(&start),
            None => log_start(&start),
        }

        let last = match self.to_block {
            Some(to) => LastBlock::Fixed(to),
            None => LastBlock::Head(self.client.clone()),
        };
        let hook = self
            .hooks
            .on_progress
            .clone()
            .unwrap_or_else(|| Arc::new(log_progress) as ProgressHook);
        *self.shared.progress() = Some(ProgressTracker::start(
            start.initial.number,
            last,
            self.progress_interval,
            hook,
        ));

        if let Some(state) = self.shared.state.as_ref().filter(|s| s.supports_rollback()) {
            state
                .on_rollback(RollbackEvent::OffsetCheck {
                    expected_latest_offset: start.current.clone(),
                })
                .await
                .context("check stored offset")?;
        }

        if start.resume {
            self.restart_from(&start.current);
        } else {
            let query = self.query.clone().with_range(start.current.number, self.to_block);
            self.source = Some(self.open(query));
        }

        Ok(start)
    }

    /// Next batch, or `None` once the range is delivered. A fatal error ends the stream.
    pub async fn next(&mut self) -> Option<Result<Batch<B>>> {
        if self.done {
            return None;
        }

        if !self.started {
            if let Err(e) = self.start().await {
                self.done = true;
                return Some(Err(e));
            }
        }

        loop {
            let next = self.source.as_mut()?.next().await;

            let data = match next {
                None => {
                    self.stop();
                    return None;
                }
                Some(Ok(data)) => data,
                Some(Err(IngestError::Fork(fork))) => match self.recover(fork).await {
                    Ok(()) => continue,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                },
                Some(Err(IngestError::Transport(e))) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let Some(offset) = PendingOffset::from_batch(&data.blocks, data.finalized_head.as_ref())
            else {
                continue;
            };

            if let Some(first) = data.blocks.first() {
                log::debug!(
                    "Enqueuing chunks from {} / {}",
                    format_number(first.number()),
                    format_number(offset.latest.number)
                );
            }

            let handle = OffsetHandle {
                seq: self.next_seq,
                latest: offset.latest.clone(),
            };
            self.next_seq += 1;

            let len = {
                let mut queue = self.shared.queue();
                queue.push_back(Pending {
                    seq: handle.seq,
                    offset,
                });
                queue.len()
            };
            self.shared.pending.send_replace(len);

            return Some(Ok(Batch {
                blocks: data.blocks,
                finalized_head: data.finalized_head,
                offset: handle,
            }));
        }
    }

    /// Replaces the portal stream with one continuing right after `offset`.
    pub fn restart_from(&mut self, offset: &Offset) {
        let mut query = self
            .query
            .clone()
            .with_range(offset.number + 1, self.to_block);
        query.parent_block_hash = offset.hash.clone();

        self.source = Some(self.open(query));
        self.done = false;
    }

    /// Cancels the portal stream and stops progress reporting.
    pub fn stop(&mut self) {
        if let Some(source) = self.source.take() {
            source.cancel();
        }
        self.shared.progress().take();
        self.done = true;

        log::info!("Stream stopped");
    }

    fn open(&self, query: Query) -> PortalStream<B> {
        if self.finalized {
            self.client.finalized_stream(query, &self.stream_config)
        } else {
            self.client.stream(query, &self.stream_config)
        }
    }

    async fn recover(&mut self, fork: crate::ForkDetected) -> Result<()> {
        let state = match &self.shared.state {
            Some(state) if state.supports_rollback() => state.clone(),
            _ => return Err(anyhow::Error::new(fork)),
        };

        let mut canonical_blocks = fork.previous_blocks;
        canonical_blocks.sort_by_key(|b| b.number);

        if let Some(newest) = canonical_blocks.last() {
            log::info!(
                "Fork is detected on block {}",
                format_number(newest.number + 1)
            );
        }

        let mut pending = self.shared.pending.subscribe();
        pending
            .wait_for(|n| *n == 0)
            .await
            .context("wait for pending offsets to drain")?;
        log::debug!("All batches have been processed");

        let offset = state
            .on_rollback(RollbackEvent::BlockchainFork { canonical_blocks })
            .await
            .context("resolve fork")?;

        log::debug!(
            "Restarting streaming from unforked block {} with hash {}",
            format_number(offset.number + 1),
            offset.hash.as_deref().unwrap_or_default()
        );
        self.restart_from(&offset);

        Ok(())
    }
}

fn log_start(start: &StartState) {
    if start.resume {
        log::info!("Resuming from {} block", format_number(start.current.number + 1));
    } else {
        log::info!("Syncing from {}", format_number(start.current.number));
    }
}
