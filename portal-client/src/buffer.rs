use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};

use crate::{config::StreamSettings, error::IngestError};

/// Records accumulated between two `take` calls.
#[derive(Debug)]
pub struct Chunk<B> {
    pub blocks: Vec<B>,
    pub bytes: u64,
}

enum State {
    Open,
    Closed,
    Failed(Option<IngestError>),
}

struct Inner<B> {
    state: State,
    chunk: Option<Chunk<B>>,
    forced_ready: bool,
    /// Start of the current wait window: buffer creation or the last take.
    window_start: Instant,
    last_put: Instant,
    /// Incremented on every take, lets a blocked put see its chunk was consumed.
    generation: u64,
}

struct Shared<B> {
    inner: Mutex<Inner<B>>,
    changed: Notify,
    settings: StreamSettings,
}

/// Single-slot handoff between the network reader and the consumer.
///
/// `put` appends to the one pending chunk and suspends while it holds `max_bytes` or more.
/// `take` hands the chunk over once it holds `min_bytes`, once `max_wait_time` passed since
/// the previous take, or once no `put` happened for `max_idle_time`.
pub struct StreamBuffer<B> {
    shared: Arc<Shared<B>>,
}

impl<B> Clone for StreamBuffer<B> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<B> StreamBuffer<B> {
    pub fn new(settings: StreamSettings) -> Self {
        let now = Instant::now();

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: State::Open,
                    chunk: None,
                    forced_ready: false,
                    window_start: now,
                    last_put: now,
                    generation: 0,
                }),
                changed: Notify::new(),
                settings,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        match self.shared.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Waits for the next chunk. `Ok(None)` means the buffer was closed and fully drained.
    pub async fn take(&self) -> Result<Option<Chunk<B>>, IngestError> {
        let settings = self.shared.settings;

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);

            let deadline = {
                let mut guard = self.lock();
                let inner = &mut *guard;

                match &mut inner.state {
                    State::Failed(err) => {
                        return Err(err
                            .take()
                            .unwrap_or_else(|| anyhow!("stream buffer has failed").into()));
                    }
                    State::Closed => {
                        let chunk = inner.chunk.take();
                        self.shared.changed.notify_waiters();
                        return Ok(chunk);
                    }
                    State::Open => (),
                }

                let now = Instant::now();
                let wait_deadline = inner.window_start + settings.max_wait_time;
                let idle_deadline = inner.last_put + settings.max_idle_time;

                let ready = inner.chunk.as_ref().map(|chunk| {
                    inner.forced_ready
                        || chunk.bytes >= settings.min_bytes
                        || now >= wait_deadline
                        || now >= idle_deadline
                });

                match ready {
                    Some(true) => {
                        let chunk = inner.chunk.take();
                        inner.forced_ready = false;
                        inner.window_start = now;
                        inner.generation += 1;
                        self.shared.changed.notify_waiters();
                        return Ok(chunk);
                    }
                    Some(false) => {
                        notified.as_mut().enable();
                        Some(wait_deadline.min(idle_deadline))
                    }
                    None => {
                        notified.as_mut().enable();
                        None
                    }
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => (),
                        _ = sleep_until(deadline) => (),
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Appends records to the pending chunk. Suspends while the chunk holds `max_bytes` or more
    /// until the consumer takes it.
    pub async fn put(&self, blocks: Vec<B>, bytes: u64) -> Result<()> {
        let generation = {
            let mut guard = self.lock();
            let inner = &mut *guard;

            if !matches!(inner.state, State::Open) {
                bail!("buffer is closed");
            }

            inner.last_put = Instant::now();
            let chunk = inner.chunk.get_or_insert_with(|| Chunk {
                blocks: Vec::new(),
                bytes: 0,
            });
            chunk.bytes += bytes;
            chunk.blocks.extend(blocks);
            let full = chunk.bytes >= self.shared.settings.max_bytes;

            self.shared.changed.notify_waiters();

            if !full {
                return Ok(());
            }
            inner.generation
        };

        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);

            {
                let inner = self.lock();
                if inner.generation != generation || !matches!(inner.state, State::Open) {
                    return Ok(());
                }
                notified.as_mut().enable();
            }

            notified.await;
        }
    }

    /// Makes the pending chunk, if any, available immediately.
    pub fn ready(&self) {
        let mut inner = self.lock();
        if inner.chunk.is_some() {
            inner.forced_ready = true;
            self.shared.changed.notify_waiters();
        }
    }

    pub fn close(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, State::Open) {
            inner.state = State::Closed;
            self.shared.changed.notify_waiters();
        }
    }

    pub fn fail(&self, err: IngestError) {
        let mut inner = self.lock();
        if matches!(inner.state, State::Open) {
            inner.state = State::Failed(Some(err));
            self.shared.changed.notify_waiters();
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.lock().state, State::Open)
    }

    pub fn pending_bytes(&self) -> u64 {
        self.lock().chunk.as_ref().map(|c| c.bytes).unwrap_or(0)
    }
}
