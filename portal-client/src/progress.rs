use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{
    util::{display_estimated_time, format_decimal, format_number, human_bytes},
    Client,
};

/// How often the head is asked for when the range is open ended.
const HEAD_REFRESH: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Rate {
    pub count: u64,
    pub per_second: f64,
}

/// Snapshot handed to the progress hook.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressState {
    /// Block the stream started from.
    pub initial: u64,
    /// Block the stream is heading to, the range end or the portal head.
    pub last: u64,
    /// Last acknowledged block.
    pub current: u64,
    pub percent: f64,
    /// `None` while nothing is moving.
    pub eta: Option<Duration>,
    pub processed_blocks: Rate,
    pub bytes_downloaded: Rate,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    block_number: u64,
    bytes: u64,
}

/// Rolling window of acknowledged progress samples.
#[derive(Debug)]
pub struct ProgressHistory {
    max_history: usize,
    max_stale: Duration,
    samples: VecDeque<Sample>,
}

impl Default for ProgressHistory {
    fn default() -> Self {
        Self::new(50, Duration::from_secs(30))
    }
}

impl ProgressHistory {
    pub fn new(max_history: usize, max_stale: Duration) -> Self {
        Self {
            max_history: max_history.max(1),
            max_stale,
            samples: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Records that the stream reached `block_number` after downloading `bytes` more.
    pub fn add(&mut self, now: Instant, block_number: u64, bytes: u64) {
        if let Some(newest) = self.samples.back() {
            // the stream was stuck, start over
            if now.duration_since(newest.at) > self.max_stale {
                self.samples.clear();
            }
        }

        self.samples.push_back(Sample {
            at: now,
            block_number,
            bytes,
        });
        while self.samples.len() > self.max_history {
            self.samples.pop_front();
        }
    }

    pub fn calculate(&mut self, now: Instant, initial: u64, current: u64, last: u64) -> ProgressState {
        if let Some(newest) = self.samples.back() {
            if now.duration_since(newest.at) > self.max_stale {
                self.samples.clear();
            }
        }

        let (blocks, bytes) = match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(newest)) if self.samples.len() >= 2 => (
                newest.block_number.saturating_sub(first.block_number),
                self.samples.iter().map(|s| s.bytes).sum(),
            ),
            (Some(only), _) => (0, only.bytes),
            _ => (0, 0),
        };

        let elapsed = self
            .samples
            .front()
            .map(|first| now.duration_since(first.at).as_secs_f64())
            .unwrap_or_default();
        let per_second = |count: u64| {
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };

        let blocks_total = last.saturating_sub(initial);
        let blocks_processed = current.saturating_sub(initial);
        let blocks_remaining = last.saturating_sub(current);
        let blocks_per_second = per_second(blocks);

        ProgressState {
            initial,
            last,
            current,
            percent: if blocks_total > 0 {
                blocks_processed as f64 / blocks_total as f64 * 100.0
            } else {
                0.0
            },
            eta: (blocks_per_second > 0.0)
                .then(|| blocks_remaining as f64 / blocks_per_second)
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            processed_blocks: Rate {
                count: blocks,
                per_second: blocks_per_second,
            },
            bytes_downloaded: Rate {
                count: bytes,
                per_second: per_second(bytes),
            },
        }
    }
}

/// Default progress hook.
pub fn log_progress(state: &ProgressState) {
    let blocks_per_second = if state.processed_blocks.per_second > 10.0 {
        format_number(state.processed_blocks.per_second as u64)
    } else {
        format!("{:.1}", state.processed_blocks.per_second)
    };

    log::info!(
        "{} / {} ({}%), {}, {} blocks/second, {}/second",
        format_number(state.current),
        format_number(state.last),
        format_decimal(state.percent),
        display_estimated_time(state.eta),
        blocks_per_second,
        human_bytes(state.bytes_downloaded.per_second),
    );
}

pub type ProgressHook = Arc<dyn Fn(&ProgressState) + Send + Sync>;

/// Where the progress target comes from.
#[derive(Clone)]
pub(crate) enum LastBlock {
    Fixed(u64),
    Head(Client),
}

#[derive(Debug)]
struct Tracked {
    history: ProgressHistory,
    initial: u64,
    current: Option<u64>,
    bytes_total: u64,
}

/// Feeds acknowledged offsets into a [`ProgressHistory`] and reports on an interval.
///
/// The reporting task stops when the tracker is dropped.
pub struct ProgressTracker {
    tracked: Arc<Mutex<Tracked>>,
    _guard: DropGuard,
}

impl ProgressTracker {
    pub(crate) fn start(initial: u64, last: LastBlock, interval: Duration, hook: ProgressHook) -> Self {
        let tracked = Arc::new(Mutex::new(Tracked {
            history: ProgressHistory::default(),
            initial,
            current: None,
            bytes_total: 0,
        }));
        let cancel = CancellationToken::new();

        tokio::spawn(report(tracked.clone(), last, interval, hook, cancel.clone()));

        Self {
            tracked,
            _guard: cancel.drop_guard(),
        }
    }

    /// `bytes_total` is the running byte counter of the client, deltas are derived here.
    pub fn track(&self, block_number: u64, bytes_total: u64) {
        let mut tracked = lock(&self.tracked);
        let delta = bytes_total.saturating_sub(tracked.bytes_total);
        tracked.bytes_total = bytes_total;
        tracked.current = Some(block_number);
        tracked.history.add(Instant::now(), block_number, delta);
    }
}

fn lock(m: &Mutex<Tracked>) -> std::sync::MutexGuard<'_, Tracked> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn report(
    tracked: Arc<Mutex<Tracked>>,
    target: LastBlock,
    interval: Duration,
    hook: ProgressHook,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut head: Option<(Instant, u64)> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let current = match lock(&tracked).current {
            Some(current) => current,
            None => continue,
        };

        let last = match &target {
            LastBlock::Fixed(to) => *to,
            LastBlock::Head(client) => {
                let stale = head.map_or(true, |(at, _)| at.elapsed() >= HEAD_REFRESH);
                if stale {
                    match client.get_head().await {
                        Ok(h) => head = Some((Instant::now(), h.map_or(0, |h| h.number))),
                        Err(e) => log::debug!("failed to refresh head for progress: {e:?}"),
                    }
                }
                head.map_or(0, |(_, n)| n).max(current)
            }
        };

        let state = {
            let mut tracked = lock(&tracked);
            let initial = tracked.initial;
            tracked
                .history
                .calculate(Instant::now(), initial, current, last)
        };
        hook(&state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rates_over_window() {
        let mut history = ProgressHistory::default();
        let start = Instant::now();

        history.add(start, 100, 1000);
        history.add(start + Duration::from_secs(5), 150, 1000);
        history.add(start + Duration::from_secs(10), 200, 2000);

        let state = history.calculate(start + Duration::from_secs(10), 0, 200, 400);

        assert_eq!(state.processed_blocks.count, 100);
        assert_eq!(state.processed_blocks.per_second, 10.0);
        assert_eq!(state.bytes_downloaded.count, 4000);
        assert_eq!(state.percent, 50.0);
        assert_eq!(state.eta, Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn percent_is_clamped() {
        let mut history = ProgressHistory::default();
        let now = Instant::now();

        let state = history.calculate(now, 500, 400, 1000);
        assert_eq!(state.percent, 0.0);

        let state = history.calculate(now, 500, 600, 400);
        assert_eq!(state.percent, 0.0);
        assert_eq!(state.eta, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_history_is_reset() {
        let mut history = ProgressHistory::default();
        let start = Instant::now();

        history.add(start, 1, 10);
        history.add(start + Duration::from_secs(1), 2, 10);
        history.add(start + Duration::from_secs(60), 3, 10);
        assert_eq!(history.len(), 1);

        let state = history.calculate(start + Duration::from_secs(120), 0, 3, 10);
        assert!(history.is_empty());
        assert_eq!(state.processed_blocks.count, 0);
        assert_eq!(state.eta, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_eta_is_unknown() {
        let mut history = ProgressHistory::default();
        let start = Instant::now();

        history.add(start, 1, 10);
        history.add(start + Duration::from_secs(20), 2, 10);

        let state = history.calculate(start + Duration::from_secs(20), 0, 2, u64::MAX);
        assert_eq!(state.processed_blocks.count, 1);
        assert!(state.processed_blocks.per_second > 0.0);
        assert_eq!(state.eta, None);
    }

    #[tokio::test(start_paused = true)]
    async fn window_is_bounded() {
        let mut history = ProgressHistory::new(3, Duration::from_secs(30));
        let start = Instant::now();
        for i in 0..10 {
            history.add(start + Duration::from_secs(i), i, 1);
        }
        assert_eq!(history.len(), 3);

        let state = history.calculate(start + Duration::from_secs(9), 0, 9, 9);
        assert_eq!(state.processed_blocks.count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_reports_on_interval() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let tracker = ProgressTracker::start(
            0,
            LastBlock::Fixed(100),
            Duration::from_secs(5),
            Arc::new(move |state: &ProgressState| sink.lock().unwrap().push(*state)),
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(reports.lock().unwrap().is_empty());

        tracker.track(25, 1024);
        tokio::time::sleep(Duration::from_secs(5)).await;

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].current, 25);
        assert_eq!(reports[0].last, 100);
        assert_eq!(reports[0].percent, 25.0);
    }
}
