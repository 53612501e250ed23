use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use portal_format::{BlockRef, ChainContinuity, Offset, PendingOffset, StoredOffset};

/// Reason the coordinator asks the state for a rollback point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackEvent {
    /// Sent once before the first request of a resumed stream. The state verifies that the
    /// data it stored matches `expected_latest_offset` and repairs it if a previous run
    /// persisted data without its offset.
    OffsetCheck { expected_latest_offset: Offset },
    /// The portal reported a fork. `canonical_blocks` is its view of the chain right before
    /// the cursor, oldest first.
    BlockchainFork { canonical_blocks: Vec<BlockRef> },
}

/// Durable offset storage the coordinator resumes from and commits to.
#[async_trait]
pub trait State: Send + Sync {
    /// Returns the stored offsets, or `None` if nothing was committed yet. `default` is the
    /// offset the stream would start from without a stored one.
    async fn get_offset(&self, default: &Offset) -> Result<Option<StoredOffset>>;

    /// Records the offset of an acknowledged batch. Called once per ack, in delivery order.
    async fn commit_offset(&self, offset: &PendingOffset) -> Result<()>;

    /// Whether [`State::on_rollback`] is implemented. Without it forks are fatal.
    fn supports_rollback(&self) -> bool {
        false
    }

    /// Rolls the stored data back and returns the offset to continue after.
    async fn on_rollback(&self, event: RollbackEvent) -> Result<Offset> {
        Err(anyhow!("state does not support rollbacks, got {event:?}"))
    }
}

#[derive(Debug, Default)]
struct Inner {
    initial: Option<Offset>,
    /// Committed offsets, oldest first.
    history: Vec<PendingOffset>,
}

/// Keeps offsets in memory. Resolves forks against the chain continuity of its committed
/// offsets.
#[derive(Debug, Default)]
pub struct MemoryState {
    inner: Mutex<Inner>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last committed offset.
    pub fn latest(&self) -> Option<Offset> {
        self.lock().history.last().map(|p| p.latest.clone())
    }

    /// Number of committed offsets still kept for fork resolution.
    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl State for MemoryState {
    async fn get_offset(&self, default: &Offset) -> Result<Option<StoredOffset>> {
        let mut inner = self.lock();
        let initial = inner.initial.get_or_insert_with(|| default.clone()).clone();

        Ok(inner.history.last().map(|last| StoredOffset {
            latest: last.latest.clone(),
            initial,
        }))
    }

    async fn commit_offset(&self, offset: &PendingOffset) -> Result<()> {
        let mut inner = self.lock();
        if inner.initial.is_none() {
            inner.initial = Some(offset.latest.clone());
        }

        // records entirely below the finalized head can't take part in fork resolution
        if let Some(finalized) = &offset.finalized {
            inner
                .history
                .retain(|p| p.latest.number >= finalized.number);
        }
        inner.history.push(offset.clone());

        Ok(())
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn on_rollback(&self, event: RollbackEvent) -> Result<Offset> {
        let canonical_blocks = match event {
            RollbackEvent::OffsetCheck {
                expected_latest_offset,
            } => return Ok(expected_latest_offset),
            RollbackEvent::BlockchainFork { canonical_blocks } => canonical_blocks,
        };

        let mut inner = self.lock();
        let found = ChainContinuity::resolve_fork(
            inner.history.iter().rev().map(|p| &p.chain_continuity),
            &canonical_blocks,
        )
        .ok_or_else(|| {
            anyhow!(
                "none of {} canonical blocks were found in the committed chain continuity",
                canonical_blocks.len()
            )
        })?;

        inner.history.retain(|p| p.latest.number <= found.number);
        if inner.history.last().map(|p| p.latest.number) != Some(found.number) {
            inner.history.push(PendingOffset {
                latest: Offset::from(&found),
                finalized: None,
                chain_continuity: ChainContinuity::from_refs(vec![found.clone()]),
            });
        }

        Ok(Offset::from(&found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(latest: u64, finalized: Option<u64>, continuity: &[(u64, &str)]) -> PendingOffset {
        let refs = continuity
            .iter()
            .map(|(n, h)| BlockRef::new(*n, *h))
            .collect::<Vec<_>>();
        let hash = continuity
            .iter()
            .find(|(n, _)| *n == latest)
            .map(|(_, h)| h.to_string());

        PendingOffset {
            latest: Offset {
                number: latest,
                hash,
                timestamp: None,
            },
            finalized: finalized.map(|n| BlockRef::new(n, format!("0x{n}"))),
            chain_continuity: ChainContinuity::from_refs(refs),
        }
    }

    #[tokio::test]
    async fn nothing_stored_before_first_commit() {
        let state = MemoryState::new();
        assert_eq!(state.get_offset(&Offset::at(10)).await.unwrap(), None);

        state
            .commit_offset(&pending(12, None, &[(12, "0xc")]))
            .await
            .unwrap();

        let stored = state.get_offset(&Offset::at(0)).await.unwrap().unwrap();
        assert_eq!(stored.initial, Offset::at(10));
        assert_eq!(stored.latest.number, 12);
        assert_eq!(stored.latest.hash.as_deref(), Some("0xc"));
    }

    #[tokio::test]
    async fn fork_resolves_to_newest_shared_block() {
        let state = MemoryState::new();
        state
            .commit_offset(&pending(3, Some(1), &[(1, "0x1"), (2, "0x2"), (3, "0x3")]))
            .await
            .unwrap();
        state
            .commit_offset(&pending(5, Some(1), &[(4, "0x4"), (5, "0x5")]))
            .await
            .unwrap();

        let offset = state
            .on_rollback(RollbackEvent::BlockchainFork {
                canonical_blocks: vec![
                    BlockRef::new(2, "0x2"),
                    BlockRef::new(3, "0x3"),
                    BlockRef::new(4, "0x4b"),
                ],
            })
            .await
            .unwrap();

        assert_eq!(offset.number, 3);
        assert_eq!(offset.hash.as_deref(), Some("0x3"));
        assert_eq!(state.latest().unwrap().number, 3);
        assert_eq!(state.history_len(), 1);
    }

    #[tokio::test]
    async fn fork_below_committed_history_fails() {
        let state = MemoryState::new();
        state
            .commit_offset(&pending(5, Some(4), &[(4, "0x4"), (5, "0x5")]))
            .await
            .unwrap();

        let res = state
            .on_rollback(RollbackEvent::BlockchainFork {
                canonical_blocks: vec![BlockRef::new(4, "0x4b"), BlockRef::new(5, "0x5b")],
            })
            .await;

        assert!(res.is_err());
    }

    #[tokio::test]
    async fn offset_check_accepts_expected_offset() {
        let state = MemoryState::new();
        let expected = Offset::at(77);
        let res = state
            .on_rollback(RollbackEvent::OffsetCheck {
                expected_latest_offset: expected.clone(),
            })
            .await
            .unwrap();
        assert_eq!(res, expected);
    }

    #[tokio::test]
    async fn finalized_records_are_pruned() {
        let state = MemoryState::new();
        state
            .commit_offset(&pending(2, Some(1), &[(1, "0x1"), (2, "0x2")]))
            .await
            .unwrap();
        state
            .commit_offset(&pending(4, Some(3), &[(3, "0x3"), (4, "0x4")]))
            .await
            .unwrap();

        assert_eq!(state.history_len(), 1);
        assert_eq!(state.latest().unwrap().number, 4);
    }
}
