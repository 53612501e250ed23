use serde::{Deserialize, Serialize};

use super::block::{BlockRef, PortalBlock};

/// A resumption point: "continue after this block".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    pub number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Offset {
    pub fn at(number: u64) -> Self {
        Self {
            number,
            ..Default::default()
        }
    }
}

impl From<&BlockRef> for Offset {
    fn from(block: &BlockRef) -> Self {
        Self {
            number: block.number,
            hash: Some(block.hash.clone()),
            timestamp: block.timestamp,
        }
    }
}

/// Offsets as returned by a state backend on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOffset {
    /// Last committed offset.
    pub latest: Offset,
    /// Offset the stream was first started from.
    pub initial: Offset,
}

/// Block references from the finalized head through the newest unfinalized block,
/// sorted newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainContinuity(Vec<BlockRef>);

impl ChainContinuity {
    /// Builds the continuity slice of a batch: blocks at or above the finalized head, newest first.
    ///
    /// Without a finalized head the slice is empty.
    pub fn from_batch<B: PortalBlock>(blocks: &[B], finalized: Option<&BlockRef>) -> Self {
        let Some(finalized) = finalized else {
            return Self::default();
        };

        let mut refs: Vec<BlockRef> = blocks
            .iter()
            .filter(|b| b.number() >= finalized.number)
            .map(|b| b.block_ref())
            .collect();
        refs.sort_by(|a, b| b.number.cmp(&a.number));

        Self(refs)
    }

    pub fn from_refs(mut refs: Vec<BlockRef>) -> Self {
        refs.sort_by(|a, b| b.number.cmp(&a.number));
        Self(refs)
    }

    pub fn blocks(&self) -> &[BlockRef] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Numbers decrease by exactly one from each entry to the next.
    pub fn is_contiguous(&self) -> bool {
        self.0
            .windows(2)
            .all(|w| w[1].number.checked_add(1) == Some(w[0].number))
    }

    /// Finds the newest canonical block recorded in `history` (newest record first).
    ///
    /// Walks every recorded block newest first. A candidate whose number and hash match a
    /// recorded block is the answer. Candidates at or above a visited block that did not
    /// match can no longer be the answer and are discarded.
    pub fn resolve_fork<'a, I>(history: I, canonical: &[BlockRef]) -> Option<BlockRef>
    where
        I: IntoIterator<Item = &'a ChainContinuity>,
    {
        let mut unforked: Vec<&BlockRef> = canonical.iter().collect();

        for record in history {
            for block in record.blocks() {
                if let Some(found) = unforked.iter().find(|u| u.same_block(block)) {
                    return Some((*found).clone());
                }

                unforked.retain(|u| u.number < block.number);
                if unforked.is_empty() {
                    return None;
                }
            }
        }

        None
    }
}

/// Bookkeeping record for one delivered batch, committed to the state on ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOffset {
    pub latest: Offset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized: Option<BlockRef>,
    pub chain_continuity: ChainContinuity,
}

impl PendingOffset {
    /// Computes the offset of a non-empty batch. Returns `None` for an empty one.
    pub fn from_batch<B: PortalBlock>(blocks: &[B], finalized: Option<&BlockRef>) -> Option<Self> {
        let last = blocks.last()?;

        Some(Self {
            latest: Offset::from(&last.block_ref()),
            finalized: finalized.cloned(),
            chain_continuity: ChainContinuity::from_batch(blocks, finalized),
        })
    }
}
