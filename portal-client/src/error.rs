use portal_format::BlockRef;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::util::format_number;

/// The portal refused the cursor because its chain no longer contains `parent_block_hash`.
///
/// Carries the portal's view of the canonical blocks right before `from_block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkDetected {
    pub previous_blocks: Vec<BlockRef>,
    pub from_block: Option<u64>,
    pub parent_block_hash: Option<String>,
}

impl std::fmt::Display for ForkDetected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let block = match self.from_block {
            Some(n) if n > 0 => format_number(n),
            _ => "last".to_owned(),
        };
        let correct = self
            .previous_blocks
            .iter()
            .max_by_key(|b| b.number)
            .map(|b| b.hash.as_str())
            .unwrap_or_default();
        let provided = self.parent_block_hash.as_deref().unwrap_or_default();

        writeln!(f, "A blockchain fork was detected at {block} block.")?;
        writeln!(f, "-----------------------------------------")?;
        writeln!(f, "The correct hash:        \"{correct}\".")?;
        writeln!(f, "But the client provided: \"{provided}\".")?;
        writeln!(f, "-----------------------------------------")?;
        write!(f, "Please refer to the documentation on how to handle forks.")
    }
}

impl std::error::Error for ForkDetected {}

/// Outcome of an ingestion attempt that did not produce data.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fork(#[from] ForkDetected),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl IngestError {
    pub fn is_fork(&self) -> bool {
        matches!(self, Self::Fork(_))
    }
}

/// Non-retryable or exhausted-retries response status.
#[derive(Debug, Error)]
#[error("Got {} from {}", .status.as_u16(), .url)]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub url: Url,
    pub body: Option<String>,
}
