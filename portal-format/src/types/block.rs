use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies a block by number and hash. The timestamp is informational.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl BlockRef {
    pub fn new(number: u64, hash: impl Into<String>) -> Self {
        Self {
            number,
            hash: hash.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Whether both refs point at the same block. Timestamps are ignored.
    pub fn same_block(&self, other: &BlockRef) -> bool {
        self.number == other.number && self.hash == other.hash
    }
}

/// Header part of a portal block record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Any other header fields that were selected in the query.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A block record as it comes over the wire.
///
/// Only the header is typed; the rest of the record (transactions, logs, instructions...)
/// is kept as raw JSON for the decoder layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub header: BlockHeader,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// Anything the ingestor can decode from an NDJSON line and advance its cursor with.
pub trait PortalBlock: DeserializeOwned + Send + 'static {
    fn number(&self) -> u64;
    fn hash(&self) -> &str;
    fn timestamp(&self) -> Option<u64>;

    fn block_ref(&self) -> BlockRef {
        BlockRef {
            number: self.number(),
            hash: self.hash().to_owned(),
            timestamp: self.timestamp(),
        }
    }
}

impl PortalBlock for RawBlock {
    fn number(&self) -> u64 {
        self.header.number
    }

    fn hash(&self) -> &str {
        &self.header.hash
    }

    fn timestamp(&self) -> Option<u64> {
        self.header.timestamp
    }
}

impl RawBlock {
    /// Decodes a single NDJSON line.
    pub fn from_line(line: &str) -> crate::Result<Self> {
        serde_json::from_str(line).map_err(crate::Error::DecodeBlock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_block_keeps_unknown_fields() {
        let line = r#"{"header":{"number":1,"hash":"0x123","timestamp":1000,"parentHash":"0x0"},"logs":[{"logIndex":0}]}"#;
        let block = RawBlock::from_line(line).unwrap();

        assert_eq!(block.number(), 1);
        assert_eq!(block.hash(), "0x123");
        assert_eq!(block.timestamp(), Some(1000));
        assert_eq!(block.header.extra["parentHash"], "0x0");
        assert!(block.data.contains_key("logs"));
        assert_eq!(
            block.block_ref(),
            BlockRef::new(1, "0x123").with_timestamp(1000)
        );
    }

    #[test]
    fn raw_block_rejects_missing_header() {
        assert!(RawBlock::from_line(r#"{"logs":[]}"#).is_err());
    }

    #[test]
    fn same_block_ignores_timestamp() {
        let a = BlockRef::new(10, "0xa").with_timestamp(5);
        let b = BlockRef::new(10, "0xa");
        assert!(a.same_block(&b));
        assert!(!a.same_block(&BlockRef::new(10, "0xb")));
    }
}
