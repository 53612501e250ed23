use portal_format::BlockRef;
use serde::{Deserialize, Serialize};

/// Header carrying the hash of the finalized head on a `200` stream response.
pub const FINALIZED_HEAD_HASH_HEADER: &str = "x-sqd-finalized-head-hash";
/// Header carrying the number of the finalized head on a `200` stream response.
pub const FINALIZED_HEAD_NUMBER_HEADER: &str = "x-sqd-finalized-head-number";

/// Body of a `409 Conflict` stream response.
///
/// The portal returns its view of the canonical chain right before the
/// requested `fromBlock` so the client can find a common ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkResponse {
    pub previous_blocks: Vec<BlockRef>,
}
