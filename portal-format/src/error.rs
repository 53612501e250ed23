use std::result::Result as StdResult;
use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(
        "Can't parse a block number from string \"{0}\". Valid examples: \"1000000\", \"1_000_000\", \"1,000,000\""
    )]
    InvalidBlockNumber(String),
    #[error("Invalid block range. \"to\" block {to} is lower than \"from\" block {from}.")]
    InvalidBlockRange { from: u64, to: u64 },
    #[error("Failed to decode block record:\n{0}")]
    DecodeBlock(serde_json::Error),
}

pub type Result<T> = StdResult<T, Error>;
