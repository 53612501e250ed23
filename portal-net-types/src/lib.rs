//! Portal network types for transport and queries.
//!
//! Queries are sent as JSON to the `stream`/`finalized-stream` endpoints. Responses are
//! newline delimited block records; the few non-record payloads (fork signal, finalized
//! head headers) are described in [`response`].

pub mod query;
pub mod response;

pub use query::{ChainKind, FieldSelection, Query};
pub use response::{
    ForkResponse, FINALIZED_HEAD_HASH_HEADER, FINALIZED_HEAD_NUMBER_HEADER,
};
