//! # Portal Format
//!
//! Value types shared by the portal ingestor, the offset coordinator and state backends.
//!
//! Nothing in here interprets block contents. A block record only has to expose the
//! `number`/`hash`/`timestamp` triple of its header, see [`PortalBlock`].
//!
//! ## Key Types
//!
//! - [`BlockRef`] - A block identified by number and hash
//! - [`Offset`] - A resumption point, "continue after this block"
//! - [`ChainContinuity`] - Recent block references, newest first
//! - [`PendingOffset`] - Bookkeeping record of one delivered, unacknowledged batch
//! - [`PortalRange`] - User supplied block range, parsed with [`PortalRange::parse`]
//!
//! ## Example
//!
//! ```
//! use portal_format::{PortalRange, RangeBound};
//!
//! let range = PortalRange {
//!     from: RangeBound::Text("1_000_000".into()),
//!     to: Some(RangeBound::Text("+500".into())),
//! };
//! let parsed = range.parse()?;
//! assert_eq!(parsed.from, 1_000_000);
//! assert_eq!(parsed.to, Some(1_000_500));
//! # Ok::<(), portal_format::Error>(())
//! ```

mod error;
mod range;
mod types;

pub use error::{Error, Result};
pub use range::{parse_block_number, ParsedRange, PortalRange, RangeBound};
pub use types::{
    block::{BlockHeader, BlockRef, PortalBlock, RawBlock},
    offset::{ChainContinuity, Offset, PendingOffset, StoredOffset},
};
