//! This crate is a re-export of the portal streaming client with its block model and wire types.
//!
//! Find the ingestor, buffer and offset coordinator in `portal-client`, block/offset types in
//! `portal-format`, and query parameters in `portal-net-types`.

pub use portal_client as client;
pub use portal_format as format;
pub use portal_net_types as net_types;
