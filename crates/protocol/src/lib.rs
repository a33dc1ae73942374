//! Wire payloads for Galley chunked file transfers.
//!
//! Every caller-facing transfer operation maps to one request/response
//! pair defined in [`messages`]. The transport (HTTP, RPC, WebSocket) is
//! left to the embedding service; these types only fix the JSON shape.

pub mod constants;
pub mod messages;
pub mod types;

pub use types::{ErrorBody, ErrorKind, FileMeta, Purpose, PurposeFields, UnknownPurpose};
