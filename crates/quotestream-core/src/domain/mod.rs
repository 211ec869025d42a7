//! # Domain Models
//!
//! Canonical quote types flowing through the ingestion pipeline.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Ticker`] | Validated `^[A-Z]{1,5}$` symbol used in configuration |
//! | [`UtcDateTime`] | RFC3339 timestamp, UTC by construction |
//! | [`QuoteSource`] | Allow-list of origin identifiers |
//! | [`Quote`] | Single price observation, validated at publish time |
//! | [`Batch`] | Non-empty, bounded chunk of quotes for one storage request |
//!
//! Quotes are created by a data source, consumed once by the publisher and
//! then dropped. Nothing here is persisted.

mod batch;
mod quote;
mod ticker;
mod timestamp;

pub use batch::{Batch, MAX_BATCH};
pub use quote::{decode_wire_batch, encode_wire_batch, Quote, QuoteSource, WireBatch};
pub use ticker::Ticker;
pub use timestamp::UtcDateTime;
