//! Concrete upstream adapters.

mod yahoo;

pub use yahoo::{default_source_retry, YahooQuoteSource, DEFAULT_YAHOO_BASE_URL};
