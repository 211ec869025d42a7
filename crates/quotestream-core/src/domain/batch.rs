use std::ops::Deref;

use crate::{Quote, ValidationError};

/// Documented storage ceiling for one batch request.
pub const MAX_BATCH: usize = 1000;

/// Ordered, non-empty group of quotes sent in one downstream request.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch(Vec<Quote>);

impl Batch {
    pub fn new(quotes: Vec<Quote>, max: usize) -> Result<Self, ValidationError> {
        if quotes.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if quotes.len() > max {
            return Err(ValidationError::BatchTooLarge {
                len: quotes.len(),
                max,
            });
        }
        Ok(Self(quotes))
    }

    /// Splits `quotes` into batches of at most `max`, preserving order.
    pub fn split(quotes: Vec<Quote>, max: usize) -> Result<Vec<Self>, ValidationError> {
        if quotes.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        let max = max.clamp(1, MAX_BATCH);

        let mut batches = Vec::with_capacity(quotes.len().div_ceil(max));
        let mut remaining = quotes.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<Quote> = remaining.by_ref().take(max).collect();
            batches.push(Self(chunk));
        }
        Ok(batches)
    }

    /// Fail-fast validation: the first invalid quote rejects the whole batch.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (index, quote) in self.0.iter().enumerate() {
            quote
                .validate()
                .map_err(|reason| ValidationError::InvalidQuoteInBatch {
                    index,
                    reason: Box::new(reason),
                })?;
        }
        Ok(())
    }

    pub fn quotes(&self) -> &[Quote] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Quote> {
        self.0
    }
}

impl Deref for Batch {
    type Target = [Quote];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{QuoteSource, UtcDateTime};

    fn quotes(count: usize) -> Vec<Quote> {
        let ts = UtcDateTime::parse("2025-12-22T15:30:00Z").expect("timestamp");
        (0..count)
            .map(|i| Quote::new("AAPL", ts, 100.0 + i as f64, QuoteSource::Yfinance))
            .collect()
    }

    #[test]
    fn split_preserves_order_and_sizes() {
        let batches = Batch::split(quotes(2500), 1000).expect("split");
        let sizes: Vec<usize> = batches.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
        assert_eq!(batches[1][0].close(), 1100.0);
        assert_eq!(batches[2][499].close(), 2599.0);
    }

    #[test]
    fn split_rejects_empty_input() {
        assert_eq!(Batch::split(Vec::new(), 10), Err(ValidationError::EmptyBatch));
    }

    #[test]
    fn split_never_exceeds_storage_ceiling() {
        let batches = Batch::split(quotes(1200), 5000).expect("split");
        assert!(batches.iter().all(|b| b.len() <= MAX_BATCH));
        assert_eq!(batches.len(), 2);
    }

    #[test]
    fn new_enforces_bounds() {
        assert_eq!(Batch::new(Vec::new(), 3), Err(ValidationError::EmptyBatch));
        assert_eq!(
            Batch::new(quotes(4), 3),
            Err(ValidationError::BatchTooLarge { len: 4, max: 3 })
        );
    }

    #[test]
    fn validate_reports_first_bad_index() {
        let ts = UtcDateTime::parse("2025-12-22T15:30:00Z").expect("timestamp");
        let mut input = quotes(3);
        input.push(Quote::new("TSLA", ts, -5.0, QuoteSource::Yfinance));
        input.push(Quote::new("bad", ts, 5.0, QuoteSource::Yfinance));
        let batch = Batch::new(input, MAX_BATCH).expect("batch");

        match batch.validate() {
            Err(ValidationError::InvalidQuoteInBatch { index, .. }) => assert_eq!(index, 3),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
