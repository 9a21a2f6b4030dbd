use serde::{Deserialize, Serialize};

use crate::{
    error::EngineError,
    matching::Matching,
    model::{OfferId, RequestId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPair {
    pub offer_id: OfferId,
    pub request_id: RequestId,
}

/// Externally visible result of a matching run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchingReport {
    pub matched_count: usize,
    pub total_requests: usize,
    /// Sorted by offer id.
    pub pairs: Vec<MatchPair>,
}

impl MatchingReport {
    pub fn new(matching: &Matching, total_requests: usize) -> Self {
        let pairs: Vec<MatchPair> = matching
            .iter()
            .map(|(offer_id, request_id)| MatchPair {
                offer_id,
                request_id,
            })
            .collect();
        Self {
            matched_count: pairs.len(),
            total_requests,
            pairs,
        }
    }
}

/// Where the stored match set lives.
///
/// `replace_matches` must swap the whole stored set for `pairs` atomically:
/// on error the previous set is still in place.
pub trait MatchSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn replace_matches(&self, pairs: &[MatchPair]) -> Result<(), Self::Error>;
}

/// Turns `matching` into a report and hands its pairs to `sink` in one call.
pub fn materialize<S: MatchSink>(
    matching: &Matching,
    total_requests: usize,
    sink: &S,
) -> Result<MatchingReport, EngineError> {
    let report = MatchingReport::new(matching, total_requests);
    sink.replace_matches(&report.pairs)
        .map_err(|e| EngineError::Sink(Box::new(e)))?;
    Ok(report)
}
