use std::time::Instant;

use tracing::info;

use crate::{
    error::EngineError,
    graph::build_graph,
    materialize::{materialize, MatchSink, MatchingReport},
    matching::maximum_matching,
    model::{Offer, Request},
    schedule::OverlapPolicy,
};

/// Point-in-time view of all offers and requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub offers: Vec<Offer>,
    pub requests: Vec<Request>,
}

pub trait SnapshotProvider {
    type Error: std::error::Error + Send + Sync + 'static;

    fn snapshot(&self) -> Result<Snapshot, Self::Error>;
}

impl SnapshotProvider for Snapshot {
    type Error = std::convert::Infallible;

    fn snapshot(&self) -> Result<Snapshot, Self::Error> {
        Ok(self.clone())
    }
}

/// Matches every offer in `snapshot` against the requests without touching storage.
pub fn compute(snapshot: &Snapshot, policy: &OverlapPolicy) -> Result<MatchingReport, EngineError> {
    let graph = build_graph(&snapshot.offers, &snapshot.requests, policy)?;
    let matching = maximum_matching(&graph);
    Ok(MatchingReport::new(&matching, snapshot.requests.len()))
}

/// One full recompute: snapshot, build, solve, and replace the stored matches.
pub fn run_matching<P, S>(
    provider: &P,
    sink: &S,
    policy: &OverlapPolicy,
) -> Result<MatchingReport, EngineError>
where
    P: SnapshotProvider,
    S: MatchSink,
{
    let started = Instant::now();
    let snapshot = provider
        .snapshot()
        .map_err(|e| EngineError::Snapshot(Box::new(e)))?;

    let graph = build_graph(&snapshot.offers, &snapshot.requests, policy)?;
    let matching = maximum_matching(&graph);
    let report = materialize(&matching, snapshot.requests.len(), sink)?;

    info!(
        offers = snapshot.offers.len(),
        requests = report.total_requests,
        edges = graph.edge_count(),
        matched = report.matched_count,
        phases = matching.phases(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "matching run finished"
    );
    Ok(report)
}
