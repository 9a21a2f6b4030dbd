use std::collections::HashMap;

use tracing::debug;

use crate::{
    error::EngineError,
    model::{Offer, OfferId, Request, RequestId},
    schedule::OverlapPolicy,
};

/// Offers on the left, requests on the right, edges only from left to right.
///
/// Vertices are addressed by their insertion index. Adjacency lists keep the
/// order edges were added in, which fixes the solver's tie-breaking.
#[derive(Default, Debug, Clone)]
pub struct BipartiteGraph {
    offers: Vec<OfferId>,
    requests: Vec<RequestId>,
    edges: Vec<Vec<usize>>,
    offer_index: HashMap<OfferId, usize>,
    request_index: HashMap<RequestId, usize>,
}

impl BipartiteGraph {
    pub fn add_offer(&mut self, offer: OfferId) -> usize {
        assert!(
            !self.offer_index.contains_key(&offer),
            "offer {offer} added twice"
        );
        let id = self.offers.len();
        self.offers.push(offer);
        self.edges.push(Vec::new());
        self.offer_index.insert(offer, id);
        id
    }

    pub fn add_request(&mut self, request: RequestId) -> usize {
        assert!(
            !self.request_index.contains_key(&request),
            "request {request} added twice"
        );
        let id = self.requests.len();
        self.requests.push(request);
        self.request_index.insert(request, id);
        id
    }

    pub fn add_edge(&mut self, offer: usize, request: usize) {
        assert!(self.offers.len() > offer);
        assert!(self.requests.len() > request);
        self.edges[offer].push(request);
    }

    pub fn offer_count(&self) -> usize {
        self.offers.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }

    pub fn offer(&self, id: usize) -> OfferId {
        self.offers[id]
    }

    pub fn request(&self, id: usize) -> RequestId {
        self.requests[id]
    }

    pub fn offer_position(&self, offer: OfferId) -> Option<usize> {
        self.offer_index.get(&offer).copied()
    }

    pub fn request_position(&self, request: RequestId) -> Option<usize> {
        self.request_index.get(&request).copied()
    }

    pub fn edges_for(&self, offer: usize) -> &[usize] {
        &self.edges[offer]
    }

    /// Compatible requests of `offer` by id, in adjacency order.
    pub fn neighbours(&self, offer: OfferId) -> Option<Vec<RequestId>> {
        let id = self.offer_position(offer)?;
        Some(self.edges[id].iter().map(|r| self.requests[*r]).collect())
    }

    pub fn has_edge(&self, offer: OfferId, request: RequestId) -> bool {
        match (self.offer_position(offer), self.request_position(request)) {
            (Some(o), Some(r)) => self.edges[o].contains(&r),
            _ => false,
        }
    }
}

/// Builds the compatibility graph: an edge joins an offer and a request when
/// they share a subject and `policy` finds a common slot.
///
/// Offers and adjacency lists are laid out in ascending id order. Every offer
/// becomes a vertex, including those without any compatible request.
pub fn build_graph(
    offers: &[Offer],
    requests: &[Request],
    policy: &OverlapPolicy,
) -> Result<BipartiteGraph, EngineError> {
    let mut offers: Vec<&Offer> = offers.iter().collect();
    offers.sort_by_key(|o| o.id);
    if let Some(pair) = offers.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(EngineError::DuplicateId {
            entity: "offer",
            id: pair[0].id.0,
        });
    }

    let mut requests: Vec<&Request> = requests.iter().collect();
    requests.sort_by_key(|r| r.id);
    if let Some(pair) = requests.windows(2).find(|w| w[0].id == w[1].id) {
        return Err(EngineError::DuplicateId {
            entity: "request",
            id: pair[0].id.0,
        });
    }

    let mut graph = BipartiteGraph::default();
    let mut by_subject: HashMap<&str, Vec<(usize, &Request)>> = HashMap::new();
    for request in requests {
        let index = graph.add_request(request.id);
        by_subject
            .entry(request.subject.as_str())
            .or_default()
            .push((index, request));
    }

    for offer in offers {
        let index = graph.add_offer(offer.id);
        let Some(candidates) = by_subject.get(offer.subject.as_str()) else {
            continue;
        };
        for (request_index, request) in candidates {
            if policy.overlaps(&offer.availability, &request.availability) {
                graph.add_edge(index, *request_index);
            }
        }
    }

    debug!(
        offers = graph.offer_count(),
        requests = graph.request_count(),
        edges = graph.edge_count(),
        subjects = by_subject.len(),
        "built compatibility graph"
    );
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{ClassRange, UserId},
        schedule::{Availability, Weekday},
    };

    fn offer(id: i64, subject: &str, day: Weekday, slot: u8) -> Offer {
        Offer::new(
            id,
            UserId(id),
            subject,
            Availability::new().with(day, [slot]),
            ClassRange { min: 1, max: 13 },
        )
    }

    fn request(id: i64, subject: &str, day: Weekday, slot: u8) -> Request {
        Request::new(id, UserId(100 + id), subject, Availability::new().with(day, [slot]))
    }

    #[test]
    fn edges_need_subject_and_slot() {
        let offers = [
            offer(1, "MA", Weekday::Mon, 1),
            offer(2, "DE", Weekday::Mon, 1),
        ];
        let requests = [
            request(10, "MA", Weekday::Mon, 1),
            request(11, "MA", Weekday::Mon, 2),
            request(12, "DE", Weekday::Tue, 1),
        ];
        let graph = build_graph(&offers, &requests, &OverlapPolicy::default()).unwrap();

        assert_eq!(graph.edge_count(), 1);
        assert!(graph.has_edge(OfferId(1), RequestId(10)));
        assert!(!graph.has_edge(OfferId(1), RequestId(11)));
        assert_eq!(graph.neighbours(OfferId(2)), Some(vec![]));
    }

    #[test]
    fn offers_without_partners_stay_in_the_graph() {
        let offers = [offer(5, "PH", Weekday::Fri, 3)];
        let graph = build_graph(&offers, &[], &OverlapPolicy::default()).unwrap();
        assert_eq!(graph.offer_count(), 1);
        assert_eq!(graph.request_count(), 0);
        assert_eq!(graph.neighbours(OfferId(5)), Some(vec![]));
    }

    #[test]
    fn layout_is_sorted_by_id_regardless_of_input_order() {
        let offers = [
            offer(3, "MA", Weekday::Wed, 1),
            offer(1, "MA", Weekday::Wed, 1),
        ];
        let requests = [
            request(30, "MA", Weekday::Wed, 1),
            request(20, "MA", Weekday::Wed, 1),
            request(25, "EN", Weekday::Wed, 1),
        ];
        let graph = build_graph(&offers, &requests, &OverlapPolicy::default()).unwrap();

        assert_eq!(graph.offer(0), OfferId(1));
        assert_eq!(graph.offer(1), OfferId(3));
        assert_eq!(
            graph.neighbours(OfferId(3)),
            Some(vec![RequestId(20), RequestId(30)])
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let offers = [
            offer(1, "MA", Weekday::Mon, 1),
            offer(1, "DE", Weekday::Tue, 2),
        ];
        let err = build_graph(&offers, &[], &OverlapPolicy::default()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DuplicateId {
                entity: "offer",
                id: 1
            }
        ));
    }

    #[test]
    fn policy_controls_weekend_edges() {
        let offers = [offer(1, "MA", Weekday::Sun, 4)];
        let requests = [request(2, "MA", Weekday::Sun, 4)];

        let school = build_graph(&offers, &requests, &OverlapPolicy::default()).unwrap();
        assert_eq!(school.edge_count(), 0);

        let full = build_graph(&offers, &requests, &OverlapPolicy::new(Weekday::ALL)).unwrap();
        assert_eq!(full.edge_count(), 1);
    }
}
