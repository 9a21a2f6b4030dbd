use std::collections::{BTreeMap, VecDeque};

use tracing::trace;

use crate::{
    graph::BipartiteGraph,
    model::{OfferId, RequestId},
};

const UNREACHED: u32 = u32::MAX;

/// A set of compatibility edges in which no offer and no request repeats.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Matching {
    pairs: BTreeMap<OfferId, RequestId>,
    phases: usize,
}

impl Matching {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, offer: OfferId) -> Option<RequestId> {
        self.pairs.get(&offer).copied()
    }

    /// Pairs in ascending offer id order.
    pub fn iter(&self) -> impl Iterator<Item = (OfferId, RequestId)> + '_ {
        self.pairs.iter().map(|(o, r)| (*o, *r))
    }

    /// Number of augmenting phases the solver ran.
    pub fn phases(&self) -> usize {
        self.phases
    }
}

/// Working state of one Hopcroft-Karp run.
struct Solver<'g> {
    graph: &'g BipartiteGraph,
    offer_match: Vec<Option<usize>>,
    request_match: Vec<Option<usize>>,
    /// BFS layer per offer; `UNREACHED` also marks offers pruned during DFS.
    layer: Vec<u32>,
    /// Layer of the offers from which a free request was first reached.
    free_layer: u32,
    /// Requests already on an augmenting path (or proven dead) this phase.
    consumed: Vec<bool>,
    queue: VecDeque<usize>,
    /// DFS frames: an offer and the position of its next edge to try.
    path: Vec<(usize, usize)>,
}

impl<'g> Solver<'g> {
    fn new(graph: &'g BipartiteGraph) -> Self {
        Self {
            graph,
            offer_match: vec![None; graph.offer_count()],
            request_match: vec![None; graph.request_count()],
            layer: vec![UNREACHED; graph.offer_count()],
            free_layer: UNREACHED,
            consumed: vec![false; graph.request_count()],
            queue: VecDeque::with_capacity(graph.offer_count()),
            path: Vec::new(),
        }
    }

    fn with_matching(graph: &'g BipartiteGraph, matching: &Matching) -> Self {
        let mut solver = Self::new(graph);
        for (offer, request) in matching.iter() {
            let (Some(o), Some(r)) = (graph.offer_position(offer), graph.request_position(request))
            else {
                continue;
            };
            solver.offer_match[o] = Some(r);
            solver.request_match[r] = Some(o);
        }
        solver
    }

    /// Layers the alternating graph from all free offers. Returns whether a
    /// free request is reachable, i.e. whether an augmenting path exists.
    fn bfs(&mut self) -> bool {
        self.queue.clear();
        for (offer, partner) in self.offer_match.iter().enumerate() {
            if partner.is_none() {
                self.layer[offer] = 0;
                self.queue.push_back(offer);
            } else {
                self.layer[offer] = UNREACHED;
            }
        }
        self.free_layer = UNREACHED;

        while let Some(offer) = self.queue.pop_front() {
            // Paths longer than the shortest augmenting path are not needed.
            if self.layer[offer] >= self.free_layer {
                break;
            }
            for &request in self.graph.edges_for(offer) {
                match self.request_match[request] {
                    None => {
                        if self.free_layer == UNREACHED {
                            self.free_layer = self.layer[offer];
                        }
                    }
                    Some(next) if self.layer[next] == UNREACHED => {
                        self.layer[next] = self.layer[offer] + 1;
                        self.queue.push_back(next);
                    }
                    Some(_) => {}
                }
            }
        }

        self.free_layer != UNREACHED
    }

    /// Searches a layered augmenting path from `root` and flips it on success.
    ///
    /// Frames live on `self.path` rather than the call stack, so a path
    /// through every vertex of a large graph is fine.
    fn augment(&mut self, root: usize) -> bool {
        let graph = self.graph;
        let mut path = std::mem::take(&mut self.path);
        path.clear();
        path.push((root, 0));

        let mut found = false;
        while let Some(&(offer, cursor)) = path.last() {
            let Some(&request) = graph.edges_for(offer).get(cursor) else {
                // Dead end for the rest of this phase.
                self.layer[offer] = UNREACHED;
                path.pop();
                continue;
            };
            if let Some(top) = path.last_mut() {
                top.1 += 1;
            }
            if self.consumed[request] {
                continue;
            }

            let depth = self.layer[offer];
            match self.request_match[request] {
                None if depth == self.free_layer => {
                    found = true;
                    break;
                }
                Some(next) if depth < self.free_layer && self.layer[next] == depth + 1 => {
                    self.consumed[request] = true;
                    path.push((next, 0));
                }
                _ => {}
            }
        }

        if found {
            // Each frame's last tried edge is on the path.
            for &(offer, cursor) in &path {
                let request = graph.edges_for(offer)[cursor - 1];
                self.consumed[request] = true;
                self.offer_match[offer] = Some(request);
                self.request_match[request] = Some(offer);
            }
        }
        self.path = path;
        found
    }

    fn run(&mut self) -> usize {
        let mut phases = 0;
        while self.bfs() {
            phases += 1;
            self.consumed.fill(false);

            let mut augmented = 0;
            for offer in 0..self.graph.offer_count() {
                if self.offer_match[offer].is_none() && self.augment(offer) {
                    augmented += 1;
                }
            }
            trace!(phase = phases, augmented, path_length = self.free_layer, "phase done");

            if augmented == 0 {
                break;
            }
        }
        phases
    }

    fn into_matching(self, phases: usize) -> Matching {
        let pairs = self
            .offer_match
            .iter()
            .enumerate()
            .filter_map(|(offer, request)| {
                request.map(|r| (self.graph.offer(offer), self.graph.request(r)))
            })
            .collect();
        Matching { pairs, phases }
    }
}

/// Computes a maximum-cardinality matching with Hopcroft-Karp.
///
/// Free offers are tried in vertex order and requests in adjacency order, so
/// the same graph always yields the same matching. Runs in `O(E * sqrt(V))`.
pub fn maximum_matching(graph: &BipartiteGraph) -> Matching {
    let mut solver = Solver::new(graph);
    let phases = solver.run();
    solver.into_matching(phases)
}

/// True when `matching` can still be grown, meaning it is not maximum.
///
/// Pairs that are not vertices of `graph` are ignored.
pub fn has_augmenting_path(graph: &BipartiteGraph, matching: &Matching) -> bool {
    Solver::with_matching(graph, matching).bfs()
}
