//! End-to-end checks of the matching engine without any storage.

use std::{cell::RefCell, collections::HashSet};

use pretty_assertions::assert_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use tutor_matcher::{
    engine::{compute, run_matching, Snapshot},
    error::EngineError,
    graph::build_graph,
    materialize::{MatchPair, MatchSink, MatchingReport},
    matching::{has_augmenting_path, maximum_matching},
    model::{ClassRange, Offer, OfferId, RawOffer, Request, RequestId, UserId},
    schedule::{Availability, OverlapPolicy, Weekday, SCHOOL_WEEK},
};

const CLASSES: ClassRange = ClassRange { min: 5, max: 10 };

fn on(day: Weekday, slots: &[u8]) -> Availability {
    Availability::new().with(day, slots.iter().copied())
}

const TUTOR: UserId = UserId(1);
const PUPIL: UserId = UserId(2);

fn pair(offer: i64, request: i64) -> MatchPair {
    MatchPair {
        offer_id: OfferId(offer),
        request_id: RequestId(request),
    }
}

#[derive(Default)]
struct RecordingSink {
    replaced: RefCell<Vec<Vec<MatchPair>>>,
}

impl MatchSink for RecordingSink {
    type Error = std::convert::Infallible;

    fn replace_matches(&self, pairs: &[MatchPair]) -> Result<(), Self::Error> {
        self.replaced.borrow_mut().push(pairs.to_vec());
        Ok(())
    }
}

#[test]
fn day_overlap_decides_the_pairing() {
    let snapshot = Snapshot {
        offers: vec![
            Offer::new(1, TUTOR, "MA", on(Weekday::Mon, &[1, 2]), CLASSES),
            Offer::new(2, TUTOR, "MA", on(Weekday::Tue, &[1, 2]), CLASSES),
        ],
        requests: vec![
            Request::new(1, PUPIL, "MA", on(Weekday::Mon, &[1, 2])),
            Request::new(2, PUPIL, "MA", on(Weekday::Wed, &[1, 2])),
        ],
    };

    let report = compute(&snapshot, &OverlapPolicy::default()).unwrap();
    assert_eq!(
        report,
        MatchingReport {
            matched_count: 1,
            total_requests: 2,
            pairs: vec![pair(1, 1)],
        }
    );
}

#[test]
fn complete_two_by_two_covers_everyone() {
    let both = Availability::new()
        .with(Weekday::Mon, [3])
        .with(Weekday::Thu, [5]);
    let snapshot = Snapshot {
        offers: vec![
            Offer::new(10, TUTOR, "DE", both.clone(), CLASSES),
            Offer::new(11, TUTOR, "DE", both.clone(), CLASSES),
        ],
        requests: vec![
            Request::new(20, PUPIL, "DE", both.clone()),
            Request::new(21, PUPIL, "DE", both),
        ],
    };

    let report = compute(&snapshot, &OverlapPolicy::default()).unwrap();
    assert_eq!(report.matched_count, 2);
    assert_eq!(report.pairs, vec![pair(10, 20), pair(11, 21)]);
}

#[test]
fn empty_input_gives_empty_report() {
    let report = compute(&Snapshot::default(), &OverlapPolicy::default()).unwrap();
    assert_eq!(report, MatchingReport::default());
    assert_eq!(
        serde_json::to_value(&report).unwrap(),
        serde_json::json!({ "matchedCount": 0, "totalRequests": 0, "pairs": [] })
    );
}

#[test]
fn offer_without_subject_partner_is_left_out() {
    let snapshot = Snapshot {
        offers: vec![
            Offer::new(1, TUTOR, "EN", on(Weekday::Fri, &[1]), CLASSES),
            Offer::new(2, TUTOR, "MA", on(Weekday::Fri, &[1]), CLASSES),
        ],
        requests: vec![Request::new(5, PUPIL, "MA", on(Weekday::Fri, &[1]))],
    };

    let report = compute(&snapshot, &OverlapPolicy::default()).unwrap();
    assert_eq!(report.pairs, vec![pair(2, 5)]);
}

#[test]
fn weekend_slots_only_count_when_configured() {
    let snapshot = Snapshot {
        offers: vec![Offer::new(1, TUTOR, "MA", on(Weekday::Sat, &[2]), CLASSES)],
        requests: vec![Request::new(1, PUPIL, "MA", on(Weekday::Sat, &[2]))],
    };

    let school_week = compute(&snapshot, &OverlapPolicy::new(SCHOOL_WEEK)).unwrap();
    assert_eq!(school_week.matched_count, 0);

    let whole_week = compute(&snapshot, &OverlapPolicy::new(Weekday::ALL)).unwrap();
    assert_eq!(whole_week.pairs, vec![pair(1, 1)]);
}

#[test]
fn class_range_does_not_restrict_matching() {
    let snapshot = Snapshot {
        offers: vec![Offer::new(1, TUTOR, "MA", on(Weekday::Mon, &[1]), ClassRange { min: 12, max: 13 })],
        requests: vec![Request::new(1, PUPIL, "MA", on(Weekday::Mon, &[1]))],
    };
    assert_eq!(
        compute(&snapshot, &OverlapPolicy::default()).unwrap().matched_count,
        1
    );
}

#[test]
fn run_hands_the_sorted_report_to_the_sink() {
    let snapshot = Snapshot {
        offers: vec![
            Offer::new(7, TUTOR, "MA", on(Weekday::Mon, &[1]), CLASSES),
            Offer::new(3, TUTOR, "MA", on(Weekday::Mon, &[1]), CLASSES),
        ],
        requests: vec![
            Request::new(9, PUPIL, "MA", on(Weekday::Mon, &[1])),
            Request::new(4, PUPIL, "MA", on(Weekday::Mon, &[1])),
        ],
    };
    let sink = RecordingSink::default();

    let report = run_matching(&snapshot, &sink, &OverlapPolicy::default()).unwrap();
    assert_eq!(report.pairs, vec![pair(3, 4), pair(7, 9)]);
    assert_eq!(sink.replaced.into_inner(), vec![report.pairs]);
}

#[test]
fn incomplete_record_fails_before_matching() {
    let raw = RawOffer {
        id: Some(1),
        owner: Some(1),
        subject: Some("MA".to_owned()),
        availability: None,
        min_class: Some(5),
        max_class: Some(7),
    };
    let err = Offer::try_from(raw).unwrap_err();
    assert!(matches!(
        err,
        EngineError::MissingField {
            field: "availability",
            ..
        }
    ));
}

#[test]
fn duplicate_ids_are_rejected() {
    let snapshot = Snapshot {
        offers: vec![],
        requests: vec![
            Request::new(1, PUPIL, "MA", on(Weekday::Mon, &[1])),
            Request::new(1, PUPIL, "DE", on(Weekday::Tue, &[1])),
        ],
    };
    let err = compute(&snapshot, &OverlapPolicy::default()).unwrap_err();
    assert!(matches!(err, EngineError::DuplicateId { .. }));
}

fn random_availability(rng: &mut ChaCha8Rng) -> Availability {
    let mut availability = Availability::new();
    for _ in 0..rng.gen_range(1..=3) {
        let day = Weekday::ALL[rng.gen_range(0..Weekday::ALL.len())];
        availability = availability.with(day, [rng.gen_range(1..=8)]);
    }
    availability
}

fn random_snapshot(seed: u64) -> Snapshot {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let subjects = ["MA", "DE", "EN"];
    let offers = (0..40)
        .map(|id| {
            let subject = subjects[rng.gen_range(0..subjects.len())];
            Offer::new(id, TUTOR, subject, random_availability(&mut rng), CLASSES)
        })
        .collect();
    let requests = (0..50)
        .map(|id| {
            let subject = subjects[rng.gen_range(0..subjects.len())];
            Request::new(id, PUPIL, subject, random_availability(&mut rng))
        })
        .collect();
    Snapshot { offers, requests }
}

#[test]
fn generated_graphs_get_valid_maximum_matchings() {
    let policy = OverlapPolicy::default();
    for seed in 1..=20 {
        let snapshot = random_snapshot(seed);
        let graph = build_graph(&snapshot.offers, &snapshot.requests, &policy).unwrap();
        let matching = maximum_matching(&graph);

        let mut used = HashSet::new();
        for (offer, request) in matching.iter() {
            assert!(graph.has_edge(offer, request), "seed {seed}: phantom pair");
            assert!(used.insert(request), "seed {seed}: request used twice");
        }
        assert!(!has_augmenting_path(&graph, &matching), "seed {seed}");

        let again = maximum_matching(&graph);
        assert_eq!(
            matching.iter().collect::<Vec<_>>(),
            again.iter().collect::<Vec<_>>()
        );
    }
}

#[test]
fn input_order_does_not_change_the_result() {
    let policy = OverlapPolicy::default();
    let snapshot = random_snapshot(42);
    let mut shuffled = snapshot.clone();
    shuffled.offers.reverse();
    shuffled.requests.rotate_left(17);

    assert_eq!(
        compute(&snapshot, &policy).unwrap(),
        compute(&shuffled, &policy).unwrap()
    );
}
