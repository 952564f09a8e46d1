use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::merge::{dedupe_stop_changes, merge_candidate};
use crate::{
    CandidateError, CandidateTripModification, CanonicalStore, CanonicalTripUpdate,
    CandidateWarning, ProvenanceRecord, ReconcileError, ReferenceResolver, ResolveError, TripKey,
    TripReference, UnitOfWork,
};

/// A candidate that was left out of the batch, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CandidateRejection {
    pub index: usize,
    pub trip: Option<TripKey>,
    pub error: CandidateError,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileOutcome {
    pub provenance: ProvenanceRecord,
    #[serde(default)]
    pub rejected: Vec<CandidateRejection>,
    #[serde(default)]
    pub warnings: Vec<CandidateWarning>,
}

/// Reconcile one ingestion batch into the canonical store.
///
/// Candidates are processed in input order inside a single unit of work. Invalid or
/// unresolvable candidates are reported in [`ReconcileOutcome::rejected`] and do not stop the
/// batch. The returned provenance lists every merged trip update once, at the position of the
/// first candidate that touched it.
///
/// # Errors
/// Returns [`ReconcileError::InvalidProvenance`] when the provenance record is malformed and
/// [`ReconcileError::PersistenceFailure`] when the store cannot open or commit the unit of
/// work. Nothing is persisted in either case.
pub fn reconcile<S, R>(
    store: &mut S,
    resolver: &R,
    provenance: ProvenanceRecord,
    candidates: Vec<CandidateTripModification>,
) -> Result<ReconcileOutcome, ReconcileError>
where
    S: CanonicalStore,
    R: ReferenceResolver + ?Sized,
{
    reconcile_entries(store, resolver, provenance, candidates.into_iter().map(Ok).collect())
}

/// Same as [`reconcile`], for batches whose candidates were decoded one by one.
///
/// An `Err` entry is a candidate that could not be decoded; it is rejected at its index and
/// the rest of the batch proceeds.
///
/// # Errors
/// Same as [`reconcile`].
pub fn reconcile_entries<S, R>(
    store: &mut S,
    resolver: &R,
    mut provenance: ProvenanceRecord,
    candidates: Vec<Result<CandidateTripModification, CandidateError>>,
) -> Result<ReconcileOutcome, ReconcileError>
where
    S: CanonicalStore,
    R: ReferenceResolver + ?Sized,
{
    provenance.validate()?;

    let unit = store
        .begin()
        .map_err(|err| ReconcileError::PersistenceFailure(err.to_string()))?;

    let candidate_count = candidates.len();
    let mut references: BTreeMap<TripKey, Result<TripReference, ResolveError>> = BTreeMap::new();
    let mut staged: Vec<CanonicalTripUpdate> = Vec::new();
    let mut slots: BTreeMap<TripKey, usize> = BTreeMap::new();
    let mut rejected = Vec::new();
    let mut warnings = Vec::new();

    for (index, entry) in candidates.into_iter().enumerate() {
        let mut candidate = match entry {
            Ok(candidate) => candidate,
            Err(error) => {
                tracing::warn!(
                    provenance_id = %provenance.provenance_id,
                    candidate_index = index,
                    error = %error,
                    "rejecting undecodable candidate"
                );
                rejected.push(CandidateRejection { index, trip: None, error });
                continue;
            }
        };

        let key = match candidate.validate() {
            Ok(key) => key,
            Err(error) => {
                let trip = known_key(&candidate);
                tracing::warn!(
                    provenance_id = %provenance.provenance_id,
                    candidate_index = index,
                    error = %error,
                    "rejecting candidate"
                );
                rejected.push(CandidateRejection { index, trip, error });
                continue;
            }
        };

        let (stop_changes, dropped) =
            dedupe_stop_changes(std::mem::take(&mut candidate.stop_changes));
        candidate.stop_changes = stop_changes;

        let resolution = references.entry(key.clone()).or_insert_with(|| {
            tracing::debug!(trip = %key, "resolving trip reference");
            resolver.resolve(&key)
        });
        let reference = match resolution {
            Ok(reference) => &*reference,
            Err(err) => {
                let error = CandidateError::ReferenceNotFound {
                    trip_id: key.trip_id.clone(),
                    service_date: key.service_date,
                    reason: err.to_string(),
                };
                tracing::warn!(
                    provenance_id = %provenance.provenance_id,
                    candidate_index = index,
                    trip = %key,
                    error = %error,
                    "rejecting candidate"
                );
                rejected.push(CandidateRejection { index, trip: Some(key), error });
                continue;
            }
        };

        let slot = slots.get(&key).copied();
        let live = match slot {
            Some(slot) => staged.get(slot).cloned(),
            None => unit
                .find_live(&key)
                .map_err(|err| ReconcileError::PersistenceFailure(err.to_string()))?,
        };

        let mut merged = merge_candidate(live.as_ref(), reference, &candidate);
        if merged.record_provenance(provenance.provenance_id) {
            tracing::debug!(
                trip = %key,
                trip_update_id = %merged.trip_update_id,
                history_len = merged.history.len(),
                "appended provenance to trip update history"
            );
        } else if slot.is_none() {
            tracing::info!(
                trip = %key,
                provenance_id = %provenance.provenance_id,
                "provenance already applied to trip update, history left unchanged"
            );
        }
        tracing::info!(
            trip = %key,
            trip_update_id = %merged.trip_update_id,
            status = merged.status.as_str(),
            first_sighting = live.is_none(),
            reported_stops = candidate.stop_changes.len(),
            "merged candidate"
        );
        // only candidates that were applied report their dropped repeats
        for stop_id in dropped {
            tracing::warn!(
                trip = %key,
                candidate_index = index,
                stop_id = %stop_id,
                "stop reported more than once in candidate, keeping the first occurrence"
            );
            warnings.push(CandidateWarning::DuplicateStopInCandidate {
                candidate_index: index,
                stop_id,
            });
        }

        match slot {
            Some(slot) => staged[slot] = merged,
            None => {
                slots.insert(key, staged.len());
                staged.push(merged);
            }
        }
    }

    provenance.trip_updates = staged;
    unit.commit(&provenance)
        .map_err(|err| ReconcileError::PersistenceFailure(err.to_string()))?;

    tracing::info!(
        provenance_id = %provenance.provenance_id,
        source = %provenance.source,
        candidates = candidate_count,
        trip_updates = provenance.trip_updates.len(),
        rejected = rejected.len(),
        warnings = warnings.len(),
        "committed batch"
    );

    Ok(ReconcileOutcome { provenance, rejected, warnings })
}

fn known_key(candidate: &CandidateTripModification) -> Option<TripKey> {
    if candidate.trip_id.trim().is_empty() {
        return None;
    }
    candidate
        .service_date
        .map(|service_date| TripKey::new(candidate.trip_id.clone(), service_date))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

    use super::*;
    use crate::{ChangeStatus, ScheduledStop, StopChange, StoreError, TripStatus};

    #[derive(Default)]
    struct MemoryStore {
        live: BTreeMap<TripKey, CanonicalTripUpdate>,
        provenance: Vec<ProvenanceRecord>,
        fail_commit: bool,
    }

    struct MemoryUnit<'a> {
        store: &'a mut MemoryStore,
    }

    impl CanonicalStore for MemoryStore {
        type Unit<'a> = MemoryUnit<'a>;

        fn begin(&mut self) -> Result<Self::Unit<'_>, StoreError> {
            Ok(MemoryUnit { store: self })
        }
    }

    impl UnitOfWork for MemoryUnit<'_> {
        fn find_live(&self, key: &TripKey) -> Result<Option<CanonicalTripUpdate>, StoreError> {
            Ok(self.store.live.get(key).cloned())
        }

        fn commit(self, provenance: &ProvenanceRecord) -> Result<(), StoreError> {
            if self.store.fail_commit {
                return Err(StoreError("disk full".to_string()));
            }
            for update in &provenance.trip_updates {
                self.store.live.insert(update.trip.clone(), update.clone());
            }
            self.store.provenance.push(provenance.clone());
            Ok(())
        }
    }

    struct FixtureResolver {
        trips: BTreeMap<TripKey, TripReference>,
        calls: Cell<usize>,
        unavailable: bool,
    }

    impl FixtureResolver {
        fn new(references: Vec<TripReference>) -> Self {
            Self {
                trips: references
                    .into_iter()
                    .map(|reference| (reference.key.clone(), reference))
                    .collect(),
                calls: Cell::new(0),
                unavailable: false,
            }
        }
    }

    impl ReferenceResolver for FixtureResolver {
        fn resolve(&self, key: &TripKey) -> Result<TripReference, ResolveError> {
            self.calls.set(self.calls.get() + 1);
            if self.unavailable {
                return Err(ResolveError::Lookup("connection refused".to_string()));
            }
            self.trips.get(key).cloned().ok_or(ResolveError::NotFound)
        }
    }

    fn fixture_date() -> Date {
        match Date::from_calendar_date(2015, Month::September, 8) {
            Ok(date) => date,
            Err(err) => panic!("invalid fixture date: {err}"),
        }
    }

    fn at(hour: u8, minute: u8) -> OffsetDateTime {
        match Time::from_hms(hour, minute, 0) {
            Ok(time) => PrimitiveDateTime::new(fixture_date(), time).assume_utc(),
            Err(err) => panic!("invalid fixture time {hour}:{minute}: {err}"),
        }
    }

    fn key(trip_id: &str) -> TripKey {
        TripKey::new(trip_id, fixture_date())
    }

    fn abc_reference(trip_id: &str) -> TripReference {
        TripReference {
            key: key(trip_id),
            stops: vec![
                ScheduledStop {
                    stop_id: "sa:1".to_string(),
                    scheduled_arrival: None,
                    scheduled_departure: Some(at(8, 10)),
                },
                ScheduledStop {
                    stop_id: "sa:2".to_string(),
                    scheduled_arrival: Some(at(9, 5)),
                    scheduled_departure: Some(at(9, 10)),
                },
                ScheduledStop {
                    stop_id: "sa:3".to_string(),
                    scheduled_arrival: Some(at(10, 5)),
                    scheduled_departure: None,
                },
            ],
        }
    }

    fn candidate(trip_id: &str, stop_changes: Vec<StopChange>) -> CandidateTripModification {
        CandidateTripModification {
            trip_id: trip_id.to_string(),
            service_date: Some(fixture_date()),
            trip_status: None,
            message: None,
            contributor: None,
            stop_changes,
        }
    }

    fn departure_change(stop_id: &str, departure: OffsetDateTime) -> StopChange {
        StopChange {
            departure: Some(Some(departure)),
            departure_status: Some(ChangeStatus::Updated),
            ..StopChange::new(stop_id)
        }
    }

    fn arrival_change(stop_id: &str, arrival: OffsetDateTime) -> StopChange {
        StopChange {
            arrival: Some(Some(arrival)),
            arrival_status: Some(ChangeStatus::Updated),
            ..StopChange::new(stop_id)
        }
    }

    fn run(
        store: &mut MemoryStore,
        resolver: &FixtureResolver,
        candidates: Vec<CandidateTripModification>,
    ) -> ReconcileOutcome {
        match reconcile(store, resolver, ProvenanceRecord::new("realtime.ire", None), candidates) {
            Ok(outcome) => outcome,
            Err(err) => panic!("reconcile failed: {err}"),
        }
    }

    #[test]
    fn delays_on_successive_batches_accumulate_on_one_record() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        let first = run(
            &mut store,
            &resolver,
            vec![candidate(
                "vehicle_journey:1",
                vec![
                    departure_change("sa:2", at(9, 50)),
                    arrival_change("sa:2", at(9, 49)),
                ],
            )],
        );
        assert_eq!(first.warnings.len(), 1);
        let p1 = first.provenance.provenance_id;

        let second = run(
            &mut store,
            &resolver,
            vec![candidate(
                "vehicle_journey:1",
                vec![departure_change("sa:1", at(8, 15)), arrival_change("sa:3", at(10, 30))],
            )],
        );
        let p2 = second.provenance.provenance_id;

        let live = match store.live.get(&key("vehicle_journey:1")) {
            Some(live) => live,
            None => panic!("trip update was not persisted"),
        };
        assert_eq!(live.stop_time_updates.len(), 3);
        assert_eq!(live.stop_time_updates[0].departure, Some(at(8, 15)));
        assert_eq!(live.stop_time_updates[0].departure_status, ChangeStatus::Updated);
        // first change for sa:2 won: departure applied, duplicate arrival dropped
        assert_eq!(live.stop_time_updates[1].departure, Some(at(9, 50)));
        assert_eq!(live.stop_time_updates[1].arrival, Some(at(9, 5)));
        assert_eq!(live.stop_time_updates[2].arrival, Some(at(10, 30)));
        assert_eq!(live.history, vec![p1, p2]);
        assert_eq!(
            second.provenance.trip_updates[0].trip_update_id,
            first.provenance.trip_updates[0].trip_update_id
        );
    }

    #[test]
    fn abc_scenario_leaves_unreported_stops_intact() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        run(
            &mut store,
            &resolver,
            vec![candidate(
                "vehicle_journey:1",
                vec![StopChange {
                    arrival: Some(Some(at(9, 49))),
                    departure: Some(Some(at(9, 50))),
                    ..StopChange::new("sa:2")
                }],
            )],
        );
        run(
            &mut store,
            &resolver,
            vec![candidate("vehicle_journey:1", vec![arrival_change("sa:3", at(10, 20))])],
        );

        let live = match store.live.get(&key("vehicle_journey:1")) {
            Some(live) => live,
            None => panic!("trip update was not persisted"),
        };
        let b = &live.stop_time_updates[1];
        assert_eq!((b.arrival, b.departure), (Some(at(9, 49)), Some(at(9, 50))));
        assert_eq!(
            (b.arrival_status, b.departure_status),
            (ChangeStatus::Updated, ChangeStatus::Updated)
        );
        let a = &live.stop_time_updates[0];
        assert_eq!(a.departure, Some(at(8, 10)));
        assert_eq!(a.departure_status, ChangeStatus::None);
        assert_eq!(live.stop_time_updates[2].arrival, Some(at(10, 20)));
    }

    #[test]
    fn empty_batch_commits_bare_provenance() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![]);

        let outcome = run(&mut store, &resolver, vec![]);
        assert!(outcome.provenance.trip_updates.is_empty());
        assert!(outcome.rejected.is_empty());
        assert_eq!(store.provenance.len(), 1);
        assert_eq!(resolver.calls.get(), 0);
    }

    #[test]
    fn invalid_provenance_aborts_before_touching_the_store() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        let result = reconcile(
            &mut store,
            &resolver,
            ProvenanceRecord::new("", None),
            vec![candidate("vehicle_journey:1", vec![])],
        );
        assert!(matches!(result, Err(ReconcileError::InvalidProvenance(_))));
        assert!(store.provenance.is_empty());
        assert!(store.live.is_empty());
    }

    #[test]
    fn rejected_candidates_do_not_abort_the_batch() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        let mut undated = candidate("vehicle_journey:1", vec![]);
        undated.service_date = None;
        let outcome = run(
            &mut store,
            &resolver,
            vec![
                candidate("vehicle_journey:unknown", vec![]),
                undated,
                candidate("vehicle_journey:1", vec![arrival_change("sa:3", at(10, 20))]),
            ],
        );

        assert_eq!(outcome.provenance.trip_updates.len(), 1);
        assert_eq!(outcome.rejected.len(), 2);
        assert_eq!(outcome.rejected[0].index, 0);
        assert!(matches!(outcome.rejected[0].error, CandidateError::ReferenceNotFound { .. }));
        assert_eq!(outcome.rejected[0].trip, Some(key("vehicle_journey:unknown")));
        assert_eq!(outcome.rejected[1].index, 1);
        assert!(matches!(outcome.rejected[1].error, CandidateError::InvalidCandidate { .. }));
        assert_eq!(outcome.rejected[1].trip, None);
        assert!(store.live.contains_key(&key("vehicle_journey:1")));
    }

    #[test]
    fn undecodable_entries_are_rejected_at_their_index() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        let outcome = match reconcile_entries(
            &mut store,
            &resolver,
            ProvenanceRecord::new("realtime.ire", None),
            vec![
                Err(CandidateError::InvalidCandidate { reason: "missing trip_id".to_string() }),
                Ok(candidate("vehicle_journey:1", vec![arrival_change("sa:2", at(9, 30))])),
            ],
        ) {
            Ok(outcome) => outcome,
            Err(err) => panic!("reconcile failed: {err}"),
        };

        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].index, 0);
        assert_eq!(outcome.rejected[0].trip, None);
        assert_eq!(outcome.provenance.trip_updates.len(), 1);
        assert!(store.live.contains_key(&key("vehicle_journey:1")));
    }

    #[test]
    fn rejected_candidates_report_no_duplicate_warnings() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        let outcome = run(
            &mut store,
            &resolver,
            vec![
                candidate(
                    "vehicle_journey:unknown",
                    vec![arrival_change("sa:2", at(9, 30)), arrival_change("sa:2", at(9, 40))],
                ),
                candidate(
                    "vehicle_journey:1",
                    vec![arrival_change("sa:3", at(10, 30)), arrival_change("sa:3", at(10, 40))],
                ),
            ],
        );

        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(
            outcome.warnings,
            vec![CandidateWarning::DuplicateStopInCandidate {
                candidate_index: 1,
                stop_id: "sa:3".to_string(),
            }]
        );
    }

    #[test]
    fn lookup_failures_are_reported_per_candidate() {
        let mut store = MemoryStore::default();
        let mut resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);
        resolver.unavailable = true;

        let outcome = run(&mut store, &resolver, vec![candidate("vehicle_journey:1", vec![])]);
        match &outcome.rejected[0].error {
            CandidateError::ReferenceNotFound { reason, .. } => {
                assert!(reason.contains("connection refused"));
            }
            other => panic!("unexpected rejection: {other:?}"),
        }
        assert!(store.live.is_empty());
        assert_eq!(store.provenance.len(), 1);
    }

    #[test]
    fn cancellation_skips_every_stop() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);
        run(
            &mut store,
            &resolver,
            vec![candidate("vehicle_journey:1", vec![arrival_change("sa:2", at(9, 30))])],
        );

        let mut cancel = candidate("vehicle_journey:1", vec![arrival_change("sa:3", at(10, 30))]);
        cancel.trip_status = Some(TripStatus::Cancelled);
        cancel.message = Some("train cancelled".to_string());
        let outcome = run(&mut store, &resolver, vec![cancel]);

        let update = &outcome.provenance.trip_updates[0];
        assert_eq!(update.status, TripStatus::Cancelled);
        assert_eq!(update.message.as_deref(), Some("train cancelled"));
        assert!(update.stop_time_updates.iter().all(|stop| {
            stop.arrival_status == ChangeStatus::Skipped
                && stop.departure_status == ChangeStatus::Skipped
        }));
    }

    #[test]
    fn history_grows_by_one_entry_per_batch() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        let mut expected = Vec::new();
        for minute in 0..5 {
            let outcome = run(
                &mut store,
                &resolver,
                vec![candidate(
                    "vehicle_journey:1",
                    vec![arrival_change("sa:3", at(10, 10 + minute))],
                )],
            );
            expected.push(outcome.provenance.provenance_id);
        }

        let live = match store.live.get(&key("vehicle_journey:1")) {
            Some(live) => live,
            None => panic!("trip update was not persisted"),
        };
        assert_eq!(live.history, expected);
        assert_eq!(live.stop_time_updates[2].arrival, Some(at(10, 14)));
    }

    #[test]
    fn replaying_a_batch_is_idempotent() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);
        let provenance = ProvenanceRecord::new("realtime.ire", Some("<feed/>".to_string()));
        let batch = vec![candidate("vehicle_journey:1", vec![arrival_change("sa:2", at(9, 30))])];

        let first = match reconcile(&mut store, &resolver, provenance.clone(), batch.clone()) {
            Ok(outcome) => outcome,
            Err(err) => panic!("first run failed: {err}"),
        };
        let replay = match reconcile(&mut store, &resolver, provenance.clone(), batch) {
            Ok(outcome) => outcome,
            Err(err) => panic!("replay failed: {err}"),
        };

        assert_eq!(first.provenance.trip_updates, replay.provenance.trip_updates);
        let live = match store.live.get(&key("vehicle_journey:1")) {
            Some(live) => live,
            None => panic!("trip update was not persisted"),
        };
        assert_eq!(live.history, vec![provenance.provenance_id]);
    }

    #[test]
    fn failed_commit_leaves_nothing_behind() {
        let mut store = MemoryStore { fail_commit: true, ..MemoryStore::default() };
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);

        let result = reconcile(
            &mut store,
            &resolver,
            ProvenanceRecord::new("realtime.ire", None),
            vec![candidate("vehicle_journey:1", vec![arrival_change("sa:2", at(9, 30))])],
        );
        assert!(matches!(
            result,
            Err(ReconcileError::PersistenceFailure(message)) if message.contains("disk full")
        ));
        assert!(store.live.is_empty());
        assert!(store.provenance.is_empty());
    }

    #[test]
    fn same_trip_twice_in_a_batch_merges_against_staged_state() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![
            abc_reference("vehicle_journey:1"),
            abc_reference("vehicle_journey:2"),
        ]);

        let outcome = run(
            &mut store,
            &resolver,
            vec![
                candidate("vehicle_journey:1", vec![arrival_change("sa:2", at(9, 30))]),
                candidate("vehicle_journey:2", vec![]),
                candidate("vehicle_journey:1", vec![arrival_change("sa:3", at(10, 40))]),
            ],
        );

        let trips = outcome
            .provenance
            .trip_updates
            .iter()
            .map(|update| update.trip.trip_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(trips, vec!["vehicle_journey:1", "vehicle_journey:2"]);
        let first = &outcome.provenance.trip_updates[0];
        assert_eq!(first.stop_time_updates[1].arrival, Some(at(9, 30)));
        assert_eq!(first.stop_time_updates[2].arrival, Some(at(10, 40)));
        assert_eq!(first.history, vec![outcome.provenance.provenance_id]);
        // one lookup per circulation
        assert_eq!(resolver.calls.get(), 2);
    }

    #[test]
    fn changed_reference_is_followed_on_next_merge() {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![abc_reference("vehicle_journey:1")]);
        run(
            &mut store,
            &resolver,
            vec![candidate("vehicle_journey:1", vec![arrival_change("sa:3", at(10, 20))])],
        );

        let mut shortened = abc_reference("vehicle_journey:1");
        shortened.stops.remove(1);
        let resolver = FixtureResolver::new(vec![shortened]);
        let outcome = run(&mut store, &resolver, vec![candidate("vehicle_journey:1", vec![])]);

        let update = &outcome.provenance.trip_updates[0];
        let stops =
            update.stop_time_updates.iter().map(|stop| stop.stop_id.as_str()).collect::<Vec<_>>();
        assert_eq!(stops, vec!["sa:1", "sa:3"]);
        assert_eq!(update.stop_time_updates[1].arrival, Some(at(10, 20)));
        assert_eq!(update.history.len(), 2);
    }

    #[test]
    fn outcome_serializes_rejections_with_kind_tags() -> Result<(), serde_json::Error> {
        let mut store = MemoryStore::default();
        let resolver = FixtureResolver::new(vec![]);
        let outcome = run(&mut store, &resolver, vec![candidate("vehicle_journey:9", vec![])]);

        let value = serde_json::to_value(&outcome)?;
        let kind = value
            .pointer("/rejected/0/error/kind")
            .and_then(serde_json::Value::as_str);
        assert_eq!(kind, Some("reference_not_found"));
        let parsed: ReconcileOutcome = serde_json::from_value(value)?;
        assert_eq!(parsed.rejected, outcome.rejected);
        Ok(())
    }
}
