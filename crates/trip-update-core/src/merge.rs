use std::collections::BTreeMap;

use time::OffsetDateTime;

use crate::{
    CandidateTripModification, CanonicalTripUpdate, ChangeStatus, ScheduledStop, StopChange,
    StopTimeUpdate, TripReference, TripStatus, TripUpdateId,
};

/// Split stop changes into the ones applied and the stop ids dropped as repeats.
///
/// The first change reported for a stop id wins, in the candidate's input order.
#[must_use]
pub fn dedupe_stop_changes(changes: Vec<StopChange>) -> (Vec<StopChange>, Vec<String>) {
    let mut kept: Vec<StopChange> = Vec::with_capacity(changes.len());
    let mut dropped = Vec::new();
    for change in changes {
        if kept.iter().any(|existing| existing.stop_id == change.stop_id) {
            dropped.push(change.stop_id);
        } else {
            kept.push(change);
        }
    }
    (kept, dropped)
}

/// Reconcile one candidate against the freshly resolved reference and the live record, if any.
///
/// The result follows `reference.stops` exactly. Prior per-stop state is carried forward by
/// (stop id, occurrence), reported stops are overlaid, and a cancelled trip forces every
/// stop to `skipped`. When a vehicle passes the same stop twice, only the first occurrence
/// receives the candidate's change. History is left to the caller.
///
/// A trip leaving `cancelled` has the statuses of its carried stops re-derived from their
/// times against the schedule.
///
/// `candidate.stop_changes` is expected to have gone through [`dedupe_stop_changes`]; any
/// repeat left in it is ignored without a warning.
#[must_use]
pub fn merge_candidate(
    existing: Option<&CanonicalTripUpdate>,
    reference: &TripReference,
    candidate: &CandidateTripModification,
) -> CanonicalTripUpdate {
    let mut changes: BTreeMap<&str, &StopChange> = BTreeMap::new();
    for change in &candidate.stop_changes {
        changes.entry(change.stop_id.as_str()).or_insert(change);
    }

    let status = candidate
        .trip_status
        .or_else(|| existing.map(|record| record.status))
        .unwrap_or(TripStatus::Normal);
    let reinstated = existing.is_some_and(|record| record.status == TripStatus::Cancelled)
        && status != TripStatus::Cancelled;

    let carried = existing.map(carried_state).unwrap_or_default();
    if let Some(existing) = existing {
        if !same_sequence(existing, reference) {
            tracing::info!(
                trip = %reference.key,
                previous_stops = existing.stop_time_updates.len(),
                current_stops = reference.stops.len(),
                "authoritative stop sequence changed, re-deriving canonical stops"
            );
        }
    }
    if reinstated {
        tracing::info!(
            trip = %reference.key,
            status = status.as_str(),
            "cancellation lifted, re-deriving stop statuses from the schedule"
        );
    }

    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    let mut stop_time_updates = Vec::with_capacity(reference.stops.len());
    for scheduled in &reference.stops {
        let counter = occurrences.entry(scheduled.stop_id.as_str()).or_insert(0);
        let occurrence = *counter;
        *counter += 1;

        let base = match carried.get(&(scheduled.stop_id.as_str(), occurrence)) {
            Some(stop) if reinstated => restore_statuses((*stop).clone(), scheduled),
            Some(stop) => (*stop).clone(),
            None => StopTimeUpdate::scheduled(scheduled),
        };

        let stop = match changes.get(scheduled.stop_id.as_str()) {
            Some(change) if occurrence == 0 => overlay_stop(base, change),
            _ => base,
        };
        stop_time_updates.push(stop);
    }

    for stop_id in changes.keys() {
        if !occurrences.contains_key(stop_id) {
            tracing::info!(
                trip = %reference.key,
                stop_id,
                "reported stop is not served by the trip, ignoring it"
            );
        }
    }

    if status == TripStatus::Cancelled {
        for stop in &mut stop_time_updates {
            stop.arrival_status = ChangeStatus::Skipped;
            stop.departure_status = ChangeStatus::Skipped;
        }
    }

    CanonicalTripUpdate {
        trip_update_id: existing.map_or_else(TripUpdateId::new, |record| record.trip_update_id),
        trip: reference.key.clone(),
        status,
        stop_time_updates,
        message: candidate
            .message
            .clone()
            .or_else(|| existing.and_then(|record| record.message.clone())),
        contributor: candidate
            .contributor
            .clone()
            .or_else(|| existing.and_then(|record| record.contributor.clone())),
        history: existing.map(|record| record.history.clone()).unwrap_or_default(),
    }
}

fn carried_state(record: &CanonicalTripUpdate) -> BTreeMap<(&str, usize), &StopTimeUpdate> {
    let mut occurrences: BTreeMap<&str, usize> = BTreeMap::new();
    let mut state = BTreeMap::new();
    for stop in &record.stop_time_updates {
        let counter = occurrences.entry(stop.stop_id.as_str()).or_insert(0);
        state.insert((stop.stop_id.as_str(), *counter), stop);
        *counter += 1;
    }
    state
}

fn same_sequence(record: &CanonicalTripUpdate, reference: &TripReference) -> bool {
    record.stop_time_updates.len() == reference.stops.len()
        && record
            .stop_time_updates
            .iter()
            .zip(&reference.stops)
            .all(|(stop, scheduled)| stop.stop_id == scheduled.stop_id)
}

fn restore_statuses(mut stop: StopTimeUpdate, scheduled: &ScheduledStop) -> StopTimeUpdate {
    stop.arrival_status = derived_status(stop.arrival, scheduled.scheduled_arrival);
    stop.departure_status = derived_status(stop.departure, scheduled.scheduled_departure);
    stop
}

fn derived_status(
    current: Option<OffsetDateTime>,
    scheduled: Option<OffsetDateTime>,
) -> ChangeStatus {
    if current == scheduled {
        ChangeStatus::None
    } else if current.is_none() {
        ChangeStatus::Skipped
    } else {
        ChangeStatus::Updated
    }
}

fn overlay_stop(mut stop: StopTimeUpdate, change: &StopChange) -> StopTimeUpdate {
    if let Some(arrival) = change.arrival {
        stop.arrival = arrival;
    }
    if let Some(departure) = change.departure {
        stop.departure = departure;
    }
    stop.arrival_status =
        reported_status(change.arrival_status, change.arrival, stop.arrival_status);
    stop.departure_status =
        reported_status(change.departure_status, change.departure, stop.departure_status);
    if let Some(cause) = &change.cause {
        stop.cause = Some(cause.clone());
    }
    stop
}

// An explicit status wins; otherwise a set time means `updated`, a cleared one `skipped`.
fn reported_status(
    explicit: Option<ChangeStatus>,
    time: Option<Option<OffsetDateTime>>,
    current: ChangeStatus,
) -> ChangeStatus {
    match (explicit, time) {
        (Some(status), _) => status,
        (None, Some(Some(_))) => ChangeStatus::Updated,
        (None, Some(None)) => ChangeStatus::Skipped,
        (None, None) => current,
    }
}
