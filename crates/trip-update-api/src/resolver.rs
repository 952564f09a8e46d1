use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::Date;
use trip_update_core::{
    service_date, ReferenceResolver, ResolveError, ScheduledStop, TripKey, TripReference,
};

/// Wire and file representation of one scheduled circulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleTrip {
    pub trip_id: String,
    #[serde(with = "service_date")]
    pub service_date: Date,
    pub stops: Vec<ScheduledStop>,
}

impl From<ScheduleTrip> for TripReference {
    fn from(trip: ScheduleTrip) -> Self {
        Self { key: TripKey::new(trip.trip_id, trip.service_date), stops: trip.stops }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ScheduleFile {
    trips: Vec<ScheduleTrip>,
}

/// Resolver backed by a schedule file loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticScheduleResolver {
    trips: BTreeMap<TripKey, TripReference>,
}

impl StaticScheduleResolver {
    /// Load a YAML or JSON schedule file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid schedule.
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schedule file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid schedule file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when the document does not parse, a trip is listed twice, or a stop
    /// has an empty identifier.
    pub fn parse(raw: &str) -> Result<Self> {
        let file: ScheduleFile = serde_yaml::from_str(raw).context("failed to parse schedule")?;
        let mut trips = BTreeMap::new();
        for trip in file.trips {
            let reference = TripReference::from(trip);
            if reference.key.trip_id.trim().is_empty() {
                return Err(anyhow!("schedule contains a trip with an empty trip_id"));
            }
            if reference.stops.iter().any(|stop| stop.stop_id.trim().is_empty()) {
                return Err(anyhow!("trip {} has a stop with an empty stop_id", reference.key));
            }
            let key = reference.key.clone();
            if trips.insert(key.clone(), reference).is_some() {
                return Err(anyhow!("trip {key} is listed more than once"));
            }
        }
        Ok(Self { trips })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.trips.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }
}

impl ReferenceResolver for StaticScheduleResolver {
    fn resolve(&self, key: &TripKey) -> Result<TripReference, ResolveError> {
        self.trips.get(key).cloned().ok_or(ResolveError::NotFound)
    }
}

/// Resolver querying a schedule service over HTTP:
/// `GET {base_url}/trips/{trip_id}?service_date=YYYY-MM-DD`.
pub struct HttpScheduleResolver {
    agent: ureq::Agent,
    base_url: url::Url,
    token: Option<String>,
}

impl HttpScheduleResolver {
    /// # Errors
    /// Returns an error when `base_url` is not an absolute URL that can carry path segments.
    pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
        let base_url = url::Url::parse(base_url)
            .with_context(|| format!("invalid schedule service url: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("schedule service url cannot be a base: {base_url}"));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self { agent, base_url, token })
    }

    fn trip_url(&self, key: &TripKey) -> Result<url::Url, ResolveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ResolveError::Lookup(format!("invalid base url {}", self.base_url)))?
            .pop_if_empty()
            .push("trips")
            .push(&key.trip_id);
        url.query_pairs_mut()
            .append_pair("service_date", &service_date::format(key.service_date));
        Ok(url)
    }
}

impl ReferenceResolver for HttpScheduleResolver {
    fn resolve(&self, key: &TripKey) -> Result<TripReference, ResolveError> {
        let url = self.trip_url(key)?;
        let mut request = self.agent.request_url("GET", &url).set("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }

        let response = match request.call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Err(ResolveError::NotFound),
            Err(ureq::Error::Status(code, _)) => {
                return Err(ResolveError::Lookup(format!("schedule service returned HTTP {code}")));
            }
            Err(err) => return Err(ResolveError::Lookup(err.to_string())),
        };

        let trip: ScheduleTrip = response
            .into_json()
            .map_err(|err| ResolveError::Lookup(format!("invalid schedule response: {err}")))?;
        let reference = TripReference::from(trip);
        if reference.key != *key {
            return Err(ResolveError::Lookup(format!(
                "schedule service answered for {} instead of {key}",
                reference.key
            )));
        }
        tracing::debug!(trip = %key, stops = reference.stops.len(), "resolved trip over http");
        Ok(reference)
    }
}
