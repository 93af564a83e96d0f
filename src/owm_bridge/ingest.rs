// owm_bridge - OpenWeather ingestion and map tile proxy
//
// Copyright 2024 The owm_bridge developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use crate::client::{ClientError, CurrentConditions, ForecastResponse, ForecastSlot, OpenWeatherClient};
use crate::store::{DocPath, DocumentStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::Serialize;
use std::error;
use std::fmt;
use std::sync::Arc;

/// Locations ingested when none are configured explicitly.
pub const DEFAULT_LOCATIONS: &[&str] = &[
    "Madrid", "Pollensa", "Palma", "Inca", "Manacor", "Campos", "Soller", "Helsinki", "Melbourne",
];

const OBSERVATION_DOC: &str = "Actual";
const FORECAST_DOC: &str = "Predicción";

// Sunrise and sunset are rendered on the peninsular Spain clock regardless
// of the location's own timezone.
const LOCAL_UTC_OFFSET_SECS: i32 = 3600;

/// Highest forecast index stored under the Standard tier. The boundary is
/// inclusive and fixed.
const STANDARD_TIER_MAX_INDEX: usize = 16;

#[derive(Debug)]
pub enum IngestError {
    Provider(ClientError),
    Store(StoreError),
    Encode(serde_json::Error),
    Malformed(&'static str),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provider(e) => write!(f, "{}", e),
            Self::Store(e) => write!(f, "{}", e),
            Self::Encode(e) => write!(f, "{}", e),
            Self::Malformed(what) => write!(f, "malformed provider response: {}", what),
        }
    }
}

impl error::Error for IngestError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Provider(e) => Some(e),
            Self::Store(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Malformed(_) => None,
        }
    }
}

impl From<ClientError> for IngestError {
    fn from(e: ClientError) -> Self {
        IngestError::Provider(e)
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        IngestError::Store(e)
    }
}

/// Forecast storage bucket. Indices 0 through 16 are Standard, 17 through 39
/// Premium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Standard,
    Premium,
}

impl Tier {
    pub fn for_index(index: usize) -> Tier {
        if index <= STANDARD_TIER_MAX_INDEX {
            Tier::Standard
        } else {
            Tier::Premium
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Standard => "Standard",
            Tier::Premium => "Premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document path for a location's single live observation record.
pub fn observation_path(city: &str) -> DocPath {
    DocPath::new([city.to_string(), OBSERVATION_DOC.to_string()])
}

/// Document path for one forecast entry. Entry identity is
/// `(location, tier, index)`, writing one index never touches another.
pub fn forecast_path(city: &str, tier: Tier, index: usize) -> DocPath {
    DocPath::new([
        city.to_string(),
        FORECAST_DOC.to_string(),
        tier.as_str().to_string(),
        index.to_string(),
    ])
}

/// Stored shape of a current-weather record. Field names are the document
/// schema the mobile clients read, do not rename them.
#[derive(Debug, Serialize)]
pub struct ObservationRecord {
    pub city: String,
    pub temperature: f64,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub pressure: Option<f64>,
    pub humidity: f64,
    pub wind_speed: f64,
    pub wind_deg: Option<f64>,
    pub description: String,
    pub icon: String,
    pub sunrise: Option<String>,
    pub sunset: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Stored shape of one forecast entry.
#[derive(Debug, Serialize)]
pub struct ForecastRecord {
    pub index: usize,
    pub datetime: Option<String>,
    pub temp: f64,
    pub pressure: Option<f64>,
    pub humidity: f64,
    pub description: String,
    pub icon: String,
    pub wind_speed: f64,
    pub wind_deg: Option<f64>,
    pub pop: f64,
    pub timestamp_request: DateTime<Utc>,
}

/// Reshape a provider current-weather response into the stored record.
pub fn reshape_observation(
    city: &str,
    conditions: &CurrentConditions,
    written_at: DateTime<Utc>,
) -> Result<ObservationRecord, IngestError> {
    let condition = conditions
        .weather
        .first()
        .ok_or(IngestError::Malformed("empty weather array"))?;
    let sun = conditions.sys.as_ref();

    Ok(ObservationRecord {
        city: conditions.name.clone().unwrap_or_else(|| city.to_string()),
        temperature: conditions.main.temp,
        temp_min: conditions.main.temp_min,
        temp_max: conditions.main.temp_max,
        pressure: conditions.main.pressure,
        humidity: conditions.main.humidity,
        wind_speed: conditions.wind.speed,
        wind_deg: conditions.wind.deg,
        description: condition.description.clone(),
        icon: condition.icon.clone(),
        sunrise: sun.and_then(|s| s.sunrise).and_then(local_hhmm),
        sunset: sun.and_then(|s| s.sunset).and_then(local_hhmm),
        timestamp: written_at,
    })
}

/// Reshape one forecast list entry. A missing precipitation probability is
/// stored as 0.
pub fn reshape_forecast(
    index: usize,
    slot: &ForecastSlot,
    written_at: DateTime<Utc>,
) -> Result<ForecastRecord, IngestError> {
    let condition = slot
        .weather
        .first()
        .ok_or(IngestError::Malformed("empty weather array"))?;

    Ok(ForecastRecord {
        index,
        datetime: slot.dt_txt.clone(),
        temp: slot.main.temp,
        pressure: slot.main.pressure,
        humidity: slot.main.humidity,
        description: condition.description.clone(),
        icon: condition.icon.clone(),
        wind_speed: slot.wind.speed,
        wind_deg: slot.wind.deg,
        pop: slot.pop.unwrap_or(0.0),
        timestamp_request: written_at,
    })
}

fn local_hhmm(epoch: i64) -> Option<String> {
    let offset = FixedOffset::east_opt(LOCAL_UTC_OFFSET_SECS)?;
    let local = offset.timestamp_opt(epoch, 0).single()?;
    Some(local.format("%H:%M").to_string())
}

/// Overwrite the single observation record for a location.
pub async fn store_observation(
    store: &dyn DocumentStore,
    city: &str,
    conditions: &CurrentConditions,
    written_at: DateTime<Utc>,
) -> Result<(), IngestError> {
    let record = reshape_observation(city, conditions, written_at)?;
    let fields = serde_json::to_value(&record).map_err(IngestError::Encode)?;
    store.set(&observation_path(city), &fields).await?;
    Ok(())
}

/// Overwrite one record per returned forecast entry, list position as index.
///
/// When the provider returns fewer entries than a previous run did, the
/// higher indices keep their old values. Stale-entry cleanup is out of
/// scope, readers are expected to tolerate it.
pub async fn store_forecast(
    store: &dyn DocumentStore,
    city: &str,
    forecast: &ForecastResponse,
    written_at: DateTime<Utc>,
) -> Result<usize, IngestError> {
    for (index, slot) in forecast.list.iter().enumerate() {
        let record = reshape_forecast(index, slot, written_at)?;
        let fields = serde_json::to_value(&record).map_err(IngestError::Encode)?;
        store
            .set(&forecast_path(city, Tier::for_index(index), index), &fields)
            .await?;
    }
    Ok(forecast.list.len())
}

/// Weather provider seam so batch semantics stay testable without a network.
#[async_trait]
pub trait WeatherApi: Send + Sync {
    async fn current(&self, city: &str) -> Result<CurrentConditions, ClientError>;
    async fn forecast(&self, city: &str) -> Result<ForecastResponse, ClientError>;
}

#[async_trait]
impl WeatherApi for OpenWeatherClient {
    async fn current(&self, city: &str) -> Result<CurrentConditions, ClientError> {
        OpenWeatherClient::current(self, city).await
    }

    async fn forecast(&self, city: &str) -> Result<ForecastResponse, ClientError> {
        OpenWeatherClient::forecast(self, city).await
    }
}

/// What to do with the rest of the batch once a location fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Skip the remaining locations on the first failure. The default.
    AbortOnError,
    /// Record the failure and keep going.
    ContinueOnError,
}

/// Per-location outcome of one scheduled ingestion run.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<(String, Result<(), IngestError>)>,
    pub aborted: bool,
}

impl BatchReport {
    pub fn ok_count(&self) -> usize {
        self.results.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn err_count(&self) -> usize {
        self.results.len() - self.ok_count()
    }

    pub fn first_error(&self) -> Option<(&str, &IngestError)> {
        self.results
            .iter()
            .find_map(|(city, r)| r.as_ref().err().map(|e| (city.as_str(), e)))
    }

    /// Record an outcome, returns true when the batch should stop here.
    fn push(&mut self, city: &str, outcome: Result<(), IngestError>, policy: BatchPolicy) -> bool {
        let failed = outcome.is_err();
        self.results.push((city.to_string(), outcome));
        if failed && policy == BatchPolicy::AbortOnError {
            self.aborted = true;
        }
        self.aborted
    }
}

/// Runs scheduled ingestion over the configured location list, sequentially
/// and on a single task. Each location is fetch, reshape, overwrite.
pub struct Ingester {
    api: Arc<dyn WeatherApi>,
    store: Arc<dyn DocumentStore>,
    locations: Vec<String>,
    policy: BatchPolicy,
}

impl Ingester {
    pub fn new(
        api: Arc<dyn WeatherApi>,
        store: Arc<dyn DocumentStore>,
        locations: Vec<String>,
        policy: BatchPolicy,
    ) -> Self {
        Ingester {
            api,
            store,
            locations,
            policy,
        }
    }

    /// One observation ingestion run over every configured location.
    pub async fn run_observations(&self) -> BatchReport {
        let written_at = Utc::now();
        let mut report = BatchReport::default();
        for city in &self.locations {
            let outcome = self.ingest_observation(city, written_at).await;
            if report.push(city, outcome, self.policy) {
                break;
            }
        }
        report
    }

    /// One forecast ingestion run over every configured location.
    pub async fn run_forecasts(&self) -> BatchReport {
        let written_at = Utc::now();
        let mut report = BatchReport::default();
        for city in &self.locations {
            let outcome = self.ingest_forecast(city, written_at).await;
            if report.push(city, outcome, self.policy) {
                break;
            }
        }
        report
    }

    async fn ingest_observation(&self, city: &str, written_at: DateTime<Utc>) -> Result<(), IngestError> {
        let conditions = self.api.current(city).await?;
        store_observation(self.store.as_ref(), city, &conditions, written_at).await?;
        tracing::info!(message = "stored current conditions", city = %city);
        Ok(())
    }

    async fn ingest_forecast(&self, city: &str, written_at: DateTime<Utc>) -> Result<(), IngestError> {
        let forecast = self.api.forecast(city).await?;
        let entries = store_forecast(self.store.as_ref(), city, &forecast, written_at).await?;
        tracing::info!(message = "stored forecast entries", city = %city, entries = entries);
        Ok(())
    }
}
