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

use crate::ingest::BatchReport;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum IngestKind {
    Observation,
    Forecast,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: IngestKind,
}

/// Counters for scheduled ingestion runs, labelled by kind.
///
/// All metrics share the prefix `owm_` and are registered on construction.
#[derive(Clone)]
pub struct IngestMetrics {
    runs: Family<KindLabels, Counter>,
    locations: Family<KindLabels, Counter>,
    failures: Family<KindLabels, Counter>,
}

impl IngestMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let runs = Family::<KindLabels, Counter>::default();
        registry.register("owm_ingest_runs", "Completed ingestion runs", runs.clone());

        let locations = Family::<KindLabels, Counter>::default();
        registry.register(
            "owm_ingest_locations",
            "Locations successfully written by ingestion runs",
            locations.clone(),
        );

        let failures = Family::<KindLabels, Counter>::default();
        registry.register(
            "owm_ingest_failures",
            "Locations that failed during ingestion runs",
            failures.clone(),
        );

        IngestMetrics {
            runs,
            locations,
            failures,
        }
    }

    pub fn observe(&self, kind: IngestKind, report: &BatchReport) {
        let labels = KindLabels { kind };
        self.runs.get_or_create(&labels).inc();
        self.locations
            .get_or_create(&labels)
            .inc_by(report.ok_count() as u64);
        self.failures
            .get_or_create(&labels)
            .inc_by(report.err_count() as u64);
    }
}

/// Counters for the tile proxy endpoint.
#[derive(Clone, Default)]
pub struct TileMetrics {
    requests: Counter,
    errors: Counter,
}

impl TileMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = TileMetrics::default();
        registry.register(
            "owm_tile_requests",
            "Tile proxy requests received",
            metrics.requests.clone(),
        );
        registry.register(
            "owm_tile_errors",
            "Tile proxy requests answered with an error",
            metrics.errors.clone(),
        );
        metrics
    }

    pub fn request(&self) {
        self.requests.inc();
    }

    pub fn error(&self) {
        self.errors.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestError;

    #[test]
    fn report_counts_feed_the_counters() {
        let mut registry = Registry::default();
        let metrics = IngestMetrics::new(&mut registry);

        let report = BatchReport {
            results: vec![
                ("Madrid".to_string(), Ok(())),
                ("Palma".to_string(), Err(IngestError::Malformed("empty weather array"))),
            ],
            aborted: true,
        };
        metrics.observe(IngestKind::Forecast, &report);

        let labels = KindLabels {
            kind: IngestKind::Forecast,
        };
        assert_eq!(metrics.runs.get_or_create(&labels).get(), 1);
        assert_eq!(metrics.locations.get_or_create(&labels).get(), 1);
        assert_eq!(metrics.failures.get_or_create(&labels).get(), 1);
    }

    #[test]
    fn tile_counters_increment() {
        let mut registry = Registry::default();
        let metrics = TileMetrics::new(&mut registry);
        metrics.request();
        metrics.request();
        metrics.error();
        assert_eq!(metrics.requests.get(), 2);
        assert_eq!(metrics.errors.get(), 1);
    }
}
