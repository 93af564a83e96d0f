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

use clap::Parser;
use owm_bridge::client::OpenWeatherClient;
use owm_bridge::http::RequestContext;
use owm_bridge::ingest::{BatchPolicy, Ingester, DEFAULT_LOCATIONS};
use owm_bridge::metrics::{IngestKind, IngestMetrics, TileMetrics};
use owm_bridge::store::{DocumentStore, FirestoreStore, ServiceAccount, StaticTokenSource};
use prometheus_client::registry::Registry;
use reqwest::{Client, Url};
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tracing::{Instrument, Level};

const DEFAULT_LOG_LEVEL: Level = Level::INFO;
const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 9784);
const DEFAULT_OBSERVATION_REFRESH_SECS: u64 = 3600;
const DEFAULT_FORECAST_REFRESH_SECS: u64 = 10800;
const DEFAULT_TIMEOUT_MILLIS: u64 = 10000;
const DEFAULT_API_URL: &str = "https://api.openweathermap.org/";
const DEFAULT_TILE_URL: &str = "http://maps.openweathermap.org/";
// Generous idle pool, tiles arrive in bursts when a client pans the map.
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const API_KEY_VAR: &str = "OPENWEATHER_API_KEY";
const FORECAST_LANG: &str = "es";

#[derive(Debug, Parser)]
#[clap(name = "owm_bridge", version = clap::crate_version!())]
struct OwmBridgeApplication {
    /// Locations to ingest weather for, comma separated
    #[clap(long, value_delimiter = ',', default_values_t = DEFAULT_LOCATIONS.iter().map(|s| s.to_string()))]
    locations: Vec<String>,

    /// Base URL for the OpenWeather data API
    #[clap(long, default_value_t = DEFAULT_API_URL.into())]
    api_url: String,

    /// Base URL for the OpenWeather tile API
    #[clap(long, default_value_t = DEFAULT_TILE_URL.into())]
    tile_url: String,

    /// Base URL for the Firestore REST API
    #[clap(long, default_value_t = FirestoreStore::DEFAULT_URL.into())]
    firestore_url: String,

    /// Logging verbosity. Allowed values are 'trace', 'debug', 'info', 'warn', and 'error'
    /// (case insensitive)
    #[clap(long, default_value_t = DEFAULT_LOG_LEVEL)]
    log_level: Level,

    /// Ingest current conditions at this interval, in seconds.
    #[clap(long, default_value_t = DEFAULT_OBSERVATION_REFRESH_SECS)]
    observation_refresh_secs: u64,

    /// Ingest the 5-day forecast at this interval, in seconds.
    #[clap(long, default_value_t = DEFAULT_FORECAST_REFRESH_SECS)]
    forecast_refresh_secs: u64,

    /// Timeout for outbound provider and store requests, in milliseconds.
    #[clap(long, default_value_t = DEFAULT_TIMEOUT_MILLIS)]
    timeout_millis: u64,

    /// Keep ingesting the remaining locations when one of them fails,
    /// instead of aborting the rest of the run.
    #[clap(long)]
    continue_on_error: bool,

    /// Address to bind to.
    #[clap(long, default_value_t = DEFAULT_BIND_ADDR.into())]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = OwmBridgeApplication::parse();
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opts.log_level)
            .finish(),
    )
    .expect("failed to set tracing subscriber");

    let timeout = Duration::from_millis(opts.timeout_millis);
    let http_client = Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize HTTP client", error = %e);
            process::exit(1)
        });

    let api_url = parse_url(&opts.api_url);
    let tile_url = parse_url(&opts.tile_url);
    let firestore_url = parse_url(&opts.firestore_url);

    // Ingestion runs and the tile proxy both fail per call without a key,
    // the process itself still starts so the failure shows up in logs and
    // metrics instead of a crash loop.
    let api_key = std::env::var(API_KEY_VAR).ok();
    if api_key.is_none() {
        tracing::warn!(message = "API key not set, provider requests will fail", var = API_KEY_VAR);
    }

    let account = ServiceAccount::from_env().unwrap_or_else(|e| {
        tracing::error!(message = "incomplete store credentials", error = %e);
        process::exit(1)
    });
    let token = StaticTokenSource::from_env().unwrap_or_else(|e| {
        tracing::error!(message = "missing store access token", error = %e);
        process::exit(1)
    });
    tracing::info!(
        message = "using service account",
        project_id = %account.project_id,
        client_email = %account.client_email,
    );

    let weather = Arc::new(OpenWeatherClient::new(
        http_client.clone(),
        api_url,
        tile_url,
        api_key,
        Some(FORECAST_LANG.to_string()),
    ));
    let store: Arc<dyn DocumentStore> = Arc::new(FirestoreStore::new(
        http_client,
        firestore_url,
        account,
        Box::new(token),
    ));

    let mut registry = Registry::default();
    let ingest_metrics = IngestMetrics::new(&mut registry);
    let tile_metrics = TileMetrics::new(&mut registry);

    let policy = if opts.continue_on_error {
        BatchPolicy::ContinueOnError
    } else {
        BatchPolicy::AbortOnError
    };
    let ingester = Arc::new(Ingester::new(
        weather.clone(),
        store,
        opts.locations.clone(),
        policy,
    ));

    tracing::info!(
        message = "ingestion started",
        api_url = %opts.api_url,
        locations = opts.locations.len(),
    );
    spawn_ingest_loop(
        ingester.clone(),
        IngestKind::Observation,
        Duration::from_secs(opts.observation_refresh_secs),
        ingest_metrics.clone(),
    );
    spawn_ingest_loop(
        ingester,
        IngestKind::Forecast,
        Duration::from_secs(opts.forecast_refresh_secs),
        ingest_metrics,
    );

    let context = Arc::new(RequestContext::new(weather, registry, tile_metrics));
    let router = owm_bridge::http::router(context);
    let server = axum::Server::try_bind(&opts.bind).unwrap_or_else(|e| {
        tracing::error!(message = "error binding to address", address = %opts.bind, error = %e);
        process::exit(1)
    });

    tracing::info!(message = "server started", address = %opts.bind);
    server
        .serve(router.into_make_service())
        .with_graceful_shutdown(async {
            // Wait for either SIGTERM or SIGINT to shutdown
            tokio::select! {
                _ = sigterm() => {}
                _ = sigint() => {}
            }
        })
        .await?;

    tracing::info!("server shutdown");
    Ok(())
}

fn spawn_ingest_loop(ingester: Arc<Ingester>, kind: IngestKind, period: Duration, metrics: IngestMetrics) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            let _ = interval.tick().await;
            let report = async {
                match kind {
                    IngestKind::Observation => ingester.run_observations().await,
                    IngestKind::Forecast => ingester.run_forecasts().await,
                }
            }
            .instrument(tracing::span!(Level::DEBUG, "ingest_run"))
            .await;

            metrics.observe(kind, &report);
            match report.first_error() {
                Some((city, e)) => {
                    tracing::error!(
                        message = "ingestion batch failed",
                        kind = ?kind,
                        city = %city,
                        error = %e,
                        completed = report.ok_count(),
                        aborted = report.aborted,
                    );
                }
                None => {
                    tracing::info!(
                        message = "ingestion batch complete",
                        kind = ?kind,
                        locations = report.ok_count(),
                    );
                }
            }
        }
    });
}

fn parse_url(raw: &str) -> Url {
    Url::parse(raw).unwrap_or_else(|e| {
        tracing::error!(message = "invalid base URL", url = %raw, error = %e);
        process::exit(1)
    })
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
