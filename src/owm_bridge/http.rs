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

use crate::client::{ClientError, OpenWeatherClient};
use crate::ingest::{reshape_observation, ObservationRecord};
use crate::metrics::TileMetrics;
use crate::tiles::{MapQuery, TileRequest};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

const DEFAULT_CITY: &str = "Madrid";
const TILE_CACHE_CONTROL: &str = "public, max-age=300";
const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Everything the handlers need, built once at startup and shared. Keeping
/// this explicit (instead of module-level globals) keeps initialization
/// order and test substitution obvious.
pub struct RequestContext {
    weather: Arc<OpenWeatherClient>,
    registry: Registry,
    tiles: TileMetrics,
}

impl RequestContext {
    pub fn new(weather: Arc<OpenWeatherClient>, registry: Registry, tiles: TileMetrics) -> Self {
        RequestContext {
            weather,
            registry,
            tiles,
        }
    }
}

pub fn router(context: Arc<RequestContext>) -> Router {
    Router::new()
        .route("/get_map", get(get_map))
        .route("/test_weather", get(test_weather))
        .route("/metrics", get(text_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

/// Tile proxy. Validates the query, translates the layer alias, buckets the
/// timestamp to the hour and forwards to the provider, passing the image
/// bytes straight back.
async fn get_map(State(context): State<Arc<RequestContext>>, Query(query): Query<MapQuery>) -> Response {
    context.tiles.request();

    let request = match TileRequest::from_query(&query, Utc::now().timestamp()) {
        Ok(request) => request,
        Err(help) => {
            context.tiles.error();
            return (StatusCode::BAD_REQUEST, help).into_response();
        }
    };

    if !context.weather.has_api_key() {
        context.tiles.error();
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            ClientError::MissingApiKey.to_string(),
        )
            .into_response();
    }

    tracing::debug!(
        message = "proxying tile",
        op = query.op.as_deref().unwrap_or(""),
        code = %request.code,
        date = request.date,
    );

    match context.weather.tile(&request).await {
        Ok(image) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, TILE_CACHE_CONTROL),
                (header::CONNECTION, "keep-alive"),
            ],
            image,
        )
            .into_response(),
        Err(e) => {
            context.tiles.error();
            tracing::error!(message = "tile request failed", error = %e);
            tile_error_response(e)
        }
    }
}

/// Provider and transport failures mapped onto the proxy's own status codes.
fn tile_error_response(error: ClientError) -> Response {
    match error {
        ClientError::Unexpected(status, body) => {
            (status, format!("Error fetching map tile: {} - {}", status, body))
        }
        ClientError::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            "Timed out fetching map tile".to_string(),
        ),
        ClientError::MissingApiKey => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        ClientError::Internal(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Connection error: {}", e),
        ),
    }
    .into_response()
}

#[derive(Debug, Deserialize)]
struct WeatherQuery {
    city: Option<String>,
}

/// Fetch-and-reshape check endpoint: returns the observation record that an
/// ingestion run would store for the city, without writing anything.
async fn test_weather(
    State(context): State<Arc<RequestContext>>,
    Query(query): Query<WeatherQuery>,
) -> Response {
    let city = query.city.as_deref().unwrap_or(DEFAULT_CITY);
    match fetch_observation(&context, city).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response(),
    }
}

async fn fetch_observation(
    context: &RequestContext,
    city: &str,
) -> Result<ObservationRecord, Box<dyn std::error::Error + Send + Sync>> {
    let conditions = context.weather.current(city).await?;
    Ok(reshape_observation(city, &conditions, Utc::now())?)
}

async fn text_metrics(State(context): State<Arc<RequestContext>>) -> Response {
    let mut buf = String::new();
    match encode(&mut buf, &context.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)],
            buf,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}
