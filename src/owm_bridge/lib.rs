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

//! OpenWeather ingestion and map tile proxy for the MeteoApp backend.
//!
//! ## Features
//!
//! `owm_bridge` keeps a Firestore database fed with weather data for a fixed
//! list of locations, and proxies weather map tiles for the mobile clients:
//!
//! * **Observation ingestion**: on a timer (hourly by default), the current
//!   conditions of every configured location are fetched from OpenWeather
//!   and written to `{location}/Actual`, fully replacing the previous
//!   record.
//! * **Forecast ingestion**: on a timer (every three hours by default), the
//!   5-day/3-hour forecast is fetched per location and its entries written
//!   to `{location}/Predicción/{tier}/{index}`, where indices 0-16 land in
//!   the `Standard` tier and 17-39 in `Premium`. Every run overwrites the
//!   indices it receives and leaves the rest alone.
//! * **Tile proxy**: `GET /get_map?op={layer}&z={zoom}&x={x}&y={y}&timestamp={unix_time}`
//!   translates Weather Maps 1.0 layer aliases to 2.0 codes, buckets the
//!   timestamp to the hour and returns the provider's PNG tile with a short
//!   public cache header.
//! * `GET /test_weather?city={name}` returns the reshaped observation record
//!   as JSON without writing it, handy for checking credentials.
//! * `GET /metrics` exposes ingestion and proxy counters in OpenMetrics
//!   text format.
//!
//! ## Configuration
//!
//! Operational knobs (bind address, refresh intervals, timeouts, location
//! list) are CLI flags, see `owm_bridge --help`. Credentials come from the
//! environment:
//!
//! * `OPENWEATHER_API_KEY` - provider API key
//! * `FIREBASE_PROJECT_ID` - Firestore project
//! * `FIREBASE_CLIENT_EMAIL` - service account email
//! * `FIREBASE_PRIVATE_KEY` - service account key, `\n`-escaped newlines
//! * `FIRESTORE_ACCESS_TOKEN` - bearer token for Firestore REST writes
//!
//! ## Run
//!
//! ```text
//! owm_bridge --locations Madrid,Palma --log-level debug
//! ```

pub mod client;
pub mod http;
pub mod ingest;
pub mod metrics;
pub mod store;
pub mod tiles;
