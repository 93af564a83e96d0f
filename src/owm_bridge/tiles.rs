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

use serde::Deserialize;

/// Layer code used when the requested alias is not in the table. Unknown
/// aliases are not an error, callers get the temperature layer.
pub const DEFAULT_LAYER_CODE: &str = "TA2";

/// Message returned with a 400 when any mandatory tile parameter is missing.
pub const MISSING_PARAMS_HELP: &str =
    "Missing parameters. Use: ?op={layer}&z={zoom}&x={x}&y={y}&timestamp={unix_time}";

const HOUR_SECS: i64 = 3600;

/// Translate a Weather Maps 1.0 layer alias to its 2.0 layer code.
pub fn layer_code(alias: &str) -> &'static str {
    match alias {
        "temp_new" => "TA2",
        "clouds_new" => "CL",
        "precipitation_new" => "PR0",
        "pressure_new" => "APM",
        "wind_new" => "WND",
        _ => DEFAULT_LAYER_CODE,
    }
}

/// Round an epoch timestamp down to the hour. The provider only keeps hourly
/// tile snapshots, anything finer grained would miss the cache.
pub fn bucket_hour(ts: i64) -> i64 {
    ts.div_euclid(HOUR_SECS) * HOUR_SECS
}

/// Raw `get_map` query string, everything optional so that missing
/// parameters can be reported with a helpful message instead of a
/// framework rejection.
#[derive(Debug, Default, Deserialize)]
pub struct MapQuery {
    pub op: Option<String>,
    pub z: Option<u32>,
    pub x: Option<u32>,
    pub y: Option<u32>,
    pub timestamp: Option<i64>,
}

/// A validated tile request, ready to be turned into a provider URL.
#[derive(Debug, PartialEq, Eq)]
pub struct TileRequest {
    pub code: &'static str,
    pub z: u32,
    pub x: u32,
    pub y: u32,
    pub date: i64,
}

impl TileRequest {
    /// Validate a raw query, bucketing the supplied timestamp (or `now` when
    /// none was given) to the hour. An empty `op=` counts as missing.
    pub fn from_query(query: &MapQuery, now: i64) -> Result<TileRequest, &'static str> {
        let op = query.op.as_deref().filter(|s| !s.is_empty());
        let (op, z, x, y) = match (op, query.z, query.x, query.y) {
            (Some(op), Some(z), Some(x), Some(y)) => (op, z, x, y),
            _ => return Err(MISSING_PARAMS_HELP),
        };

        Ok(TileRequest {
            code: layer_code(op),
            z,
            x,
            y,
            date: bucket_hour(query.timestamp.unwrap_or(now)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_aliases_translate() {
        assert_eq!(layer_code("temp_new"), "TA2");
        assert_eq!(layer_code("clouds_new"), "CL");
        assert_eq!(layer_code("precipitation_new"), "PR0");
        assert_eq!(layer_code("pressure_new"), "APM");
        assert_eq!(layer_code("wind_new"), "WND");
    }

    #[test]
    fn unknown_alias_falls_back_to_temperature() {
        assert_eq!(layer_code("radar"), "TA2");
        assert_eq!(layer_code(""), "TA2");
    }

    #[test]
    fn bucket_rounds_down_to_hour() {
        assert_eq!(bucket_hour(3599), 0);
        assert_eq!(bucket_hour(3600), 3600);
        assert_eq!(bucket_hour(7201), 7200);
    }

    #[test]
    fn missing_mandatory_parameter_is_reported() {
        let query = MapQuery {
            op: Some("CL".to_string()),
            z: Some(3),
            x: Some(4),
            y: None,
            timestamp: None,
        };
        let err = TileRequest::from_query(&query, 0).unwrap_err();
        assert!(err.contains("?op={layer}&z={zoom}&x={x}&y={y}"));
    }

    #[test]
    fn empty_layer_alias_counts_as_missing() {
        let query = MapQuery {
            op: Some(String::new()),
            z: Some(1),
            x: Some(2),
            y: Some(3),
            timestamp: None,
        };
        let err = TileRequest::from_query(&query, 0).unwrap_err();
        assert_eq!(err, MISSING_PARAMS_HELP);
    }

    #[test]
    fn supplied_timestamp_is_bucketed() {
        let query = MapQuery {
            op: Some("temp_new".to_string()),
            z: Some(1),
            x: Some(2),
            y: Some(3),
            timestamp: Some(3599),
        };
        let request = TileRequest::from_query(&query, 999_999).unwrap();
        assert_eq!(request.date, 0);
        assert_eq!(request.code, "TA2");
    }

    #[test]
    fn missing_timestamp_buckets_current_time() {
        let query = MapQuery {
            op: Some("wind_new".to_string()),
            z: Some(1),
            x: Some(2),
            y: Some(3),
            timestamp: None,
        };
        let request = TileRequest::from_query(&query, 7250).unwrap();
        assert_eq!(request.date, 7200);
    }
}
