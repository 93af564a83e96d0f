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

use crate::tiles::TileRequest;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Deserialize;
use std::error;
use std::fmt;

const ERROR_BODY_MAX: usize = 300;

#[derive(Debug)]
pub enum ClientError {
    MissingApiKey,
    Timeout,
    Internal(reqwest::Error),
    Unexpected(StatusCode, String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingApiKey => write!(f, "OPENWEATHER_API_KEY is not configured"),
            Self::Timeout => write!(f, "timed out waiting for OpenWeather"),
            Self::Internal(e) => write!(f, "{}", e),
            Self::Unexpected(status, body) => write!(f, "OpenWeather error {}: {}", status, body),
        }
    }
}

impl error::Error for ClientError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(e) => Some(e),
            _ => None,
        }
    }
}

/// Client for the OpenWeather data and tile APIs.
///
/// All calls share a single pooled `reqwest::Client`. The API key is held as
/// an `Option` on purpose: the process is expected to start (and the tile
/// proxy to answer 500) even when `OPENWEATHER_API_KEY` is missing from the
/// environment.
#[derive(Debug, Clone)]
pub struct OpenWeatherClient {
    client: Client,
    base_url: Url,
    tile_url: Url,
    api_key: Option<String>,
    lang: Option<String>,
}

impl OpenWeatherClient {
    const TILE_OPACITY: &'static str = "0.5";
    // Transparent retries for connection-level failures, mirroring what the
    // pooled adapter used to do. Timeouts are never retried.
    const TILE_CONNECT_RETRIES: usize = 2;

    pub fn new(
        client: Client,
        base_url: Url,
        tile_url: Url,
        api_key: Option<String>,
        lang: Option<String>,
    ) -> Self {
        OpenWeatherClient {
            client,
            base_url,
            tile_url,
            api_key,
            lang,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn api_key(&self) -> Result<&str, ClientError> {
        self.api_key.as_deref().ok_or(ClientError::MissingApiKey)
    }

    /// Fetch current conditions for a city, metric units.
    pub async fn current(&self, city: &str) -> Result<CurrentConditions, ClientError> {
        let url = self.weather_url(city)?;
        tracing::debug!(message = "making current conditions request", city = %city);

        let res = self.make_request(url).await?;
        res.json::<CurrentConditions>().await.map_err(map_transport)
    }

    /// Fetch the 5-day/3-hour forecast for a city, metric units, localized
    /// descriptions when a language hint is configured.
    pub async fn forecast(&self, city: &str) -> Result<ForecastResponse, ClientError> {
        let url = self.forecast_url(city)?;
        tracing::debug!(message = "making forecast request", city = %city);

        let res = self.make_request(url).await?;
        res.json::<ForecastResponse>().await.map_err(map_transport)
    }

    /// Fetch a single map tile image for an already validated tile request.
    pub async fn tile(&self, request: &TileRequest) -> Result<Bytes, ClientError> {
        let url = self.tile_image_url(request)?;
        tracing::debug!(message = "making tile request", code = %request.code, date = request.date);

        let mut attempt = 0;
        let res = loop {
            match self.make_request(url.clone()).await {
                Err(ClientError::Internal(e)) if e.is_connect() && attempt < Self::TILE_CONNECT_RETRIES => {
                    attempt += 1;
                    tracing::debug!(message = "retrying tile request", attempt = attempt, error = %e);
                }
                other => break other,
            }
        }?;

        res.bytes().await.map_err(map_transport)
    }

    async fn make_request(&self, url: Url) -> Result<Response, ClientError> {
        let res = self.client.get(url).send().await.map_err(map_transport)?;

        let status = res.status();
        if status == StatusCode::OK {
            Ok(res)
        } else {
            let body = res.text().await.unwrap_or_default();
            Err(ClientError::Unexpected(status, truncate_body(&body)))
        }
    }

    fn weather_url(&self, city: &str) -> Result<Url, ClientError> {
        let mut url = self.data_url("weather");
        url.query_pairs_mut()
            .append_pair("q", city)
            .append_pair("appid", self.api_key()?)
            .append_pair("units", "metric");
        Ok(url)
    }

    fn forecast_url(&self, city: &str) -> Result<Url, ClientError> {
        let mut url = self.data_url("forecast");
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("q", city)
                .append_pair("appid", self.api_key()?)
                .append_pair("units", "metric");
            if let Some(lang) = &self.lang {
                pairs.append_pair("lang", lang);
            }
        }
        Ok(url)
    }

    fn data_url(&self, endpoint: &str) -> Url {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map(|mut p| {
                p.clear().push("data").push("2.5").push(endpoint);
            })
            .expect("unable to modify weather URL path segments");
        url
    }

    fn tile_image_url(&self, request: &TileRequest) -> Result<Url, ClientError> {
        let mut url = self.tile_url.clone();
        url.path_segments_mut()
            .map(|mut p| {
                p.clear()
                    .push("maps")
                    .push("2.0")
                    .push("weather")
                    .push(request.code)
                    .push(&request.z.to_string())
                    .push(&request.x.to_string())
                    .push(&request.y.to_string());
            })
            .expect("unable to modify tile URL path segments");
        url.query_pairs_mut()
            .append_pair("date", &request.date.to_string())
            .append_pair("opacity", Self::TILE_OPACITY)
            .append_pair("appid", self.api_key()?);
        Ok(url)
    }
}

/// Timeouts can fire during `send()` or while the body is still streaming
/// in, both have to surface as [`ClientError::Timeout`].
fn map_transport(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Internal(e)
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() > ERROR_BODY_MAX {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i <= ERROR_BODY_MAX)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}...", &body[..cut])
    } else {
        body.to_string()
    }
}

#[derive(Deserialize, Debug)]
pub struct CurrentConditions {
    pub name: Option<String>,
    pub main: MainReadings,
    pub wind: Wind,
    pub weather: Vec<Condition>,
    pub sys: Option<SunTimes>,
}

#[derive(Deserialize, Debug)]
pub struct ForecastResponse {
    pub list: Vec<ForecastSlot>,
}

#[derive(Deserialize, Debug)]
pub struct ForecastSlot {
    pub dt_txt: Option<String>,
    pub main: MainReadings,
    pub weather: Vec<Condition>,
    pub wind: Wind,
    pub pop: Option<f64>,
}

#[derive(Deserialize, Debug)]
pub struct MainReadings {
    pub temp: f64,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub pressure: Option<f64>,
    pub humidity: f64,
}

#[derive(Deserialize, Debug)]
pub struct Wind {
    pub speed: f64,
    pub deg: Option<f64>,
}

#[derive(Deserialize, Debug)]
pub struct Condition {
    pub description: String,
    pub icon: String,
}

#[derive(Deserialize, Debug)]
pub struct SunTimes {
    pub sunrise: Option<i64>,
    pub sunset: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tiles::TileRequest;

    fn client(api_key: Option<&str>) -> OpenWeatherClient {
        OpenWeatherClient::new(
            Client::new(),
            Url::parse("https://api.openweathermap.org/").unwrap(),
            Url::parse("http://maps.openweathermap.org/").unwrap(),
            api_key.map(String::from),
            Some("es".to_string()),
        )
    }

    #[test]
    fn weather_url_has_city_and_units() {
        let url = client(Some("k123")).weather_url("Palma").unwrap();
        assert_eq!(url.path(), "/data/2.5/weather");
        let query = url.query().unwrap();
        assert!(query.contains("q=Palma"));
        assert!(query.contains("appid=k123"));
        assert!(query.contains("units=metric"));
        assert!(!query.contains("lang="));
    }

    #[test]
    fn forecast_url_has_language_hint() {
        let url = client(Some("k123")).forecast_url("Inca").unwrap();
        assert_eq!(url.path(), "/data/2.5/forecast");
        assert!(url.query().unwrap().contains("lang=es"));
    }

    #[test]
    fn tile_url_shape() {
        let request = TileRequest {
            code: "CL",
            z: 3,
            x: 4,
            y: 2,
            date: 3600,
        };
        let url = client(Some("k123")).tile_image_url(&request).unwrap();
        assert_eq!(url.path(), "/maps/2.0/weather/CL/3/4/2");
        let query = url.query().unwrap();
        assert!(query.contains("date=3600"));
        assert!(query.contains("opacity=0.5"));
    }

    #[test]
    fn missing_api_key_short_circuits() {
        let err = client(None).weather_url("Madrid").unwrap_err();
        assert!(matches!(err, ClientError::MissingApiKey));
    }

    #[test]
    fn deserialize_current_conditions() {
        let body = r#"{
            "name": "Madrid",
            "main": {"temp": 21.3, "temp_min": 19.0, "temp_max": 24.1, "pressure": 1017, "humidity": 40},
            "wind": {"speed": 3.6, "deg": 220},
            "weather": [{"description": "cielo claro", "icon": "01d"}],
            "sys": {"sunrise": 1700000000, "sunset": 1700035200}
        }"#;
        let conditions: CurrentConditions = serde_json::from_str(body).unwrap();
        assert_eq!(conditions.name.as_deref(), Some("Madrid"));
        assert_eq!(conditions.main.humidity, 40.0);
        assert_eq!(conditions.weather[0].icon, "01d");
    }

    #[test]
    fn deserialize_forecast_without_pop() {
        let body = r#"{
            "list": [{
                "dt_txt": "2024-03-01 12:00:00",
                "main": {"temp": 12.0, "humidity": 60},
                "weather": [{"description": "nubes", "icon": "03d"}],
                "wind": {"speed": 2.0}
            }]
        }"#;
        let forecast: ForecastResponse = serde_json::from_str(body).unwrap();
        assert_eq!(forecast.list.len(), 1);
        assert!(forecast.list[0].pop.is_none());
        assert!(forecast.list[0].main.pressure.is_none());
        assert!(forecast.list[0].wind.deg.is_none());
    }

    #[tokio::test]
    async fn timeout_while_reading_the_body_maps_to_timeout() {
        use std::time::Duration;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Answer with headers and a partial body, then stall past the
        // client timeout so the failure happens mid-read, not on send.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100000\r\n\r\npartial")
                .await
                .unwrap();
            sock.flush().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let base = Url::parse(&format!("http://{}/", addr)).unwrap();
        let weather = OpenWeatherClient::new(
            Client::builder()
                .timeout(Duration::from_millis(300))
                .build()
                .unwrap(),
            base.clone(),
            base,
            Some("k123".to_string()),
            None,
        );
        let request = TileRequest {
            code: "TA2",
            z: 0,
            x: 0,
            y: 0,
            date: 0,
        };
        let err = weather.tile(&request).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(2000);
        let truncated = truncate_body(&body);
        assert!(truncated.len() < 400);
        assert!(truncated.ends_with("..."));
    }
}
