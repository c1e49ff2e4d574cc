//! Weather forecasts from the Open-Meteo API.
//!
//! Each lookup makes two GET requests (an hourly and a daily parameter
//! set). Missing or `null` samples read as zero. When the API cannot be
//! reached or returns no hourly data the caller gets a degraded, all-zero
//! report instead of an error.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error};

use crate::db::Farm;

pub const DEFAULT_BASE_URL: &str = "https://api.open-meteo.com/v1/forecast";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const HOURLY_PARAMS: &str = "temperature_2m,precipitation,cloud_cover,\
shortwave_radiation,direct_radiation,diffuse_radiation,\
direct_normal_irradiance,global_tilted_irradiance,relative_humidity_2m,\
soil_moisture_0_1cm,soil_moisture_1_3cm,soil_moisture_3_9cm,\
soil_temperature_6cm";

const DAILY_PARAMS: &str = "temperature_2m_max,temperature_2m_min,temperature_2m_mean,\
precipitation_sum,precipitation_probability_max,weather_code,\
sunrise,sunset,wind_speed_10m_max,wind_direction_10m_dominant";

// ---------------------------------------------------------------------------
// Series
// ---------------------------------------------------------------------------

/// Hourly samples, index-aligned with `time` (`YYYY-MM-DDTHH:MM`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HourlySeries {
    pub time: Vec<String>,
    pub temperature_2m: Vec<Option<f64>>,
    pub precipitation: Vec<Option<f64>>,
    pub cloud_cover: Vec<Option<f64>>,
    pub shortwave_radiation: Vec<Option<f64>>,
    pub direct_radiation: Vec<Option<f64>>,
    pub diffuse_radiation: Vec<Option<f64>>,
    pub direct_normal_irradiance: Vec<Option<f64>>,
    pub global_tilted_irradiance: Vec<Option<f64>>,
    pub relative_humidity_2m: Vec<Option<f64>>,
    pub soil_moisture_0_1cm: Vec<Option<f64>>,
    pub soil_moisture_1_3cm: Vec<Option<f64>>,
    pub soil_moisture_3_9cm: Vec<Option<f64>>,
    pub soil_temperature_6cm: Vec<Option<f64>>,
}

impl HourlySeries {
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
            && self.temperature_2m.is_empty()
            && self.precipitation.is_empty()
            && self.cloud_cover.is_empty()
            && self.global_tilted_irradiance.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DailySeries {
    pub time: Vec<String>,
    pub temperature_2m_max: Vec<Option<f64>>,
    pub temperature_2m_min: Vec<Option<f64>>,
    pub temperature_2m_mean: Vec<Option<f64>>,
    pub precipitation_sum: Vec<Option<f64>>,
    pub precipitation_probability_max: Vec<Option<f64>>,
    pub weather_code: Vec<Option<f64>>,
    pub sunrise: Vec<Option<String>>,
    pub sunset: Vec<Option<String>>,
    pub wind_speed_10m_max: Vec<Option<f64>>,
    pub wind_direction_10m_dominant: Vec<Option<f64>>,
}

/// Sample `idx` of a series, zero when out of range or `null`.
pub fn value_at(series: &[Option<f64>], idx: usize) -> f64 {
    series.get(idx).copied().flatten().unwrap_or(0.0)
}

/// Hourly and daily series for one farm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForecastBundle {
    pub hourly: HourlySeries,
    pub daily: DailySeries,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Deserialize)]
struct HourlyResponse {
    #[serde(default)]
    hourly: Option<HourlySeries>,
    timezone: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DailyResponse {
    #[serde(default)]
    daily: Option<DailySeries>,
}

// ---------------------------------------------------------------------------
// Slicing
// ---------------------------------------------------------------------------

/// Current conditions at the farm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub gti: f64,
    pub clouds: f64,
    pub rain: f64,
    pub temperature: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TomorrowForecast {
    pub clouds: f64,
    pub rain: f64,
}

/// Index of the current UTC hour in `times`. Falls back to the hour of day
/// clamped to the series, or 0 for an empty series.
pub fn resolve_now_index(times: &[String], now: DateTime<Utc>) -> usize {
    if times.is_empty() {
        return 0;
    }
    let key = now.format("%Y-%m-%dT%H:00").to_string();
    match times.iter().position(|t| *t == key) {
        Some(idx) => idx,
        None => {
            let idx = (now.hour() as usize).min(times.len() - 1);
            debug!("current hour {key} not in forecast, using index {idx}");
            idx
        }
    }
}

/// The sample 24 hours after `now_idx`, clamped to the series.
pub fn tomorrow_index(now_idx: usize, len: usize) -> usize {
    if len == 0 {
        now_idx + 24
    } else {
        (now_idx + 24).min(len - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherReport {
    pub current: WeatherSnapshot,
    pub tomorrow: TomorrowForecast,
    pub forecast: ForecastBundle,
    pub now_index: usize,
    /// Zeroed stand-in after a failed lookup.
    pub degraded: bool,
}

impl WeatherReport {
    pub fn from_bundle(forecast: ForecastBundle, now: DateTime<Utc>) -> Result<Self> {
        let h = &forecast.hourly;
        if h.is_empty() {
            bail!("no hourly data in weather response");
        }

        let now_index = resolve_now_index(&h.time, now);
        let tomorrow = tomorrow_index(now_index, h.time.len());

        let current = WeatherSnapshot {
            gti: value_at(&h.global_tilted_irradiance, now_index),
            clouds: value_at(&h.cloud_cover, now_index),
            rain: value_at(&h.precipitation, now_index),
            temperature: value_at(&h.temperature_2m, now_index),
        };
        let tomorrow = TomorrowForecast {
            clouds: value_at(&h.cloud_cover, tomorrow),
            rain: value_at(&h.precipitation, tomorrow),
        };

        Ok(Self {
            current,
            tomorrow,
            forecast,
            now_index,
            degraded: false,
        })
    }

    pub fn degraded(farm: &Farm) -> Self {
        Self {
            current: WeatherSnapshot::default(),
            tomorrow: TomorrowForecast::default(),
            forecast: ForecastBundle {
                timezone: farm.timezone.clone(),
                latitude: farm.latitude,
                longitude: farm.longitude,
                ..ForecastBundle::default()
            },
            now_index: 0,
            degraded: true,
        }
    }

    /// Forecast GTI for the hour after "now", if the series has one.
    pub fn next_hour_gti(&self) -> Option<f64> {
        let gti = &self.forecast.hourly.global_tilted_irradiance;
        let next = self.now_index + 1;
        (next < gti.len()).then(|| value_at(gti, next))
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Where forecasts come from.
pub trait WeatherSource: Send + Sync {
    fn fetch_forecast(
        &self,
        farm: &Farm,
        days: u32,
    ) -> impl Future<Output = Result<ForecastBundle>> + Send;
}

/// Fetch and slice a forecast, degrading to zeros on any failure.
pub async fn weather_report<W: WeatherSource>(
    source: &W,
    farm: &Farm,
    days: u32,
    now: DateTime<Utc>,
) -> WeatherReport {
    let result = match source.fetch_forecast(farm, days).await {
        Ok(bundle) => WeatherReport::from_bundle(bundle, now),
        Err(e) => Err(e),
    };
    match result {
        Ok(report) => {
            debug!(
                farm = farm.farm_id,
                gti = report.current.gti,
                temp = report.current.temperature,
                clouds = report.current.clouds,
                "weather fetched"
            );
            report
        }
        Err(e) => {
            error!(farm = farm.farm_id, "weather lookup for {} failed: {e:#}", farm.name);
            WeatherReport::degraded(farm)
        }
    }
}

/// Open-Meteo HTTP client.
#[derive(Debug, Clone)]
pub struct WeatherClient {
    http: reqwest::Client,
    base_url: String,
}

impl WeatherClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("farm-hub/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, query: &[(&str, String)]) -> Result<T> {
        let response = self
            .http
            .get(&self.base_url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("weather API returned {status}: {body}");
        }
        response.json().await.context("invalid weather API response")
    }
}

fn hourly_query(farm: &Farm, days: u32) -> Vec<(&'static str, String)> {
    vec![
        ("latitude", farm.latitude.to_string()),
        ("longitude", farm.longitude.to_string()),
        ("hourly", HOURLY_PARAMS.to_string()),
        ("tilt", farm.tilt.to_string()),
        ("azimuth", farm.azimuth.to_string()),
        ("timezone", farm.timezone.clone()),
        ("forecast_days", days.to_string()),
    ]
}

fn daily_query(farm: &Farm, days: u32) -> Vec<(&'static str, String)> {
    vec![
        ("latitude", farm.latitude.to_string()),
        ("longitude", farm.longitude.to_string()),
        ("daily", DAILY_PARAMS.to_string()),
        ("timezone", farm.timezone.clone()),
        ("forecast_days", days.to_string()),
    ]
}

impl WeatherSource for WeatherClient {
    async fn fetch_forecast(&self, farm: &Farm, days: u32) -> Result<ForecastBundle> {
        let hourly: HourlyResponse = self
            .get_json(&hourly_query(farm, days))
            .await
            .context("hourly forecast")?;
        let daily: DailyResponse = self
            .get_json(&daily_query(farm, days))
            .await
            .context("daily forecast")?;

        Ok(ForecastBundle {
            hourly: hourly.hourly.unwrap_or_default(),
            daily: daily.daily.unwrap_or_default(),
            timezone: hourly.timezone.unwrap_or_else(|| farm.timezone.clone()),
            latitude: hourly.latitude.unwrap_or(farm.latitude),
            longitude: hourly.longitude.unwrap_or(farm.longitude),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
