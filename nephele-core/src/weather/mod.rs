//! Live weather lookup
//!
//! [`WeatherAdapter`] wraps a [`WeatherProvider`] with a per-attempt timeout,
//! bounded retries with exponential backoff, and a hard ceiling on the whole
//! fetch. Raw provider payloads are normalised into [`WeatherData`].

mod location;
mod provider;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WeatherSettings;
use crate::error::ErrorKind;
use crate::llm::RetryConfig;
use crate::llm::retry::with_retry_if;

pub use location::{LocationExtractor, extract_with_pattern};
pub use provider::{OpenWeatherProvider, ProviderError, WeatherProvider};

/// Current conditions at one location, fetched for a single turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherData {
    pub location: String,
    pub temperature: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feels_like: Option<f64>,
    /// Condition group, e.g. `Rain` or `Clear`
    pub condition: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_km: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunrise: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<DateTime<Utc>>,
    /// Unit system the provider answered in
    #[serde(default = "default_units")]
    pub units: String,
    pub fetched_at: DateTime<Utc>,
}

fn default_units() -> String {
    "metric".to_string()
}

fn number(value: &Value, pointer: &str) -> Option<f64> {
    value.pointer(pointer).and_then(Value::as_f64)
}

fn unix_time(value: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    value
        .pointer(pointer)
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

impl WeatherData {
    /// Normalise an OpenWeatherMap current-weather payload.
    ///
    /// # Errors
    ///
    /// Returns [`WeatherError::InvalidPayload`] when `main.temp` or the
    /// `weather` condition list is missing.
    pub fn normalize(requested: &str, payload: &Value, units: &str) -> Result<Self, WeatherError> {
        let temperature = number(payload, "/main/temp")
            .ok_or_else(|| WeatherError::InvalidPayload("missing main.temp".to_string()))?;

        let weather = payload
            .get("weather")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .ok_or_else(|| WeatherError::InvalidPayload("missing weather conditions".to_string()))?;

        let location = payload
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .or_else(|| payload.pointer("/sys/country").and_then(Value::as_str))
            .unwrap_or(requested)
            .to_string();

        Ok(Self {
            location,
            temperature,
            feels_like: number(payload, "/main/feels_like"),
            condition: weather
                .get("main")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            description: weather
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            humidity: number(payload, "/main/humidity"),
            wind_speed: number(payload, "/wind/speed"),
            pressure: number(payload, "/main/pressure"),
            visibility_km: number(payload, "/visibility").map(|m| m / 1000.0),
            sunrise: unix_time(payload, "/sys/sunrise"),
            sunset: unix_time(payload, "/sys/sunset"),
            units: units.to_string(),
            fetched_at: Utc::now(),
        })
    }

    /// Emoji for the condition group
    pub fn emoji(&self) -> &'static str {
        match self.condition.as_str() {
            "Thunderstorm" => "⛈️",
            "Drizzle" => "🌦️",
            "Rain" => "🌧️",
            "Snow" => "❄️",
            "Clear" => "☀️",
            "Clouds" => "☁️",
            _ => "🌍",
        }
    }

    fn unit_symbols(&self) -> (&'static str, &'static str) {
        match self.units.as_str() {
            "imperial" => ("°F", "mph"),
            "standard" => ("K", "m/s"),
            _ => ("°C", "m/s"),
        }
    }

    /// Structured block for the synthesis prompt
    pub fn to_prompt_text(&self) -> String {
        let (temp_unit, speed_unit) = self.unit_symbols();
        let mut lines = vec![format!("{} Weather in {}", self.emoji(), self.location)];

        let mut condition = self.condition.clone();
        if !self.description.is_empty() {
            condition = format!("{} ({})", condition, self.description);
        }
        lines.push(format!("Condition: {}", condition));

        match self.feels_like {
            Some(feels) => lines.push(format!(
                "Temperature: {:.1}{} (feels like {:.1}{})",
                self.temperature, temp_unit, feels, temp_unit
            )),
            None => lines.push(format!("Temperature: {:.1}{}", self.temperature, temp_unit)),
        }
        if let Some(humidity) = self.humidity {
            lines.push(format!("Humidity: {:.0}%", humidity));
        }
        if let Some(wind) = self.wind_speed {
            lines.push(format!("Wind: {:.1} {}", wind, speed_unit));
        }
        if let Some(pressure) = self.pressure {
            lines.push(format!("Pressure: {:.0} hPa", pressure));
        }
        if let Some(visibility) = self.visibility_km {
            lines.push(format!("Visibility: {:.1} km", visibility));
        }
        if let (Some(sunrise), Some(sunset)) = (self.sunrise, self.sunset) {
            lines.push(format!(
                "Sunrise/Sunset: {} / {} UTC",
                sunrise.format("%H:%M"),
                sunset.format("%H:%M")
            ));
        }
        lines.push(format!("Observed: {}", self.fetched_at.format("%Y-%m-%d %H:%M UTC")));

        lines.join("\n")
    }
}

/// Error type for weather lookups
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WeatherError {
    /// Retry budget spent on transient failures
    #[error("Weather unavailable: {last_error}")]
    Unavailable { last_error: String },

    /// Hard ceiling hit, or the last attempt timed out
    #[error("Weather lookup timed out")]
    Timeout,

    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    #[error("Weather provider rejected the API key")]
    Unauthorized,

    #[error("Invalid weather payload: {0}")]
    InvalidPayload(String),
}

impl WeatherError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WeatherError::Timeout => ErrorKind::WeatherTimeout,
            WeatherError::UnknownLocation(_) => ErrorKind::UnknownLocation,
            WeatherError::Unavailable { .. }
            | WeatherError::Unauthorized
            | WeatherError::InvalidPayload(_) => ErrorKind::WeatherUnavailable,
        }
    }
}

/// Bounded-time weather lookups with retry.
///
/// Stateless per call; one adapter is shared by every session.
#[derive(Clone)]
pub struct WeatherAdapter {
    provider: Arc<dyn WeatherProvider>,
    retry: RetryConfig,
    attempt_timeout: Duration,
    total_timeout: Duration,
    units: String,
}

impl WeatherAdapter {
    /// Adapter using the default weather settings
    pub fn new(provider: Arc<dyn WeatherProvider>) -> Self {
        Self::from_settings(provider, &WeatherSettings::default())
    }

    pub fn from_settings(provider: Arc<dyn WeatherProvider>, settings: &WeatherSettings) -> Self {
        Self {
            provider,
            retry: settings.retry_config(),
            attempt_timeout: settings.attempt_timeout,
            total_timeout: settings.total_timeout,
            units: settings.units.clone(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    /// Fetch current weather for `location`.
    ///
    /// Makes one attempt plus up to `R` retries on transient failures
    /// (timeouts, HTTP 429 and 5xx, transport errors), backing off
    /// exponentially between them. An unknown location is never retried.
    ///
    /// # Errors
    ///
    /// - [`WeatherError::Timeout`] if the total ceiling elapses, or the
    ///   retry budget runs out on a timed-out attempt
    /// - [`WeatherError::Unavailable`] with the last error once retries are spent
    /// - [`WeatherError::UnknownLocation`] if the provider cannot resolve `location`
    pub async fn fetch(&self, location: &str) -> Result<WeatherData, WeatherError> {
        let location = location.trim();
        if location.is_empty() {
            return Err(WeatherError::UnknownLocation(String::new()));
        }

        match tokio::time::timeout(self.total_timeout, self.fetch_with_retry(location)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    location,
                    total_timeout_ms = self.total_timeout.as_millis() as u64,
                    "weather lookup hit its hard ceiling"
                );
                Err(WeatherError::Timeout)
            }
        }
    }

    async fn fetch_with_retry(&self, location: &str) -> Result<WeatherData, WeatherError> {
        let result = with_retry_if(
            &self.retry,
            || self.attempt(location),
            ProviderError::is_transient,
        )
        .await;

        match result {
            Ok(payload) => WeatherData::normalize(location, &payload, &self.units),
            Err(ProviderError::NotFound) => Err(WeatherError::UnknownLocation(location.to_string())),
            Err(ProviderError::Unauthorized) => Err(WeatherError::Unauthorized),
            Err(ProviderError::InvalidBody(msg)) => Err(WeatherError::InvalidPayload(msg)),
            Err(ProviderError::Timeout) => Err(WeatherError::Timeout),
            Err(e) => Err(WeatherError::Unavailable {
                last_error: e.to_string(),
            }),
        }
    }

    async fn attempt(&self, location: &str) -> Result<Value, ProviderError> {
        match tokio::time::timeout(self.attempt_timeout, self.provider.current_weather(location)).await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        }
    }
}
