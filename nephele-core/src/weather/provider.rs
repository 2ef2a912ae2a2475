//! Weather provider collaborator and the OpenWeatherMap client

use async_trait::async_trait;
use serde_json::Value;

use crate::config::WeatherSettings;
use crate::error::{NepheleError, Result};

/// Failure of a single provider call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("provider returned HTTP {0}")]
    Status(u16),

    #[error("location not found")]
    NotFound,

    #[error("provider rejected the API key")]
    Unauthorized,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unreadable response body: {0}")]
    InvalidBody(String),
}

impl ProviderError {
    /// Whether another attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::Transport(_) => true,
            ProviderError::Status(code) => *code == 429 || (500..600).contains(code),
            ProviderError::NotFound | ProviderError::Unauthorized | ProviderError::InvalidBody(_) => {
                false
            }
        }
    }
}

/// Live weather source returning the provider's raw payload
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current_weather(&self, location: &str) -> std::result::Result<Value, ProviderError>;

    fn name(&self) -> &str {
        "weather"
    }
}

/// Client for the OpenWeatherMap current-weather endpoint
pub struct OpenWeatherProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    units: String,
    lang: String,
}

impl OpenWeatherProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        let defaults = WeatherSettings::default();
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: defaults.base_url,
            units: defaults.units,
            lang: defaults.lang,
        }
    }

    /// Build from configuration.
    ///
    /// The API key comes from `weather.api_key`, falling back to `OPENWEATHER_API_KEY`.
    /// The HTTP client timeout is the per-attempt bound.
    ///
    /// # Errors
    ///
    /// Returns an error if no API key is available or the client cannot be built.
    pub fn from_settings(settings: &WeatherSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENWEATHER_API_KEY").ok())
            .ok_or_else(|| {
                NepheleError::Configuration(
                    "OPENWEATHER_API_KEY environment variable not set".to_string(),
                )
            })?;

        let client = reqwest::Client::builder()
            .timeout(settings.attempt_timeout)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            units: settings.units.clone(),
            lang: settings.lang.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn map_status(status: u16) -> ProviderError {
    match status {
        401 => ProviderError::Unauthorized,
        404 => ProviderError::NotFound,
        code => ProviderError::Status(code),
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    async fn current_weather(&self, location: &str) -> std::result::Result<Value, ProviderError> {
        let url = format!("{}/weather", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("q", location),
                ("appid", self.api_key.as_str()),
                ("units", self.units.as_str()),
                ("lang", self.lang.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status.as_u16()));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ProviderError::InvalidBody(e.to_string()))
    }

    fn name(&self) -> &str {
        "openweathermap"
    }
}
