//! Reverse geocoding of check-in coordinates.
//!
//! The address is informational only. Any failure degrades to
//! [`UNKNOWN_LOCATION`] and never fails a check-in.

use async_trait::async_trait;
use presence_core::decision::UNKNOWN_LOCATION;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("presenced/", env!("CARGO_PKG_VERSION"));

#[derive(Error, Debug)]
pub enum GeocodeError {
    #[error("geocoder request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("geocoder returned HTTP {0}")]
    Status(u16),
    #[error("geocoder response invalid: {0}")]
    Decode(String),
    #[error("geocoder disabled")]
    Disabled,
}

/// Resolves coordinates to a human-readable address.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<String, GeocodeError>;
}

/// Nominatim (OpenStreetMap) `/reverse` client.
pub struct NominatimGeocoder {
    client: Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, GeocodeError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[derive(Deserialize)]
struct ReverseResponse {
    display_name: Option<String>,
}

fn parse_display_name(body: &[u8]) -> Result<String, GeocodeError> {
    let decoded: ReverseResponse =
        serde_json::from_slice(body).map_err(|e| GeocodeError::Decode(e.to_string()))?;
    decoded
        .display_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| GeocodeError::Decode("missing display_name".into()))
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn reverse(&self, latitude: f64, longitude: f64) -> Result<String, GeocodeError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        parse_display_name(&body)
    }
}

/// Geocoder used when lookups are turned off in the configuration.
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    async fn reverse(&self, _latitude: f64, _longitude: f64) -> Result<String, GeocodeError> {
        Err(GeocodeError::Disabled)
    }
}

/// Reverse-geocode, falling back to [`UNKNOWN_LOCATION`] on any error.
pub async fn resolve_address(geocoder: &dyn Geocoder, latitude: f64, longitude: f64) -> String {
    match geocoder.reverse(latitude, longitude).await {
        Ok(address) => address,
        Err(GeocodeError::Disabled) => UNKNOWN_LOCATION.to_string(),
        Err(err) => {
            tracing::warn!(error = %err, latitude, longitude, "reverse geocoding failed");
            UNKNOWN_LOCATION.to_string()
        }
    }
}
