//! ==============================================================================
//! api.rs - backend rest client
//! ==============================================================================
//!
//! purpose:
//!     typed access to the dashboard backend. the engine only needs the
//!     fleet status poll (through the StatusSource seam); the other calls
//!     are used by the binary and by consumers that render location lists.
//!
//! endpoints:
//!     GET  /api/locations                        bearer
//!     GET  /api/locations/status                 bearer
//!     GET  /api/location/{name}/capabilities     bearer
//!     GET  /api/devices                          bearer
//!     GET  /api/export/csv                       bearer
//!     POST /api/devices/register                 bearer
//!     GET  /api/public/locations                 none
//!
//! ==============================================================================

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{Capabilities, Coordinates, LocationStatus, LocationSummary};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned {status} for {path}")]
    Status { status: StatusCode, path: String },
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}

// ==============================================================================
// wire records
// ==============================================================================

#[derive(Debug, Clone, Deserialize)]
struct LocationRecord {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusRecord {
    location_id: String,
    online: bool,
    #[serde(default)]
    last_seen: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    name: Option<String>,
}

impl From<StatusRecord> for LocationStatus {
    fn from(r: StatusRecord) -> Self {
        Self {
            name: r.name.unwrap_or_else(|| r.location_id.clone()),
            location_id: r.location_id,
            online: r.online,
            last_seen: r.last_seen,
            coordinates: Coordinates::from_parts(r.latitude, r.longitude),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CapabilitiesRecord {
    #[serde(default)]
    has_aqi: bool,
    #[serde(default)]
    has_water: bool,
}

/// device as listed by /api/devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub last_seen: Option<String>,
}

impl DeviceRecord {
    pub fn is_online(&self) -> bool {
        self.status.eq_ignore_ascii_case("online")
    }
}

/// location described by area/site type instead of an explicit id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationInput {
    pub area: String,
    pub site_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDevice {
    pub device_id: String,
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_input: Option<LocationInput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub status: String,
    pub device_id: String,
    pub assigned_location_id: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
}

/// entry of the unauthenticated public listing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PublicLocation {
    pub location_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

// ==============================================================================
// status seam
// ==============================================================================

/// where the engine gets fleet status from
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    async fn fetch_status(&self, token: &str) -> Result<Vec<LocationStatus>, ApiError>;
}

// ==============================================================================
// client
// ==============================================================================

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base: Url,
}

impl BackendClient {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let base = Url::parse(api_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", api_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(api_url.to_string()));
        }
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// base url + percent-encoded path segments
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str], token: Option<&str>) -> Result<T, ApiError> {
        let url = self.endpoint(segments)?;
        let mut req = self.http.get(url.clone());
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status { status: resp.status(), path: url.path().to_string() });
        }
        Ok(resp.json().await?)
    }

    /// locations owned by the user, each with its capabilities.
    /// a failed capability lookup falls back to "both sensors", which is
    /// what the backend reports for every location today.
    pub async fn locations(&self, token: &str) -> Result<Vec<LocationSummary>, ApiError> {
        let records: Vec<LocationRecord> = self.get_json(&["api", "locations"], Some(token)).await?;

        let lookups = records.iter().map(|r| self.capabilities(token, &r.name));
        let capabilities = join_all(lookups).await;

        Ok(records
            .into_iter()
            .zip(capabilities)
            .map(|(r, caps)| {
                let capabilities = caps.unwrap_or_else(|e| {
                    warn!(location = %r.name, error = %e, "capability lookup failed");
                    Capabilities::all()
                });
                LocationSummary {
                    display_name: r.display_name.unwrap_or_else(|| r.name.clone()),
                    coordinates: Coordinates::from_parts(r.latitude, r.longitude),
                    location_id: r.name,
                    capabilities,
                }
            })
            .collect())
    }

    pub async fn location_status(&self, token: &str) -> Result<Vec<LocationStatus>, ApiError> {
        let records: Vec<StatusRecord> = self.get_json(&["api", "locations", "status"], Some(token)).await?;
        debug!(count = records.len(), "fleet status polled");
        Ok(records.into_iter().map(LocationStatus::from).collect())
    }

    pub async fn capabilities(&self, token: &str, location: &str) -> Result<Capabilities, ApiError> {
        let record: CapabilitiesRecord = self
            .get_json(&["api", "location", location, "capabilities"], Some(token))
            .await?;
        Ok(Capabilities { has_air_sensor: record.has_aqi, has_water_sensor: record.has_water })
    }

    pub async fn devices(&self, token: &str) -> Result<Vec<DeviceRecord>, ApiError> {
        self.get_json(&["api", "devices"], Some(token)).await
    }

    /// raw csv bytes, not parsed
    pub async fn export_csv(&self, token: &str) -> Result<Vec<u8>, ApiError> {
        let url = self.endpoint(&["api", "export", "csv"])?;
        let resp = self.http.get(url.clone()).bearer_auth(token).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status { status: resp.status(), path: url.path().to_string() });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    pub async fn register_device(&self, token: &str, device: &RegisterDevice) -> Result<Registration, ApiError> {
        let url = self.endpoint(&["api", "devices", "register"])?;
        let resp = self.http.post(url.clone()).bearer_auth(token).json(device).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status { status: resp.status(), path: url.path().to_string() });
        }
        Ok(resp.json().await?)
    }

    pub async fn public_locations(&self) -> Result<Vec<PublicLocation>, ApiError> {
        self.get_json(&["api", "public", "locations"], None).await
    }
}

#[async_trait]
impl StatusSource for BackendClient {
    async fn fetch_status(&self, token: &str) -> Result<Vec<LocationStatus>, ApiError> {
        self.location_status(token).await
    }
}
