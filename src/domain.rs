//! ==============================================================================
//! domain.rs - shared monitoring types
//! ==============================================================================
//!
//! purpose:
//!     the vocabulary shared by the rest client, the push channel and the
//!     reconciliation engine: locations, their polled status, and the push
//!     envelopes that carry sensor readings.
//!
//! relationships:
//!     - used by: api.rs (wire records convert into these)
//!     - used by: engine.rs (envelope dispatch, fleet status)
//!     - used by: fleet.rs (auto-selection over LocationStatus)
//!
//! ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// tracked air metrics, in chart order
pub const AIR_METRICS: [&str; 6] = ["pm25", "pm10", "co", "no2", "o3", "so2"];

/// tracked groundwater metrics
pub const WATER_METRICS: [&str; 3] = ["level", "ph", "turbidity"];

// ==============================================================================
// locations
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// the backend sends latitude/longitude as two nullable fields
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Self { latitude, longitude }),
            _ => None,
        }
    }
}

/// which data categories a location can produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub has_air_sensor: bool,
    pub has_water_sensor: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Self { has_air_sensor: true, has_water_sensor: true }
    }
}

/// one monitored site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationSummary {
    pub location_id: String,
    pub display_name: String,
    pub coordinates: Option<Coordinates>,
    pub capabilities: Capabilities,
}

/// point-in-time liveness of one location, as reported by the status poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationStatus {
    pub location_id: String,
    pub name: String,
    pub online: bool,
    /// backend timestamp, passed through untouched
    pub last_seen: Option<String>,
    pub coordinates: Option<Coordinates>,
}

// ==============================================================================
// push envelopes
// ==============================================================================

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed push message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// the device kinds the backend tags push messages with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "aqi")]
    AirQuality,
    #[serde(rename = "aqi_camera")]
    AirQualityCamera,
    #[serde(rename = "water_sensor")]
    WaterSensor,
    #[serde(rename = "water")]
    WaterGeneric,
    #[serde(rename = "heartbeat")]
    Heartbeat,
}

/// accumulation path an envelope is dispatched into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Air,
    Water,
    Heartbeat,
}

impl EnvelopeKind {
    /// kind -> category table; a new device kind is one arm here
    pub fn category(self) -> Category {
        match self {
            Self::AirQuality | Self::AirQualityCamera => Category::Air,
            Self::WaterSensor | Self::WaterGeneric => Category::Water,
            Self::Heartbeat => Category::Heartbeat,
        }
    }
}

/// one push message from /ws/live/{location}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEnvelope {
    #[serde(default)]
    pub location_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, rename = "data")]
    pub payload: BTreeMap<String, f64>,
}

impl RealtimeEnvelope {
    /// parse a text frame; heartbeats come back with an empty payload
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let mut envelope: RealtimeEnvelope = serde_json::from_str(text)?;
        if envelope.kind == EnvelopeKind::Heartbeat {
            envelope.payload.clear();
        }
        Ok(envelope)
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }

    /// value of a metric, missing metrics read as zero
    pub fn metric(&self, name: &str) -> f64 {
        self.payload.get(name).copied().unwrap_or(0.0)
    }

    /// true when every tracked water metric is exactly zero.
    /// a dead probe reports this, so it is not evidence of liveness.
    pub fn is_dead_zero(&self) -> bool {
        WATER_METRICS.iter().all(|m| self.metric(m) == 0.0)
    }
}

/// latest reading of one category, as handed to the rendering layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub device_id: String,
    pub kind: EnvelopeKind,
    pub timestamp: Option<String>,
    pub received_at: DateTime<Utc>,
    pub values: BTreeMap<String, f64>,
}

impl Reading {
    pub fn from_envelope(envelope: &RealtimeEnvelope, received_at: DateTime<Utc>) -> Self {
        Self {
            device_id: envelope.device_id.clone(),
            kind: envelope.kind,
            timestamp: envelope.timestamp.clone(),
            received_at,
            values: envelope.payload.clone(),
        }
    }
}
