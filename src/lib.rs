//! realtime reconciliation core for an air quality and groundwater
//! monitoring dashboard.
//!
//! the [`engine::RealtimeEngine`] keeps one push connection per selected
//! location, polls fleet status, derives liveness and fails over to another
//! location when the selected one goes offline. renderers read
//! [`engine::EngineSnapshot`]s and never mutate engine state.

pub mod api;
pub mod aqi;
pub mod auth;
pub mod config;
pub mod domain;
pub mod engine;
pub mod fleet;
pub mod liveness;
pub mod push;
pub mod series;

pub use auth::{AuthContext, TokenSetter};
pub use engine::{EngineConfig, EngineHandle, EngineSnapshot, RealtimeEngine};
