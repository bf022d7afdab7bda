//! mqttprobe - MQTT broker capability prober
//!
//! Connects to a broker over MQTT v3.1.1 and v5.0 and measures what it
//! actually supports: topic, payload and client identifier limits, delivery
//! reliability per QoS level, retained messages, wildcard and shared
//! subscriptions, and the characters accepted in client identifiers.

pub mod client;
pub mod codec;
pub mod config;
pub mod probe;
pub mod protocol;
pub mod render;
pub mod testing;
pub mod topic;

pub use config::Config;
pub use probe::{FeatureProber, ProbeKind, ProbeReport};
pub use protocol::{ProtocolVersion, QoS};
