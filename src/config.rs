//! Simulation parameter loading and validation.
//!
//! Parameters come from a TOML file; every option has a default, so an
//! empty file (or no file at all) yields a runnable configuration. Time
//! quantities are plain seconds in the file and converted to virtual-time
//! durations at the point of use.

use embassy_time::Duration;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::Path;

use crate::clustering::machine::ClusterConfig;
use crate::simulation::types::MAX_NODE_COUNT;

/// Routing protocol whose table output the neighbor layer parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingProtocol {
    Dsdv,
    Aodv,
}

impl RoutingProtocol {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "dsdv" => Some(RoutingProtocol::Dsdv),
            "aodv" => Some(RoutingProtocol::Aodv),
            _ => None,
        }
    }
}

/// When traveller nodes pick a new direction: after a fixed distance
/// walked, or after a fixed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    Distance,
    Time,
}

impl WalkMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "distance" => Some(WalkMode::Distance),
            "time" => Some(WalkMode::Time),
            _ => None,
        }
    }
}

fn de_routing<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RoutingProtocol, D::Error> {
    let text = String::deserialize(deserializer)?;
    RoutingProtocol::parse(&text)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized routing protocol '{}'", text)))
}

fn de_walk_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<WalkMode, D::Error> {
    let text = String::deserialize(deserializer)?;
    WalkMode::parse(&text)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognized walk mode '{}'", text)))
}

/// All tunables of one simulation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulation duration in virtual seconds.
    pub run_time: f64,
    /// Number of mobile nodes.
    pub total_nodes: u32,
    /// Seed for every random stream of the run; also names the CSV outputs.
    pub seed: u64,
    /// Lower bound of the node wakeup delay (s).
    pub wait_time: f64,
    /// Upper bound of the wakeup delay and end of the standoff window (s).
    pub standoff_time: f64,
    /// Neighborhood hop count (H).
    pub hops: u32,
    /// Simulation area bounds (m).
    pub area_width: f64,
    pub area_length: f64,
    /// Traveller mobility: speed (m/s), direction-change distance (m) and
    /// period (s), and which of the two triggers applies.
    pub traveller_velocity: f64,
    pub traveller_walk_dist: f64,
    pub traveller_walk_time: f64,
    #[serde(deserialize_with = "de_walk_mode")]
    pub traveller_walk_mode: WalkMode,
    /// Routing protocol emulated by the routing layer.
    #[serde(deserialize_with = "de_routing")]
    pub routing: RoutingProtocol,
    /// Radio connectivity radius (m).
    pub wifi_radius: f64,
    /// Lookup timeout (s) of the ancestor scheme; recognized but unused.
    pub request_timeout: f64,
    /// Routing snapshot refresh period (s).
    pub profile_delay: f64,
    /// Hello broadcast period (s).
    pub hello_message_timeout: f64,
    /// Table refresh period (s).
    pub table_scan_timeout: f64,
    /// Information-row freshness window (s).
    pub valid_entry_timeout: f64,
    /// Cluster size at or below which a covered head resigns.
    pub resign_threshold: usize,
    /// Virtual/real speed of the time driver in percent.
    pub time_scale_percent: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            run_time: 120.0,
            total_nodes: 160,
            seed: 1,
            wait_time: 30.0,
            standoff_time: 3.0,
            hops: 1,
            area_width: 1000.0,
            area_length: 1000.0,
            traveller_velocity: 20.0,
            traveller_walk_dist: 0.0,
            traveller_walk_time: 30.0,
            traveller_walk_mode: WalkMode::Distance,
            routing: RoutingProtocol::Dsdv,
            wifi_radius: 100.0,
            request_timeout: 10.0,
            profile_delay: 6.0,
            hello_message_timeout: 1.0,
            table_scan_timeout: 0.1,
            valid_entry_timeout: 2.3,
            resign_threshold: 5,
            time_scale_percent: 100,
        }
    }
}

/// Configuration loading failures. Any of these aborts startup.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(String),
    Parse(String),
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(msg) => write!(f, "failed to read config file: {}", msg),
            ConfigError::Parse(msg) => write!(f, "failed to parse config file: {}", msg),
            ConfigError::Validation(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl SimulationConfig {
    /// Load from a TOML file, apply derived defaults, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Parse from TOML text, apply derived defaults, and validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: SimulationConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.finalize();
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// The built-in defaults, finalized and validated.
    pub fn defaults() -> Self {
        let mut config = Self::default();
        config.finalize();
        config
    }

    fn finalize(&mut self) {
        // A zero walk distance means "cross the whole area".
        if self.traveller_walk_dist == 0.0 {
            self.traveller_walk_dist = self.area_width.min(self.area_length);
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.run_time <= 0.0 {
            return Err(format!("run_time ({}) must be positive", self.run_time));
        }
        if self.total_nodes == 0 {
            return Err("total_nodes must be at least 1".to_string());
        }
        if self.total_nodes as usize > MAX_NODE_COUNT {
            return Err(format!(
                "total_nodes ({}) exceeds maximum of {}",
                self.total_nodes, MAX_NODE_COUNT
            ));
        }
        if self.area_width <= 0.0 || self.area_length <= 0.0 {
            return Err(format!(
                "area ({} x {}) must be positive",
                self.area_width, self.area_length
            ));
        }
        if self.traveller_velocity < 0.0 {
            return Err(format!(
                "traveller_velocity ({}) is negative",
                self.traveller_velocity
            ));
        }
        if self.traveller_walk_time <= 0.0 {
            return Err(format!(
                "traveller_walk_time ({}) must be positive",
                self.traveller_walk_time
            ));
        }
        if self.traveller_walk_dist < 0.0 {
            return Err(format!(
                "traveller_walk_dist ({}) is negative",
                self.traveller_walk_dist
            ));
        }
        if self.wifi_radius <= 0.0 {
            return Err(format!("wifi_radius ({}) must be positive", self.wifi_radius));
        }
        if self.hops == 0 {
            return Err("hops must be at least 1".to_string());
        }
        if self.wait_time < 0.0 || self.standoff_time < 0.0 {
            return Err("wait_time and standoff_time must be non-negative".to_string());
        }
        if self.request_timeout < 0.0 {
            return Err(format!("request_timeout ({}) is negative", self.request_timeout));
        }
        for (name, value) in [
            ("profile_delay", self.profile_delay),
            ("hello_message_timeout", self.hello_message_timeout),
            ("table_scan_timeout", self.table_scan_timeout),
            ("valid_entry_timeout", self.valid_entry_timeout),
        ] {
            if value <= 0.0 {
                return Err(format!("{} ({}) must be positive", name, value));
            }
        }
        if self.resign_threshold == 0 {
            return Err("resign_threshold must be at least 1".to_string());
        }
        if self.time_scale_percent == 0 || self.time_scale_percent > 10_000 {
            return Err(format!(
                "time_scale_percent ({}) must be in 1..=10000",
                self.time_scale_percent
            ));
        }
        Ok(())
    }

    /// The protocol tunables handed to each node's state machine.
    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            hops: self.hops,
            wait_time: secs(self.wait_time),
            standoff_time: secs(self.standoff_time),
            profile_delay: secs(self.profile_delay),
            hello_message_timeout: secs(self.hello_message_timeout),
            table_scan_timeout: secs(self.table_scan_timeout),
            valid_entry_timeout: secs(self.valid_entry_timeout),
            resign_threshold: self.resign_threshold,
        }
    }

    pub fn run_time_duration(&self) -> Duration {
        secs(self.run_time)
    }
}

fn secs(seconds: f64) -> Duration {
    Duration::from_micros((seconds * 1e6) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = SimulationConfig::from_toml("").unwrap();
        assert_eq!(config.total_nodes, 160);
        assert_eq!(config.routing, RoutingProtocol::Dsdv);
        assert_eq!(config.traveller_walk_mode, WalkMode::Distance);
        // Zero walk distance was replaced by the area rule.
        assert_eq!(config.traveller_walk_dist, 1000.0);
    }

    #[test]
    fn options_override_defaults() {
        let config = SimulationConfig::from_toml(
            r#"
run_time = 600.0
total_nodes = 40
routing = "AODV"
traveller_walk_mode = "time"
wifi_radius = 250.0
standoff_time = 1.0
wait_time = 0.0
"#,
        )
        .unwrap();
        assert_eq!(config.run_time, 600.0);
        assert_eq!(config.total_nodes, 40);
        assert_eq!(config.routing, RoutingProtocol::Aodv);
        assert_eq!(config.traveller_walk_mode, WalkMode::Time);
        assert_eq!(config.wifi_radius, 250.0);
    }

    #[test]
    fn unknown_routing_protocol_fails_parse() {
        let error = SimulationConfig::from_toml(r#"routing = "olsr""#).unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn unknown_walk_mode_fails_parse() {
        let error = SimulationConfig::from_toml(r#"traveller_walk_mode = "teleport""#).unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn invalid_values_fail_validation() {
        for toml in [
            "run_time = -1.0",
            "total_nodes = 0",
            "area_width = 0.0",
            "traveller_velocity = -5.0",
            "wifi_radius = 0.0",
            "resign_threshold = 0",
            "time_scale_percent = 0",
        ] {
            let error = SimulationConfig::from_toml(toml).unwrap_err();
            assert!(matches!(error, ConfigError::Validation(_)), "{} should fail", toml);
        }
    }

    #[test]
    fn cluster_config_converts_seconds() {
        let config = SimulationConfig::from_toml("valid_entry_timeout = 2.3").unwrap();
        let cluster = config.cluster_config();
        assert_eq!(cluster.valid_entry_timeout, Duration::from_millis(2300));
        assert_eq!(cluster.wait_time, Duration::from_secs(30));
        assert_eq!(cluster.resign_threshold, 5);
    }
}
