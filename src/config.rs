use crate::state::{clamp_gpm, LoopState};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use std::{fs, path::Path};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Defaults to `hydronics-sim-<uuid>` when absent
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Consecutive transport failures tolerated before shutting down.
    /// Absent means retry forever.
    pub max_reconnect_attempts: Option<u32>,
}

fn default_keep_alive_secs() -> u64 {
    60
}
fn default_clean_session() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_state_topic")]
    pub state: String,
    #[serde(default = "default_config_topic")]
    pub config: String,
}

fn default_state_topic() -> String {
    "hydronics/main/state".into()
}
fn default_config_topic() -> String {
    "hydronics/config".into()
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            state: default_state_topic(),
            config: default_config_topic(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_loop_name")]
    pub loop_name: String,
    #[serde(default = "default_period_secs")]
    pub period_secs: f64,
    #[serde(default)]
    pub initial: InitialConditions,
    /// Fixed RNG seed for reproducible telemetry
    pub seed: Option<u64>,
}

fn default_loop_name() -> String {
    crate::state::DEFAULT_NAME.into()
}
fn default_period_secs() -> f64 {
    1.0
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            loop_name: default_loop_name(),
            period_secs: default_period_secs(),
            initial: InitialConditions::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialConditions {
    pub supply_f: f64,
    pub return_f: f64,
    pub gpm: f64,
}

impl Default for InitialConditions {
    fn default() -> Self {
        Self {
            supply_f: 118.0,
            return_f: 108.0,
            gpm: 3.0,
        }
    }
}

impl SimulationConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(self.period_secs)
    }

    pub fn initial_state(&self) -> LoopState {
        LoopState::new(
            self.loop_name.clone(),
            self.initial.supply_f,
            self.initial.return_f,
            clamp_gpm(self.initial.gpm),
        )
    }
}

impl Config {
    /// Load YAML from disk, substitute $(VAR)/${VAR} with env vars, then parse.
    /// `MQTT_HOST` / `MQTT_PORT` override the broker address from the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, anyhow::Error> {
        let expanded = expand_env_placeholders(raw)?;
        let mut cfg: Self = serde_yaml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("MQTT_HOST") {
            cfg.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("MQTT_PORT") {
            cfg.mqtt.port = port
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {port}"))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(!self.mqtt.host.is_empty(), "mqtt.host must not be empty");
        anyhow::ensure!(self.mqtt.port != 0, "mqtt.port must not be 0");
        anyhow::ensure!(
            self.simulation.period_secs.is_finite() && self.simulation.period_secs > 0.0,
            "simulation.period_secs must be a positive number, got {}",
            self.simulation.period_secs
        );
        anyhow::ensure!(
            self.topics.state != self.topics.config,
            "state and config topics must differ"
        );
        Ok(())
    }
}

/// Expand `$(VAR)` and `${VAR}` from the environment; `$$` is a literal `$`.
/// Any other `$` is kept untouched.
fn expand_env_placeholders(input: &str) -> Result<String, anyhow::Error> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let close = match after.chars().next() {
            Some('$') => {
                out.push('$');
                rest = &after[1..];
                continue;
            }
            Some('(') => ')',
            Some('{') => '}',
            _ => {
                out.push('$');
                rest = after;
                continue;
            }
        };
        let end = after
            .find(close)
            .with_context(|| format!("unterminated env placeholder: missing '{close}'"))?;
        let var = &after[1..end];
        let val = std::env::var(var)
            .with_context(|| format!("missing environment variable: {var}"))?;
        out.push_str(&val);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}
