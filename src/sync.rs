//! The tick/publish loop and the configuration entry point that runs
//! concurrently with it.
//!
//! Only the flow rate crosses between the two activities. It lives in a
//! [`FlowSetpoint`] that the inbound handler writes and the tick reads once
//! per iteration; every other field of [`LoopState`] is owned by the loop.

use crate::error::{AppError, ConfigError};
use crate::model::{Noise, ThermalModel};
use crate::state::{clamp_gpm, LoopState};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Lock-free `f64` slot. Stores the bit pattern so a reader can never see a
/// half-written value.
#[derive(Debug)]
pub struct FlowSetpoint(AtomicU64);

impl FlowSetpoint {
    pub fn new(gpm: f64) -> Self {
        Self(AtomicU64::new(gpm.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, gpm: f64) {
        self.0.store(gpm.to_bits(), Ordering::Release);
    }
}

/// Cloneable handle given to the transport's inbound-message handler.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    gpm: Arc<FlowSetpoint>,
}

impl ConfigHandle {
    pub fn new(gpm: f64) -> Self {
        Self {
            gpm: Arc::new(FlowSetpoint::new(clamp_gpm(gpm))),
        }
    }

    pub fn gpm(&self) -> f64 {
        self.gpm.load()
    }

    /// Apply a raw configuration payload. Returns the flow rate now in effect.
    ///
    /// Rejected payloads are logged and leave the setpoint untouched.
    pub fn apply_config(&self, raw: &[u8]) -> Result<f64, ConfigError> {
        match parse_flow_rate(raw) {
            Ok(requested) => {
                let gpm = clamp_gpm(requested);
                self.gpm.store(gpm);
                info!(requested, gpm, "updated flow rate");
                Ok(gpm)
            }
            Err(e) => {
                warn!(error = %e, gpm = self.gpm(), "config parse error; keeping current gpm");
                Err(e)
            }
        }
    }
}

/// Extract the requested `gpm` from a config payload. Unknown fields are ignored.
pub fn parse_flow_rate(raw: &[u8]) -> Result<f64, ConfigError> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err(ConfigError::Empty);
    }

    let value: Value = serde_json::from_str(text)?;
    let obj = value.as_object().ok_or(ConfigError::NotAnObject)?;
    let gpm = obj.get("gpm").ok_or(ConfigError::MissingFlowRate)?;
    coerce_f64(gpm)
}

fn coerce_f64(v: &Value) -> Result<f64, ConfigError> {
    let parsed = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) if !f.is_nan() => Ok(f),
        _ => Err(ConfigError::NonNumericFlowRate(v.to_string())),
    }
}

/// Outbound side of the transport. Must not wait for broker acknowledgement.
#[cfg_attr(test, mockall::automock)]
pub trait StatePublisher {
    /// Hand `payload` to the transport with "retain last value" set.
    fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Stopped,
    Running,
}

pub struct SyncLoop<N> {
    state: LoopState,
    model: ThermalModel<N>,
    config: ConfigHandle,
    started: Instant,
    status: LoopStatus,
    topic: String,
}

impl<N: Noise> SyncLoop<N> {
    pub fn new(state: LoopState, model: ThermalModel<N>, topic: impl Into<String>) -> Self {
        let config = ConfigHandle::new(state.gpm);
        Self {
            state,
            model,
            config,
            started: Instant::now(),
            status: LoopStatus::Stopped,
            topic: topic.into(),
        }
    }

    /// Handle for the inbound-message side; shares the flow setpoint with this loop.
    pub fn config_handle(&self) -> ConfigHandle {
        self.config.clone()
    }

    pub fn status(&self) -> LoopStatus {
        self.status
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// One simulation step: pick up the latest setpoint, then advance the model.
    pub fn tick(&mut self) -> &LoopState {
        // single atomic read per tick; btuPerHour is computed from exactly this value
        self.state.gpm = self.config.gpm();
        let elapsed = self.started.elapsed().as_secs_f64();
        self.model.advance(&mut self.state, elapsed)
    }

    /// Tick, serialize and hand one state to `publisher`.
    pub fn publish_state<P: StatePublisher + ?Sized>(&mut self, publisher: &P) -> Result<(), AppError> {
        self.tick();
        let payload = self.state.to_payload()?;
        publisher.publish_retained(&self.topic, payload)
    }

    /// [`publish_state`](Self::publish_state), with failures logged and swallowed.
    pub fn tick_and_publish<P: StatePublisher + ?Sized>(&mut self, publisher: &P) {
        match self.publish_state(publisher) {
            Ok(()) => debug!(
                topic = %self.topic,
                supply_f = self.state.supply_f,
                return_f = self.state.return_f,
                gpm = self.state.gpm,
                btu_per_hour = self.state.btu_per_hour,
                "published loop state"
            ),
            Err(e) => error!(topic = %self.topic, error = %e, "failed to publish loop state"),
        }
    }

    /// Run until `shutdown` becomes `true` (or its sender goes away).
    ///
    /// The sleep between ticks is not compensated for the time spent ticking.
    pub async fn run<P: StatePublisher + ?Sized>(
        &mut self,
        period: Duration,
        publisher: &P,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.status = LoopStatus::Running;
        info!(topic = %self.topic, period_ms = period.as_millis() as u64, "sync loop running");

        while !*shutdown.borrow() {
            self.tick_and_publish(publisher);

            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        self.status = LoopStatus::Stopped;
        info!("sync loop stopped");
    }
}
