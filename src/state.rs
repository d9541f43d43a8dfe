use serde::Serialize;

/// BTU/hr = 500 * GPM * ΔT for water.
pub const BTU_FACTOR: f64 = 500.0;

pub const MIN_GPM: f64 = 0.0;
pub const MAX_GPM: f64 = 50.0;

pub const DEFAULT_NAME: &str = "Main Loop";
pub const DEFAULT_STATUS: &str = "OK (sim)";

/// Clamp a requested flow rate into the pump's range.
pub fn clamp_gpm(gpm: f64) -> f64 {
    gpm.clamp(MIN_GPM, MAX_GPM)
}

pub fn btu_per_hour(gpm: f64, delta_t: f64) -> f64 {
    BTU_FACTOR * gpm * delta_t
}

/// Snapshot of the simulated loop, published as-is on the state topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub name: String,
    pub supply_f: f64,
    pub return_f: f64,
    pub delta_t: f64,
    pub gpm: f64,
    pub btu_per_hour: f64,
    pub status: String,
    /// Unix epoch seconds of the last tick
    #[serde(rename = "ts")]
    pub timestamp: f64,
}

impl LoopState {
    pub fn new(name: impl Into<String>, supply_f: f64, return_f: f64, gpm: f64) -> Self {
        let gpm = clamp_gpm(gpm);
        let delta_t = supply_f - return_f;
        Self {
            name: name.into(),
            supply_f,
            return_f,
            delta_t,
            gpm,
            btu_per_hour: btu_per_hour(gpm, delta_t),
            status: DEFAULT_STATUS.to_string(),
            timestamp: 0.0,
        }
    }

    /// Recompute ΔT and heat output from the current temperatures and flow.
    pub fn refresh_derived(&mut self) {
        self.delta_t = self.supply_f - self.return_f;
        self.btu_per_hour = btu_per_hour(self.gpm, self.delta_t);
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new(DEFAULT_NAME, 118.0, 108.0, 3.0)
    }
}
