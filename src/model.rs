//! Plausible-looking loop telemetry without any real load input.
//!
//! Supply temperature is a random walk nudged by a slow sine wave; return
//! temperature chases `supply - load` with exponential smoothing, where the
//! target ΔT ("load") oscillates around 10 °F. Nothing here is bounded: the
//! supply temperature may drift indefinitely.

use crate::state::LoopState;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WAVE_AMPLITUDE: f64 = 0.6;
const WAVE_DIVISOR_SECS: f64 = 15.0;
const WAVE_GAIN: f64 = 0.02;

const LOAD_BASE_DELTA_T: f64 = 10.0;
const LOAD_AMPLITUDE: f64 = 2.0;
const LOAD_DIVISOR_SECS: f64 = 10.0;

const SUPPLY_JITTER: f64 = 0.08;
const RETURN_JITTER: f64 = 0.06;

/// Fraction of the remaining gap to the return target closed per tick.
pub const RETURN_SMOOTHING: f64 = 0.05;

/// A source of symmetric perturbations.
pub trait Noise {
    /// Returns a value in `[-amplitude, amplitude]`.
    fn sample(&mut self, amplitude: f64) -> f64;
}

impl<R: Rng> Noise for R {
    fn sample(&mut self, amplitude: f64) -> f64 {
        self.gen_range(-amplitude..=amplitude)
    }
}

/// Noise source that never perturbs anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Still;

impl Noise for Still {
    fn sample(&mut self, _amplitude: f64) -> f64 {
        0.0
    }
}

/// Slow sinusoid (period 2π·15 s) that nudges the supply temperature.
pub fn wave(elapsed_secs: f64) -> f64 {
    (elapsed_secs / WAVE_DIVISOR_SECS).sin() * WAVE_AMPLITUDE
}

/// Target ΔT the return temperature is pulled towards (period 2π·10 s).
pub fn load(elapsed_secs: f64) -> f64 {
    LOAD_BASE_DELTA_T + (elapsed_secs / LOAD_DIVISOR_SECS).sin() * LOAD_AMPLITUDE
}

/// Current wall-clock time as fractional Unix seconds.
pub fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[derive(Debug)]
pub struct ThermalModel<N = StdRng> {
    noise: N,
}

impl ThermalModel<StdRng> {
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }

    /// Reproducible noise sequence for a given seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<N: Noise> ThermalModel<N> {
    pub fn new(noise: N) -> Self {
        Self { noise }
    }

    /// Advance `state` by one tick, stamping it with the current wall-clock time.
    pub fn advance<'a>(&mut self, state: &'a mut LoopState, elapsed_secs: f64) -> &'a mut LoopState {
        self.advance_at(state, elapsed_secs, now_epoch_secs())
    }

    /// Advance `state` by one tick. `elapsed_secs` is the time since the
    /// simulation started; `now_secs` is the Unix time recorded on the state.
    ///
    /// Uses whatever `gpm` the state currently holds.
    pub fn advance_at<'a>(
        &mut self,
        state: &'a mut LoopState,
        elapsed_secs: f64,
        now_secs: f64,
    ) -> &'a mut LoopState {
        let wave = wave(elapsed_secs);
        let load = load(elapsed_secs);

        state.supply_f += self.noise.sample(SUPPLY_JITTER) + wave * WAVE_GAIN;

        let return_target = state.supply_f - load;
        state.return_f += (return_target - state.return_f) * RETURN_SMOOTHING
            + self.noise.sample(RETURN_JITTER);

        state.refresh_derived();
        // never step backwards, even if the wall clock does
        state.timestamp = state.timestamp.max(now_secs);
        state
    }
}
