use hydronics_sim::model::Still;
use hydronics_sim::state::btu_per_hour;
use hydronics_sim::{AppError, ConfigError, LoopState, LoopStatus, StatePublisher, SyncLoop, ThermalModel};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const STATE_TOPIC: &str = "hydronics/main/state";

/// Publisher that keeps every payload it was handed.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    fail: AtomicBool,
}

impl Recorder {
    fn states(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| serde_json::from_slice(p).unwrap())
            .collect()
    }
}

impl StatePublisher for Recorder {
    fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), AppError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Mqtt("connection reset".into()));
        }
        self.sent.lock().unwrap().push((topic.to_string(), payload));
        Ok(())
    }
}

fn seeded_loop() -> SyncLoop<rand::rngs::StdRng> {
    SyncLoop::new(LoopState::default(), ThermalModel::seeded(42), STATE_TOPIC)
}

#[test]
fn test_config_scenario() {
    let sim = SyncLoop::new(LoopState::default(), ThermalModel::new(Still), STATE_TOPIC);
    assert_eq!(sim.state().btu_per_hour, 15000.0);
    let handle = sim.config_handle();
    assert_eq!(handle.gpm(), 3.0);

    assert_eq!(handle.apply_config(br#"{"gpm": 75}"#).unwrap(), 50.0);
    assert_eq!(handle.gpm(), 50.0);

    assert_eq!(handle.apply_config(br#"{"gpm": -5}"#).unwrap(), 0.0);
    assert_eq!(handle.gpm(), 0.0);

    assert!(matches!(handle.apply_config(b"{}"), Err(ConfigError::MissingFlowRate)));
    assert_eq!(handle.gpm(), 0.0);

    assert!(matches!(handle.apply_config(b"{\"gpm\": "), Err(ConfigError::Parse(_))));
    assert_eq!(handle.gpm(), 0.0);
}

#[test]
fn test_clamping_for_many_inputs() {
    let handle = seeded_loop().config_handle();
    let inputs: [f64; 11] = [-1e9, -50.0, -0.0001, 0.0, 0.5, 3.0, 25.25, 49.99, 50.0, 50.0001, 1e12];
    for g in inputs {
        handle.apply_config(format!(r#"{{"gpm": {g}}}"#).as_bytes()).unwrap();
        assert_eq!(handle.gpm(), g.clamp(0.0, 50.0), "input {g}");
    }
}

#[test]
fn test_malformed_payloads_leave_gpm_unchanged() {
    let handle = seeded_loop().config_handle();
    handle.apply_config(br#"{"gpm": 8.5}"#).unwrap();

    let payloads: [&[u8]; 7] = [
        b"",
        b"   ",
        b"not json",
        b"[8]",
        br#"{"flow": 12}"#,
        br#"{"gpm": "lots"}"#,
        br#"{"gpm": true}"#,
    ];
    for p in payloads {
        assert!(handle.apply_config(p).is_err());
        assert_eq!(handle.gpm(), 8.5);
    }
}

#[test]
fn test_unknown_fields_are_ignored() {
    let handle = seeded_loop().config_handle();
    let gpm = handle
        .apply_config(br#"{"gpm": 12, "mode": "turbo", "zones": [1, 2]}"#)
        .unwrap();
    assert_eq!(gpm, 12.0);
}

#[test]
fn test_concurrent_updates_never_tear() {
    const VALUES: [f64; 4] = [0.1, 7.77, 33.333_333_333_3, 49.9];

    let mut sim = seeded_loop();
    let handle = sim.config_handle();
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let handle = handle.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut i = w;
                while !stop.load(Ordering::Relaxed) {
                    let g = VALUES[i % VALUES.len()];
                    handle.apply_config(format!(r#"{{"gpm": {g}}}"#).as_bytes()).unwrap();
                    i += 1;
                }
            })
        })
        .collect();

    for _ in 0..2_000 {
        let state = sim.tick();
        assert!(
            state.gpm == 3.0 || VALUES.contains(&state.gpm),
            "torn gpm {}",
            state.gpm
        );
        assert_eq!(state.btu_per_hour, btu_per_hour(state.gpm, state.delta_t));
    }

    stop.store(true, Ordering::Relaxed);
    for w in writers {
        w.join().unwrap();
    }
}

#[tokio::test]
async fn test_run_publishes_until_shutdown() {
    let mut sim = seeded_loop();
    let publisher = Recorder::default();
    let (tx, rx) = watch::channel(false);

    tokio::join!(sim.run(Duration::from_millis(10), &publisher, rx), async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        tx.send_replace(true);
    });

    assert_eq!(sim.status(), LoopStatus::Stopped);
    let sent = publisher.sent.lock().unwrap().clone();
    assert!(sent.len() >= 2, "only {} publishes", sent.len());
    assert!(sent.iter().all(|(topic, _)| topic == STATE_TOPIC));

    let states = publisher.states();
    let mut last_ts = 0.0;
    for s in &states {
        let ts = s["ts"].as_f64().unwrap();
        assert!(ts >= last_ts);
        last_ts = ts;

        let supply = s["supplyF"].as_f64().unwrap();
        let ret = s["returnF"].as_f64().unwrap();
        let delta = s["deltaT"].as_f64().unwrap();
        // JSON parsing may be off by an ulp
        assert!((delta - (supply - ret)).abs() < 1e-9);
        let btu = s["btuPerHour"].as_f64().unwrap();
        assert!((btu - 500.0 * s["gpm"].as_f64().unwrap() * delta).abs() < 1e-6);
        assert_eq!(s["name"], "Main Loop");
        assert_eq!(s["status"], "OK (sim)");
    }
}

#[tokio::test]
async fn test_run_picks_up_config_between_ticks() {
    let mut sim = seeded_loop();
    let handle = sim.config_handle();
    let publisher = Recorder::default();
    let (tx, rx) = watch::channel(false);

    tokio::join!(sim.run(Duration::from_millis(10), &publisher, rx), async {
        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.apply_config(br#"{"gpm": 20}"#).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);
    });

    let states = publisher.states();
    assert_eq!(states.first().unwrap()["gpm"], 3.0);
    assert_eq!(states.last().unwrap()["gpm"], 20.0);
}

#[tokio::test]
async fn test_run_survives_failed_publishes() {
    let mut sim = seeded_loop();
    let publisher = Recorder::default();
    publisher.fail.store(true, Ordering::SeqCst);
    let (tx, rx) = watch::channel(false);

    tokio::join!(sim.run(Duration::from_millis(10), &publisher, rx), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        publisher.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);
    });

    assert!(!publisher.states().is_empty());
    assert_eq!(sim.status(), LoopStatus::Stopped);
}

#[tokio::test]
async fn test_run_exits_immediately_when_already_cancelled() {
    let mut sim = seeded_loop();
    let publisher = Recorder::default();
    let (_tx, rx) = watch::channel(true);

    sim.run(Duration::from_secs(60), &publisher, rx).await;
    assert!(publisher.states().is_empty());
    assert_eq!(sim.status(), LoopStatus::Stopped);
}

#[tokio::test]
async fn test_run_stops_when_shutdown_sender_dropped() {
    let mut sim = seeded_loop();
    let publisher = Recorder::default();
    let (tx, rx) = watch::channel(false);

    tokio::join!(sim.run(Duration::from_secs(60), &publisher, rx), async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);
    });

    assert_eq!(publisher.states().len(), 1);
}
