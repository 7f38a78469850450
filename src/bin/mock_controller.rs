//! Stand-in for the roadside controller. Serves the telemetry protocol on
//! `/ws` with generated readings and applies operator commands.
//!
//! Usage: `mock_controller [PORT]` (or `TRAFFIC_LINK_MOCK_PORT`, default 5000).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use nvml_wrapper::Nvml;
use rand::Rng;
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tokio::net::TcpListener;
use tokio::sync::watch;

const DEFAULT_PORT: u16 = 5000;
const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);
const DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const PHASE_SECS: u64 = 10;
const FORCE_HOLD: Duration = Duration::from_secs(PHASE_SECS);
const MAX_LOGS: usize = 50;
const SENT_LOGS: usize = 10;
const MAX_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    A,
    B,
}

impl Lane {
    fn as_str(self) -> &'static str {
        match self {
            Lane::A => "A",
            Lane::B => "B",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct VehicleTypes {
    car: u32,
    bus: u32,
    truck: u32,
    bike: u32,
}

struct Controller {
    started: Instant,
    road_a: u32,
    road_b: u32,
    signal: Lane,
    time_left: u64,
    fps: u32,
    avg_frame_time: u32,
    frames_processed: u64,
    vehicles_detected: u64,
    signal_cycles: u64,
    emergency_overrides: u64,
    logs: VecDeque<String>,
    history: VecDeque<(String, u32, u32)>,
    vehicle_types: VehicleTypes,
    paused: bool,
    forced: Option<(Lane, Instant)>,
    last_detection: Option<Instant>,
}

impl Controller {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            road_a: 0,
            road_b: 0,
            signal: Lane::A,
            time_left: PHASE_SECS,
            fps: 0,
            avg_frame_time: 0,
            frames_processed: 0,
            vehicles_detected: 0,
            signal_cycles: 0,
            emergency_overrides: 0,
            logs: VecDeque::with_capacity(MAX_LOGS),
            history: VecDeque::with_capacity(MAX_HISTORY),
            vehicle_types: VehicleTypes::default(),
            paused: false,
            forced: None,
            last_detection: None,
        }
    }

    fn log(&mut self, message: impl AsRef<str>) {
        if self.logs.len() == MAX_LOGS {
            self.logs.pop_front();
        }
        self.logs.push_back(format!("[{}] {}", wall_clock(true), message.as_ref()));
    }

    /// Applies one operator command. Returns false for identifiers the
    /// controller does not know.
    fn apply(&mut self, command: &str, now: Instant) -> bool {
        self.log(format!("Command received: {command}"));
        match command {
            "ADD_VEHICLE_A" | "ADD_VEHICLE_B" => {
                let lane = if command.ends_with('A') { Lane::A } else { Lane::B };
                match lane {
                    Lane::A => self.road_a += 1,
                    Lane::B => self.road_b += 1,
                }
                self.vehicles_detected += 1;
                self.vehicle_types.car += 1;
                self.log(format!("Vehicle added to Road {}", lane.as_str()));
            }
            "FORCE_GREEN_A" | "FORCE_GREEN_B" => {
                let lane = if command.ends_with('A') { Lane::A } else { Lane::B };
                self.forced = Some((lane, now + FORCE_HOLD));
                self.log(format!("Forcing Road {} to GREEN", lane.as_str()));
            }
            "TRIGGER_EMERGENCY" => {
                self.emergency_overrides += 1;
                self.log("Emergency override triggered");
            }
            "RESET" => {
                let mut fresh = Controller::new(now);
                fresh.logs = std::mem::take(&mut self.logs);
                *self = fresh;
                self.log("System reset initiated");
            }
            "PAUSE" => {
                self.paused = true;
                self.log("System paused");
            }
            "RESUME" => {
                self.paused = false;
                self.log("System resumed");
            }
            _ => {
                self.log(format!("Unknown command ignored: {command}"));
                return false;
            }
        }
        true
    }

    fn tick(&mut self, now: Instant) {
        if self.paused {
            return;
        }
        self.frames_processed += 1;

        let due = self
            .last_detection
            .map_or(true, |at| now.duration_since(at) >= DETECTION_INTERVAL);
        if due {
            self.last_detection = Some(now);
            self.detect(&mut rand::thread_rng());
        }

        let elapsed = now.duration_since(self.started).as_secs();
        let cycled = if (elapsed / PHASE_SECS) % 2 == 0 {
            Lane::A
        } else {
            Lane::B
        };
        let signal = match self.forced {
            Some((lane, until)) if now < until => {
                self.time_left = until.duration_since(now).as_secs();
                lane
            }
            _ => {
                self.forced = None;
                self.time_left = PHASE_SECS - elapsed % PHASE_SECS;
                cycled
            }
        };
        if signal != self.signal {
            self.signal = signal;
            self.signal_cycles += 1;
        }

        let minute = wall_clock(false);
        if self.history.back().map(|(time, _, _)| time != &minute).unwrap_or(true) {
            if self.history.len() == MAX_HISTORY {
                self.history.pop_front();
            }
            self.history.push_back((minute, self.road_a, self.road_b));
        }
    }

    fn detect(&mut self, rng: &mut impl Rng) {
        self.road_a = rng.gen_range(5..=15);
        self.road_b = rng.gen_range(5..=15);
        self.fps = rng.gen_range(25..=30);
        self.avg_frame_time = rng.gen_range(35..=45);
        self.vehicle_types = VehicleTypes {
            car: rng.gen_range(4..=12),
            bus: rng.gen_range(0..=2),
            truck: rng.gen_range(0..=3),
            bike: rng.gen_range(0..=5),
        };
        self.vehicles_detected += u64::from(self.road_a + self.road_b);
        let count = self.road_a;
        self.log(format!("Detected {count} vehicles on Road A"));
    }

    fn payload(&self, now: Instant, cpu: f32, gpu: f32) -> serde_json::Value {
        let skip = self.logs.len().saturating_sub(SENT_LOGS);
        let logs: Vec<&String> = self.logs.iter().skip(skip).collect();
        let history: Vec<serde_json::Value> = self
            .history
            .iter()
            .map(|(time, a, b)| json!({ "time": time, "roadA": a, "roadB": b }))
            .collect();
        json!({
            "roadA": self.road_a,
            "roadB": self.road_b,
            "currentSignal": self.signal.as_str(),
            "timeLeft": self.time_left,
            "systemUptime": now.duration_since(self.started).as_secs(),
            "cpuUsage": percent(cpu),
            "gpuUsage": percent(gpu),
            "fps": self.fps,
            "avgFrameTime": self.avg_frame_time,
            "framesProcessed": self.frames_processed,
            "vehiclesDetected": self.vehicles_detected,
            "signalCycles": self.signal_cycles,
            "emergencyOverrides": self.emergency_overrides,
            "arduinoConnected": false,
            "arduinoPort": "",
            "videoFrame": null,
            "logs": logs,
            "vehicleHistory": history,
            "vehicleTypes": {
                "car": self.vehicle_types.car,
                "bus": self.vehicle_types.bus,
                "truck": self.vehicle_types.truck,
                "bike": self.vehicle_types.bike,
            },
        })
    }
}

struct MockState {
    controller: Mutex<Controller>,
    frames: watch::Sender<String>,
}

impl MockState {
    fn controller(&self) -> MutexGuard<'_, Controller> {
        self.controller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct HostMetrics {
    sys: System,
    nvml: Option<Nvml>,
}

impl HostMetrics {
    fn new() -> Self {
        Self {
            sys: System::new(),
            nvml: Nvml::init().ok(),
        }
    }

    fn sample(&mut self) -> (f32, f32) {
        self.sys.refresh_cpu();
        let cpu = self.sys.global_cpu_info().cpu_usage();
        let gpu = self
            .nvml
            .as_ref()
            .and_then(|nvml| nvml.device_by_index(0).ok())
            .and_then(|device| device.utilization_rates().ok())
            .map(|u| u.gpu as f32)
            .unwrap_or(0.0);
        (cpu, gpu)
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let port = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => std::env::var("TRAFFIC_LINK_MOCK_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT),
    };

    let (frames, _) = watch::channel(String::new());
    let state = Arc::new(MockState {
        controller: Mutex::new(Controller::new(Instant::now())),
        frames,
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "mock controller listening on /ws");
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let mut host = HostMetrics::new();
    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (cpu, gpu) = host.sample();
                let now = Instant::now();
                let payload = {
                    let mut controller = state.controller();
                    controller.tick(now);
                    controller.payload(now, cpu, gpu)
                };
                state.frames.send_replace(payload.to_string());
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown: ctrl-c");
                break;
            }
        }
    }

    server.abort();
    Ok(())
}

async fn ws_handler(
    State(state): State<Arc<MockState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<MockState>) {
    tracing::info!("dashboard connected");
    state.controller().log("Dashboard connected");
    let mut frames = state.frames.subscribe();

    loop {
        tokio::select! {
            changed = frames.changed() => {
                if changed.is_err() {
                    break;
                }
                let payload = frames.borrow_and_update().clone();
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_command(&state, &text),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    tracing::info!("dashboard disconnected");
    state.controller().log("Dashboard disconnected");
}

fn handle_command(state: &MockState, text: &str) {
    let command = serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("command").and_then(|c| c.as_str()).map(str::to_owned));
    let Some(command) = command else {
        tracing::warn!(payload = %text, "ignoring message without a command");
        return;
    };
    if state.controller().apply(&command, Instant::now()) {
        tracing::info!(command = %command, "command applied");
    } else {
        tracing::warn!(command = %command, "unknown command");
    }
}

/// Whole percent in 0..=100. Unreadable samples report 0.
fn percent(sample: f32) -> f32 {
    if sample.is_finite() {
        sample.clamp(0.0, 100.0).round()
    } else {
        0.0
    }
}

/// `HH:MM:SS` (or `HH:MM`) of the current UTC time.
fn wall_clock(with_seconds: bool) -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let (h, m, s) = ((secs / 3600) % 24, (secs / 60) % 60, secs % 60);
    if with_seconds {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{h:02}:{m:02}")
    }
}
