use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    A,
    B,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// One complete reading of the remote controller. Replaced wholesale on
/// every accepted message, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub road_a: u32,
    pub road_b: u32,
    pub current_signal: Lane,
    pub time_left: f64,
    pub system_uptime: f64,
    pub cpu_usage: f64,
    pub gpu_usage: f64,
    pub fps: f64,
    pub avg_frame_time: f64,
    pub frames_processed: u64,
    pub vehicles_detected: u64,
    pub signal_cycles: u64,
    pub emergency_overrides: u64,
    pub arduino_connected: bool,
    pub arduino_port: String,
    /// Base64 JPEG of the annotated camera frame.
    #[serde(default)]
    pub video_frame: Option<String>,
    pub logs: Vec<String>,
    pub vehicle_history: Vec<HistoryPoint>,
    pub vehicle_types: VehicleTypes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub time: String,
    pub road_a: u32,
    pub road_b: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleTypes {
    pub car: u32,
    pub bus: u32,
    pub truck: u32,
    pub bike: u32,
}

impl VehicleTypes {
    pub fn total(&self) -> u64 {
        u64::from(self.car) + u64::from(self.bus) + u64::from(self.truck) + u64::from(self.bike)
    }
}

impl Snapshot {
    pub fn lane_count(&self, lane: Lane) -> u32 {
        match lane {
            Lane::A => self.road_a,
            Lane::B => self.road_b,
        }
    }

    pub fn frame_jpeg(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        self.video_frame
            .as_deref()
            .map(|frame| general_purpose::STANDARD.decode(frame))
    }

    /// True when a cumulative counter or the uptime went backwards relative
    /// to `previous`, which only happens when the remote process restarted.
    pub fn regressed_from(&self, previous: &Snapshot) -> bool {
        self.system_uptime < previous.system_uptime
            || self.frames_processed < previous.frames_processed
            || self.vehicles_detected < previous.vehicles_detected
            || self.signal_cycles < previous.signal_cycles
            || self.emergency_overrides < previous.emergency_overrides
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    AddVehicleA,
    AddVehicleB,
    TriggerEmergency,
    Reset,
    Pause,
    Resume,
    ForceGreenA,
    ForceGreenB,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::AddVehicleA,
        Command::AddVehicleB,
        Command::TriggerEmergency,
        Command::Reset,
        Command::Pause,
        Command::Resume,
        Command::ForceGreenA,
        Command::ForceGreenB,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddVehicleA => "ADD_VEHICLE_A",
            Self::AddVehicleB => "ADD_VEHICLE_B",
            Self::TriggerEmergency => "TRIGGER_EMERGENCY",
            Self::Reset => "RESET",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::ForceGreenA => "FORCE_GREEN_A",
            Self::ForceGreenB => "FORCE_GREEN_B",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown command: {}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Command::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}
