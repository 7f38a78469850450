//! Wire codec for the remote controller link.
//!
//! Inbound messages are JSON text carrying one complete [`Snapshot`]; they are
//! parsed and then range-checked so a half-valid reading never reaches the
//! store. Outbound messages are `{"command":"<ID>"}`.

use crate::model::{Command, Snapshot};
use std::fmt;

pub const MAX_LOG_LINES: usize = 50;
pub const MAX_HISTORY_POINTS: usize = 20;

#[derive(Debug)]
pub enum DecodeError {
    NotText,
    Malformed(serde_json::Error),
    OutOfRange { field: &'static str, value: f64 },
    TooLong { field: &'static str, len: usize, max: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotText => write!(f, "payload is not utf-8 text"),
            Self::Malformed(err) => write!(f, "malformed snapshot: {err}"),
            Self::OutOfRange { field, value } => write!(f, "{field} out of range: {value}"),
            Self::TooLong { field, len, max } => {
                write!(f, "{field} has {len} entries (max {max})")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(err) => Some(err),
            _ => None,
        }
    }
}

pub fn decode(raw: &str) -> Result<Snapshot, DecodeError> {
    let snapshot: Snapshot = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
    validate(&snapshot)?;
    Ok(snapshot)
}

pub fn decode_bytes(raw: &[u8]) -> Result<Snapshot, DecodeError> {
    let text = std::str::from_utf8(raw).map_err(|_| DecodeError::NotText)?;
    decode(text)
}

pub fn encode(command: Command) -> String {
    format!("{{\"command\":\"{}\"}}", command.as_str())
}

fn validate(s: &Snapshot) -> Result<(), DecodeError> {
    non_negative("timeLeft", s.time_left)?;
    non_negative("systemUptime", s.system_uptime)?;
    non_negative("fps", s.fps)?;
    non_negative("avgFrameTime", s.avg_frame_time)?;
    percent("cpuUsage", s.cpu_usage)?;
    percent("gpuUsage", s.gpu_usage)?;
    bounded("logs", s.logs.len(), MAX_LOG_LINES)?;
    bounded("vehicleHistory", s.vehicle_history.len(), MAX_HISTORY_POINTS)?;
    Ok(())
}

fn non_negative(field: &'static str, value: f64) -> Result<(), DecodeError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(DecodeError::OutOfRange { field, value })
    }
}

fn percent(field: &'static str, value: f64) -> Result<(), DecodeError> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(DecodeError::OutOfRange { field, value })
    }
}

fn bounded(field: &'static str, len: usize, max: usize) -> Result<(), DecodeError> {
    if len <= max {
        Ok(())
    } else {
        Err(DecodeError::TooLong { field, len, max })
    }
}
