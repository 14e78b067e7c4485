use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration, time::SystemTime};

/// Default rider weight in kilograms
pub const DEFAULT_WEIGHT_KG: u8 = 70;

/// Live rider telemetry
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryState {
    /// Speed in km/h
    pub speed_kmh: f64,
    /// Cadence in rpm
    pub cadence_rpm: u8,
    /// Power in watts
    pub power_watts: u16,
    /// Distance reported by the head unit, in meters
    pub distance_m: u32,
    /// Brake temperature in °C
    pub brake_temp_c: u8,
    /// Heart rate in bpm
    pub heart_rate_bpm: u8,
    /// Currently commanded slope in percent
    pub slope_percent: f64,
    /// Rider weight in kilograms
    pub weight_kg: u8,
}

impl TelemetryState {
    /// Create a zeroed state for a rider of the given weight
    #[must_use]
    pub const fn new(weight_kg: u8) -> Self {
        Self {
            speed_kmh: 0.0,
            cadence_rpm: 0,
            power_watts: 0,
            distance_m: 0,
            brake_temp_c: 0,
            heart_rate_bpm: 0,
            slope_percent: 0.0,
            weight_kg,
        }
    }
}

impl Default for TelemetryState {
    fn default() -> Self {
        Self::new(DEFAULT_WEIGHT_KG)
    }
}

/// Telemetry recorded when the rider enters a course segment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Telemetry at the time the segment was entered
    pub telemetry: TelemetryState,
    /// Distance along the route, offset included
    pub effective_distance_m: i64,
    /// Wall clock time of the sample
    pub timestamp: SystemTime,
}

/// Connection state of a trainer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link bring-up commands queued or in flight
    LinkEstablishing,
    /// Channel open, head unit not yet reporting
    LinkOpen,
    /// Head unit paused
    Paused,
    /// Rider pedaling
    Running,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::LinkEstablishing => write!(f, "Link Establishing"),
            Self::LinkOpen => write!(f, "Link Open"),
            Self::Paused => write!(f, "Paused"),
            Self::Running => write!(f, "Running"),
        }
    }
}

/// Head unit buttons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Button {
    /// Left
    Left = 0x01,
    /// Down
    Down = 0x02,
    /// OK (reported but not bound to an action)
    Ok = 0x03,
    /// Up
    Up = 0x04,
    /// Right
    Right = 0x05,
}

impl Button {
    /// Convert from a raw button code
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Left),
            0x02 => Some(Self::Down),
            0x03 => Some(Self::Ok),
            0x04 => Some(Self::Up),
            0x05 => Some(Self::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Left => write!(f, "Left"),
            Self::Down => write!(f, "Down"),
            Self::Ok => write!(f, "OK"),
            Self::Up => write!(f, "Up"),
            Self::Right => write!(f, "Right"),
        }
    }
}

/// Events published by a trainer session
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainerEvent {
    /// Telemetry changed; carries the full snapshot
    DataUpdated(TelemetryState),
    /// Distance reported by the head unit changed
    DistanceUpdated(u32),
    /// Head unit paused
    Paused,
    /// Rider resumed pedaling
    Resumed,
    /// A head unit button was pressed
    Button(Button),
    /// The session moved to a new connection state
    ConnectionStateChanged(ConnectionState),
    /// A new slope setpoint was computed
    SlopeChanged(f64),
    /// A telemetry sample was recorded for a course segment
    SampleRecorded {
        /// Segment index
        segment: usize,
        /// Recorded sample
        sample: TelemetrySample,
    },
}

/// USB identification of the ANT stick shipped with the head unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkParams {
    /// USB vendor id
    pub vendor_id: u16,
    /// USB product id
    pub product_id: u16,
    /// Interface to claim
    pub interface: u8,
    /// Bulk OUT endpoint address
    pub out_endpoint: u8,
    /// Bulk IN endpoint address
    pub in_endpoint: u8,
    /// Size of each bulk IN transfer
    pub read_chunk_size: usize,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            vendor_id: crate::BUSHIDO_VENDOR_ID,
            product_id: crate::BUSHIDO_PRODUCT_ID,
            interface: 0,
            out_endpoint: crate::BUSHIDO_BULK_ENDPOINT,
            in_endpoint: 0x80 | crate::BUSHIDO_BULK_ENDPOINT,
            read_chunk_size: 64,
        }
    }
}

/// ANT channel parameters used during link bring-up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// ANT channel type
    pub channel_type: u8,
    /// ANT device type of the head unit
    pub device_type: u8,
    /// Channel period in 1/32768 s units
    pub period: u16,
    /// RF frequency in MHz
    pub rf_frequency_mhz: u16,
    /// Network key, sent before channel assignment when set
    pub network_key: Option<[u8; 8]>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            channel_type: 0x00,
            device_type: 0x52,
            period: 4096,
            rf_frequency_mhz: 2460,
            network_key: None,
        }
    }
}

/// Acknowledgment retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Interval between retransmissions of an unacknowledged frame
    pub ack_retry_interval: Duration,
    /// Maximum transmissions per command; `None` retries forever
    pub max_ack_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ack_retry_interval: Duration::from_secs(1),
            max_ack_attempts: None,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// USB link identification
    pub link: LinkParams,
    /// ANT channel parameters
    pub channel: ChannelConfig,
    /// Acknowledgment retry behavior
    pub retry: RetryConfig,
    /// Rider weight sent with every resistance command
    pub weight_kg: u8,
    /// Minimum interval between two dispatches of the same button
    pub button_debounce: Duration,
    /// Largest slope change applied per distance update, in percent
    pub max_slope_change: f64,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link: LinkParams::default(),
            channel: ChannelConfig::default(),
            retry: RetryConfig::default(),
            weight_kg: DEFAULT_WEIGHT_KG,
            button_debounce: Duration::from_millis(1000),
            max_slope_change: 1.0,
            event_capacity: 256,
        }
    }
}
