use crate::error::{BushidoError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Sync byte opening every ANT serial frame
pub const SYNC_BYTE: u8 = 0xA4;

/// Largest payload a single length byte can describe
pub const MAX_PAYLOAD_SIZE: usize = 255;

/// Bytes surrounding the payload on the wire: sync, length, type and checksum
pub const FRAME_OVERHEAD: usize = 4;

/// Channel number used for every command; the stick drives a single channel
pub const CHANNEL: u8 = 0x00;

/// ANT message types used by the Bushido link
///
/// Only the types the trainer conversation actually needs are listed. Note that
/// the reset command is sent with type `0xA4`, the same value as the sync byte;
/// the head unit's ANT stick accepts it and the link bring-up relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Channel response / event, used as acknowledgment
    ChannelResponse = 0x40,
    /// Assign a channel type to the channel
    AssignChannel = 0x42,
    /// Set the channel message period
    ChannelPeriod = 0x43,
    /// Set the channel RF frequency
    ChannelRfFrequency = 0x45,
    /// Set the network key
    NetworkKey = 0x46,
    /// Open the channel
    OpenChannel = 0x4B,
    /// Broadcast data to or from the head unit
    BroadcastData = 0x4E,
    /// Set the channel id (device type)
    ChannelId = 0x51,
    /// Reset the link
    Reset = 0xA4,
}

/// Channel event reported through a channel response once a broadcast went out
///
/// A response whose content reads `[channel, 0x01, 0x03]` (RF event, `EVENT_TX`)
/// stands in for the acknowledgment of a broadcast command.
pub const EVENT_TX: [u8; 2] = [0x01, 0x03];

/// XOR-fold over the given bytes
#[must_use]
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// One unit of the ANT serial protocol
///
/// Wire layout:
///
/// ```text
/// [SYNC 0xA4][LEN][TYPE][PAYLOAD ... LEN bytes][CHECKSUM]
/// ```
///
/// The checksum is the XOR-fold of every preceding byte, sync included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    msg_type: u8,
    payload: Bytes,
}

impl Frame {
    /// Create a frame
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::InvalidParameters`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`] bytes.
    pub fn new(msg_type: u8, payload: impl Into<Bytes>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(BushidoError::InvalidParameters(format!(
                "Payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit",
                payload.len()
            )));
        }
        Ok(Self { msg_type, payload })
    }

    /// Message type byte
    #[must_use]
    pub const fn msg_type(&self) -> u8 {
        self.msg_type
    }

    /// Payload (content) bytes
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn header(&self) -> [u8; 3] {
        // payload length is bounded by construction
        [SYNC_BYTE, self.payload.len() as u8, self.msg_type]
    }

    /// Checksum of the frame as it goes on the wire
    #[must_use]
    pub fn checksum(&self) -> u8 {
        xor_checksum(&self.header()) ^ xor_checksum(&self.payload)
    }

    /// Serialize the frame to its wire form
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        buf.put_slice(&self.header());
        buf.put_slice(&self.payload);
        buf.put_u8(self.checksum());
        buf.freeze()
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Bytes preceding the sync byte are discarded. Returns `Ok(None)` when the
    /// buffer does not yet hold a complete frame; the partial frame stays in the
    /// buffer so that more bytes can be appended.
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::Checksum`] if the transmitted checksum does not
    /// match. The offending frame is consumed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        match buf.iter().position(|&b| b == SYNC_BYTE) {
            Some(start) => buf.advance(start),
            None => {
                buf.clear();
                return Ok(None);
            }
        }

        if buf.len() < 2 {
            return Ok(None);
        }

        let len = usize::from(buf[1]);
        if buf.len() < len + FRAME_OVERHEAD {
            return Ok(None);
        }

        let mut raw = buf.split_to(len + FRAME_OVERHEAD);
        raw.advance(2);
        let msg_type = raw.get_u8();
        let payload = raw.split_to(len).freeze();
        let actual = raw.get_u8();

        let frame = Self { msg_type, payload };
        let expected = frame.checksum();
        if expected != actual {
            return Err(BushidoError::Checksum { expected, actual });
        }

        Ok(Some(frame))
    }

    /// Whether this frame acknowledges a previously sent frame of `sent_type`
    ///
    /// A channel response acknowledges either by echoing the sent message type
    /// in content byte 1, or by reporting `EVENT_TX` for a broadcast.
    #[must_use]
    pub fn acknowledges(&self, sent_type: u8) -> bool {
        if self.msg_type != MessageType::ChannelResponse as u8 {
            return false;
        }
        match self.payload.get(1..3) {
            Some(content) => content[0] == sent_type || content == EVENT_TX,
            None => self.payload.get(1) == Some(&sent_type),
        }
    }
}

/// Accumulates raw transfer chunks and splits them into frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes received from the link
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete frame, if buffered
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::Checksum`] on a corrupted frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        Frame::decode(&mut self.buffer)
    }

    /// Number of buffered bytes not yet consumed
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Encode a slope in percent the way the head unit expects it
///
/// The slope is scaled to tenths of a percent and clamped to `-5.0 ..= 20.0 %`.
/// Negative values are sent as a `0xFF` marker followed by `256 + value`,
/// non-negative values as `0x00` followed by the value.
#[must_use]
pub fn encode_slope(slope_percent: f64) -> (u8, u8) {
    // half-way values round toward positive infinity
    let corrected = (slope_percent * 10.0 + 0.5).floor().clamp(-50.0, 200.0) as i16;
    if corrected < 0 {
        (0xFF, (256 + corrected) as u8)
    } else {
        (0x00, corrected as u8)
    }
}

/// Every outbound message the engine can send
///
/// Link setup commands configure the ANT stick; the remaining variants are
/// broadcast commands addressed to the Bushido head unit, all carried in a
/// `BroadcastData` frame with an 8-byte body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Reset the link
    Reset,
    /// Set the 8-byte network key
    SetNetworkKey([u8; 8]),
    /// Assign the channel type
    AssignChannel {
        /// ANT channel type
        channel_type: u8,
    },
    /// Set the channel id
    SetChannelId {
        /// ANT device type to pair with
        device_type: u8,
    },
    /// Set the channel period (1/32768 s units)
    SetChannelPeriod(u16),
    /// Set the RF frequency as an offset from 2400 MHz
    SetChannelRfFrequency {
        /// Offset from 2400 MHz
        offset_mhz: u8,
    },
    /// Open the channel
    OpenChannel,
    /// Put the head unit into PC-controlled mode
    InitPcConnection,
    /// Reset the head unit
    ResetHeadUnit,
    /// Start a cycling session
    StartCycling,
    /// Keep the head unit in paused polling mode
    Continue,
    /// Start a time/slope program
    StartTimeSlope,
    /// Resistance setpoint: slope and rider weight
    Data01 {
        /// Slope in percent grade
        slope_percent: f64,
        /// Rider weight in kilograms
        weight_kg: u8,
    },
    /// Keep-alive data frame
    Data02,
}

impl Command {
    /// Build a RF frequency command from an absolute frequency
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::InvalidParameters`] if the frequency lies outside
    /// `2400 ..= 2655` MHz.
    pub fn rf_frequency(mhz: u16) -> Result<Self> {
        mhz.checked_sub(2400)
            .and_then(|offset| u8::try_from(offset).ok())
            .map(|offset_mhz| Self::SetChannelRfFrequency { offset_mhz })
            .ok_or_else(|| {
                BushidoError::InvalidParameters(format!(
                    "RF frequency {mhz} MHz is out of range (2400 - 2655)"
                ))
            })
    }

    /// ANT message type this command is sent with
    #[must_use]
    pub const fn msg_type(&self) -> MessageType {
        match self {
            Self::Reset => MessageType::Reset,
            Self::SetNetworkKey(_) => MessageType::NetworkKey,
            Self::AssignChannel { .. } => MessageType::AssignChannel,
            Self::SetChannelId { .. } => MessageType::ChannelId,
            Self::SetChannelPeriod(_) => MessageType::ChannelPeriod,
            Self::SetChannelRfFrequency { .. } => MessageType::ChannelRfFrequency,
            Self::OpenChannel => MessageType::OpenChannel,
            _ => MessageType::BroadcastData,
        }
    }

    /// Whether this is a broadcast command addressed to the head unit
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        matches!(self.msg_type(), MessageType::BroadcastData)
    }

    fn broadcast_body(&self) -> Option<[u8; 8]> {
        let body = match *self {
            Self::InitPcConnection => [0xAC, 0x03, 0x04, 0, 0, 0, 0, 0],
            Self::ResetHeadUnit => [0xAC, 0x03, 0x01, 0, 0, 0, 0, 0],
            Self::StartCycling => [0xAC, 0x03, 0x03, 0, 0, 0, 0, 0],
            Self::Continue => [0xAC, 0x03, 0x02, 0, 0, 0, 0, 0],
            Self::StartTimeSlope => [0xDC, 0x0A, 0, 0, 0, 0, 0, 0],
            Self::Data01 {
                slope_percent,
                weight_kg,
            } => {
                let (sign, slope) = encode_slope(slope_percent);
                [0xDC, 0x01, 0x00, sign, slope, weight_kg, 0, 0]
            }
            Self::Data02 => [0xDC, 0x02, 0x00, 0x99, 0, 0, 0, 0],
            _ => return None,
        };
        Some(body)
    }

    /// Payload bytes of the command
    #[must_use]
    pub fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(CHANNEL);
        match *self {
            Self::Reset | Self::OpenChannel => {}
            Self::SetNetworkKey(key) => buf.put_slice(&key),
            Self::AssignChannel { channel_type } => {
                buf.put_u8(channel_type);
                buf.put_u8(0x00);
            }
            Self::SetChannelId { device_type } => {
                buf.put_slice(&[0x00, 0x00, device_type, 0x00]);
            }
            Self::SetChannelPeriod(period) => buf.put_u16_le(period),
            Self::SetChannelRfFrequency { offset_mhz } => buf.put_u8(offset_mhz),
            _ => {
                if let Some(body) = self.broadcast_body() {
                    buf.put_slice(&body);
                }
            }
        }
        buf.freeze()
    }

    /// Build the frame for this command
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame {
            msg_type: self.msg_type() as u8,
            payload: self.payload(),
        }
    }

    /// Serialize the command to its wire form
    #[must_use]
    pub fn encode(&self) -> Bytes {
        self.to_frame().encode()
    }
}

/// Lead byte of telemetry content
pub const TELEMETRY_MARKER: u8 = 0xDD;
/// Lead byte of pause/resume content
pub const STATE_MARKER: u8 = 0xAD;

/// Classified inbound message
///
/// Offsets below are relative to the content following the channel byte.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InboundMessage {
    /// `DD 01`: speed, power, cadence
    Speed {
        /// Speed in km/h
        speed_kmh: f64,
        /// Power in watts
        power_watts: u16,
        /// Cadence in rpm
        cadence_rpm: u8,
    },
    /// `DD 02`: distance and heart rate
    Distance {
        /// Distance in meters
        distance_m: u32,
        /// Heart rate in bpm
        heart_rate_bpm: u8,
    },
    /// `DD 03`: brake temperature
    BrakeTemperature {
        /// Temperature in °C
        celsius: u8,
    },
    /// `DD 10`: raw button code
    Button(u8),
    /// `AD 01 02`: rider resumed pedaling
    Resumed,
    /// `AD 01 03`: head unit paused
    Paused,
    /// Anything else
    Unknown,
}

impl InboundMessage {
    /// Classify a frame by its content
    ///
    /// The distance field is read as a conventional big-endian 32-bit value.
    #[must_use]
    pub fn parse(frame: &Frame) -> Self {
        let Some(data) = frame.payload().get(1..) else {
            return Self::Unknown;
        };

        match data {
            [TELEMETRY_MARKER, 0x01, s0, s1, p0, p1, cadence, ..] => Self::Speed {
                speed_kmh: f64::from(u16::from_be_bytes([*s0, *s1])) / 10.0,
                power_watts: u16::from_be_bytes([*p0, *p1]),
                cadence_rpm: *cadence,
            },
            [TELEMETRY_MARKER, 0x02, d0, d1, d2, d3, heart_rate, ..] => Self::Distance {
                distance_m: u32::from_be_bytes([*d0, *d1, *d2, *d3]),
                heart_rate_bpm: *heart_rate,
            },
            [TELEMETRY_MARKER, 0x03, _, _, celsius, ..] => Self::BrakeTemperature { celsius: *celsius },
            [TELEMETRY_MARKER, 0x10, code, ..] => Self::Button(*code),
            [STATE_MARKER, 0x01, 0x02, ..] => Self::Resumed,
            [STATE_MARKER, 0x01, 0x03, ..] => Self::Paused,
            _ => Self::Unknown,
        }
    }
}
