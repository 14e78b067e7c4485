use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::{
    protocol::{Command, Frame, InboundMessage},
    types::{Button, ConnectionState, TelemetryState, TrainerEvent},
};

/// Last dispatched button press
#[derive(Debug, Clone, Copy, Default)]
pub struct ButtonDebounce {
    last_code: Option<u8>,
    last_timestamp: Option<Instant>,
}

impl ButtonDebounce {
    /// Whether `code` pressed at `now` repeats the last dispatch within `interval`
    fn is_repeat(&self, code: u8, now: Instant, interval: Duration) -> bool {
        self.last_code == Some(code)
            && self
                .last_timestamp
                .is_some_and(|last| now.saturating_duration_since(last) < interval)
    }

    fn record(&mut self, code: u8, now: Instant) {
        self.last_code = Some(code);
        self.last_timestamp = Some(now);
    }
}

/// Outcome of dispatching one inbound frame
#[derive(Debug, Default, PartialEq)]
pub struct Dispatch {
    /// Events to publish, in order
    pub events: Vec<TrainerEvent>,
    /// Commands to queue, in order
    pub responses: Vec<Command>,
}

/// Connection state machine and telemetry owner
///
/// ```text
/// Disconnected -> LinkEstablishing -> LinkOpen -> Paused <-> Running
/// ```
#[derive(Debug)]
pub struct Dispatcher {
    state: ConnectionState,
    telemetry: TelemetryState,
    paused: bool,
    debounce: ButtonDebounce,
    debounce_interval: Duration,
}

impl Dispatcher {
    /// Create a dispatcher for a rider of `weight_kg`
    #[must_use]
    pub fn new(weight_kg: u8, debounce_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            telemetry: TelemetryState::new(weight_kg),
            paused: false,
            debounce: ButtonDebounce::default(),
            debounce_interval,
        }
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current telemetry
    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryState {
        &self.telemetry
    }

    /// Whether the head unit reported a pause more recently than a resume
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused
    }

    /// Set the slope sent with the next resistance command
    pub fn set_slope(&mut self, slope_percent: f64) {
        self.telemetry.slope_percent = slope_percent;
    }

    /// Set the rider weight sent with the next resistance command
    pub fn set_weight(&mut self, weight_kg: u8) {
        self.telemetry.weight_kg = weight_kg;
    }

    /// The resistance command reflecting the current slope and weight
    #[must_use]
    pub const fn resistance_command(&self) -> Command {
        Command::Data01 {
            slope_percent: self.telemetry.slope_percent,
            weight_kg: self.telemetry.weight_kg,
        }
    }

    fn transition(&mut self, next: ConnectionState) -> Option<TrainerEvent> {
        if self.state == next {
            return None;
        }
        info!("Connection state {} -> {}", self.state, next);
        self.state = next;
        Some(TrainerEvent::ConnectionStateChanged(next))
    }

    /// Start a new connection: fresh telemetry, link bring-up pending
    pub fn begin_link(&mut self) -> Option<TrainerEvent> {
        self.telemetry = TelemetryState::new(self.telemetry.weight_kg);
        self.paused = false;
        self.debounce = ButtonDebounce::default();
        self.transition(ConnectionState::LinkEstablishing)
    }

    /// The connection ended
    pub fn disconnect(&mut self) -> Option<TrainerEvent> {
        self.transition(ConnectionState::Disconnected)
    }

    /// Note an acknowledged command
    pub fn on_acknowledged(&mut self, command: &Command) -> Option<TrainerEvent> {
        match command {
            Command::OpenChannel if self.state == ConnectionState::LinkEstablishing => {
                self.transition(ConnectionState::LinkOpen)
            }
            _ => None,
        }
    }

    /// Classify an inbound frame and apply it
    pub fn handle(&mut self, frame: &Frame, now: Instant) -> Dispatch {
        let mut dispatch = Dispatch::default();

        match InboundMessage::parse(frame) {
            InboundMessage::Speed {
                speed_kmh,
                power_watts,
                cadence_rpm,
            } => {
                self.telemetry.speed_kmh = speed_kmh;
                self.telemetry.power_watts = power_watts;
                self.telemetry.cadence_rpm = cadence_rpm;
                dispatch.events.push(TrainerEvent::DataUpdated(self.telemetry));
            }
            InboundMessage::Distance {
                distance_m,
                heart_rate_bpm,
            } => {
                let previous = self.telemetry.distance_m;
                self.telemetry.distance_m = distance_m;
                self.telemetry.heart_rate_bpm = heart_rate_bpm;
                dispatch.events.push(TrainerEvent::DataUpdated(self.telemetry));
                if previous != distance_m {
                    dispatch.events.push(TrainerEvent::DistanceUpdated(distance_m));
                }
            }
            InboundMessage::BrakeTemperature { celsius } => {
                self.telemetry.brake_temp_c = celsius;
                dispatch.events.push(TrainerEvent::DataUpdated(self.telemetry));
            }
            InboundMessage::Button(code) => {
                if let Some(button) = self.debounce_button(code, now) {
                    dispatch.events.push(TrainerEvent::Button(button));
                }
            }
            InboundMessage::Resumed => {
                self.paused = false;
                dispatch.events.extend(self.transition(ConnectionState::Running));
                dispatch.events.push(TrainerEvent::Resumed);
                debug!("Sending slope of {:.1}%", self.telemetry.slope_percent);
                dispatch.responses.push(self.resistance_command());
                dispatch.responses.push(Command::Data02);
            }
            InboundMessage::Paused => {
                self.paused = true;
                dispatch.events.extend(self.transition(ConnectionState::Paused));
                dispatch.events.push(TrainerEvent::Paused);
                debug!("Sending continue message");
                dispatch.responses.push(Command::Continue);
            }
            InboundMessage::Unknown => {
                trace!(
                    "Ignoring message {:02X} {:02X?}",
                    frame.msg_type(),
                    frame.payload()
                );
            }
        }

        dispatch
    }

    fn debounce_button(&mut self, code: u8, now: Instant) -> Option<Button> {
        let Some(button) = Button::from_code(code) else {
            warn!("Ignoring unknown button code {:02X}", code);
            return None;
        };

        if button == Button::Ok {
            debug!("OK button pressed, no action bound");
            return None;
        }

        if self.debounce.is_repeat(code, now, self.debounce_interval) {
            trace!("Debounced {} button", button);
            return None;
        }

        self.debounce.record(code, now);
        Some(button)
    }
}
