use crate::{
    controller::{ControllerUpdate, ResistanceController},
    dispatcher::{Dispatch, Dispatcher},
    error::{BushidoError, Result},
    link::{DeviceLink, UsbLink},
    protocol::{Command, Frame},
    route::RouteProfile,
    transport::Transport,
    types::{ConnectionState, SessionConfig, TelemetrySample, TelemetryState, TrainerEvent},
};
use futures::Stream;
use std::{collections::BTreeMap, ops::ControlFlow};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Requests from a [`SessionHandle`] to the running session
#[derive(Debug)]
enum Control {
    Stop,
    Seek(i64),
    SetSlope(f64),
    SetWeight(u8),
    Send(Command, Option<oneshot::Sender<()>>),
}

/// A session with a Tacx Bushido trainer
///
/// `BushidoDevice` owns the link to the ANT stick and runs the whole
/// conversation with the head unit: it brings the ANT channel up, keeps the
/// head unit in PC mode, decodes telemetry and button presses, and follows a
/// loaded [`RouteProfile`] by sending rate-limited slope setpoints.
///
/// The session runs in [`run`](Self::run), a single loop that alternates
/// between sending queued commands (each retransmitted until acknowledged)
/// and processing one inbound frame. Other tasks interact with it through a
/// [`SessionHandle`].
///
/// # Examples
///
/// ```no_run
/// use bushido::{BushidoDevice, ConnectionState, RouteProfile, TrainerEvent};
/// use futures::StreamExt;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let route = RouteProfile::from_slopes(&[0.0, 1.5, 3.0, 4.5, 2.0], 120.0);
///     let mut device = BushidoDevice::open().await?.with_route(route);
///     let handle = device.handle();
///
///     let session = tokio::spawn(async move { device.run().await });
///
///     let mut events = Box::pin(handle.events());
///     while let Some(event) = events.next().await {
///         match event {
///             TrainerEvent::DataUpdated(data) => {
///                 println!("{:.1} km/h, {} W", data.speed_kmh, data.power_watts);
///             }
///             TrainerEvent::ConnectionStateChanged(ConnectionState::Disconnected) => break,
///             _ => {}
///         }
///     }
///
///     session.await??;
///     Ok(())
/// }
/// ```
pub struct BushidoDevice<L = UsbLink> {
    transport: Transport<L>,
    dispatcher: Dispatcher,
    controller: Option<ResistanceController>,
    config: SessionConfig,
    events: broadcast::Sender<TrainerEvent>,
    telemetry_tx: watch::Sender<TelemetryState>,
    state_tx: watch::Sender<ConnectionState>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl BushidoDevice<UsbLink> {
    /// Open the first attached Bushido ANT stick with default settings
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::DeviceNotFound`] if no stick is attached, or any
    /// USB error raised while opening it.
    pub async fn open() -> Result<Self> {
        Self::open_with_config(SessionConfig::default()).await
    }

    /// Open the ANT stick described by `config.link`
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::DeviceNotFound`] if no matching stick is
    /// attached, or any USB error raised while opening it.
    pub async fn open_with_config(config: SessionConfig) -> Result<Self> {
        let link = UsbLink::open(&config.link).await?;
        Ok(Self::with_link(link, config))
    }
}

impl<L: DeviceLink> BushidoDevice<L> {
    /// Create a session over an already opened link
    pub fn with_link(link: L, config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (telemetry_tx, _) = watch::channel(TelemetryState::new(config.weight_kg));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        Self {
            transport: Transport::new(link, config.retry.clone()),
            dispatcher: Dispatcher::new(config.weight_kg, config.button_debounce),
            controller: None,
            config,
            events,
            telemetry_tx,
            state_tx,
            control_tx,
            control_rx,
        }
    }

    /// Follow `profile` during the session
    #[must_use]
    pub fn with_route(mut self, profile: RouteProfile) -> Self {
        self.set_route(profile);
        self
    }

    /// Replace the followed route; recorded samples and the seek offset are dropped
    pub fn set_route(&mut self, profile: RouteProfile) {
        info!("Loaded route with {} segments", profile.len());
        self.controller = Some(ResistanceController::new(
            profile,
            self.config.max_slope_change,
        ));
    }

    /// The followed route, if any
    #[must_use]
    pub fn route(&self) -> Option<&RouteProfile> {
        self.controller.as_ref().map(ResistanceController::profile)
    }

    /// Samples recorded per route segment
    #[must_use]
    pub fn samples(&self) -> Option<&BTreeMap<usize, TelemetrySample>> {
        self.controller.as_ref().map(ResistanceController::samples)
    }

    /// A handle to control and observe the session from other tasks
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            control: self.control_tx.clone(),
            events: self.events.clone(),
            telemetry: self.telemetry_tx.subscribe(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Current telemetry
    #[must_use]
    pub const fn telemetry(&self) -> &TelemetryState {
        self.dispatcher.telemetry()
    }

    /// Current connection state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.dispatcher.state()
    }

    /// Whether the head unit is paused
    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.dispatcher.is_paused()
    }

    /// Whether a session is active
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.dispatcher.state() != ConnectionState::Disconnected
    }

    /// Run the session until stopped through a [`SessionHandle`] or until the
    /// link fails
    ///
    /// Queues the link bring-up and head unit start commands, then loops:
    /// pending controls are applied, queued commands are sent until the first
    /// broadcast command is acknowledged, and one inbound frame is processed.
    /// The session ends `Disconnected` either way and can be run again.
    ///
    /// # Errors
    ///
    /// Returns link errors, [`BushidoError::Checksum`] for a corrupted inbound
    /// frame, [`BushidoError::LinkTimeout`] when a retry bound is configured
    /// and exhausted, or [`BushidoError::InvalidParameters`] for an invalid
    /// channel configuration.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_session().await;

        self.transport.clear();
        if let Some(event) = self.dispatcher.disconnect() {
            self.emit(event);
        }
        self.publish();

        match &result {
            Ok(()) => info!("Session stopped"),
            Err(e) => error!("Session failed: {}", e),
        }
        result
    }

    async fn run_session(&mut self) -> Result<()> {
        self.transport.clear();
        if let Some(event) = self.dispatcher.begin_link() {
            self.emit(event);
        }
        self.queue_bring_up()?;
        self.prime_controller();
        self.publish();

        loop {
            while let Ok(control) = self.control_rx.try_recv() {
                if self.apply_control(control).is_break() {
                    return Ok(());
                }
            }

            for command in self.transport.send_step().await? {
                if let Some(event) = self.dispatcher.on_acknowledged(&command) {
                    info!("ANT channel open");
                    self.emit(event);
                    self.publish();
                }
            }

            let frame = tokio::select! {
                frame = self.transport.receive_step() => frame?,
                Some(control) = self.control_rx.recv() => {
                    if self.apply_control(control).is_break() {
                        return Ok(());
                    }
                    continue;
                }
            };
            self.dispatch(&frame);

            tokio::task::yield_now().await;
        }
    }

    fn queue_bring_up(&mut self) -> Result<()> {
        let channel = &self.config.channel;
        let mut commands = vec![Command::Reset];
        if let Some(key) = channel.network_key {
            commands.push(Command::SetNetworkKey(key));
        }
        commands.extend([
            Command::AssignChannel {
                channel_type: channel.channel_type,
            },
            Command::SetChannelId {
                device_type: channel.device_type,
            },
            Command::SetChannelPeriod(channel.period),
            Command::rf_frequency(channel.rf_frequency_mhz)?,
            Command::OpenChannel,
            Command::InitPcConnection,
            Command::ResetHeadUnit,
            Command::StartCycling,
        ]);

        info!("Queueing link bring-up ({} commands)", commands.len());
        for command in commands {
            self.transport.enqueue_detached(command);
        }
        Ok(())
    }

    /// Run the controller once at the start line so the first setpoint is known
    fn prime_controller(&mut self) {
        let telemetry = *self.dispatcher.telemetry();
        if let Some(controller) = self.controller.as_mut() {
            // the head unit starts out paused
            let update = controller.on_distance_updated(telemetry.distance_m, &telemetry, true);
            self.apply_update(update);
        }
    }

    fn apply_control(&mut self, control: Control) -> ControlFlow<()> {
        match control {
            Control::Stop => {
                info!("Stop requested");
                return ControlFlow::Break(());
            }
            Control::Seek(delta) => {
                let telemetry = *self.dispatcher.telemetry();
                let paused = self.dispatcher.is_paused();
                match self.controller.as_mut() {
                    Some(controller) => {
                        if let Some(update) =
                            controller.seek(delta, telemetry.distance_m, &telemetry, paused)
                        {
                            self.apply_update(update);
                        }
                    }
                    None => warn!("Ignoring seek of {} m without a route", delta),
                }
            }
            Control::SetSlope(slope) => {
                debug!("Slope set to {:.1}%", slope);
                if let Some(controller) = self.controller.as_mut() {
                    controller.override_slope(slope);
                }
                self.dispatcher.set_slope(slope);
                self.emit(TrainerEvent::SlopeChanged(slope));
            }
            Control::SetWeight(weight) => {
                debug!("Weight set to {} kg", weight);
                self.dispatcher.set_weight(weight);
            }
            Control::Send(command, completion) => {
                self.transport.enqueue_with(command, completion);
            }
        }
        self.publish();
        ControlFlow::Continue(())
    }

    fn apply_update(&mut self, update: ControllerUpdate) {
        if let Some(slope) = update.slope_percent {
            self.dispatcher.set_slope(slope);
            self.emit(TrainerEvent::SlopeChanged(slope));
        }
        if let Some((segment, sample)) = update.sample {
            self.emit(TrainerEvent::SampleRecorded { segment, sample });
        }
    }

    fn dispatch(&mut self, frame: &Frame) {
        let now = tokio::time::Instant::now().into_std();
        let Dispatch { events, responses } = self.dispatcher.handle(frame, now);

        for command in responses {
            self.transport.enqueue_detached(command);
        }

        for event in events {
            match event {
                TrainerEvent::Paused => info!("Head unit paused"),
                TrainerEvent::Resumed => debug!("Head unit running"),
                _ => {}
            }
            self.emit(event);

            if let TrainerEvent::DistanceUpdated(distance) = event {
                let telemetry = *self.dispatcher.telemetry();
                let paused = self.dispatcher.is_paused();
                if let Some(controller) = self.controller.as_mut() {
                    let update = controller.on_distance_updated(distance, &telemetry, paused);
                    self.apply_update(update);
                }
            }
        }

        self.publish();
    }

    fn emit(&self, event: TrainerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn publish(&self) {
        self.telemetry_tx.send_replace(*self.dispatcher.telemetry());
        self.state_tx.send_replace(self.dispatcher.state());
    }
}

/// Cloneable handle to a [`BushidoDevice`] session
///
/// Controls are applied by the session loop between two frames.
#[derive(Clone)]
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Control>,
    events: broadcast::Sender<TrainerEvent>,
    telemetry: watch::Receiver<TelemetryState>,
    state: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    fn send(&self, control: Control) -> Result<()> {
        self.control
            .send(control)
            .map_err(|_| BushidoError::Disconnected)
    }

    fn require_connected(&self) -> Result<()> {
        let state = self.connection_state();
        if state == ConnectionState::Disconnected {
            return Err(BushidoError::InvalidState {
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Ask the session to stop
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::Disconnected`] if the session was dropped.
    pub fn stop(&self) -> Result<()> {
        self.send(Control::Stop)
    }

    /// Move along the route by `delta_m` meters
    ///
    /// A seek that would put the rider before the start of the route is
    /// ignored by the session.
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::InvalidState`] when no session is running, or
    /// [`BushidoError::Disconnected`] if the session was dropped.
    pub fn seek(&self, delta_m: i64) -> Result<()> {
        self.require_connected()?;
        self.send(Control::Seek(delta_m))
    }

    /// Override the slope sent with the next resistance command
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::InvalidParameters`] for a non-finite slope, or
    /// [`BushidoError::Disconnected`] if the session was dropped.
    pub fn set_slope(&self, slope_percent: f64) -> Result<()> {
        if !slope_percent.is_finite() {
            return Err(BushidoError::InvalidParameters(format!(
                "Slope {slope_percent} is not a number"
            )));
        }
        self.send(Control::SetSlope(slope_percent))
    }

    /// Change the rider weight sent with resistance commands
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::InvalidParameters`] for a zero weight, or
    /// [`BushidoError::Disconnected`] if the session was dropped.
    pub fn set_weight(&self, weight_kg: u8) -> Result<()> {
        if weight_kg == 0 {
            return Err(BushidoError::InvalidParameters(
                "Weight must be positive".to_string(),
            ));
        }
        self.send(Control::SetWeight(weight_kg))
    }

    /// Queue a time/slope program start
    ///
    /// The returned receiver resolves once the head unit acknowledged it.
    ///
    /// # Errors
    ///
    /// Returns [`BushidoError::InvalidState`] when no session is running, or
    /// [`BushidoError::Disconnected`] if the session was dropped.
    pub fn start_time_slope(&self) -> Result<oneshot::Receiver<()>> {
        self.require_connected()?;
        let (tx, rx) = oneshot::channel();
        self.send(Control::Send(Command::StartTimeSlope, Some(tx)))?;
        Ok(rx)
    }

    /// Subscribe to session events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TrainerEvent> {
        self.events.subscribe()
    }

    /// Session events as a stream
    ///
    /// Events missed by a slow consumer are skipped with a warning.
    pub fn events(&self) -> impl Stream<Item = TrainerEvent> + Send + 'static {
        futures::stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Event consumer lagging, skipped {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Latest telemetry snapshot
    #[must_use]
    pub fn telemetry(&self) -> TelemetryState {
        *self.telemetry.borrow()
    }

    /// Latest connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether the head unit is paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.connection_state() == ConnectionState::Paused
    }

    /// Whether a session is active
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() != ConnectionState::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::mock::{MockLink, MockRemote},
        types::RetryConfig,
    };
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::{task::JoinHandle, time::timeout};

    type Session = JoinHandle<(Result<()>, BushidoDevice<MockLink>)>;

    async fn next_event(
        events: &mut broadcast::Receiver<TrainerEvent>,
        predicate: impl Fn(&TrainerEvent) -> bool,
    ) -> TrainerEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn brake_frame(remote: &MockRemote, celsius: u8) {
        remote.push_broadcast(&[0xDD, 0x03, 0x00, 0x00, celsius, 0x00, 0x00]);
    }

    async fn wait_for_brake(events: &mut broadcast::Receiver<TrainerEvent>, celsius: u8) {
        next_event(events, |e| {
            matches!(e, TrainerEvent::DataUpdated(data) if data.brake_temp_c == celsius)
        })
        .await;
    }

    fn spawn(mut device: BushidoDevice<MockLink>) -> Session {
        tokio::spawn(async move {
            let result = device.run().await;
            (result, device)
        })
    }

    /// Start a session and feed frames until the start sequence is sent
    async fn start(
        route: Option<RouteProfile>,
    ) -> (
        SessionHandle,
        MockRemote,
        broadcast::Receiver<TrainerEvent>,
        Session,
    ) {
        let (link, remote) = MockLink::new(true);
        let mut device = BushidoDevice::with_link(link, SessionConfig::default());
        if let Some(route) = route {
            device.set_route(route);
        }
        let handle = device.handle();
        let mut events = handle.subscribe();
        let session = spawn(device);

        for celsius in 1..=3 {
            brake_frame(&remote, celsius);
        }
        wait_for_brake(&mut events, 3).await;
        assert_eq!(remote.sent().len(), 9);

        (handle, remote, events, session)
    }

    async fn stop(handle: &SessionHandle, session: Session) -> BushidoDevice<MockLink> {
        handle.stop().unwrap();
        let (result, device) = session.await.unwrap();
        tokio_test::assert_ok!(result);
        device
    }

    #[tokio::test]
    async fn test_bring_up_sequence() {
        let (link, remote) = MockLink::new(true);
        let device = BushidoDevice::with_link(link, SessionConfig::default());
        let handle = device.handle();
        let mut events = handle.subscribe();
        let session = spawn(device);

        next_event(&mut events, |e| {
            *e == TrainerEvent::ConnectionStateChanged(ConnectionState::LinkOpen)
        })
        .await;
        assert_eq!(handle.connection_state(), ConnectionState::LinkOpen);
        assert!(handle.is_connected());
        assert!(!handle.is_paused());

        let expected: Vec<Frame> = [
            Command::Reset,
            Command::AssignChannel { channel_type: 0x00 },
            Command::SetChannelId { device_type: 0x52 },
            Command::SetChannelPeriod(4096),
            Command::SetChannelRfFrequency { offset_mhz: 60 },
            Command::OpenChannel,
            Command::InitPcConnection,
        ]
        .iter()
        .map(Command::to_frame)
        .collect();
        assert_eq!(remote.sent(), expected);

        for celsius in 1..=3 {
            brake_frame(&remote, celsius);
        }
        wait_for_brake(&mut events, 3).await;

        let sent = remote.sent();
        assert_eq!(sent.len(), 9);
        assert_eq!(sent[7], Command::ResetHeadUnit.to_frame());
        assert_eq!(sent[8], Command::StartCycling.to_frame());

        let device = stop(&handle, session).await;
        assert!(!device.is_connected());
        assert_eq!(device.telemetry().brake_temp_c, 3);
    }

    #[tokio::test]
    async fn test_session_start_primes_route() {
        let (link, _remote) = MockLink::new(true);
        let mut device = BushidoDevice::with_link(link, SessionConfig::default());
        device.set_route(RouteProfile::from_slopes(&[0.5, 3.0, 3.0], 0.0));
        let handle = device.handle();
        let mut events = handle.subscribe();
        let session = spawn(device);

        let event = next_event(&mut events, |e| matches!(e, TrainerEvent::SlopeChanged(_))).await;
        assert_eq!(event, TrainerEvent::SlopeChanged(0.5));

        next_event(&mut events, |e| {
            *e == TrainerEvent::ConnectionStateChanged(ConnectionState::LinkOpen)
        })
        .await;
        assert!(!handle.is_paused());
        assert!((handle.telemetry().slope_percent - 0.5).abs() < 1e-9);

        let device = stop(&handle, session).await;
        assert!(device.samples().unwrap().is_empty());
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(
                event,
                TrainerEvent::Paused | TrainerEvent::SampleRecorded { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_network_key_sent_when_configured() {
        let key = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];
        let mut config = SessionConfig::default();
        config.channel.network_key = Some(key);

        let (link, remote) = MockLink::new(true);
        let device = BushidoDevice::with_link(link, config);
        let handle = device.handle();
        let mut events = handle.subscribe();
        let session = spawn(device);

        next_event(&mut events, |e| {
            *e == TrainerEvent::ConnectionStateChanged(ConnectionState::LinkOpen)
        })
        .await;
        assert_eq!(
            remote.sent_types(),
            vec![0xA4, 0x46, 0x42, 0x51, 0x43, 0x45, 0x4B, 0x4E]
        );
        assert_eq!(remote.sent()[1], Command::SetNetworkKey(key).to_frame());

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_pause_sends_continue() {
        let (handle, remote, mut events, session) = start(None).await;

        remote.push_broadcast(&[0xAD, 0x01, 0x03]);
        next_event(&mut events, |e| *e == TrainerEvent::Paused).await;
        assert!(handle.is_paused());

        brake_frame(&remote, 4);
        wait_for_brake(&mut events, 4).await;
        assert_eq!(remote.sent()[9], Command::Continue.to_frame());

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_resume_sends_resistance_and_keep_alive() {
        let (handle, remote, mut events, session) = start(None).await;

        handle.set_slope(-5.5).unwrap();
        next_event(&mut events, |e| matches!(e, TrainerEvent::SlopeChanged(_))).await;

        remote.push_broadcast(&[0xAD, 0x01, 0x02]);
        next_event(&mut events, |e| *e == TrainerEvent::Resumed).await;
        assert_eq!(handle.connection_state(), ConnectionState::Running);

        brake_frame(&remote, 4);
        brake_frame(&remote, 5);
        wait_for_brake(&mut events, 5).await;

        let sent = remote.sent();
        assert_eq!(
            sent[9].payload(),
            &[0x00, 0xDC, 0x01, 0x00, 0xFF, 0xCE, 0x46, 0x00, 0x00]
        );
        assert_eq!(sent[10], Command::Data02.to_frame());

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_weight_used_in_resistance_command() {
        let (handle, remote, mut events, session) = start(None).await;

        handle.set_weight(82).unwrap();
        handle.set_slope(2.0).unwrap();
        next_event(&mut events, |e| matches!(e, TrainerEvent::SlopeChanged(_))).await;
        assert_eq!(handle.telemetry().weight_kg, 82);

        remote.push_broadcast(&[0xAD, 0x01, 0x02]);
        brake_frame(&remote, 4);
        wait_for_brake(&mut events, 4).await;

        assert_eq!(
            remote.sent()[9],
            Command::Data01 {
                slope_percent: 2.0,
                weight_kg: 82
            }
            .to_frame()
        );

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_distance_drives_slope() {
        let route = RouteProfile::from_slopes(&[0.0, 0.5, 3.0, 3.0, 3.0], 0.0);
        let (handle, remote, mut events, session) = start(Some(route)).await;

        remote.push_broadcast(&[0xDD, 0x02, 0x00, 0x00, 0x00, 0x14, 0x7A]);
        let event = next_event(&mut events, |e| matches!(e, TrainerEvent::SlopeChanged(_))).await;
        assert_eq!(event, TrainerEvent::SlopeChanged(0.5));

        remote.push_broadcast(&[0xDD, 0x02, 0x00, 0x00, 0x00, 0x28, 0x7C]);
        let event = next_event(&mut events, |e| matches!(e, TrainerEvent::SlopeChanged(_))).await;
        assert_eq!(event, TrainerEvent::SlopeChanged(1.5));

        let event = next_event(&mut events, |e| {
            matches!(e, TrainerEvent::SampleRecorded { .. })
        })
        .await;
        let TrainerEvent::SampleRecorded { segment, sample } = event else {
            unreachable!()
        };
        assert_eq!(segment, 2);
        assert_eq!(sample.effective_distance_m, 40);
        assert_eq!(sample.telemetry.heart_rate_bpm, 124);

        let telemetry = handle.telemetry();
        assert_eq!(telemetry.distance_m, 40);
        assert!((telemetry.slope_percent - 1.5).abs() < 1e-9);

        let device = stop(&handle, session).await;
        let samples = device.samples().unwrap();
        assert_eq!(samples.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_seek_moves_along_route() {
        let slopes: Vec<f64> = (0..100).map(|i| if i < 50 { 0.0 } else { 0.8 }).collect();
        let route = RouteProfile::from_slopes(&slopes, 0.0);
        let (handle, remote, mut events, session) = start(Some(route)).await;

        handle.seek(1000).unwrap();
        let event = next_event(&mut events, |e| matches!(e, TrainerEvent::SlopeChanged(_))).await;
        assert_eq!(event, TrainerEvent::SlopeChanged(0.8));

        // would move before the start line
        handle.seek(-2000).unwrap();

        remote.push_broadcast(&[0xDD, 0x02, 0x00, 0x00, 0x00, 0x14, 0x64]);
        let event = next_event(&mut events, |e| {
            matches!(e, TrainerEvent::SampleRecorded { segment, .. } if *segment > 50)
        })
        .await;
        let TrainerEvent::SampleRecorded { segment, sample } = event else {
            unreachable!()
        };
        assert_eq!(segment, 51);
        assert_eq!(sample.effective_distance_m, 1020);

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_out_of_range_seek_keeps_session_running() {
        let route = RouteProfile::from_slopes(&[0.5; 10], 0.0);
        let (handle, remote, mut events, session) = start(Some(route)).await;

        handle.seek(i64::MAX).unwrap();
        // overflows the route distance and is ignored
        handle.seek(1).unwrap();
        brake_frame(&remote, 4);
        wait_for_brake(&mut events, 4).await;

        handle.seek(-i64::MAX).unwrap();
        let event = next_event(&mut events, |e| matches!(e, TrainerEvent::SlopeChanged(_))).await;
        assert_eq!(event, TrainerEvent::SlopeChanged(0.5));

        remote.push_broadcast(&[0xDD, 0x02, 0x00, 0x00, 0x00, 0x14, 0x64]);
        let event = next_event(&mut events, |e| matches!(e, TrainerEvent::SampleRecorded { .. })).await;
        let TrainerEvent::SampleRecorded { segment, sample } = event else {
            unreachable!()
        };
        assert_eq!(segment, 1);
        assert_eq!(sample.effective_distance_m, 20);

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_start_time_slope_resolves_on_ack() {
        let (handle, remote, mut events, session) = start(None).await;

        let ack = handle.start_time_slope().unwrap();
        brake_frame(&remote, 4);
        wait_for_brake(&mut events, 4).await;
        brake_frame(&remote, 5);

        tokio_test::assert_ok!(timeout(Duration::from_secs(5), ack).await.unwrap());
        assert!(remote.sent().contains(&Command::StartTimeSlope.to_frame()));

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_stop_disconnects() {
        let (handle, _remote, mut events, session) = start(None).await;

        handle.stop().unwrap();
        next_event(&mut events, |e| {
            *e == TrainerEvent::ConnectionStateChanged(ConnectionState::Disconnected)
        })
        .await;

        let (result, device) = session.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(!handle.is_connected());
        assert!(matches!(
            handle.seek(100),
            Err(BushidoError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_events_stream() {
        let (handle, remote, _events, session) = start(None).await;
        let mut stream = Box::pin(handle.events());

        remote.push_broadcast(&[0xDD, 0x10, 0x04]);
        let event = timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert_eq!(event, Some(TrainerEvent::Button(crate::types::Button::Up)));

        stop(&handle, session).await;
    }

    #[tokio::test]
    async fn test_checksum_error_ends_session() {
        let (link, remote) = MockLink::new(true);
        let device = BushidoDevice::with_link(link, SessionConfig::default());
        let handle = device.handle();
        let session = spawn(device);

        let mut corrupted = Command::Continue.encode().to_vec();
        corrupted[4] ^= 0x01;
        remote.push_bytes(&corrupted);

        let (result, device) = session.await.unwrap();
        assert!(matches!(result, Err(BushidoError::Checksum { .. })));
        assert!(!device.is_connected());
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_bring_up_times_out() {
        let config = SessionConfig {
            retry: RetryConfig {
                ack_retry_interval: Duration::from_secs(1),
                max_ack_attempts: Some(2),
            },
            ..SessionConfig::default()
        };
        let (link, remote) = MockLink::new(false);
        let mut device = BushidoDevice::with_link(link, config);

        let err = device.run().await.unwrap_err();
        assert!(matches!(
            err,
            BushidoError::LinkTimeout {
                command: 0xA4,
                attempts: 2
            }
        ));
        assert_eq!(remote.sent_types(), vec![0xA4, 0xA4]);
        assert_eq!(device.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_invalid_rf_frequency_rejected() {
        let mut config = SessionConfig::default();
        config.channel.rf_frequency_mhz = 2300;
        let (link, remote) = MockLink::new(true);
        let mut device = BushidoDevice::with_link(link, config);

        let err = device.run().await.unwrap_err();
        assert!(matches!(err, BushidoError::InvalidParameters(_)));
        assert!(remote.sent().is_empty());
    }
}
