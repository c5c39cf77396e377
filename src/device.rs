use crate::{
    ble::{DeskScanner, DeskSession},
    error::{DeskError, IoError, Result},
    protocol::{decode_height_notification, encode_command, Command, NotificationProfile},
    types::{ConnectionParams, DeskState, DiscoveredDesk, MoveDirection},
    DESK_CONTROL_CHAR_UUID, DESK_HEIGHT_CHAR_UUID,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Callback invoked with a state snapshot after each decoded height notification
pub type HeightObserver = Box<dyn Fn(DeskState) + Send + Sync + 'static>;

/// Handle returned by [`UpliftDesk::register_callback`], usable for later
/// unregistration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(u64);

/// Main interface for controlling an Uplift standing desk
///
/// `UpliftDesk` wraps a [`DeskSession`] into a typed, stateful desk object:
/// it issues movement commands, decodes the height notifications the control
/// box pushes while the desk moves, keeps the last known [`DeskState`], and
/// fans state updates out to registered observers.
///
/// Commands never touch the cached state directly. Pressing raise makes the
/// hardware move, which is then observed through notifications; the state a
/// caller reads always came off the wire.
///
/// # Examples
///
/// ```no_run
/// use uplifters::UpliftDesk;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let desk = UpliftDesk::connect_first().await?;
///
///     desk.register_callback(|state| {
///         println!("height update: {state}");
///     })
///     .await;
///
///     desk.move_to_standing().await?;
///     Ok(())
/// }
/// ```
pub struct UpliftDesk {
    session: DeskSession,
    info: DiscoveredDesk,
    profile: NotificationProfile,
    state: Arc<RwLock<DeskState>>,
    observers: Arc<Mutex<Vec<(u64, HeightObserver)>>>,
    next_observer_id: Arc<AtomicU64>,
    in_flight: Arc<Mutex<Option<MoveDirection>>>,
}

impl UpliftDesk {
    /// Scan for desks and connect to the first one seen, with default settings
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::NoDeskFound`] if the scan finds nothing, or any
    /// scan/connect/read error from the underlying connection process.
    pub async fn connect_first() -> Result<Self> {
        Self::connect_first_with_params(ConnectionParams::default()).await
    }

    /// Scan for desks and connect to the first one seen
    ///
    /// Desks are ordered by first-seen time during the scan, so "first" is
    /// the one that advertised earliest.
    ///
    /// # Errors
    ///
    /// Returns [`DeskError::NoDeskFound`] if the scan finds nothing, or any
    /// scan/connect/read error from the underlying connection process.
    pub async fn connect_first_with_params(params: ConnectionParams) -> Result<Self> {
        let scanner = DeskScanner::new().await?;
        let desks = scanner
            .discover(Duration::from_millis(params.scan_timeout_ms))
            .await?;

        let Some(info) = desks.into_iter().next() else {
            return Err(DeskError::NoDeskFound);
        };

        let session = scanner.connect(info.address, &params).await?;
        Self::with_session(session, info, NotificationProfile::default()).await
    }

    /// Build a desk controller on an already-open session
    ///
    /// Subscribes to height notifications and performs the initial explicit
    /// height read so accessors have a state to return before the first
    /// notification arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription or the initial read fails, or if
    /// the initial height payload does not decode against `profile`.
    pub async fn with_session(
        session: DeskSession,
        info: DiscoveredDesk,
        profile: NotificationProfile,
    ) -> Result<Self> {
        let desk = Self {
            session,
            info,
            profile,
            state: Arc::new(RwLock::new(DeskState::default())),
            observers: Arc::new(Mutex::new(Vec::new())),
            next_observer_id: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(Mutex::new(None)),
        };

        desk.start_notification_task().await?;
        desk.refresh_state().await?;

        Ok(desk)
    }

    /// The discovery record this controller was built from
    #[must_use]
    pub const fn info(&self) -> &DiscoveredDesk {
        &self.info
    }

    /// The notification frame profile this controller decodes with
    #[must_use]
    pub const fn profile(&self) -> &NotificationProfile {
        &self.profile
    }

    /// Whether the underlying session still holds a live link
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Last known desk state; never blocks on the radio and may be stale
    pub async fn state(&self) -> DeskState {
        *self.state.read().await
    }

    /// Last known height in inches
    pub async fn height(&self) -> f64 {
        self.state.read().await.height
    }

    /// Last reported motion flag
    pub async fn moving(&self) -> bool {
        self.state.read().await.moving
    }

    /// Direction of the hold-to-move command currently in flight, if any
    pub async fn command_in_flight(&self) -> Option<MoveDirection> {
        *self.in_flight.lock().await
    }

    /// Start raising the desk (hold-to-move start edge)
    ///
    /// The desk keeps moving until [`release`](Self::release) sends the
    /// matching stop command or the controller board times the movement out.
    ///
    /// # Errors
    ///
    /// Returns [`IoError`] if the command write fails.
    pub async fn press_raise(&self) -> Result<(), IoError> {
        info!("press_raise");
        self.awaken().await?;
        self.send_command(Command::RaiseStart).await?;
        *self.in_flight.lock().await = Some(MoveDirection::Raise);
        Ok(())
    }

    /// Start lowering the desk (hold-to-move start edge)
    ///
    /// # Errors
    ///
    /// Returns [`IoError`] if the command write fails.
    pub async fn press_lower(&self) -> Result<(), IoError> {
        info!("press_lower");
        self.awaken().await?;
        self.send_command(Command::LowerStart).await?;
        *self.in_flight.lock().await = Some(MoveDirection::Lower);
        Ok(())
    }

    /// Stop the hold-to-move command currently in flight
    ///
    /// No-op when nothing is in flight. Actual motion stop is confirmed by a
    /// notification with `moving == false`, not by this call returning.
    ///
    /// # Errors
    ///
    /// Returns [`IoError`] if the stop write fails; the in-flight record is
    /// kept so the call can be retried.
    pub async fn release(&self) -> Result<(), IoError> {
        let Some(direction) = self.in_flight.lock().await.take() else {
            return Ok(());
        };

        info!("release {}", direction);
        let stop = match direction {
            MoveDirection::Raise => Command::RaiseStop,
            MoveDirection::Lower => Command::LowerStop,
        };

        if let Err(e) = self.send_command(stop).await {
            *self.in_flight.lock().await = Some(direction);
            return Err(e);
        }
        Ok(())
    }

    /// Drive the desk to its stored standing preset
    ///
    /// The command is written once; the desk stops autonomously at the preset
    /// and reports progress via notifications. Returns as soon as the write
    /// succeeds, never waits for motion to complete.
    ///
    /// # Errors
    ///
    /// Returns [`IoError`] if the command write fails.
    pub async fn move_to_standing(&self) -> Result<(), IoError> {
        info!("move_to_standing");
        self.awaken().await?;
        self.send_command(Command::GotoStanding).await
    }

    /// Drive the desk to its stored sitting preset
    ///
    /// # Errors
    ///
    /// Returns [`IoError`] if the command write fails.
    pub async fn move_to_sitting(&self) -> Result<(), IoError> {
        info!("move_to_sitting");
        self.awaken().await?;
        self.send_command(Command::GotoSitting).await
    }

    /// Explicitly read the current height from the desk
    ///
    /// Writes a status request, point-reads the height characteristic, and
    /// decodes it through the frame profile. On success the cached state is
    /// replaced; observers are not invoked for explicit reads. On a decode
    /// failure the previous state is retained.
    ///
    /// # Errors
    ///
    /// Returns an [`IoError`] if the write or read fails, or a
    /// [`crate::CodecError`] if the payload does not decode.
    pub async fn refresh_state(&self) -> Result<DeskState> {
        self.send_command(Command::StatusRequest).await?;
        let payload = self.session.read_characteristic(DESK_HEIGHT_CHAR_UUID).await?;
        let state = decode_height_notification(&self.profile, &payload)?;

        *self.state.write().await = state;
        Ok(state)
    }

    /// Register an observer for decoded height notifications
    ///
    /// Observers are invoked in registration order with a snapshot of the new
    /// state, once per successfully decoded notification. They run on the
    /// notification-delivery task, so slow work must be handed off (e.g. to a
    /// channel) rather than done inline. There is no upper bound on the
    /// observer list; long-running processes should unregister observers they
    /// no longer need.
    pub async fn register_callback<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(DeskState) + Send + Sync + 'static,
    {
        let id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().await.push((id, Box::new(observer)));
        ObserverHandle(id)
    }

    /// Remove a previously registered observer
    ///
    /// Unknown handles are ignored.
    pub async fn unregister_callback(&self, handle: ObserverHandle) {
        self.observers.lock().await.retain(|(id, _)| *id != handle.0);
    }

    /// Disconnect from the desk
    ///
    /// Idempotent; delegates to the session.
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    /// The control box ignores movement commands once its inactivity timeout
    /// has expired, so every command is preceded by a wake frame.
    async fn awaken(&self) -> Result<(), IoError> {
        self.send_command(Command::Wake).await
    }

    async fn send_command(&self, cmd: Command) -> Result<(), IoError> {
        self.session
            .write_characteristic(DESK_CONTROL_CHAR_UUID, &encode_command(cmd))
            .await
    }

    async fn start_notification_task(&self) -> Result<(), IoError> {
        let subscription = self.session.subscribe(DESK_HEIGHT_CHAR_UUID).await?;

        let profile = self.profile.clone();
        let state = self.state.clone();
        let observers = self.observers.clone();
        let mut receiver = subscription.receiver;

        tokio::spawn(async move {
            while let Some(payload) = receiver.recv().await {
                match decode_height_notification(&profile, &payload) {
                    Ok(new_state) => {
                        *state.write().await = new_state;

                        let observers = observers.lock().await;
                        for (id, observer) in observers.iter() {
                            if catch_unwind(AssertUnwindSafe(|| observer(new_state))).is_err() {
                                warn!("height observer {} panicked; continuing delivery", id);
                            }
                        }
                    }
                    Err(e) => {
                        // State stays as-is and no observer runs.
                        error!("ignoring undecodable height notification: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ble::DeskTransport,
        protocol::{decode_command, encode_height_notification},
    };
    use async_trait::async_trait;
    use btleplug::api::BDAddr;
    use std::{sync::Mutex as StdMutex, time::SystemTime};
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uuid::Uuid;

    #[derive(Clone)]
    struct MockTransport {
        writes: Arc<StdMutex<Vec<Vec<u8>>>>,
        read_frame: Vec<u8>,
    }

    #[async_trait]
    impl DeskTransport for MockTransport {
        async fn write(&mut self, _characteristic: Uuid, payload: &[u8]) -> Result<(), IoError> {
            self.writes.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn read(&mut self, _characteristic: Uuid) -> Result<Vec<u8>, IoError> {
            Ok(self.read_frame.clone())
        }

        async fn subscribe(&mut self, _characteristic: Uuid) -> Result<(), IoError> {
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), IoError> {
            Ok(())
        }
    }

    type NoteSender = mpsc::UnboundedSender<(Uuid, Vec<u8>)>;

    async fn desk_with_mock(
        initial_height: f64,
    ) -> (UpliftDesk, Arc<StdMutex<Vec<Vec<u8>>>>, NoteSender) {
        let profile = NotificationProfile::default();
        let writes = Arc::new(StdMutex::new(Vec::new()));
        let transport = MockTransport {
            writes: writes.clone(),
            read_frame: encode_height_notification(&profile, initial_height, false).unwrap(),
        };

        let (note_tx, note_rx) = mpsc::unbounded_channel();
        let session = DeskSession::spawn(transport, note_rx, 1_000);
        let info = DiscoveredDesk {
            address: BDAddr::from([0u8; 6]),
            name: "Test Desk".to_string(),
            first_seen: SystemTime::now(),
        };

        let desk = UpliftDesk::with_session(session, info, profile).await.unwrap();
        // Drop the command writes issued by the initial refresh.
        writes.lock().unwrap().clear();
        (desk, writes, note_tx)
    }

    async fn wait_until(f: impl Fn() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !f() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_initial_state_from_explicit_read() {
        let (desk, _writes, _note_tx) = desk_with_mock(30.0).await;

        assert!((desk.height().await - 30.0).abs() < 1e-9);
        assert!(!desk.moving().await);
        assert!(desk.command_in_flight().await.is_none());
    }

    #[tokio::test]
    async fn test_notification_updates_state_and_invokes_observer_once() {
        let (desk, _writes, note_tx) = desk_with_mock(30.0).await;

        let seen: Arc<StdMutex<Vec<DeskState>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        desk.register_callback(move |state| sink.lock().unwrap().push(state))
            .await;

        let frame = encode_height_notification(desk.profile(), 34.5, true).unwrap();
        note_tx.send((DESK_HEIGHT_CHAR_UUID, frame)).unwrap();

        wait_until(|| !seen.lock().unwrap().is_empty()).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!((seen[0].height - 34.5).abs() < 1e-9);
        assert!(seen[0].moving);
        drop(seen);

        assert!((desk.height().await - 34.5).abs() < 1e-9);
        assert!(desk.moving().await);
    }

    #[tokio::test]
    async fn test_observers_run_in_registration_order() {
        let (desk, _writes, note_tx) = desk_with_mock(30.0).await;

        let order: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));
        let first = order.clone();
        desk.register_callback(move |_| first.lock().unwrap().push("first"))
            .await;
        let second = order.clone();
        desk.register_callback(move |_| second.lock().unwrap().push("second"))
            .await;

        let frame = encode_height_notification(desk.profile(), 40.0, true).unwrap();
        note_tx.send((DESK_HEIGHT_CHAR_UUID, frame)).unwrap();

        wait_until(|| order.lock().unwrap().len() == 2).await;
        assert_eq!(order.lock().unwrap().as_slice(), &["first", "second"]);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_block_delivery() {
        let (desk, _writes, note_tx) = desk_with_mock(30.0).await;

        desk.register_callback(|_| panic!("observer bug")).await;
        let seen: Arc<StdMutex<Vec<DeskState>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        desk.register_callback(move |state| sink.lock().unwrap().push(state))
            .await;

        let frame = encode_height_notification(desk.profile(), 42.0, false).unwrap();
        note_tx.send((DESK_HEIGHT_CHAR_UUID, frame)).unwrap();

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        assert!((seen.lock().unwrap()[0].height - 42.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unregistered_observer_is_not_invoked() {
        let (desk, _writes, note_tx) = desk_with_mock(30.0).await;

        let gone: Arc<StdMutex<Vec<DeskState>>> = Arc::new(StdMutex::new(Vec::new()));
        let gone_sink = gone.clone();
        let handle = desk
            .register_callback(move |state| gone_sink.lock().unwrap().push(state))
            .await;
        desk.unregister_callback(handle).await;

        let kept: Arc<StdMutex<Vec<DeskState>>> = Arc::new(StdMutex::new(Vec::new()));
        let kept_sink = kept.clone();
        desk.register_callback(move |state| kept_sink.lock().unwrap().push(state))
            .await;

        let frame = encode_height_notification(desk.profile(), 33.0, false).unwrap();
        note_tx.send((DESK_HEIGHT_CHAR_UUID, frame)).unwrap();

        wait_until(|| !kept.lock().unwrap().is_empty()).await;
        assert!(gone.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_notification_keeps_state_and_skips_observers() {
        let (desk, _writes, note_tx) = desk_with_mock(30.0).await;

        let seen: Arc<StdMutex<Vec<DeskState>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        desk.register_callback(move |state| sink.lock().unwrap().push(state))
            .await;

        // Truncated frame, then one with a height above max travel.
        note_tx
            .send((DESK_HEIGHT_CHAR_UUID, vec![0xF2, 0xF2, 0x00]))
            .unwrap();
        let too_high = encode_height_notification(desk.profile(), 72.0, true).unwrap();
        note_tx.send((DESK_HEIGHT_CHAR_UUID, too_high)).unwrap();

        // A valid frame afterwards proves both bad ones were processed first
        // (per-characteristic ordering) without touching state.
        let valid = encode_height_notification(desk.profile(), 35.0, false).unwrap();
        note_tx.send((DESK_HEIGHT_CHAR_UUID, valid)).unwrap();

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!((desk.height().await - 35.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_press_raise_and_release_write_matching_frames() {
        let (desk, writes, _note_tx) = desk_with_mock(30.0).await;

        desk.press_raise().await.unwrap();
        assert_eq!(desk.command_in_flight().await, Some(MoveDirection::Raise));

        desk.release().await.unwrap();
        assert!(desk.command_in_flight().await.is_none());

        let frames = writes.lock().unwrap().clone();
        let commands: Vec<Command> = frames
            .iter()
            .map(|f| decode_command(f).unwrap())
            .collect();
        assert_eq!(
            commands,
            vec![Command::Wake, Command::RaiseStart, Command::RaiseStop]
        );

        // Releasing while idle writes nothing.
        desk.release().await.unwrap();
        assert_eq!(writes.lock().unwrap().len(), frames.len());
    }

    #[tokio::test]
    async fn test_press_lower_release_writes_lower_stop() {
        let (desk, writes, _note_tx) = desk_with_mock(30.0).await;

        desk.press_lower().await.unwrap();
        desk.release().await.unwrap();

        let frames = writes.lock().unwrap().clone();
        let commands: Vec<Command> = frames
            .iter()
            .map(|f| decode_command(f).unwrap())
            .collect();
        assert_eq!(
            commands,
            vec![Command::Wake, Command::LowerStart, Command::LowerStop]
        );
    }

    #[tokio::test]
    async fn test_presets_write_once_and_do_not_mutate_state() {
        let (desk, writes, _note_tx) = desk_with_mock(30.0).await;
        let before = desk.state().await;

        desk.move_to_standing().await.unwrap();
        desk.move_to_sitting().await.unwrap();

        let frames = writes.lock().unwrap().clone();
        let commands: Vec<Command> = frames
            .iter()
            .map(|f| decode_command(f).unwrap())
            .collect();
        assert_eq!(
            commands,
            vec![
                Command::Wake,
                Command::GotoStanding,
                Command::Wake,
                Command::GotoSitting
            ]
        );

        // Command writes never touch the cached state.
        assert_eq!(desk.state().await, before);
    }

    #[tokio::test]
    async fn test_refresh_state_does_not_invoke_observers() {
        let (desk, writes, _note_tx) = desk_with_mock(30.0).await;

        let seen: Arc<StdMutex<Vec<DeskState>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        desk.register_callback(move |state| sink.lock().unwrap().push(state))
            .await;

        let state = desk.refresh_state().await.unwrap();
        assert!((state.height - 30.0).abs() < 1e-9);
        assert!(seen.lock().unwrap().is_empty());

        let frames = writes.lock().unwrap().clone();
        assert_eq!(decode_command(&frames[0]).unwrap(), Command::StatusRequest);
    }

    #[tokio::test]
    async fn test_commands_after_disconnect_fail() {
        let (desk, _writes, _note_tx) = desk_with_mock(30.0).await;

        desk.disconnect().await;
        assert!(!desk.is_connected());

        assert!(matches!(
            desk.press_raise().await,
            Err(IoError::Disconnected)
        ));
        assert!(matches!(
            desk.move_to_standing().await,
            Err(IoError::Disconnected)
        ));
    }
}
