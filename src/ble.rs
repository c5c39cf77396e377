use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral},
};
use futures::{stream::StreamExt, Stream};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{mpsc, oneshot, Mutex},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{ConnectError, IoError, ScanError},
    types::{ConnectionParams, DiscoveredDesk},
    DESK_CONTROL_CHAR_UUID, DESK_HEIGHT_CHAR_UUID, DESK_SERVICE_UUID,
};

/// Narrow radio capability set the session depends on
///
/// The session core only needs write/read/subscribe against characteristics
/// plus a disconnect, so that is all this trait carries. Notifications arrive
/// out-of-band through the ordered channel handed to [`DeskSession::spawn`];
/// the transport must close that channel when the link drops.
#[async_trait]
pub trait DeskTransport: Send + 'static {
    /// Write a payload to a characteristic
    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), IoError>;

    /// Point-read a characteristic value
    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, IoError>;

    /// Enable notifications for a characteristic
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), IoError>;

    /// Tear the link down
    async fn disconnect(&mut self) -> Result<(), IoError>;
}

fn map_io_err(e: btleplug::Error) -> IoError {
    match e {
        btleplug::Error::NotConnected => IoError::Disconnected,
        btleplug::Error::TimedOut(d) => IoError::Timeout {
            timeout_ms: u64::try_from(d.as_millis()).unwrap_or(u64::MAX),
        },
        other => IoError::Rejected(other.to_string()),
    }
}

/// [`DeskTransport`] backed by a btleplug peripheral
struct BleTransport {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
}

impl BleTransport {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, IoError> {
        self.characteristics
            .get(&uuid)
            .cloned()
            .ok_or_else(|| IoError::Rejected(format!("unknown characteristic {uuid}")))
    }
}

#[async_trait]
impl DeskTransport for BleTransport {
    async fn write(&mut self, characteristic: Uuid, payload: &[u8]) -> Result<(), IoError> {
        let c = self.characteristic(characteristic)?;
        let write_type = if c.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        debug!("writing {:02X?} to {}", payload, characteristic);
        self.peripheral
            .write(&c, payload, write_type)
            .await
            .map_err(map_io_err)
    }

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>, IoError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.read(&c).await.map_err(map_io_err)
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<(), IoError> {
        let c = self.characteristic(characteristic)?;
        self.peripheral.subscribe(&c).await.map_err(map_io_err)
    }

    async fn disconnect(&mut self) -> Result<(), IoError> {
        self.peripheral.disconnect().await.map_err(map_io_err)
    }
}

/// Scanner that discovers desk controllers and opens sessions to them
///
/// Owns the Bluetooth adapter and remembers every peripheral it has seen so a
/// later [`connect`](Self::connect) can reach it by address. The peripheral
/// map grows with each [`discover`](Self::discover) call and is never pruned,
/// so a long-lived scanner holds one entry per distinct desk ever seen.
pub struct DeskScanner {
    adapter: Adapter,
    peripherals: Arc<Mutex<HashMap<BDAddr, Peripheral>>>,
}

impl DeskScanner {
    /// Create a scanner on the first available Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::AdapterUnavailable`] if the host has no usable
    /// adapter, or [`ScanError::Radio`] if the stack cannot be initialized.
    pub async fn new() -> Result<Self, ScanError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(ScanError::AdapterUnavailable)?;

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Scan for desks advertising the desk service UUID
    ///
    /// Runs a filtered scan for at most `scan_timeout` and returns every
    /// distinct desk seen, ordered by first-seen time. An empty scan is not an
    /// error; a zero timeout returns immediately with an empty list.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::Radio`] if the stack fails to start or stop the
    /// scan.
    pub async fn discover(&self, scan_timeout: Duration) -> Result<Vec<DiscoveredDesk>, ScanError> {
        info!("scanning for desks ({}ms)...", scan_timeout.as_millis());

        let events = self.adapter.events().await?;
        self.adapter
            .start_scan(ScanFilter {
                services: vec![DESK_SERVICE_UUID],
            })
            .await?;

        let adapter = &self.adapter;
        let peripherals = &self.peripherals;
        let resolved = events.filter_map(move |event| async move {
            let CentralEvent::DeviceDiscovered(id) = event else {
                return None;
            };
            let peripheral = adapter.peripheral(&id).await.ok()?;
            let address = peripheral.address();

            let properties = peripheral.properties().await.ok().flatten();
            if let Some(props) = &properties {
                // The scan filter is advisory on some platforms.
                if !props.services.is_empty() && !props.services.contains(&DESK_SERVICE_UUID) {
                    return None;
                }
            }

            let name = properties
                .and_then(|p| p.local_name)
                .unwrap_or_else(|| "Unknown desk".to_string());

            peripherals.lock().await.insert(address, peripheral);
            Some(DiscoveredDesk {
                address,
                name,
                first_seen: SystemTime::now(),
            })
        });
        tokio::pin!(resolved);

        let desks = drain_discovery_stream(resolved, scan_timeout).await;

        self.adapter.stop_scan().await?;
        info!("scan complete; found {} desk(s)", desks.len());
        Ok(desks)
    }

    /// Connect to a previously discovered desk and open a session
    ///
    /// Establishes the link, resolves the desk service and its control and
    /// height characteristics by UUID, and spawns the session's worker tasks.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::NotFound`] if the address was never discovered
    /// or the expected service/characteristics are absent,
    /// [`ConnectError::Timeout`] if the link does not establish within
    /// `params.connect_timeout_ms`, or [`ConnectError::LinkRefused`] on
    /// stack-level rejection.
    pub async fn connect(
        &self,
        address: BDAddr,
        params: &ConnectionParams,
    ) -> Result<DeskSession, ConnectError> {
        let peripheral = self
            .peripherals
            .lock()
            .await
            .get(&address)
            .cloned()
            .ok_or(ConnectError::NotFound)?;

        info!("connecting to {}", address);
        timeout(
            Duration::from_millis(params.connect_timeout_ms),
            peripheral.connect(),
        )
        .await
        .map_err(|_| ConnectError::Timeout {
            timeout_ms: params.connect_timeout_ms,
        })??;

        peripheral.discover_services().await?;

        let service = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == DESK_SERVICE_UUID)
            .ok_or(ConnectError::NotFound)?;

        let mut characteristics = HashMap::new();
        for wanted in [DESK_CONTROL_CHAR_UUID, DESK_HEIGHT_CHAR_UUID] {
            let c = service
                .characteristics
                .iter()
                .find(|c| c.uuid == wanted)
                .ok_or(ConnectError::NotFound)?
                .clone();
            characteristics.insert(wanted, c);
        }

        // Bridge the peripheral's notification stream into the session's
        // ordered channel. The stream ends when the link drops, which closes
        // the channel and moves the session to its terminal state.
        let mut stream = peripheral.notifications().await?;
        let (note_tx, note_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(n) = stream.next().await {
                if note_tx.send((n.uuid, n.value)).is_err() {
                    break;
                }
            }
        });

        info!("connected to {}", address);
        let transport = BleTransport {
            peripheral,
            characteristics,
        };
        Ok(DeskSession::spawn(transport, note_rx, params.op_timeout_ms))
    }
}

/// Drain a discovery stream until the scan deadline
///
/// Deduplicates by address, keeping first-seen order. A zero timeout returns
/// an empty list without polling the stream; a stream that ends early returns
/// whatever was collected so far.
async fn drain_discovery_stream<S>(
    mut advertisements: S,
    scan_timeout: Duration,
) -> Vec<DiscoveredDesk>
where
    S: Stream<Item = DiscoveredDesk> + Unpin,
{
    let deadline = Instant::now() + scan_timeout;
    let mut desks: Vec<DiscoveredDesk> = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let desk = match timeout(remaining, advertisements.next()).await {
            Ok(Some(desk)) => desk,
            Ok(None) | Err(_) => break,
        };

        if desks.iter().any(|d| d.address == desk.address) {
            continue;
        }
        info!("found desk: {}", desk);
        desks.push(desk);
    }

    desks
}

/// Handle identifying one notification subscription on a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    characteristic: Uuid,
}

/// A live notification subscription
///
/// Payloads from the subscribed characteristic arrive on `receiver` in the
/// order the hardware sent them.
pub struct Subscription {
    /// Handle for a later [`DeskSession::unsubscribe`]
    pub handle: SubscriptionHandle,
    /// Ordered stream of notification payloads
    pub receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

enum SessionRequest {
    Write {
        characteristic: Uuid,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), IoError>>,
    },
    Read {
        characteristic: Uuid,
        reply: oneshot::Sender<Result<Vec<u8>, IoError>>,
    },
    Subscribe {
        characteristic: Uuid,
        reply: oneshot::Sender<Result<(), IoError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

type SubscriberMap = HashMap<Uuid, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>;

/// Live link to one physical desk
///
/// All command/read/subscribe requests funnel through a single worker task
/// that owns the transport, so writes from concurrent callers are serialized
/// and never interleave on the wire. A separate router task delivers inbound
/// notifications to subscribers, preserving per-characteristic order, so a
/// slow caller never stalls delivery.
///
/// A detected link drop moves the session to a terminal disconnected state:
/// pending and subsequent operations fail with [`IoError::Disconnected`] and
/// the session never reconnects on its own.
#[derive(Clone)]
pub struct DeskSession {
    requests: mpsc::UnboundedSender<SessionRequest>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    closed: Arc<AtomicBool>,
    next_subscription_id: Arc<AtomicU64>,
    op_timeout_ms: u64,
}

impl DeskSession {
    /// Spawn the worker tasks for a freshly connected transport
    pub(crate) fn spawn(
        transport: impl DeskTransport,
        notifications: mpsc::UnboundedReceiver<(Uuid, Vec<u8>)>,
        op_timeout_ms: u64,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let subscribers: Arc<Mutex<SubscriberMap>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(request_task(transport, request_rx));
        tokio::spawn(router_task(
            notifications,
            subscribers.clone(),
            closed.clone(),
            request_tx.clone(),
        ));

        Self {
            requests: request_tx,
            subscribers,
            closed,
            next_subscription_id: Arc::new(AtomicU64::new(0)),
            op_timeout_ms,
        }
    }

    /// Whether the session still holds a live link
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), IoError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(IoError::Disconnected)
        } else {
            Ok(())
        }
    }

    async fn roundtrip<T>(
        &self,
        request: SessionRequest,
        reply_rx: oneshot::Receiver<Result<T, IoError>>,
    ) -> Result<T, IoError> {
        self.ensure_open()?;
        self.requests
            .send(request)
            .map_err(|_| IoError::Disconnected)?;

        match timeout(Duration::from_millis(self.op_timeout_ms), reply_rx).await {
            Err(_) => Err(IoError::Timeout {
                timeout_ms: self.op_timeout_ms,
            }),
            Ok(Err(_)) => Err(IoError::Disconnected),
            Ok(Ok(result)) => result,
        }
    }

    /// Write a payload to a characteristic
    ///
    /// Serialized against every other request on this session; bounded by the
    /// session's operation timeout.
    ///
    /// # Errors
    ///
    /// Returns [`IoError::Disconnected`] after disconnect or link loss,
    /// [`IoError::Timeout`] on expiry, or [`IoError::Rejected`] if the stack
    /// refuses the write.
    pub async fn write_characteristic(
        &self,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<(), IoError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.roundtrip(
            SessionRequest::Write {
                characteristic,
                payload: payload.to_vec(),
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Point-read a characteristic value
    ///
    /// # Errors
    ///
    /// Same failure modes as [`write_characteristic`](Self::write_characteristic).
    pub async fn read_characteristic(&self, characteristic: Uuid) -> Result<Vec<u8>, IoError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.roundtrip(
            SessionRequest::Read {
                characteristic,
                reply: reply_tx,
            },
            reply_rx,
        )
        .await
    }

    /// Subscribe to notifications from a characteristic
    ///
    /// Delivery is asynchronous relative to the caller; consecutive
    /// notifications from the same characteristic are never reordered.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`write_characteristic`](Self::write_characteristic).
    pub async fn subscribe(&self, characteristic: Uuid) -> Result<Subscription, IoError> {
        self.ensure_open()?;

        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        let (sink, receiver) = mpsc::unbounded_channel();

        // Register before the CCCD write so nothing delivered immediately
        // after the transport subscribe can be missed.
        self.subscribers
            .lock()
            .await
            .entry(characteristic)
            .or_default()
            .push((id, sink));

        let (reply_tx, reply_rx) = oneshot::channel();
        let result = self
            .roundtrip(
                SessionRequest::Subscribe {
                    characteristic,
                    reply: reply_tx,
                },
                reply_rx,
            )
            .await;

        if let Err(e) = result {
            if let Some(sinks) = self.subscribers.lock().await.get_mut(&characteristic) {
                sinks.retain(|(sink_id, _)| *sink_id != id);
            }
            return Err(e);
        }

        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                characteristic,
            },
            receiver,
        })
    }

    /// Stop delivery for a subscription
    ///
    /// Dropping the [`Subscription`] receiver has the same effect; this just
    /// releases the routing entry eagerly.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(sinks) = self.subscribers.lock().await.get_mut(&handle.characteristic) {
            sinks.retain(|(sink_id, _)| *sink_id != handle.id);
        }
    }

    /// Disconnect from the desk
    ///
    /// Idempotent. Releases all subscriptions; every later operation on this
    /// session fails with [`IoError::Disconnected`].
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("disconnecting session");
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .requests
            .send(SessionRequest::Disconnect { reply: reply_tx })
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        self.subscribers.lock().await.clear();
    }
}

/// Owns the transport and serializes all caller requests against it
async fn request_task(
    mut transport: impl DeskTransport,
    mut requests: mpsc::UnboundedReceiver<SessionRequest>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            SessionRequest::Write {
                characteristic,
                payload,
                reply,
            } => {
                let _ = reply.send(transport.write(characteristic, &payload).await);
            }
            SessionRequest::Read {
                characteristic,
                reply,
            } => {
                let _ = reply.send(transport.read(characteristic).await);
            }
            SessionRequest::Subscribe {
                characteristic,
                reply,
            } => {
                let _ = reply.send(transport.subscribe(characteristic).await);
            }
            SessionRequest::Disconnect { reply } => {
                if let Err(e) = transport.disconnect().await {
                    debug!("transport disconnect failed: {}", e);
                }
                let _ = reply.send(());
                break;
            }
        }
    }
}

/// Fans inbound notifications out to subscribers in arrival order
async fn router_task(
    mut notifications: mpsc::UnboundedReceiver<(Uuid, Vec<u8>)>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    closed: Arc<AtomicBool>,
    requests: mpsc::UnboundedSender<SessionRequest>,
) {
    while let Some((characteristic, payload)) = notifications.recv().await {
        let mut map = subscribers.lock().await;
        if let Some(sinks) = map.get_mut(&characteristic) {
            sinks.retain(|(_, sink)| sink.send(payload.clone()).is_ok());
        }
    }

    // The transport closed its notification channel: either we are
    // disconnecting or the link dropped out from under us.
    if !closed.swap(true, Ordering::SeqCst) {
        warn!("desk link lost; session is now terminal");
        let (reply_tx, _reply_rx) = oneshot::channel();
        let _ = requests.send(SessionRequest::Disconnect { reply: reply_tx });
    }

    subscribers.lock().await.clear();
}
