//! Per-device GATT session state machine.
//!
//! A [`GattSession`] owns one connection to one peer:
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`,
//! with `Failed` reached from `Connecting` on timeout or refusal. Characteristic
//! discovery starts in the background once `Connected` and is published on a
//! watch channel; at most one read or write is in flight at a time.

use std::{
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   sync::watch,
   task::JoinHandle,
   time::{self, Instant},
};
use uuid::Uuid;

use crate::{
   bluetooth::{Radio, adapter::Adapter},
   discovery::registry::DeviceRegistry,
   error::{BleError, Result},
   gatt::Characteristic,
};

/// Upper bound on best-effort radio teardown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on characteristic discovery
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection state of a [`GattSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
   Failed,
}

#[derive(Debug, Clone)]
enum Discovery {
   /// No connection, nothing to discover.
   Idle,
   /// Discovery round in progress.
   Pending(u64),
   Ready(Arc<[Characteristic]>),
   TimedOut,
   /// Discovery gave up; `link_lost` when the peer went away underneath it.
   Failed { reason: String, link_lost: bool },
}

struct Shared {
   state: parking_lot::Mutex<SessionState>,
   /// Bumped by every connect; a late connect result only counts if it
   /// still owns the latest attempt.
   connect_attempt: AtomicU64,
   busy: AtomicBool,
   discovery: watch::Sender<Discovery>,
   discovery_round: AtomicU64,
   discovery_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
   fn state(&self) -> SessionState {
      *self.state.lock()
   }

   /// Drops discovered characteristics and stops any discovery in flight.
   fn invalidate(&self) {
      if let Some(handle) = self.discovery_task.lock().take() {
         handle.abort();
      }
      self.discovery.send_replace(Discovery::Idle);
   }

   /// Link lost underneath us: straight to `Disconnected`, and anyone
   /// waiting on discovery sees the transport failure.
   fn link_lost(&self, reason: String) {
      *self.state.lock() = SessionState::Disconnected;
      if let Some(handle) = self.discovery_task.lock().take() {
         handle.abort();
      }
      self.discovery.send_replace(Discovery::Failed {
         reason,
         link_lost: true,
      });
   }

   fn is_current_round(&self, round: u64) -> bool {
      matches!(*self.discovery.borrow(), Discovery::Pending(r) if r == round)
   }
}

/// Token for the single in-flight GATT operation.
struct PendingOp<'a>(&'a AtomicBool);

impl Drop for PendingOp<'_> {
   fn drop(&mut self) {
      self.0.store(false, Ordering::Release);
   }
}

/// A GATT client session with one peer.
///
/// Sessions are owned by one caller; operations take `&self` only so that
/// overlapping requests are rejected with [`BleError::SessionBusy`] instead
/// of being queued.
pub struct GattSession<R: Radio> {
   adapter: Adapter<R>,
   address: Address,
   discovery_timeout: Duration,
   shared: Arc<Shared>,
}

impl<R: Radio> GattSession<R> {
   /// Creates a disconnected session for `address`.
   pub fn new(adapter: Adapter<R>, address: Address) -> Self {
      let (discovery, _) = watch::channel(Discovery::Idle);
      Self {
         adapter,
         address,
         discovery_timeout: DISCOVERY_TIMEOUT,
         shared: Arc::new(Shared {
            state: parking_lot::Mutex::new(SessionState::Disconnected),
            connect_attempt: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            discovery,
            discovery_round: AtomicU64::new(0),
            discovery_task: parking_lot::Mutex::new(None),
         }),
      }
   }

   /// Creates a session for a device the registry has seen.
   pub fn open(adapter: Adapter<R>, registry: &DeviceRegistry, address: Address) -> Result<Self> {
      registry.lookup(address)?;
      Ok(Self::new(adapter, address))
   }

   #[must_use]
   pub const fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
      self.discovery_timeout = timeout;
      self
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub fn state(&self) -> SessionState {
      self.shared.state()
   }

   /// Connects to the peer; valid only from `Disconnected`.
   ///
   /// On success the session is `Connected` and characteristic discovery
   /// has been started. On timeout or refusal it is `Failed`.
   pub async fn connect(&self, timeout: Duration) -> Result<()> {
      let attempt = {
         let mut state = self.shared.state.lock();
         if *state != SessionState::Disconnected {
            return Err(BleError::InvalidState {
               op: "connect",
               state: *state,
            });
         }
         *state = SessionState::Connecting;
         self.shared.connect_attempt.fetch_add(1, Ordering::AcqRel) + 1
      };
      info!("{}: Connecting (timeout {timeout:?})", self.address);

      let result = time::timeout(
         timeout,
         self
            .adapter
            .radio()
            .connect(self.adapter.name(), self.address),
      )
      .await;

      let mut state = self.shared.state.lock();
      if self.shared.connect_attempt.load(Ordering::Acquire) != attempt {
         // A newer connect owns the link now; leave it alone
         drop(state);
         return Err(BleError::ConnectRefused(
            self.address,
            "superseded by a newer connection attempt".into(),
         ));
      }
      if *state != SessionState::Connecting {
         // disconnect() ran while we were waiting
         drop(state);
         self.abandon_link();
         return Err(BleError::ConnectRefused(
            self.address,
            "session was disconnected while connecting".into(),
         ));
      }

      match result {
         Err(_) => {
            *state = SessionState::Failed;
            drop(state);
            warn!("{}: Connection timed out", self.address);
            self.abandon_link();
            Err(BleError::ConnectTimeout(self.address))
         },
         Ok(Err(e)) => {
            *state = SessionState::Failed;
            drop(state);
            warn!("{}: Connection failed: {e}", self.address);
            Err(match e {
               BleError::ConnectRefused(..)
               | BleError::NotFound(_)
               | BleError::AdapterUnavailable(_) => e,
               other => BleError::ConnectRefused(self.address, other.to_string()),
            })
         },
         Ok(Ok(())) => {
            *state = SessionState::Connected;
            drop(state);
            info!("{}: Connected", self.address);
            self.start_discovery();
            Ok(())
         },
      }
   }

   /// Tears the connection down. Always succeeds and always ends in
   /// `Disconnected`; radio errors are logged and otherwise ignored.
   pub async fn disconnect(&self) {
      let prev = {
         let mut state = self.shared.state.lock();
         let prev = *state;
         if prev == SessionState::Disconnected {
            return;
         }
         *state = SessionState::Disconnecting;
         prev
      };
      self.shared.invalidate();

      if matches!(prev, SessionState::Connected | SessionState::Connecting) {
         let teardown = self
            .adapter
            .radio()
            .disconnect(self.adapter.name(), self.address);
         match time::timeout(DISCONNECT_TIMEOUT, teardown).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => warn!("{}: Disconnect failed: {e}", self.address),
            Err(_) => warn!("{}: Disconnect timed out", self.address),
         }
      }

      *self.shared.state.lock() = SessionState::Disconnected;
      info!("Disconnected from {}", self.address);
   }

   /// Returns the discovered characteristics, waiting for discovery to
   /// finish if it is still running.
   pub async fn characteristics(&self) -> Result<Arc<[Characteristic]>> {
      self.require_connected("list characteristics")?;
      self.discovered().await
   }

   /// Reads a characteristic value.
   pub async fn read(&self, uuid: Uuid, timeout: Duration) -> Result<Vec<u8>> {
      self.require_connected("read")?;
      let _op = self.begin_op()?;
      let deadline = Instant::now() + timeout;

      let characteristic = self
         .resolve(uuid, deadline, "read", |c| c.capabilities.readable())
         .await?;
      debug!("{}: Reading {uuid} (handle {:#06x})", self.address, characteristic.handle);

      let result = time::timeout_at(
         deadline,
         self
            .adapter
            .radio()
            .read(self.adapter.name(), self.address, &characteristic),
      )
      .await;
      self.finish(result)
   }

   /// Writes a characteristic value.
   pub async fn write(&self, uuid: Uuid, value: &[u8], timeout: Duration) -> Result<()> {
      self.require_connected("write")?;
      let _op = self.begin_op()?;
      let deadline = Instant::now() + timeout;

      let characteristic = self
         .resolve(uuid, deadline, "write", |c| c.capabilities.writable())
         .await?;
      debug!(
         "{}: Writing {} bytes to {uuid} (handle {:#06x})",
         self.address,
         value.len(),
         characteristic.handle
      );

      let result = time::timeout_at(
         deadline,
         self
            .adapter
            .radio()
            .write(self.adapter.name(), self.address, &characteristic, value),
      )
      .await;
      self.finish(result)
   }

   fn require_connected(&self, op: &'static str) -> Result<()> {
      match self.state() {
         SessionState::Connected => Ok(()),
         state => Err(BleError::InvalidState { op, state }),
      }
   }

   fn begin_op(&self) -> Result<PendingOp<'_>> {
      self
         .shared
         .busy
         .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
         .map_err(|_| BleError::SessionBusy)?;
      Ok(PendingOp(&self.shared.busy))
   }

   async fn resolve(
      &self,
      uuid: Uuid,
      deadline: Instant,
      op: &str,
      permitted: impl Fn(&Characteristic) -> bool,
   ) -> Result<Characteristic> {
      let characteristics = time::timeout_at(deadline, self.discovered())
         .await
         .map_err(|_| BleError::OperationTimeout)??;

      let characteristic = characteristics
         .iter()
         .find(|c| c.uuid == uuid)
         .ok_or(BleError::UnknownCharacteristic(uuid))?;
      if !permitted(characteristic) {
         return Err(BleError::UnsupportedOperation(format!(
            "{uuid} does not permit {op} (flags: {})",
            characteristic.capabilities
         )));
      }
      Ok(characteristic.clone())
   }

   fn finish<T>(&self, result: std::result::Result<Result<T>, time::error::Elapsed>) -> Result<T> {
      match result {
         Err(_) => {
            warn!("{}: GATT operation timed out", self.address);
            Err(BleError::OperationTimeout)
         },
         Ok(Err(BleError::TransportFailure(reason))) => {
            warn!("{}: Link lost during GATT operation: {reason}", self.address);
            self.shared.link_lost(reason.clone());
            Err(BleError::TransportFailure(reason))
         },
         Ok(result) => result,
      }
   }

   async fn discovered(&self) -> Result<Arc<[Characteristic]>> {
      let mut rx = self.shared.discovery.subscribe();
      let discovery = {
         let current = rx
            .wait_for(|d| !matches!(d, Discovery::Pending(_)))
            .await
            .map_err(|_| BleError::TransportFailure("session dropped".into()))?;
         Discovery::clone(&current)
      };

      match discovery {
         Discovery::Ready(characteristics) => Ok(characteristics),
         Discovery::TimedOut => Err(BleError::OperationTimeout),
         Discovery::Failed {
            reason,
            link_lost: true,
         } => Err(BleError::TransportFailure(reason)),
         Discovery::Failed {
            reason,
            link_lost: false,
         } => Err(BleError::DiscoveryFailed(reason)),
         Discovery::Idle => Err(BleError::InvalidState {
            op: "list characteristics",
            state: self.state(),
         }),
         Discovery::Pending(_) => unreachable!("wait_for excludes Pending"),
      }
   }

   fn start_discovery(&self) {
      let round = self.shared.discovery_round.fetch_add(1, Ordering::Relaxed) + 1;
      self.shared.discovery.send_replace(Discovery::Pending(round));

      let adapter = self.adapter.clone();
      let address = self.address;
      let timeout = self.discovery_timeout;
      let shared = Arc::downgrade(&self.shared);
      let handle = tokio::spawn(async move {
         let result = time::timeout(
            timeout,
            adapter.radio().discover(adapter.name(), address),
         )
         .await;
         let Some(shared) = shared.upgrade() else {
            return;
         };

         let outcome = match result {
            Ok(Ok(mut characteristics)) => {
               characteristics.sort_by_key(|c| (c.service_handle, c.handle));
               let notifiable = characteristics
                  .iter()
                  .filter(|c| c.capabilities.notifiable())
                  .count();
               info!(
                  "{address}: Discovered {} characteristics ({notifiable} notifiable)",
                  characteristics.len()
               );
               Discovery::Ready(characteristics.into())
            },
            Ok(Err(BleError::TransportFailure(reason))) => {
               warn!("{address}: Link lost during discovery: {reason}");
               if shared.is_current_round(round) {
                  shared.link_lost(reason);
               }
               return;
            },
            Ok(Err(e)) => {
               warn!("{address}: Characteristic discovery failed: {e}");
               Discovery::Failed {
                  reason: e.to_string(),
                  link_lost: false,
               }
            },
            Err(_) => {
               warn!("{address}: Characteristic discovery timed out");
               Discovery::TimedOut
            },
         };
         // A disconnect may have invalidated this round already
         shared.discovery.send_if_modified(|current| {
            if matches!(current, Discovery::Pending(r) if *r == round) {
               *current = outcome;
               true
            } else {
               false
            }
         });
      });

      if let Some(previous) = self.shared.discovery_task.lock().replace(handle) {
         previous.abort();
      }
   }

   /// Cancels a link attempt we are no longer interested in.
   fn abandon_link(&self) {
      let radio = self.adapter.radio().clone();
      let adapter = self.adapter.name().to_owned();
      let address = self.address;
      tokio::spawn(async move {
         if let Ok(Err(e)) =
            time::timeout(DISCONNECT_TIMEOUT, radio.disconnect(&adapter, address)).await
         {
            debug!("{address}: Abandoning connection attempt: {e}");
         }
      });
   }
}

impl<R: Radio> Drop for GattSession<R> {
   fn drop(&mut self) {
      self.shared.invalidate();
      let state = self.shared.state();
      if matches!(state, SessionState::Connected | SessionState::Connecting)
         && tokio::runtime::Handle::try_current().is_ok()
      {
         self.abandon_link();
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::{
      adapter::AdapterRegistry,
      mock::{MockPeer, MockRadio},
   };

   const PEER: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
   const TIMEOUT: Duration = Duration::from_secs(5);

   async fn session(radio: &MockRadio) -> GattSession<MockRadio> {
      let adapter = AdapterRegistry::new(radio.clone())
         .open(None)
         .await
         .unwrap();
      GattSession::new(adapter, PEER)
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_discovers_characteristics() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(PEER, MockPeer::reachable());
      let session = session(&radio).await;

      session.connect(TIMEOUT).await?;
      assert_eq!(session.state(), SessionState::Connected);

      let characteristics = session.characteristics().await?;
      assert_eq!(characteristics.len(), 3);
      assert!(characteristics.windows(2).all(|w| w[0].handle < w[1].handle));

      assert_eq!(session.read(MockPeer::NAME_UUID, TIMEOUT).await?, b"Workshop");
      session.write(MockPeer::CONTROL_UUID, &[0x01], TIMEOUT).await?;
      assert_eq!(radio.written(PEER, MockPeer::CONTROL_UUID), Some(vec![0x01]));
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_characteristics_wait_for_slow_discovery() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(
         PEER,
         MockPeer::reachable().with_discovery_delay(Duration::from_secs(2)),
      );
      let session = session(&radio).await;

      session.connect(TIMEOUT).await?;
      let started = Instant::now();
      let characteristics = session.characteristics().await?;
      assert_eq!(characteristics.len(), 3);
      assert!(started.elapsed() >= Duration::from_secs(2));
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_unreachable_peer_times_out_then_read_is_rejected() {
      let radio = MockRadio::new();
      radio.add_peer(PEER, MockPeer::unreachable());
      let session = session(&radio).await;

      let err = session.connect(TIMEOUT).await.unwrap_err();
      assert!(matches!(err, BleError::ConnectTimeout(addr) if addr == PEER));
      assert_eq!(session.state(), SessionState::Failed);

      let err = session.read(MockPeer::NAME_UUID, TIMEOUT).await.unwrap_err();
      assert!(matches!(
         err,
         BleError::InvalidState {
            op: "read",
            state: SessionState::Failed
         }
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_refused_connection_fails_session() {
      let radio = MockRadio::new();
      radio.add_peer(PEER, MockPeer::refusing());
      let session = session(&radio).await;

      let err = session.connect(TIMEOUT).await.unwrap_err();
      assert!(matches!(err, BleError::ConnectRefused(..)));
      assert!(err.is_connect_failure());
      assert_eq!(session.state(), SessionState::Failed);
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_then_disconnect_always_ends_disconnected() -> Result<()> {
      let radio = MockRadio::new();
      let reachable = PEER;
      let unreachable = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
      let refusing = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x77]);
      radio.add_peer(reachable, MockPeer::reachable());
      radio.add_peer(unreachable, MockPeer::unreachable());
      radio.add_peer(refusing, MockPeer::refusing());
      let adapter = AdapterRegistry::new(radio.clone()).open(None).await?;

      for address in [reachable, unreachable, refusing] {
         let session = GattSession::new(adapter.clone(), address);
         let _ = session.connect(TIMEOUT).await;
         session.disconnect().await;
         assert_eq!(session.state(), SessionState::Disconnected, "{address}");
         assert!(!radio.is_connected(address));
      }

      // Disconnect racing an in-flight connect
      let session = GattSession::new(adapter.clone(), unreachable);
      let (connect, ()) = tokio::join!(session.connect(TIMEOUT), async {
         time::sleep(Duration::from_millis(10)).await;
         session.disconnect().await;
      });
      assert!(connect.is_err());
      assert_eq!(session.state(), SessionState::Disconnected);
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_connect_only_from_disconnected() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(PEER, MockPeer::reachable());
      let session = session(&radio).await;

      session.connect(TIMEOUT).await?;
      assert!(matches!(
         session.connect(TIMEOUT).await,
         Err(BleError::InvalidState {
            op: "connect",
            state: SessionState::Connected
         })
      ));

      // Disconnect invalidates characteristics; reconnect rediscovers
      session.disconnect().await;
      assert!(session.characteristics().await.is_err());
      session.connect(TIMEOUT).await?;
      assert_eq!(session.characteristics().await?.len(), 3);
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_second_operation_is_busy_not_queued() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(
         PEER,
         MockPeer::reachable().with_op_delay(Duration::from_secs(1)),
      );
      let session = session(&radio).await;
      session.connect(TIMEOUT).await?;
      session.characteristics().await?;

      let (first, second, third) = tokio::join!(
         session.read(MockPeer::NAME_UUID, TIMEOUT),
         session.read(MockPeer::NAME_UUID, TIMEOUT),
         session.write(MockPeer::CONTROL_UUID, &[0x02], TIMEOUT),
      );
      assert_eq!(first?, b"Workshop");
      assert!(matches!(second, Err(BleError::SessionBusy)));
      assert!(matches!(third, Err(BleError::SessionBusy)));
      assert_eq!(radio.written(PEER, MockPeer::CONTROL_UUID), None);

      // Token is released once the first operation completes
      assert_eq!(session.read(MockPeer::NAME_UUID, TIMEOUT).await?, b"Workshop");
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_operation_timeout_keeps_connection() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(
         PEER,
         MockPeer::reachable().with_op_delay(Duration::from_secs(60)),
      );
      let session = session(&radio).await;
      session.connect(TIMEOUT).await?;

      let err = session.read(MockPeer::NAME_UUID, TIMEOUT).await.unwrap_err();
      assert!(matches!(err, BleError::OperationTimeout));
      assert_eq!(session.state(), SessionState::Connected);
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_capability_checks() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(PEER, MockPeer::reachable());
      let session = session(&radio).await;
      session.connect(TIMEOUT).await?;

      assert!(matches!(
         session.write(MockPeer::NAME_UUID, b"x", TIMEOUT).await,
         Err(BleError::UnsupportedOperation(_))
      ));
      assert!(matches!(
         session.read(MockPeer::NOTIFY_UUID, TIMEOUT).await,
         Err(BleError::UnsupportedOperation(_))
      ));
      let unknown = Uuid::from_u128(0x1234);
      assert!(matches!(
         session.read(unknown, TIMEOUT).await,
         Err(BleError::UnknownCharacteristic(u)) if u == unknown
      ));
      assert_eq!(session.state(), SessionState::Connected);
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_link_loss_mid_read_skips_disconnecting() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(PEER, MockPeer::reachable());
      let session = session(&radio).await;
      session.connect(TIMEOUT).await?;
      session.characteristics().await?;

      radio.drop_link(PEER);
      let err = session.read(MockPeer::NAME_UUID, TIMEOUT).await.unwrap_err();
      assert!(matches!(err, BleError::TransportFailure(_)));
      assert_eq!(session.state(), SessionState::Disconnected);
      assert!(matches!(
         session.characteristics().await,
         Err(BleError::InvalidState { .. })
      ));
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_discovery_error_with_link_up_is_not_transport_failure() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(
         PEER,
         MockPeer::reachable().with_discovery_error("attribute table unreadable"),
      );
      let session = session(&radio).await;
      session.connect(TIMEOUT).await?;

      let err = session.characteristics().await.unwrap_err();
      assert!(matches!(err, BleError::DiscoveryFailed(ref r) if r.contains("unreadable")));
      assert!(!err.is_connect_failure());
      let err = session.read(MockPeer::NAME_UUID, TIMEOUT).await.unwrap_err();
      assert!(matches!(err, BleError::DiscoveryFailed(_)));
      assert_eq!(session.state(), SessionState::Connected);
      assert!(radio.is_connected(PEER));

      session.disconnect().await;
      assert_eq!(session.state(), SessionState::Disconnected);
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_link_loss_during_discovery_disconnects() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(
         PEER,
         MockPeer::reachable().with_discovery_delay(Duration::from_secs(2)),
      );
      let session = session(&radio).await;
      session.connect(TIMEOUT).await?;

      radio.drop_link(PEER);
      let err = session.characteristics().await.unwrap_err();
      assert!(matches!(err, BleError::TransportFailure(_)));
      assert_eq!(session.state(), SessionState::Disconnected);

      // Reconnecting starts a fresh discovery round
      radio.add_peer(PEER, MockPeer::reachable());
      session.connect(TIMEOUT).await?;
      assert_eq!(session.characteristics().await?.len(), 3);
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_late_connect_does_not_adopt_newer_attempt() -> Result<()> {
      let radio = MockRadio::new();
      radio.add_peer(
         PEER,
         MockPeer::reachable().with_connect_delay(Duration::from_secs(1)),
      );
      let session = session(&radio).await;

      let (first, second) = tokio::join!(session.connect(TIMEOUT), async {
         time::sleep(Duration::from_millis(10)).await;
         session.disconnect().await;
         session.connect(TIMEOUT).await
      });
      assert!(matches!(first, Err(BleError::ConnectRefused(..))));
      second?;
      assert_eq!(session.state(), SessionState::Connected);
      assert!(radio.is_connected(PEER));
      assert_eq!(session.characteristics().await?.len(), 3);
      Ok(())
   }

   #[tokio::test]
   async fn test_open_requires_registry_record() -> Result<()> {
      let radio = MockRadio::new();
      let adapter = AdapterRegistry::new(radio.clone()).open(None).await?;
      let registry = DeviceRegistry::default();

      assert!(matches!(
         GattSession::open(adapter.clone(), &registry, PEER),
         Err(BleError::NotFound(addr)) if addr == PEER
      ));

      registry.merge(&crate::bluetooth::AdvertisementEvent::new(PEER));
      let session = GattSession::open(adapter, &registry, PEER)?;
      assert_eq!(session.state(), SessionState::Disconnected);
      Ok(())
   }
}
