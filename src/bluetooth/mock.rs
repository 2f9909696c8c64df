//! In-memory radio used by unit tests.

use std::{
   collections::HashMap,
   sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use futures::{StreamExt, channel::mpsc, future};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::time;
use uuid::Uuid;

use crate::{
   bluetooth::{AdapterInfo, AdvertisementEvent, AdvertisementStream, Radio, RawTraffic, TrafficStream},
   error::{BleError, Result},
   gatt::{Capabilities, Characteristic},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
   Reachable,
   Unreachable,
   Refusing,
}

/// Scripted remote peripheral.
#[derive(Debug, Clone)]
pub struct MockPeer {
   behavior: Behavior,
   characteristics: Vec<Characteristic>,
   values: HashMap<Uuid, Vec<u8>>,
   connect_delay: Duration,
   discovery_delay: Duration,
   discovery_error: Option<&'static str>,
   op_delay: Duration,
}

impl MockPeer {
   pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1800_0000_1000_8000_0080_5f9b_34fb);
   pub const NAME_UUID: Uuid = Uuid::from_u128(0x0000_2a00_0000_1000_8000_0080_5f9b_34fb);
   pub const CONTROL_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);
   pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

   fn new(behavior: Behavior) -> Self {
      let characteristic = |uuid, handle, capabilities| Characteristic {
         uuid,
         service: Self::SERVICE_UUID,
         service_handle: 0x0001,
         handle,
         capabilities,
      };
      Self {
         behavior,
         // Out of handle order on purpose
         characteristics: vec![
            characteristic(Self::NOTIFY_UUID, 0x0009, Capabilities {
               notify: true,
               ..Default::default()
            }),
            characteristic(Self::NAME_UUID, 0x0003, Capabilities {
               read: true,
               ..Default::default()
            }),
            characteristic(Self::CONTROL_UUID, 0x0006, Capabilities {
               write: true,
               write_without_response: true,
               ..Default::default()
            }),
         ],
         values: HashMap::from([(Self::NAME_UUID, b"Workshop".to_vec())]),
         connect_delay: Duration::ZERO,
         discovery_delay: Duration::ZERO,
         discovery_error: None,
         op_delay: Duration::ZERO,
      }
   }

   pub fn reachable() -> Self {
      Self::new(Behavior::Reachable)
   }

   /// Connection attempts never complete.
   pub fn unreachable() -> Self {
      Self::new(Behavior::Unreachable)
   }

   pub fn refusing() -> Self {
      Self::new(Behavior::Refusing)
   }

   pub const fn with_connect_delay(mut self, delay: Duration) -> Self {
      self.connect_delay = delay;
      self
   }

   /// Discovery fails with a stack error while the link stays up.
   pub const fn with_discovery_error(mut self, message: &'static str) -> Self {
      self.discovery_error = Some(message);
      self
   }

   pub const fn with_discovery_delay(mut self, delay: Duration) -> Self {
      self.discovery_delay = delay;
      self
   }

   pub const fn with_op_delay(mut self, delay: Duration) -> Self {
      self.op_delay = delay;
      self
   }
}

struct PeerState {
   peer: MockPeer,
   connected: bool,
   written: HashMap<Uuid, Vec<u8>>,
}

#[derive(Default)]
struct Inner {
   adapters: Mutex<Vec<AdapterInfo>>,
   peers: Mutex<HashMap<Address, PeerState>>,
   advertisement_taps: Mutex<Vec<mpsc::UnboundedSender<AdvertisementEvent>>>,
   traffic_taps: Mutex<Vec<mpsc::UnboundedSender<RawTraffic>>>,
   advertisement_subscriptions: AtomicUsize,
}

/// Radio backend with scriptable adapters, peers and feeds.
#[derive(Clone, Default)]
pub struct MockRadio(Arc<Inner>);

impl MockRadio {
   /// A radio with one powered adapter, `hci0`.
   pub fn new() -> Self {
      let radio = Self::default();
      radio.add_adapter("hci0", true);
      radio
   }

   pub fn add_adapter(&self, name: &str, powered: bool) {
      let mut adapters = self.0.adapters.lock();
      let index = adapters.len() as u8;
      adapters.push(AdapterInfo {
         name: SmolStr::new(name),
         address: Address([0x00, 0x1A, 0x7D, 0xDA, 0x71, index]),
         alias: SmolStr::new(format!("workshop-{name}")),
         powered,
         discovering: false,
      });
   }

   pub fn set_powered(&self, name: &str, powered: bool) {
      for adapter in self.0.adapters.lock().iter_mut() {
         if adapter.name == name {
            adapter.powered = powered;
         }
      }
   }

   pub fn add_peer(&self, address: Address, peer: MockPeer) {
      self.0.peers.lock().insert(address, PeerState {
         peer,
         connected: false,
         written: HashMap::new(),
      });
   }

   pub fn is_connected(&self, address: Address) -> bool {
      self
         .0
         .peers
         .lock()
         .get(&address)
         .is_some_and(|p| p.connected)
   }

   /// Simulates the peer vanishing without a disconnect exchange.
   pub fn drop_link(&self, address: Address) {
      if let Some(peer) = self.0.peers.lock().get_mut(&address) {
         peer.connected = false;
      }
   }

   pub fn written(&self, address: Address, uuid: Uuid) -> Option<Vec<u8>> {
      self
         .0
         .peers
         .lock()
         .get(&address)
         .and_then(|p| p.written.get(&uuid).cloned())
   }

   /// Delivers an advertisement to every live subscription.
   pub fn advertise(&self, event: AdvertisementEvent) {
      self
         .0
         .advertisement_taps
         .lock()
         .retain(|tap| tap.unbounded_send(event.clone()).is_ok());
   }

   /// Ends every advertisement subscription, as a lost D-Bus match would.
   pub fn drop_advertisement_subscriptions(&self) {
      self.0.advertisement_taps.lock().clear();
   }

   pub fn advertisement_subscriptions(&self) -> usize {
      self.0.advertisement_subscriptions.load(Ordering::Relaxed)
   }

   pub fn inject_traffic(&self, traffic: RawTraffic) {
      self
         .0
         .traffic_taps
         .lock()
         .retain(|tap| tap.unbounded_send(traffic.clone()).is_ok());
   }

   fn powered_adapter(&self, name: &str) -> Result<()> {
      let adapters = self.0.adapters.lock();
      match adapters.iter().find(|a| a.name == name) {
         Some(adapter) if adapter.powered => Ok(()),
         _ => Err(BleError::AdapterUnavailable(name.into())),
      }
   }

   fn peer_behavior(&self, address: Address) -> Result<(Behavior, Duration, Duration)> {
      self
         .0
         .peers
         .lock()
         .get(&address)
         .map(|p| (p.peer.behavior, p.peer.discovery_delay, p.peer.op_delay))
         .ok_or(BleError::NotFound(address))
   }

   fn with_connected_peer<T>(
      &self,
      address: Address,
      f: impl FnOnce(&mut PeerState) -> Result<T>,
   ) -> Result<T> {
      let mut peers = self.0.peers.lock();
      let peer = peers.get_mut(&address).ok_or(BleError::NotFound(address))?;
      if !peer.connected {
         return Err(BleError::TransportFailure(format!("{address} is not connected")));
      }
      f(peer)
   }
}

impl Radio for MockRadio {
   async fn adapters(&self) -> Result<Vec<AdapterInfo>> {
      Ok(self.0.adapters.lock().clone())
   }

   async fn advertisements(&self, adapter: &str) -> Result<AdvertisementStream> {
      self.powered_adapter(adapter)?;
      let (tx, rx) = mpsc::unbounded();
      self.0.advertisement_taps.lock().push(tx);
      self
         .0
         .advertisement_subscriptions
         .fetch_add(1, Ordering::Relaxed);
      Ok(rx.boxed())
   }

   async fn connect(&self, adapter: &str, address: Address) -> Result<()> {
      self.powered_adapter(adapter)?;
      let (behavior, ..) = self.peer_behavior(address)?;
      let delay = self
         .0
         .peers
         .lock()
         .get(&address)
         .map_or(Duration::ZERO, |p| p.peer.connect_delay);
      time::sleep(delay).await;
      match behavior {
         Behavior::Unreachable => future::pending().await,
         Behavior::Refusing => Err(BleError::ConnectRefused(
            address,
            "connection rejected by peer".into(),
         )),
         Behavior::Reachable => {
            if let Some(peer) = self.0.peers.lock().get_mut(&address) {
               peer.connected = true;
            }
            Ok(())
         },
      }
   }

   async fn disconnect(&self, _adapter: &str, address: Address) -> Result<()> {
      if let Some(peer) = self.0.peers.lock().get_mut(&address) {
         peer.connected = false;
      }
      Ok(())
   }

   async fn discover(&self, _adapter: &str, address: Address) -> Result<Vec<Characteristic>> {
      let (_, delay, _) = self.peer_behavior(address)?;
      time::sleep(delay).await;
      self.with_connected_peer(address, |p| match p.peer.discovery_error {
         Some(message) => Err(BleError::Io(std::io::Error::other(message))),
         None => Ok(p.peer.characteristics.clone()),
      })
   }

   async fn read(
      &self,
      _adapter: &str,
      address: Address,
      characteristic: &Characteristic,
   ) -> Result<Vec<u8>> {
      let (_, _, delay) = self.peer_behavior(address)?;
      time::sleep(delay).await;
      self.with_connected_peer(address, |p| {
         Ok(p
            .peer
            .values
            .get(&characteristic.uuid)
            .cloned()
            .unwrap_or_default())
      })
   }

   async fn write(
      &self,
      _adapter: &str,
      address: Address,
      characteristic: &Characteristic,
      value: &[u8],
   ) -> Result<()> {
      let (_, _, delay) = self.peer_behavior(address)?;
      time::sleep(delay).await;
      self.with_connected_peer(address, |p| {
         p.written.insert(characteristic.uuid, value.to_vec());
         Ok(())
      })
   }

   async fn traffic(&self, adapter: &str) -> Result<TrafficStream> {
      self.powered_adapter(adapter)?;
      let (tx, rx) = mpsc::unbounded();
      self.0.traffic_taps.lock().push(tx);
      Ok(rx.boxed())
   }
}
