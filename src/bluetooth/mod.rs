//! Bluetooth radio layer.
//!
//! The rest of the crate reaches the host Bluetooth stack only through the
//! [`Radio`] capability trait: advertisement subscription, connect and
//! disconnect, GATT discovery/read/write, and a raw traffic tap. The BlueZ
//! backend lives in [`bluez`]; the HCI monitor tap in [`monitor`].

use std::{collections::BTreeSet, future::Future, time::Duration, time::Instant};

use bluer::Address;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use rand::Rng;
use tokio::time;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{error::Result, gatt::Characteristic};

pub mod adapter;
pub mod bluez;
#[cfg(test)]
pub mod mock;
pub mod monitor;

/// Maximum delay between resubscription attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Snapshot of a local Bluetooth adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
   pub name: SmolStr,
   pub address: Address,
   pub alias: SmolStr,
   pub powered: bool,
   pub discovering: bool,
}

/// One advertisement sighting as reported by the stack.
#[derive(Debug, Clone)]
pub struct AdvertisementEvent {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
   pub services: BTreeSet<Uuid>,
   pub manufacturer_data: Vec<(u16, Vec<u8>)>,
   pub service_data: Vec<(Uuid, Vec<u8>)>,
   pub seen_at: Instant,
}

impl AdvertisementEvent {
   pub fn new(address: Address) -> Self {
      Self {
         address,
         name: None,
         rssi: None,
         services: BTreeSet::new(),
         manufacturer_data: Vec::new(),
         service_data: Vec::new(),
         seen_at: Instant::now(),
      }
   }
}

/// Direction of observed traffic relative to the local controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Direction {
   #[strum(to_string = "<")]
   In,
   #[strum(to_string = ">")]
   Out,
}

/// HCI packet class of a tapped frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TrafficKind {
   #[strum(to_string = "HCI_Command")]
   Command,
   #[strum(to_string = "HCI_Event")]
   Event,
   #[strum(to_string = "HCI_ACL")]
   AclTx,
   #[strum(to_string = "HCI_ACL")]
   AclRx,
   #[strum(to_string = "HCI_SCO")]
   ScoTx,
   #[strum(to_string = "HCI_SCO")]
   ScoRx,
   #[strum(to_string = "HCI_ISO")]
   IsoTx,
   #[strum(to_string = "HCI_ISO")]
   IsoRx,
}

impl TrafficKind {
   pub const fn direction(self) -> Direction {
      match self {
         Self::Command | Self::AclTx | Self::ScoTx | Self::IsoTx => Direction::Out,
         Self::Event | Self::AclRx | Self::ScoRx | Self::IsoRx => Direction::In,
      }
   }
}

/// Raw traffic as delivered by the tap, before sequencing and decoding.
#[derive(Debug, Clone)]
pub struct RawTraffic {
   pub kind: TrafficKind,
   pub source: Option<Address>,
   pub destination: Option<Address>,
   pub payload: Vec<u8>,
}

pub type AdvertisementStream = BoxStream<'static, AdvertisementEvent>;
pub type TrafficStream = BoxStream<'static, RawTraffic>;

/// Capability interface onto the host Bluetooth stack.
///
/// Streams end when the underlying subscription is lost; consumers decide
/// whether to resubscribe.
pub trait Radio: Clone + Send + Sync + 'static {
   /// Enumerates local adapters.
   fn adapters(&self) -> impl Future<Output = Result<Vec<AdapterInfo>>> + Send;

   /// Starts advertisement listening on `adapter`; listening stops when the
   /// stream is dropped.
   fn advertisements(
      &self,
      adapter: &str,
   ) -> impl Future<Output = Result<AdvertisementStream>> + Send;

   fn connect(&self, adapter: &str, address: Address) -> impl Future<Output = Result<()>> + Send;

   fn disconnect(&self, adapter: &str, address: Address)
   -> impl Future<Output = Result<()>> + Send;

   /// Enumerates the characteristics of a connected peer.
   fn discover(
      &self,
      adapter: &str,
      address: Address,
   ) -> impl Future<Output = Result<Vec<Characteristic>>> + Send;

   fn read(
      &self,
      adapter: &str,
      address: Address,
      characteristic: &Characteristic,
   ) -> impl Future<Output = Result<Vec<u8>>> + Send;

   fn write(
      &self,
      adapter: &str,
      address: Address,
      characteristic: &Characteristic,
      value: &[u8],
   ) -> impl Future<Output = Result<()>> + Send;

   /// Taps adapter-level traffic.
   fn traffic(&self, adapter: &str) -> impl Future<Output = Result<TrafficStream>> + Send;
}

/// Backoff before resubscribing after the `attempt`-th consecutive failure.
pub fn retry_delay(attempt: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << attempt.min(5));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}

/// Retries `subscribe` with [`retry_delay`] backoff until it succeeds.
pub async fn resubscribe<T, F, Fut>(what: &str, mut subscribe: F) -> T
where
   F: FnMut() -> Fut,
   Fut: Future<Output = Result<T>>,
{
   let mut attempt = 0;
   loop {
      let delay = retry_delay(attempt);
      debug!("{what}: Resubscribing in {delay:?}");
      time::sleep(delay).await;

      match subscribe().await {
         Ok(subscription) => {
            info!("{what}: Subscription restored");
            return subscription;
         },
         Err(e) => {
            warn!("{what}: Resubscription failed: {e}");
            attempt = attempt.saturating_add(1);
         },
      }
   }
}
