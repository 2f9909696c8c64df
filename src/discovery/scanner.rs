//! Discovery scanner.
//!
//! Listens for advertisements on one adapter and merges every sighting into
//! a [`DeviceRegistry`]. A lost subscription is re-established with backoff
//! and never surfaced to callers.

use std::time::Duration;

use bluer::Address;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{task::JoinHandle, time};

use crate::{
   bluetooth::{AdvertisementStream, Radio, adapter::Adapter, resubscribe},
   discovery::registry::{DeviceRecord, DeviceRegistry, Merge},
   error::{BleError, Result},
};

const FIND_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Scanner<R: Radio> {
   adapter: Adapter<R>,
   registry: DeviceRegistry,
   task: Option<JoinHandle<()>>,
}

impl<R: Radio> Scanner<R> {
   pub const fn new(adapter: Adapter<R>, registry: DeviceRegistry) -> Self {
      Self {
         adapter,
         registry,
         task: None,
      }
   }

   pub fn is_running(&self) -> bool {
      self.task.as_ref().is_some_and(|t| !t.is_finished())
   }

   /// Starts listening. Fails with `AdapterUnavailable` if the adapter is
   /// missing or unpowered, in which case the registry is untouched.
   pub async fn start(&mut self) -> Result<()> {
      if self.is_running() {
         return Ok(());
      }
      self.adapter.ensure_powered().await?;
      let stream = self
         .adapter
         .radio()
         .advertisements(self.adapter.name())
         .await?;
      info!("Scanning on {}", self.adapter.name());

      let task = ScanTask {
         adapter: self.adapter.clone(),
         registry: self.registry.clone(),
      };
      self.task = Some(tokio::spawn(task.run(stream)));
      Ok(())
   }

   /// Stops listening; dropping the subscription ends discovery on the
   /// adapter.
   pub fn stop(&mut self) {
      if let Some(task) = self.task.take() {
         task.abort();
         info!("Stopped scanning on {}", self.adapter.name());
      }
   }
}

impl<R: Radio> Drop for Scanner<R> {
   fn drop(&mut self) {
      if let Some(task) = self.task.take() {
         task.abort();
      }
   }
}

/// Returns the registry record for `address`, scanning for up to `wait`
/// first if the device has not been seen yet.
///
/// `NotFound` from here means no advertisement arrived in time; it never
/// stands in for a connection failure.
pub async fn find_device<R: Radio>(
   adapter: &Adapter<R>,
   registry: &DeviceRegistry,
   address: Address,
   wait: Duration,
) -> Result<DeviceRecord> {
   if let Ok(record) = registry.lookup(address) {
      return Ok(record);
   }
   info!("{address}: Not seen yet, scanning for up to {wait:?}");
   let mut scanner = Scanner::new(adapter.clone(), registry.clone());
   scanner.start().await?;

   let deadline = time::Instant::now() + wait;
   loop {
      if let Ok(record) = registry.lookup(address) {
         return Ok(record);
      }
      if time::Instant::now() >= deadline {
         return Err(BleError::NotFound(address));
      }
      time::sleep(FIND_POLL_INTERVAL).await;
   }
}

struct ScanTask<R: Radio> {
   adapter: Adapter<R>,
   registry: DeviceRegistry,
}

impl<R: Radio> ScanTask<R> {
   async fn run(self, mut stream: AdvertisementStream) {
      loop {
         while let Some(event) = stream.next().await {
            if self.registry.merge(&event) == Merge::Inserted {
               debug!(
                  "{}: New device {} ({:?} dBm)",
                  event.address,
                  event.name.as_deref().unwrap_or("?"),
                  event.rssi
               );
            }
         }
         warn!("{}: Advertisement subscription lost", self.adapter.name());
         let what = format!("{} advertisements", self.adapter.name());
         stream = resubscribe(&what, || {
            self
               .adapter
               .radio()
               .advertisements(self.adapter.name())
         })
         .await;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::{AdvertisementEvent, adapter::AdapterRegistry, mock::MockRadio};

   const ADDR: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   async fn settle() {
      for _ in 0..8 {
         tokio::task::yield_now().await;
      }
   }

   fn rssi(rssi: i16) -> AdvertisementEvent {
      AdvertisementEvent {
         rssi: Some(rssi),
         ..AdvertisementEvent::new(ADDR)
      }
   }

   #[tokio::test(start_paused = true)]
   async fn test_sightings_reach_registry() -> Result<()> {
      let radio = MockRadio::new();
      let adapter = AdapterRegistry::new(radio.clone()).open(None).await?;
      let registry = DeviceRegistry::default();
      let mut scanner = Scanner::new(adapter, registry.clone());

      scanner.start().await?;
      scanner.start().await?;
      assert_eq!(radio.advertisement_subscriptions(), 1);

      radio.advertise(rssi(-70));
      radio.advertise(rssi(-65));
      settle().await;

      let record = registry.lookup(ADDR)?;
      assert_eq!(record.rssi, Some(-65));
      assert_eq!(record.sightings, 2);

      scanner.stop();
      assert!(!scanner.is_running());
      radio.advertise(rssi(-10));
      settle().await;
      assert_eq!(registry.lookup(ADDR)?.rssi, Some(-65));
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_unpowered_adapter_leaves_registry_untouched() -> Result<()> {
      let radio = MockRadio::new();
      let adapter = AdapterRegistry::new(radio.clone()).open(None).await?;
      radio.set_powered("hci0", false);

      let registry = DeviceRegistry::default();
      let mut scanner = Scanner::new(adapter, registry.clone());
      assert!(matches!(
         scanner.start().await,
         Err(BleError::AdapterUnavailable(_))
      ));
      assert!(!scanner.is_running());

      radio.advertise(rssi(-70));
      settle().await;
      assert_eq!(registry.len(), 0);
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_lost_subscription_is_restored() -> Result<()> {
      let radio = MockRadio::new();
      let adapter = AdapterRegistry::new(radio.clone()).open(None).await?;
      let registry = DeviceRegistry::default();
      let mut scanner = Scanner::new(adapter, registry.clone());
      scanner.start().await?;

      radio.drop_advertisement_subscriptions();
      time::sleep(Duration::from_secs(4)).await;
      assert_eq!(radio.advertisement_subscriptions(), 2);
      assert!(scanner.is_running());

      radio.advertise(rssi(-55));
      settle().await;
      assert_eq!(registry.lookup(ADDR)?.rssi, Some(-55));
      Ok(())
   }

   #[tokio::test(start_paused = true)]
   async fn test_find_device_scans_briefly() -> Result<()> {
      let radio = MockRadio::new();
      let adapter = AdapterRegistry::new(radio.clone()).open(None).await?;
      let registry = DeviceRegistry::default();

      let missing = find_device(&adapter, &registry, ADDR, Duration::from_secs(5)).await;
      assert!(matches!(missing, Err(BleError::NotFound(a)) if a == ADDR));

      let advertiser = radio.clone();
      tokio::spawn(async move {
         time::sleep(Duration::from_secs(1)).await;
         advertiser.advertise(rssi(-48));
      });
      let record = find_device(&adapter, &registry, ADDR, Duration::from_secs(5)).await?;
      assert_eq!(record.rssi, Some(-48));

      // Known devices resolve without another subscription
      let subscriptions = radio.advertisement_subscriptions();
      find_device(&adapter, &registry, ADDR, Duration::ZERO).await?;
      assert_eq!(radio.advertisement_subscriptions(), subscriptions);
      Ok(())
   }
}
