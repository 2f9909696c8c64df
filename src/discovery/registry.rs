//! Device registry.
//!
//! One [`DeviceRecord`] per address, merged from advertisement sightings.
//! Writers are the scanner task; readers are presentation and session
//! lookup. Each merge happens under one write lock, so readers never see a
//! half-applied sighting.

use std::{
   collections::{BTreeSet, HashMap},
   sync::Arc,
   time::{Duration, Instant},
};

use bluer::Address;
use parking_lot::RwLock;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{
   bluetooth::AdvertisementEvent,
   error::{BleError, Result},
};

/// When a record stops being reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StalenessPolicy {
   #[default]
   Never,
   /// Hidden once not seen for this long.
   After(Duration),
}

impl StalenessPolicy {
   fn is_stale(self, record: &DeviceRecord, now: Instant) -> bool {
      match self {
         Self::Never => false,
         Self::After(max_age) => now.saturating_duration_since(record.last_seen) > max_age,
      }
   }
}

/// What one sighting knows about a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
   pub address: Address,
   pub name: Option<SmolStr>,
   pub rssi: Option<i16>,
   pub services: BTreeSet<Uuid>,
   pub first_seen: Instant,
   pub last_seen: Instant,
   pub sightings: u32,
}

impl DeviceRecord {
   fn from_event(event: &AdvertisementEvent) -> Self {
      Self {
         address: event.address,
         name: event.name.clone().filter(|n| !n.is_empty()),
         rssi: event.rssi,
         services: event.services.clone(),
         first_seen: event.seen_at,
         last_seen: event.seen_at,
         sightings: 1,
      }
   }

   fn apply(&mut self, event: &AdvertisementEvent) {
      if let Some(name) = event.name.as_ref().filter(|n| !n.is_empty()) {
         self.name = Some(name.clone());
      }
      self.rssi = event.rssi;
      self.last_seen = event.seen_at;
      self.services.extend(event.services.iter().copied());
      self.sightings = self.sightings.saturating_add(1);
   }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
   Inserted,
   Updated,
}

/// Shared table of discovered devices.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
   devices: Arc<RwLock<HashMap<Address, DeviceRecord>>>,
   staleness: StalenessPolicy,
}

impl DeviceRegistry {
   pub fn with_staleness(staleness: StalenessPolicy) -> Self {
      Self {
         devices: Arc::default(),
         staleness,
      }
   }

   /// Folds one sighting into the registry.
   pub fn merge(&self, event: &AdvertisementEvent) -> Merge {
      let mut devices = self.devices.write();
      match devices.get_mut(&event.address) {
         Some(record) => {
            record.apply(event);
            Merge::Updated
         },
         None => {
            devices.insert(event.address, DeviceRecord::from_event(event));
            Merge::Inserted
         },
      }
   }

   /// Point-in-time copy of every live record, most recently seen first.
   pub fn snapshot(&self) -> Vec<DeviceRecord> {
      self.snapshot_at(Instant::now())
   }

   pub fn snapshot_at(&self, now: Instant) -> Vec<DeviceRecord> {
      let mut records: Vec<_> = self
         .devices
         .read()
         .values()
         .filter(|r| !self.staleness.is_stale(r, now))
         .cloned()
         .collect();
      records.sort_by(|a, b| {
         b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| a.address.cmp(&b.address))
      });
      records
   }

   /// Current record for `address`; `NotFound` if never seen or stale.
   pub fn lookup(&self, address: Address) -> Result<DeviceRecord> {
      self.lookup_at(address, Instant::now())
   }

   pub fn lookup_at(&self, address: Address, now: Instant) -> Result<DeviceRecord> {
      self
         .devices
         .read()
         .get(&address)
         .filter(|r| !self.staleness.is_stale(r, now))
         .cloned()
         .ok_or(BleError::NotFound(address))
   }

   /// Number of stored records, stale ones included.
   pub fn len(&self) -> usize {
      self.devices.read().len()
   }

   /// Removes stale records, returning how many were dropped.
   pub fn prune(&self) -> usize {
      self.prune_at(Instant::now())
   }

   pub fn prune_at(&self, now: Instant) -> usize {
      let mut devices = self.devices.write();
      let before = devices.len();
      devices.retain(|_, r| !self.staleness.is_stale(r, now));
      before - devices.len()
   }
}
