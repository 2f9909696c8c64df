//! [`Radio`] backend over BlueZ via `bluer`.

use std::{collections::BTreeSet, time::Duration, time::Instant};

use bluer::{
   AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, ErrorKind, Session,
   gatt::remote::Characteristic as RemoteCharacteristic,
};
use futures::StreamExt;
use log::{debug, info};
use smol_str::SmolStr;
use tokio::time;

use crate::{
   bluetooth::{
      AdapterInfo, AdvertisementEvent, AdvertisementStream, Radio, RawTraffic, TrafficKind,
      TrafficStream, monitor::HciMonitor,
   },
   capture::decode,
   config::{CaptureSource, Config, Transport},
   error::{BleError, Result},
   gatt::{Capabilities, Characteristic},
};

/// How often to check whether BlueZ has resolved a peer's services
const SERVICES_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// BlueZ-backed radio. Cheap to clone; clones share one D-Bus session.
#[derive(Clone)]
pub struct BluezRadio {
   session: Session,
   transport: DiscoveryTransport,
   duplicate_data: bool,
   capture_source: CaptureSource,
}

impl BluezRadio {
   pub async fn new(config: &Config) -> Result<Self> {
      let session = Session::new().await.map_err(|e| {
         BleError::AdapterUnavailable(format!("cannot reach bluetoothd: {e}").into())
      })?;
      Ok(Self {
         session,
         transport: match config.scan.transport {
            Transport::Le => DiscoveryTransport::Le,
            Transport::Bredr => DiscoveryTransport::BrEdr,
            Transport::Auto => DiscoveryTransport::Auto,
         },
         duplicate_data: config.scan.duplicate_data,
         capture_source: config.capture.source,
      })
   }

   fn adapter(&self, name: &str) -> Result<bluer::Adapter> {
      self
         .session
         .adapter(name)
         .map_err(|e| adapter_error(name, e))
   }

   fn device(&self, adapter: &str, address: Address) -> Result<bluer::Device> {
      self
         .adapter(adapter)?
         .device(address)
         .map_err(|e| match e.kind {
            ErrorKind::DoesNotExist | ErrorKind::NotFound => BleError::NotFound(address),
            _ => e.into(),
         })
   }
}

async fn remote_characteristic(
   device: &bluer::Device,
   characteristic: &Characteristic,
) -> Result<RemoteCharacteristic> {
   let remote = match device.service(characteristic.service_handle).await {
      Ok(service) => service.characteristic(characteristic.handle).await,
      Err(e) => Err(e),
   };
   match remote {
      Ok(remote) => Ok(remote),
      Err(e) => Err(link_error(device, e).await),
   }
}

fn adapter_error(name: &str, err: bluer::Error) -> BleError {
   match err.kind {
      ErrorKind::NotReady
      | ErrorKind::NotAvailable
      | ErrorKind::NotPermitted
      | ErrorKind::NotAuthorized
      | ErrorKind::DoesNotExist
      | ErrorKind::NotFound => BleError::AdapterUnavailable(format!("{name}: {}", err.message).into()),
      _ => err.into(),
   }
}

/// Classifies a failed GATT call: if the link is gone it is a transport
/// failure, otherwise the stack's own error.
async fn link_error(device: &bluer::Device, err: bluer::Error) -> BleError {
   if device.is_connected().await.unwrap_or(false) {
      err.into()
   } else {
      BleError::TransportFailure(format!("{}: {}", device.address(), err.message))
   }
}

async fn read_advertisement(adapter: &bluer::Adapter, address: Address) -> Option<AdvertisementEvent> {
   let device = adapter.device(address).ok()?;
   let mut event = AdvertisementEvent::new(address);

   let name = match device.name().await.ok().flatten() {
      Some(name) => Some(name),
      None => device.alias().await.ok().filter(|alias| !is_address_alias(alias, address)),
   };
   event.name = name.map(SmolStr::from);
   event.rssi = device.rssi().await.ok().flatten();
   event.services = device
      .uuids()
      .await
      .ok()
      .flatten()
      .map(|uuids| uuids.into_iter().collect::<BTreeSet<_>>())
      .unwrap_or_default();

   let mut manufacturer: Vec<_> = device
      .manufacturer_data()
      .await
      .ok()
      .flatten()
      .map(|data| data.into_iter().collect())
      .unwrap_or_default();
   manufacturer.sort_by_key(|(company, _)| *company);
   event.manufacturer_data = manufacturer;

   let mut service_data: Vec<_> = device
      .service_data()
      .await
      .ok()
      .flatten()
      .map(|data| data.into_iter().collect())
      .unwrap_or_default();
   service_data.sort_by_key(|(uuid, _)| *uuid);
   event.service_data = service_data;

   event.seen_at = Instant::now();
   Some(event)
}

/// BlueZ aliases nameless devices with their address, dashes for colons.
fn is_address_alias(alias: &str, address: Address) -> bool {
   alias.replace('-', ":").eq_ignore_ascii_case(&address.to_string())
}

impl Radio for BluezRadio {
   async fn adapters(&self) -> Result<Vec<AdapterInfo>> {
      let names = self.session.adapter_names().await?;
      let mut adapters = Vec::with_capacity(names.len());
      for name in names {
         let adapter = self.adapter(&name)?;
         adapters.push(AdapterInfo {
            address: adapter.address().await?,
            alias: adapter.alias().await.unwrap_or_default().into(),
            powered: adapter.is_powered().await.unwrap_or(false),
            discovering: adapter.is_discovering().await.unwrap_or(false),
            name: name.into(),
         });
      }
      Ok(adapters)
   }

   async fn advertisements(&self, name: &str) -> Result<AdvertisementStream> {
      let adapter = self.adapter(name)?;
      adapter
         .set_discovery_filter(DiscoveryFilter {
            transport: self.transport,
            duplicate_data: self.duplicate_data,
            ..Default::default()
         })
         .await
         .map_err(|e| adapter_error(name, e))?;
      let events = adapter
         .discover_devices_with_changes()
         .await
         .map_err(|e| adapter_error(name, e))?;
      debug!("{name}: Discovery session started ({:?})", self.transport);

      let stream = events.filter_map(move |event| {
         let adapter = adapter.clone();
         async move {
            match event {
               AdapterEvent::DeviceAdded(address) => read_advertisement(&adapter, address).await,
               _ => None,
            }
         }
      });
      Ok(stream.boxed())
   }

   async fn connect(&self, adapter: &str, address: Address) -> Result<()> {
      let device = self.device(adapter, address)?;
      match device.connect().await {
         Ok(()) => Ok(()),
         Err(e) if matches!(e.kind, ErrorKind::AlreadyConnected) => Ok(()),
         Err(e) if matches!(e.kind, ErrorKind::DoesNotExist | ErrorKind::NotFound) => {
            Err(BleError::NotFound(address))
         },
         Err(e) => Err(BleError::ConnectRefused(address, e.message)),
      }
   }

   async fn disconnect(&self, adapter: &str, address: Address) -> Result<()> {
      let device = self.device(adapter, address)?;
      if let Err(e) = device.disconnect().await
         && device.is_connected().await.unwrap_or(true)
      {
         return Err(e.into());
      }
      Ok(())
   }

   async fn discover(&self, adapter: &str, address: Address) -> Result<Vec<Characteristic>> {
      let device = self.device(adapter, address)?;
      loop {
         if !device.is_connected().await? {
            return Err(BleError::TransportFailure(format!(
               "{address}: disconnected before services were resolved"
            )));
         }
         if device.is_services_resolved().await? {
            break;
         }
         time::sleep(SERVICES_POLL_INTERVAL).await;
      }

      let mut characteristics = Vec::new();
      for service in device.services().await? {
         let service_uuid = service.uuid().await?;
         for characteristic in service.characteristics().await? {
            let flags = characteristic.flags().await?;
            characteristics.push(Characteristic {
               uuid: characteristic.uuid().await?,
               service: service_uuid,
               service_handle: service.id(),
               handle: characteristic.id(),
               capabilities: Capabilities {
                  read: flags.read,
                  write: flags.write,
                  write_without_response: flags.write_without_response,
                  notify: flags.notify,
                  indicate: flags.indicate,
               },
            });
         }
      }
      Ok(characteristics)
   }

   async fn read(
      &self,
      adapter: &str,
      address: Address,
      characteristic: &Characteristic,
   ) -> Result<Vec<u8>> {
      let device = self.device(adapter, address)?;
      let remote = remote_characteristic(&device, characteristic).await?;
      match remote.read().await {
         Ok(value) => Ok(value),
         Err(e) => Err(link_error(&device, e).await),
      }
   }

   async fn write(
      &self,
      adapter: &str,
      address: Address,
      characteristic: &Characteristic,
      value: &[u8],
   ) -> Result<()> {
      let device = self.device(adapter, address)?;
      let remote = remote_characteristic(&device, characteristic).await?;
      match remote.write(value).await {
         Ok(()) => Ok(()),
         Err(e) => Err(link_error(&device, e).await),
      }
   }

   async fn traffic(&self, name: &str) -> Result<TrafficStream> {
      let local = self
         .adapter(name)?
         .address()
         .await
         .map_err(|e| adapter_error(name, e))?;
      match self.capture_source {
         CaptureSource::Monitor => {
            info!("{name}: Tapping HCI monitor channel");
            Ok(HciMonitor::open(name, local)?.into_stream())
         },
         CaptureSource::Advertisements => {
            info!("{name}: Capturing synthesised advertising reports");
            let reports = self.advertisements(name).await?.map(move |event| RawTraffic {
               kind: TrafficKind::Event,
               source: Some(event.address),
               destination: Some(local),
               payload: decode::advertising_report(&event),
            });
            Ok(reports.boxed())
         },
      }
   }
}
