//! Adapter registry.
//!
//! Enumerates local radios and hands out explicit [`Adapter`] handles that
//! the scanner, GATT sessions and capture streams are constructed with.

use log::debug;
use smol_str::SmolStr;

use crate::{
   bluetooth::{AdapterInfo, Radio},
   error::{BleError, Result},
};

/// Lists and opens local adapters through a [`Radio`] backend.
#[derive(Clone)]
pub struct AdapterRegistry<R> {
   radio: R,
}

impl<R: Radio> AdapterRegistry<R> {
   pub const fn new(radio: R) -> Self {
      Self { radio }
   }

   /// Returns a fresh snapshot of every adapter.
   pub async fn list(&self) -> Result<Vec<AdapterInfo>> {
      let mut adapters = self.radio.adapters().await?;
      adapters.sort_by(|a, b| a.name.cmp(&b.name));
      Ok(adapters)
   }

   /// Opens the named adapter, or the first powered one when `name` is
   /// `None`.
   pub async fn open(&self, name: Option<&str>) -> Result<Adapter<R>> {
      let adapters = self.list().await?;
      let info = match name {
         Some(name) => adapters
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| BleError::AdapterUnavailable(name.into()))?,
         None => adapters
            .into_iter()
            .find(|a| a.powered)
            .ok_or_else(|| BleError::AdapterUnavailable(SmolStr::new_static("no powered adapter")))?,
      };
      debug!("Opened adapter {} ({})", info.name, info.address);
      Ok(Adapter {
         radio: self.radio.clone(),
         info,
      })
   }
}

/// Handle to one local adapter.
///
/// This type is cheaply cloneable; the snapshot it carries is only as fresh
/// as the last [`Adapter::refresh`].
#[derive(Clone)]
pub struct Adapter<R> {
   radio: R,
   info: AdapterInfo,
}

impl<R: Radio> Adapter<R> {
   pub const fn radio(&self) -> &R {
      &self.radio
   }

   pub const fn info(&self) -> &AdapterInfo {
      &self.info
   }

   pub fn name(&self) -> &str {
      &self.info.name
   }

   /// Re-queries the adapter state from the stack.
   pub async fn refresh(&mut self) -> Result<&AdapterInfo> {
      let info = self
         .radio
         .adapters()
         .await?
         .into_iter()
         .find(|a| a.name == self.info.name)
         .ok_or_else(|| BleError::AdapterUnavailable(self.info.name.clone()))?;
      self.info = info;
      Ok(&self.info)
   }

   /// Refreshes and fails with `AdapterUnavailable` unless the adapter is
   /// powered.
   pub async fn ensure_powered(&mut self) -> Result<()> {
      if self.refresh().await?.powered {
         Ok(())
      } else {
         Err(BleError::AdapterUnavailable(self.info.name.clone()))
      }
   }
}
