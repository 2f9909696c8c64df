//! GATT client side: discovered characteristics and per-device sessions.

use std::fmt;

use uuid::Uuid;

pub mod session;

pub use session::{GattSession, SessionState};

/// Operations a characteristic permits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
   pub read: bool,
   pub write: bool,
   pub write_without_response: bool,
   pub notify: bool,
   pub indicate: bool,
}

impl Capabilities {
   pub const fn readable(&self) -> bool {
      self.read
   }

   pub const fn writable(&self) -> bool {
      self.write || self.write_without_response
   }

   pub const fn notifiable(&self) -> bool {
      self.notify || self.indicate
   }
}

impl fmt::Display for Capabilities {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut flags = Vec::with_capacity(5);
      if self.read {
         flags.push("read");
      }
      if self.write {
         flags.push("write");
      }
      if self.write_without_response {
         flags.push("write-without-response");
      }
      if self.notify {
         flags.push("notify");
      }
      if self.indicate {
         flags.push("indicate");
      }
      f.write_str(&flags.join(","))
   }
}

/// A characteristic discovered on a connected peer.
///
/// Only meaningful for the session that discovered it; a disconnect
/// invalidates the handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristic {
   pub uuid: Uuid,
   pub service: Uuid,
   pub service_handle: u16,
   pub handle: u16,
   pub capabilities: Capabilities,
}
