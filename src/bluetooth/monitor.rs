//! Raw HCI traffic tap over the kernel's Bluetooth monitor channel.
//!
//! The monitor channel mirrors every command, event and data packet of
//! every controller, prefixed by a small header naming the controller. Only
//! packets for the requested adapter are passed on. Opening the channel
//! needs `CAP_NET_RAW`.

use std::{
   io,
   mem,
   os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

use bluer::Address;
use futures::{StreamExt, stream};
use log::{debug, warn};
use tokio::io::unix::AsyncFd;

use crate::{
   bluetooth::{Direction, RawTraffic, TrafficKind, TrafficStream},
   capture::decode,
   error::{BleError, Result},
};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_HCI: libc::c_int = 1;
const HCI_CHANNEL_MONITOR: u16 = 2;
const HCI_DEV_NONE: u16 = 0xffff;

const MONITOR_HEADER_LEN: usize = 6;
const MAX_PACKET: usize = MONITOR_HEADER_LEN + 4 + 65535;

const MON_COMMAND: u16 = 2;
const MON_EVENT: u16 = 3;
const MON_ACL_TX: u16 = 4;
const MON_ACL_RX: u16 = 5;
const MON_SCO_TX: u16 = 6;
const MON_SCO_RX: u16 = 7;
const MON_ISO_TX: u16 = 18;
const MON_ISO_RX: u16 = 19;

#[repr(C)]
struct SockaddrHci {
   hci_family: libc::sa_family_t,
   hci_dev: u16,
   hci_channel: u16,
}

/// Controller index of an adapter name such as `hci1`.
pub fn adapter_index(name: &str) -> Option<u16> {
   name.strip_prefix("hci")?.parse().ok()
}

/// Traffic class of a monitor opcode; `None` for bookkeeping records
/// (index added/removed, system notes and the like).
pub const fn traffic_kind(opcode: u16) -> Option<TrafficKind> {
   Some(match opcode {
      MON_COMMAND => TrafficKind::Command,
      MON_EVENT => TrafficKind::Event,
      MON_ACL_TX => TrafficKind::AclTx,
      MON_ACL_RX => TrafficKind::AclRx,
      MON_SCO_TX => TrafficKind::ScoTx,
      MON_SCO_RX => TrafficKind::ScoRx,
      MON_ISO_TX => TrafficKind::IsoTx,
      MON_ISO_RX => TrafficKind::IsoRx,
      _ => return None,
   })
}

/// Splits one monitor record into `(opcode, index, payload)`.
pub fn parse_record(record: &[u8]) -> Option<(u16, u16, &[u8])> {
   let header = record.get(..MONITOR_HEADER_LEN)?;
   let opcode = u16::from_le_bytes([header[0], header[1]]);
   let index = u16::from_le_bytes([header[2], header[3]]);
   let len = u16::from_le_bytes([header[4], header[5]]) as usize;
   let payload = record.get(MONITOR_HEADER_LEN..MONITOR_HEADER_LEN + len)?;
   Some((opcode, index, payload))
}

pub struct HciMonitor {
   fd: AsyncFd<OwnedFd>,
   index: u16,
   local: Address,
   buf: Vec<u8>,
}

impl HciMonitor {
   /// Opens the monitor channel for `adapter`, whose own address is
   /// `local`.
   pub fn open(adapter: &str, local: Address) -> Result<Self> {
      let index = adapter_index(adapter).ok_or_else(|| {
         BleError::AdapterUnavailable(format!("{adapter}: not an HCI adapter name").into())
      })?;
      let fd = open_monitor_socket().map_err(|e| {
         BleError::AdapterUnavailable(format!("{adapter}: HCI monitor unavailable ({e})").into())
      })?;
      debug!("Opened HCI monitor for {adapter} (index {index})");
      Ok(Self {
         fd: AsyncFd::new(fd)?,
         index,
         local,
         buf: vec![0; MAX_PACKET],
      })
   }

   async fn recv_record(&mut self) -> io::Result<usize> {
      loop {
         let mut guard = self.fd.readable().await?;
         let buf = &mut self.buf;
         let result = guard.try_io(|fd| {
            // SAFETY: buf is valid for writes of buf.len() bytes
            let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
               Err(io::Error::last_os_error())
            } else {
               Ok(n as usize)
            }
         });
         match result {
            Ok(read) => return read,
            Err(_would_block) => continue,
         }
      }
   }

   /// Next packet for this adapter.
   pub async fn recv(&mut self) -> io::Result<RawTraffic> {
      loop {
         let n = self.recv_record().await?;
         let Some((opcode, index, payload)) = parse_record(&self.buf[..n]) else {
            debug!("Short HCI monitor record ({n} bytes)");
            continue;
         };
         if index != self.index {
            continue;
         }
         let Some(kind) = traffic_kind(opcode) else {
            continue;
         };
         return Ok(self.classify(kind, payload.to_vec()));
      }
   }

   fn classify(&self, kind: TrafficKind, payload: Vec<u8>) -> RawTraffic {
      let peer = decode::peer_address(kind, &payload);
      let (source, destination) = match kind.direction() {
         Direction::Out => (Some(self.local), peer),
         Direction::In => (peer, Some(self.local)),
      };
      RawTraffic {
         kind,
         source,
         destination,
         payload,
      }
   }

   /// Turns the monitor into a stream that ends on the first read error.
   pub fn into_stream(self) -> TrafficStream {
      stream::unfold(self, |mut monitor| async move {
         match monitor.recv().await {
            Ok(traffic) => Some((traffic, monitor)),
            Err(e) => {
               warn!("HCI monitor read failed: {e}");
               None
            },
         }
      })
      .boxed()
   }
}

fn open_monitor_socket() -> io::Result<OwnedFd> {
   // SAFETY: plain socket(2) call; ownership of the descriptor moves into
   // OwnedFd immediately
   let fd = unsafe {
      libc::socket(
         AF_BLUETOOTH,
         libc::SOCK_RAW | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
         BTPROTO_HCI,
      )
   };
   if fd < 0 {
      return Err(io::Error::last_os_error());
   }
   // SAFETY: fd was just returned by socket(2) and is not owned elsewhere
   let fd = unsafe { OwnedFd::from_raw_fd(fd) };

   let addr = SockaddrHci {
      hci_family: AF_BLUETOOTH as libc::sa_family_t,
      hci_dev: HCI_DEV_NONE,
      hci_channel: HCI_CHANNEL_MONITOR,
   };
   // SAFETY: addr is a properly laid out sockaddr_hci that outlives the call
   let result = unsafe {
      libc::bind(
         fd.as_raw_fd(),
         (&raw const addr).cast::<libc::sockaddr>(),
         mem::size_of::<SockaddrHci>() as libc::socklen_t,
      )
   };
   if result < 0 {
      return Err(io::Error::last_os_error());
   }
   Ok(fd)
}
