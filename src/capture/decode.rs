//! HCI traffic decoding.
//!
//! Turns tapped HCI packets (without the H:4 indicator byte) into one-line
//! summaries of `/`-separated layers and fields, e.g.
//! `HCI_Event / LE Meta / LE Advertising Report / addr=AA:BB:CC:DD:EE:FF / rssi=-70 / ...`.
//! Also builds LE Advertising Report events from advertisement sightings,
//! which is what the capture stream shows when no raw tap is available.

use bluer::Address;
use uuid::Uuid;

use crate::bluetooth::{AdvertisementEvent, TrafficKind};

const EVT_DISCONNECTION_COMPLETE: u8 = 0x05;
const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
const EVT_COMMAND_COMPLETE: u8 = 0x0e;
const EVT_COMMAND_STATUS: u8 = 0x0f;
const EVT_NUM_COMPLETED_PACKETS: u8 = 0x13;
const EVT_LE_META: u8 = 0x3e;

const LE_CONNECTION_COMPLETE: u8 = 0x01;
const LE_ADVERTISING_REPORT: u8 = 0x02;
const LE_ENHANCED_CONNECTION_COMPLETE: u8 = 0x0a;
const LE_EXTENDED_ADVERTISING_REPORT: u8 = 0x0d;

const CMD_DISCONNECT: u16 = 0x0406;
const CMD_LE_CREATE_CONNECTION: u16 = 0x200d;
const CMD_LE_EXTENDED_CREATE_CONNECTION: u16 = 0x2043;

const CID_ATT: u16 = 0x0004;
const CID_LE_SIGNALING: u16 = 0x0005;
const CID_SMP: u16 = 0x0006;

const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_SERVICE_DATA16: u8 = 0x16;
const AD_SERVICE_DATA128: u8 = 0x21;
const AD_MANUFACTURER_DATA: u8 = 0xff;

/// RSSI value meaning "not available" in advertising reports
const RSSI_UNAVAILABLE: u8 = 127;

/// Largest AD payload that still fits a single-report LE Meta event
pub const MAX_REPORT_DATA: usize = 255 - 12;

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

pub const KNOWN_COMMANDS: &[(u16, &str)] = &[
   (0x0401, "Inquiry"),
   (0x0406, "Disconnect"),
   (0x041d, "Read Remote Version Information"),
   (0x0c01, "Set Event Mask"),
   (0x0c03, "Reset"),
   (0x0c14, "Read Local Name"),
   (0x1001, "Read Local Version Information"),
   (0x1002, "Read Local Supported Commands"),
   (0x1003, "Read Local Supported Features"),
   (0x1009, "Read BD_ADDR"),
   (0x1405, "Read RSSI"),
   (0x2001, "LE Set Event Mask"),
   (0x2002, "LE Read Buffer Size"),
   (0x2005, "LE Set Random Address"),
   (0x2006, "LE Set Advertising Parameters"),
   (0x2008, "LE Set Advertising Data"),
   (0x2009, "LE Set Scan Response Data"),
   (0x200a, "LE Set Advertising Enable"),
   (0x200b, "LE Set Scan Parameters"),
   (0x200c, "LE Set Scan Enable"),
   (0x200d, "LE Create Connection"),
   (0x200e, "LE Create Connection Cancel"),
   (0x2013, "LE Connection Update"),
   (0x2016, "LE Read Remote Features"),
   (0x2019, "LE Enable Encryption"),
   (0x2022, "LE Set Data Length"),
   (0x2031, "LE Set Default PHY"),
   (0x2032, "LE Set PHY"),
   (0x2036, "LE Set Extended Advertising Parameters"),
   (0x2037, "LE Set Extended Advertising Data"),
   (0x2039, "LE Set Extended Advertising Enable"),
   (0x2041, "LE Set Extended Scan Parameters"),
   (0x2042, "LE Set Extended Scan Enable"),
   (0x2043, "LE Extended Create Connection"),
];

pub const KNOWN_EVENTS: &[(u8, &str)] = &[
   (0x03, "Connection Complete"),
   (0x05, "Disconnection Complete"),
   (0x08, "Encryption Change"),
   (0x0c, "Read Remote Version Complete"),
   (0x0e, "Command Complete"),
   (0x0f, "Command Status"),
   (0x10, "Hardware Error"),
   (0x13, "Number of Completed Packets"),
   (0x1a, "Data Buffer Overflow"),
   (0x30, "Encryption Key Refresh Complete"),
   (0x3e, "LE Meta"),
   (0xff, "Vendor"),
];

const LE_SUBEVENTS: &[(u8, &str)] = &[
   (0x01, "LE Connection Complete"),
   (0x02, "LE Advertising Report"),
   (0x03, "LE Connection Update Complete"),
   (0x04, "LE Read Remote Features Complete"),
   (0x05, "LE Long Term Key Request"),
   (0x07, "LE Data Length Change"),
   (0x0a, "LE Enhanced Connection Complete"),
   (0x0c, "LE PHY Update Complete"),
   (0x0d, "LE Extended Advertising Report"),
];

const SIGNALING_CODES: &[(u8, &str)] = &[
   (0x01, "Command Reject"),
   (0x06, "Disconnection Request"),
   (0x07, "Disconnection Response"),
   (0x12, "Connection Parameter Update Request"),
   (0x13, "Connection Parameter Update Response"),
   (0x14, "LE Credit Based Connection Request"),
   (0x15, "LE Credit Based Connection Response"),
   (0x16, "Flow Control Credit"),
];

const SMP_CODES: &[(u8, &str)] = &[
   (0x01, "Pairing Request"),
   (0x02, "Pairing Response"),
   (0x03, "Pairing Confirm"),
   (0x04, "Pairing Random"),
   (0x05, "Pairing Failed"),
   (0x06, "Encryption Information"),
   (0x07, "Central Identification"),
   (0x08, "Identity Information"),
   (0x09, "Identity Address Information"),
   (0x0a, "Signing Information"),
   (0x0b, "Security Request"),
   (0x0c, "Pairing Public Key"),
   (0x0d, "Pairing DHKey Check"),
   (0x0e, "Keypress Notification"),
];

/// ATT protocol opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u8)]
pub enum AttOpcode {
   #[strum(to_string = "Error Response")]
   ErrorResponse = 0x01,
   #[strum(to_string = "Exchange MTU Request")]
   ExchangeMtuRequest = 0x02,
   #[strum(to_string = "Exchange MTU Response")]
   ExchangeMtuResponse = 0x03,
   #[strum(to_string = "Find Information Request")]
   FindInformationRequest = 0x04,
   #[strum(to_string = "Find Information Response")]
   FindInformationResponse = 0x05,
   #[strum(to_string = "Find By Type Value Request")]
   FindByTypeValueRequest = 0x06,
   #[strum(to_string = "Find By Type Value Response")]
   FindByTypeValueResponse = 0x07,
   #[strum(to_string = "Read By Type Request")]
   ReadByTypeRequest = 0x08,
   #[strum(to_string = "Read By Type Response")]
   ReadByTypeResponse = 0x09,
   #[strum(to_string = "Read Request")]
   ReadRequest = 0x0a,
   #[strum(to_string = "Read Response")]
   ReadResponse = 0x0b,
   #[strum(to_string = "Read Blob Request")]
   ReadBlobRequest = 0x0c,
   #[strum(to_string = "Read Blob Response")]
   ReadBlobResponse = 0x0d,
   #[strum(to_string = "Read Multiple Request")]
   ReadMultipleRequest = 0x0e,
   #[strum(to_string = "Read Multiple Response")]
   ReadMultipleResponse = 0x0f,
   #[strum(to_string = "Read By Group Type Request")]
   ReadByGroupTypeRequest = 0x10,
   #[strum(to_string = "Read By Group Type Response")]
   ReadByGroupTypeResponse = 0x11,
   #[strum(to_string = "Write Request")]
   WriteRequest = 0x12,
   #[strum(to_string = "Write Response")]
   WriteResponse = 0x13,
   #[strum(to_string = "Prepare Write Request")]
   PrepareWriteRequest = 0x16,
   #[strum(to_string = "Prepare Write Response")]
   PrepareWriteResponse = 0x17,
   #[strum(to_string = "Execute Write Request")]
   ExecuteWriteRequest = 0x18,
   #[strum(to_string = "Execute Write Response")]
   ExecuteWriteResponse = 0x19,
   #[strum(to_string = "Handle Value Notification")]
   HandleValueNotification = 0x1b,
   #[strum(to_string = "Handle Value Indication")]
   HandleValueIndication = 0x1d,
   #[strum(to_string = "Handle Value Confirmation")]
   HandleValueConfirmation = 0x1e,
   #[strum(to_string = "Write Command")]
   WriteCommand = 0x52,
   #[strum(to_string = "Signed Write Command")]
   SignedWriteCommand = 0xd2,
}

fn lookup<K: PartialEq + Copy>(table: &[(K, &'static str)], key: K) -> Option<&'static str> {
   table.iter().find(|(k, _)| *k == key).map(|(_, name)| *name)
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
   data: &'a [u8],
   pos: usize,
}

impl<'a> Reader<'a> {
   const fn new(data: &'a [u8]) -> Self {
      Self { data, pos: 0 }
   }

   fn take(&mut self, n: usize) -> Option<&'a [u8]> {
      let end = self.pos.checked_add(n)?;
      let bytes = self.data.get(self.pos..end)?;
      self.pos = end;
      Some(bytes)
   }

   fn skip(&mut self, n: usize) -> Option<()> {
      self.take(n).map(|_| ())
   }

   fn u8(&mut self) -> Option<u8> {
      self.take(1).map(|b| b[0])
   }

   fn i8(&mut self) -> Option<i8> {
      self.u8().map(|b| b as i8)
   }

   fn u16(&mut self) -> Option<u16> {
      self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
   }

   /// Reads a device address, stored least significant byte first.
   fn address(&mut self) -> Option<Address> {
      let b = self.take(6)?;
      Some(Address([b[5], b[4], b[3], b[2], b[1], b[0]]))
   }

   fn rest(&mut self) -> &'a [u8] {
      let rest = self.data.get(self.pos..).unwrap_or_default();
      self.pos = self.data.len();
      rest
   }
}

/// Renders a packet as `/`-separated layers; truncated input ends with a
/// `truncated` marker instead of failing.
pub fn summarize(kind: TrafficKind, payload: &[u8]) -> String {
   let mut parts = vec![kind.to_string()];
   let mut r = Reader::new(payload);
   let complete = match kind {
      TrafficKind::Command => command(&mut r, &mut parts),
      TrafficKind::Event => event(&mut r, &mut parts),
      TrafficKind::AclTx | TrafficKind::AclRx => acl(&mut r, &mut parts),
      TrafficKind::ScoTx | TrafficKind::ScoRx => isochronous(&mut r, &mut parts, 1),
      TrafficKind::IsoTx | TrafficKind::IsoRx => isochronous(&mut r, &mut parts, 2),
   };
   if complete.is_none() {
      parts.push("truncated".to_owned());
   }
   parts.join(" / ")
}

fn command(r: &mut Reader<'_>, parts: &mut Vec<String>) -> Option<()> {
   let opcode = r.u16()?;
   parts.push(format!(
      "{} (0x{opcode:04x})",
      lookup(KNOWN_COMMANDS, opcode).unwrap_or("Unknown Command")
   ));
   r.skip(1)?;
   match opcode {
      CMD_DISCONNECT => {
         let handle = r.u16()?;
         let reason = r.u8()?;
         parts.push(format!("handle=0x{handle:04x}"));
         parts.push(format!("reason=0x{reason:02x}"));
      },
      CMD_LE_CREATE_CONNECTION => {
         r.skip(6)?;
         parts.push(format!("peer={}", r.address()?));
      },
      CMD_LE_EXTENDED_CREATE_CONNECTION => {
         r.skip(3)?;
         parts.push(format!("peer={}", r.address()?));
      },
      _ => {},
   }
   Some(())
}

fn event(r: &mut Reader<'_>, parts: &mut Vec<String>) -> Option<()> {
   let code = r.u8()?;
   parts.push(match lookup(KNOWN_EVENTS, code) {
      Some(name) => name.to_owned(),
      None => format!("Unknown Event (0x{code:02x})"),
   });
   r.skip(1)?;
   match code {
      EVT_COMMAND_COMPLETE => {
         r.skip(1)?;
         let opcode = r.u16()?;
         parts.push(opcode_field(opcode));
         parts.push(format!("status=0x{:02x}", r.u8()?));
      },
      EVT_COMMAND_STATUS => {
         let status = r.u8()?;
         r.skip(1)?;
         parts.push(opcode_field(r.u16()?));
         parts.push(format!("status=0x{status:02x}"));
      },
      EVT_DISCONNECTION_COMPLETE => {
         let status = r.u8()?;
         let handle = r.u16()?;
         let reason = r.u8()?;
         parts.push(format!("status=0x{status:02x}"));
         parts.push(format!("handle=0x{handle:04x}"));
         parts.push(format!("reason=0x{reason:02x}"));
      },
      EVT_ENCRYPTION_CHANGE => {
         let status = r.u8()?;
         let handle = r.u16()?;
         let enabled = r.u8()?;
         parts.push(format!("status=0x{status:02x}"));
         parts.push(format!("handle=0x{handle:04x}"));
         parts.push(format!("encryption={enabled}"));
      },
      EVT_NUM_COMPLETED_PACKETS => {
         parts.push(format!("handles={}", r.u8()?));
      },
      EVT_LE_META => le_meta(r, parts)?,
      _ => {},
   }
   Some(())
}

fn opcode_field(opcode: u16) -> String {
   match lookup(KNOWN_COMMANDS, opcode) {
      Some(name) => format!("opcode=0x{opcode:04x} ({name})"),
      None => format!("opcode=0x{opcode:04x}"),
   }
}

fn le_meta(r: &mut Reader<'_>, parts: &mut Vec<String>) -> Option<()> {
   let subevent = r.u8()?;
   parts.push(match lookup(LE_SUBEVENTS, subevent) {
      Some(name) => name.to_owned(),
      None => format!("LE Subevent 0x{subevent:02x}"),
   });
   match subevent {
      LE_CONNECTION_COMPLETE | LE_ENHANCED_CONNECTION_COMPLETE => {
         let status = r.u8()?;
         let handle = r.u16()?;
         let role = r.u8()?;
         r.skip(1)?;
         let peer = r.address()?;
         parts.push(format!("status=0x{status:02x}"));
         parts.push(format!("handle=0x{handle:04x}"));
         parts.push(format!("role={}", if role == 0 { "central" } else { "peripheral" }));
         parts.push(format!("peer={peer}"));
      },
      LE_ADVERTISING_REPORT => {
         let reports = r.u8()?;
         for _ in 0..reports {
            r.skip(2)?;
            let addr = r.address()?;
            let len = r.u8()?;
            let data = r.take(len as usize)?;
            let rssi = r.u8()?;
            report_fields(parts, addr, rssi, data);
         }
      },
      LE_EXTENDED_ADVERTISING_REPORT => {
         let reports = r.u8()?;
         for _ in 0..reports {
            r.skip(3)?;
            let addr = r.address()?;
            r.skip(4)?;
            let rssi = r.u8()?;
            r.skip(9)?;
            let len = r.u8()?;
            let data = r.take(len as usize)?;
            report_fields(parts, addr, rssi, data);
         }
      },
      _ => {},
   }
   Some(())
}

fn report_fields(parts: &mut Vec<String>, addr: Address, rssi: u8, data: &[u8]) {
   parts.push(format!("addr={addr}"));
   if rssi == RSSI_UNAVAILABLE {
      parts.push("rssi=n/a".to_owned());
   } else {
      parts.push(format!("rssi={}", rssi as i8));
   }
   parts.push(format!("len={}", data.len()));
   parts.push(format!("data=0x{}", hex::encode(data)));
   if let Some(name) = local_name(data) {
      parts.push(format!("name={name}"));
   }
   let services = service_uuids(data);
   if !services.is_empty() {
      let services: Vec<String> = services.iter().map(Uuid::to_string).collect();
      parts.push(format!("services={}", services.join(",")));
   }
}

fn acl(r: &mut Reader<'_>, parts: &mut Vec<String>) -> Option<()> {
   let handle_flags = r.u16()?;
   r.skip(2)?;
   parts.push(format!("handle=0x{:04x}", handle_flags & 0x0fff));
   if (handle_flags >> 12) & 0x3 == 0x1 {
      parts.push("continuation".to_owned());
      return Some(());
   }

   let len = r.u16()?;
   let cid = r.u16()?;
   parts.push("L2CAP".to_owned());
   match cid {
      CID_ATT => att(r, parts),
      CID_LE_SIGNALING => {
         let code = r.u8()?;
         parts.push("Signaling".to_owned());
         parts.push(lookup(SIGNALING_CODES, code).map_or_else(
            || format!("code=0x{code:02x}"),
            str::to_owned,
         ));
         Some(())
      },
      CID_SMP => {
         let code = r.u8()?;
         parts.push("SMP".to_owned());
         parts.push(
            lookup(SMP_CODES, code).map_or_else(|| format!("code=0x{code:02x}"), str::to_owned),
         );
         Some(())
      },
      _ => {
         parts.push(format!("cid=0x{cid:04x}"));
         parts.push(format!("len={len}"));
         Some(())
      },
   }
}

fn att(r: &mut Reader<'_>, parts: &mut Vec<String>) -> Option<()> {
   parts.push("ATT".to_owned());
   let raw = r.u8()?;
   let Some(opcode) = AttOpcode::from_repr(raw) else {
      parts.push(format!("opcode=0x{raw:02x}"));
      return Some(());
   };
   parts.push(opcode.to_string());

   match opcode {
      AttOpcode::ErrorResponse => {
         let request = r.u8()?;
         let handle = r.u16()?;
         let code = r.u8()?;
         parts.push(format!("request=0x{request:02x}"));
         parts.push(format!("handle=0x{handle:04x}"));
         parts.push(format!("error=0x{code:02x}"));
      },
      AttOpcode::ExchangeMtuRequest | AttOpcode::ExchangeMtuResponse => {
         parts.push(format!("mtu={}", r.u16()?));
      },
      AttOpcode::ReadRequest | AttOpcode::ReadBlobRequest | AttOpcode::PrepareWriteRequest => {
         parts.push(format!("handle=0x{:04x}", r.u16()?));
      },
      AttOpcode::WriteRequest
      | AttOpcode::WriteCommand
      | AttOpcode::SignedWriteCommand
      | AttOpcode::HandleValueNotification
      | AttOpcode::HandleValueIndication => {
         parts.push(format!("handle=0x{:04x}", r.u16()?));
         push_value(parts, r.rest());
      },
      AttOpcode::ReadResponse | AttOpcode::ReadBlobResponse => push_value(parts, r.rest()),
      _ => {},
   }
   Some(())
}

fn push_value(parts: &mut Vec<String>, value: &[u8]) {
   if !value.is_empty() {
      parts.push(format!("value=0x{}", hex::encode(value)));
   }
}

fn isochronous(r: &mut Reader<'_>, parts: &mut Vec<String>, len_size: usize) -> Option<()> {
   let handle = r.u16()? & 0x0fff;
   r.skip(len_size)?;
   parts.push(format!("handle=0x{handle:04x}"));
   parts.push(format!("len={}", r.rest().len()));
   Some(())
}

/// Remote address carried by connection and advertising packets, if any.
pub fn peer_address(kind: TrafficKind, payload: &[u8]) -> Option<Address> {
   let mut r = Reader::new(payload);
   match kind {
      TrafficKind::Command => {
         let opcode = r.u16()?;
         r.skip(1)?;
         match opcode {
            CMD_LE_CREATE_CONNECTION => r.skip(6)?,
            CMD_LE_EXTENDED_CREATE_CONNECTION => r.skip(3)?,
            _ => return None,
         }
         r.address()
      },
      TrafficKind::Event => {
         if r.u8()? != EVT_LE_META {
            return None;
         }
         r.skip(1)?;
         match r.u8()? {
            LE_CONNECTION_COMPLETE | LE_ENHANCED_CONNECTION_COMPLETE => r.skip(5)?,
            LE_ADVERTISING_REPORT => r.skip(3)?,
            LE_EXTENDED_ADVERTISING_REPORT => r.skip(4)?,
            _ => return None,
         }
         r.address()
      },
      _ => None,
   }
}

/// Iterates `(type, body)` AD structures, stopping at padding or at the
/// first malformed length.
pub fn ad_structures(data: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
   let mut rest = data;
   std::iter::from_fn(move || {
      let (&len, tail) = rest.split_first()?;
      let len = len as usize;
      if len == 0 || tail.len() < len {
         rest = &[];
         return None;
      }
      let (structure, next) = tail.split_at(len);
      rest = next;
      let (&ty, body) = structure.split_first()?;
      Some((ty, body))
   })
}

/// Advertised local name, preferring the complete one.
pub fn local_name(data: &[u8]) -> Option<String> {
   let mut short = None;
   for (ty, body) in ad_structures(data) {
      match ty {
         AD_COMPLETE_NAME => return Some(String::from_utf8_lossy(body).into_owned()),
         AD_SHORT_NAME => short = Some(String::from_utf8_lossy(body).into_owned()),
         _ => {},
      }
   }
   short
}

/// Service UUIDs listed in AD structures.
pub fn service_uuids(data: &[u8]) -> Vec<Uuid> {
   let mut uuids = Vec::new();
   for (ty, body) in ad_structures(data) {
      match ty {
         AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => uuids.extend(
            body
               .chunks_exact(2)
               .map(|c| uuid16(u16::from_le_bytes([c[0], c[1]]))),
         ),
         AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
            uuids.extend(body.chunks_exact(16).map(|c| {
               let mut bytes = [0u8; 16];
               bytes.copy_from_slice(c);
               Uuid::from_u128(u128::from_le_bytes(bytes))
            }));
         },
         _ => {},
      }
   }
   uuids
}

pub const fn uuid16(short: u16) -> Uuid {
   Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

fn short_uuid(uuid: Uuid) -> Option<u16> {
   let value = uuid.as_u128();
   let short = (value >> 96) as u32;
   (value & !(0xffff_ffff_u128 << 96) == BLUETOOTH_BASE_UUID && short <= 0xffff)
      .then_some(short as u16)
}

fn push_ad(out: &mut Vec<u8>, ty: u8, body: &[u8]) {
   if out.len() + 2 + body.len() <= MAX_REPORT_DATA {
      out.push((body.len() + 1) as u8);
      out.push(ty);
      out.extend_from_slice(body);
   }
}

/// Encodes what is known about a sighting as AD structures. Structures that
/// would overflow [`MAX_REPORT_DATA`] are left out.
pub fn advertising_data(event: &AdvertisementEvent) -> Vec<u8> {
   let mut out = Vec::new();
   if let Some(name) = event.name.as_deref().filter(|n| !n.is_empty()) {
      push_ad(&mut out, AD_COMPLETE_NAME, name.as_bytes());
   }

   let (short, long): (Vec<&Uuid>, Vec<&Uuid>) = event
      .services
      .iter()
      .partition(|u| short_uuid(**u).is_some());
   if !short.is_empty() {
      let body: Vec<u8> = short
         .iter()
         .filter_map(|u| short_uuid(**u))
         .flat_map(u16::to_le_bytes)
         .collect();
      push_ad(&mut out, AD_COMPLETE_UUID16, &body);
   }
   if !long.is_empty() {
      let body: Vec<u8> = long.iter().flat_map(|u| u.as_u128().to_le_bytes()).collect();
      push_ad(&mut out, AD_COMPLETE_UUID128, &body);
   }

   for (company, data) in &event.manufacturer_data {
      let body: Vec<u8> = company.to_le_bytes().into_iter().chain(data.iter().copied()).collect();
      push_ad(&mut out, AD_MANUFACTURER_DATA, &body);
   }
   for (uuid, data) in &event.service_data {
      let (ty, mut body) = match short_uuid(*uuid) {
         Some(short) => (AD_SERVICE_DATA16, short.to_le_bytes().to_vec()),
         None => (AD_SERVICE_DATA128, uuid.as_u128().to_le_bytes().to_vec()),
      };
      body.extend_from_slice(data);
      push_ad(&mut out, ty, &body);
   }
   out
}

/// Builds an HCI LE Meta / LE Advertising Report event for a sighting.
pub fn advertising_report(event: &AdvertisementEvent) -> Vec<u8> {
   let data = advertising_data(event);
   let rssi = event
      .rssi
      .map_or(RSSI_UNAVAILABLE, |r| r.clamp(-127, 126) as i8 as u8);
   let mut address = event.address.0;
   address.reverse();

   let mut params = Vec::with_capacity(12 + data.len());
   params.extend_from_slice(&[LE_ADVERTISING_REPORT, 1, 0x00, 0x00]);
   params.extend_from_slice(&address);
   params.push(data.len() as u8);
   params.extend_from_slice(&data);
   params.push(rssi);

   let mut packet = Vec::with_capacity(2 + params.len());
   packet.push(EVT_LE_META);
   packet.push(params.len() as u8);
   packet.extend_from_slice(&params);
   packet
}
