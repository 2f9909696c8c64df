//! Plain-text rendering for the terminal front end, plus parsing of the
//! addresses, UUIDs and hex values users type.

use std::{fmt::Write as _, time::Duration, time::Instant};

use bluer::Address;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::{
   bluetooth::AdapterInfo,
   capture::{CaptureFrame, decode},
   discovery::DeviceRecord,
   error::{BleError, Result},
   gatt::Characteristic,
};

#[derive(Debug, Clone, Copy)]
enum Align {
   Left,
   Right,
   Center,
}

struct Table {
   columns: Vec<(&'static str, Align)>,
   rows: Vec<Vec<String>>,
}

impl Table {
   fn new(columns: &[(&'static str, Align)]) -> Self {
      Self {
         columns: columns.to_vec(),
         rows: Vec::new(),
      }
   }

   fn row(&mut self, cells: Vec<String>) {
      self.rows.push(cells);
   }

   fn render(&self) -> String {
      let widths: Vec<usize> = self
         .columns
         .iter()
         .enumerate()
         .map(|(i, (header, _))| {
            self
               .rows
               .iter()
               .filter_map(|row| row.get(i))
               .map(|cell| cell.chars().count())
               .chain([header.len()])
               .max()
               .unwrap_or(0)
         })
         .collect();

      let mut out = String::new();
      let headers: Vec<String> = self.columns.iter().map(|(h, _)| (*h).to_owned()).collect();
      self.line(&mut out, &headers, &widths);
      let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
      self.line(&mut out, &rule, &widths);
      for row in &self.rows {
         self.line(&mut out, row, &widths);
      }
      out
   }

   fn line(&self, out: &mut String, cells: &[String], widths: &[usize]) {
      let mut line = String::new();
      for (i, ((_, align), width)) in self.columns.iter().zip(widths).enumerate() {
         let cell = cells.get(i).map_or("", String::as_str);
         if i > 0 {
            line.push_str("  ");
         }
         let _ = match align {
            Align::Left => write!(line, "{cell:<width$}"),
            Align::Right => write!(line, "{cell:>width$}"),
            Align::Center => write!(line, "{cell:^width$}"),
         };
      }
      out.push_str(line.trim_end());
      out.push('\n');
   }
}

fn flag(set: bool) -> String {
   if set { "Y".to_owned() } else { String::new() }
}

/// Characteristic values as text when they are printable UTF-8, hex
/// otherwise.
pub fn value(bytes: &[u8]) -> String {
   match std::str::from_utf8(bytes) {
      Ok(text) if !text.chars().any(char::is_control) => text.to_owned(),
      _ => hex::encode(bytes),
   }
}

pub fn age(elapsed: Duration) -> String {
   let secs = elapsed.as_secs();
   match secs {
      0..60 => format!("{secs}s ago"),
      60..3600 => format!("{}m ago", secs / 60),
      _ => format!("{}h ago", secs / 3600),
   }
}

pub fn adapters(adapters: &[AdapterInfo]) -> String {
   let mut table = Table::new(&[
      ("Interface", Align::Left),
      ("Address", Align::Left),
      ("State", Align::Left),
      ("Discovering", Align::Left),
      ("Alias", Align::Left),
   ]);
   for adapter in adapters {
      table.row(vec![
         adapter.name.to_string(),
         adapter.address.to_string(),
         if adapter.powered { "up" } else { "down" }.to_owned(),
         if adapter.discovering { "yes" } else { "no" }.to_owned(),
         adapter.alias.to_string(),
      ]);
   }
   table.render()
}

/// `Discovered: N   With RSSI: M` header over the device table.
pub fn scan_header(records: &[DeviceRecord]) -> String {
   let with_rssi = records.iter().filter(|r| r.rssi.is_some()).count();
   format!("Discovered: {}   With RSSI: {with_rssi}", records.len())
}

pub fn devices(records: &[DeviceRecord], now: Instant) -> String {
   let mut table = Table::new(&[
      ("Address", Align::Left),
      ("Name", Align::Left),
      ("RSSI", Align::Right),
      ("Services", Align::Right),
      ("Last Seen", Align::Right),
   ]);
   for record in records {
      table.row(vec![
         record.address.to_string(),
         record.name.as_deref().unwrap_or_default().to_owned(),
         record.rssi.map(|r| r.to_string()).unwrap_or_default(),
         record.services.len().to_string(),
         age(now.saturating_duration_since(record.last_seen)),
      ]);
   }
   table.render()
}

pub fn devices_json(records: &[DeviceRecord], now: Instant) -> Value {
   records
      .iter()
      .map(|r| {
         json!({
            "address": r.address.to_string(),
            "name": r.name,
            "rssi": r.rssi,
            "services": r.services,
            "sightings": r.sightings,
            "first_seen_secs_ago": now.saturating_duration_since(r.first_seen).as_secs_f64(),
            "last_seen_secs_ago": now.saturating_duration_since(r.last_seen).as_secs_f64(),
         })
      })
      .collect()
}

/// Handle / UUID / R / W / N / I / Value table; `values` holds what was
/// read from each readable characteristic, in the same order.
pub fn characteristics(characteristics: &[Characteristic], values: &[Option<Vec<u8>>]) -> String {
   let mut table = Table::new(&[
      ("Handle", Align::Left),
      ("UUID", Align::Left),
      ("R", Align::Center),
      ("W", Align::Center),
      ("N", Align::Center),
      ("I", Align::Center),
      ("Value", Align::Left),
   ]);
   for (i, c) in characteristics.iter().enumerate() {
      let caps = c.capabilities;
      table.row(vec![
         format!("0x{:04x}", c.handle),
         c.uuid.to_string(),
         flag(caps.readable()),
         flag(caps.writable()),
         flag(caps.notify),
         flag(caps.indicate),
         values
            .get(i)
            .and_then(Option::as_deref)
            .map(value)
            .unwrap_or_default(),
      ]);
   }
   table.render()
}

/// `#seq +secs dir source -> destination summary`, `elapsed` counted from
/// when the capture was opened.
pub fn frame(frame: &CaptureFrame, elapsed: Duration) -> String {
   let endpoint = |a: Option<Address>| a.map_or_else(|| "-".to_owned(), |a| a.to_string());
   format!(
      "#{} +{:.3} {} {} -> {} {}",
      frame.seq,
      elapsed.as_secs_f64(),
      frame.direction,
      endpoint(frame.source),
      endpoint(frame.destination),
      frame.summary
   )
}

pub fn drop_notice(new: u64, total: u64) -> String {
   format!("-- {new} frames dropped ({total} total) --")
}

pub fn parse_address(s: &str) -> Result<Address> {
   s.trim()
      .parse()
      .map_err(|_| BleError::InvalidArgument(format!("not a Bluetooth address: {s}")))
}

/// Accepts full UUIDs and 16-bit SIG short forms (`180f`, `0x2a00`).
pub fn parse_uuid(s: &str) -> Result<Uuid> {
   let s = s.trim();
   let short = s.strip_prefix("0x").unwrap_or(s);
   if short.len() <= 4
      && let Ok(short) = u16::from_str_radix(short, 16)
   {
      return Ok(decode::uuid16(short));
   }
   Uuid::parse_str(s).map_err(|_| BleError::InvalidArgument(format!("not a UUID: {s}")))
}

/// Parses hex bytes, ignoring a `0x` prefix and `:`/`-`/space separators.
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
   let s = s.trim();
   let digits: String = s
      .strip_prefix("0x")
      .unwrap_or(s)
      .chars()
      .filter(|c| !matches!(c, ':' | '-' | ' '))
      .collect();
   hex::decode(&digits).map_err(|e| BleError::InvalidArgument(format!("bad hex value {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
   use std::collections::BTreeSet;

   use smallvec::smallvec;
   use smol_str::SmolStr;

   use super::*;
   use crate::{
      bluetooth::{Direction, TrafficKind},
      gatt::Capabilities,
   };

   const ADDR: Address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

   fn record(rssi: Option<i16>, last_seen: Instant) -> DeviceRecord {
      DeviceRecord {
         address: ADDR,
         name: Some(SmolStr::new("Thermo")),
         rssi,
         services: BTreeSet::from([decode::uuid16(0x180f)]),
         first_seen: last_seen,
         last_seen,
         sightings: 1,
      }
   }

   #[test]
   fn test_value_rendering() {
      assert_eq!(value(b"Workshop"), "Workshop");
      assert_eq!(value(&[0x64, 0x00]), "6400");
      assert_eq!(value(&[0xff, 0xfe]), "fffe");
      assert_eq!(value(&[]), "");
   }

   #[test]
   fn test_scan_table() {
      let now = Instant::now() + Duration::from_secs(600);
      let records = [
         record(Some(-65), now - Duration::from_secs(3)),
         record(None, now - Duration::from_secs(125)),
      ];
      assert_eq!(scan_header(&records), "Discovered: 2   With RSSI: 1");

      let table = devices(&records, now);
      let lines: Vec<&str> = table.lines().collect();
      assert_eq!(lines[0], "Address            Name    RSSI  Services  Last Seen");
      assert_eq!(lines[2], "AA:BB:CC:DD:EE:FF  Thermo   -65         1     3s ago");
      assert!(lines[3].ends_with("2m ago"));

      let json = devices_json(&records, now);
      assert_eq!(json[0]["rssi"], -65);
      assert_eq!(json[1]["rssi"], Value::Null);
      assert_eq!(json[0]["services"][0], "0000180f-0000-1000-8000-00805f9b34fb");
   }

   #[test]
   fn test_characteristic_table() {
      let name = Characteristic {
         uuid: decode::uuid16(0x2a00),
         service: decode::uuid16(0x1800),
         service_handle: 0x0001,
         handle: 0x0003,
         capabilities: Capabilities {
            read: true,
            ..Default::default()
         },
      };
      let control = Characteristic {
         handle: 0x0006,
         capabilities: Capabilities {
            write_without_response: true,
            notify: true,
            ..Default::default()
         },
         ..name.clone()
      };
      let table = characteristics(&[name, control], &[Some(b"Workshop".to_vec()), None]);
      let lines: Vec<&str> = table.lines().collect();
      assert!(lines[0].starts_with("Handle  UUID"));
      assert!(lines[2].starts_with("0x0003  00002a00-0000-1000-8000-00805f9b34fb  Y"));
      assert!(lines[2].ends_with("Workshop"));
      assert!(lines[3].ends_with("Y  Y"));
   }

   #[test]
   fn test_frame_line() {
      let opened_at = Instant::now();
      let frame = CaptureFrame {
         seq: 42,
         timestamp: opened_at + Duration::from_millis(1500),
         kind: TrafficKind::Event,
         direction: Direction::In,
         source: Some(ADDR),
         destination: None,
         payload: smallvec![0x0e],
         summary: "HCI_Event / Command Complete / truncated".to_owned(),
      };
      assert_eq!(
         super::frame(&frame, frame.timestamp.saturating_duration_since(opened_at)),
         "#42 +1.500 < AA:BB:CC:DD:EE:FF -> - HCI_Event / Command Complete / truncated"
      );
   }

   #[test]
   fn test_parsers() -> Result<()> {
      assert_eq!(parse_address("aa:bb:cc:dd:ee:ff")?, ADDR);
      assert!(parse_address("nope").is_err());

      assert_eq!(parse_uuid("2a00")?, decode::uuid16(0x2a00));
      assert_eq!(parse_uuid("0x180F")?, decode::uuid16(0x180f));
      assert_eq!(
         parse_uuid("6e400002-b5a3-f393-e0a9-e50e24dcca9e")?,
         Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e)
      );
      assert!(parse_uuid("xyz").is_err());

      assert_eq!(parse_hex("0x0102ff")?, [0x01, 0x02, 0xff]);
      assert_eq!(parse_hex("01:02 03")?, [0x01, 0x02, 0x03]);
      assert!(matches!(parse_hex("0g"), Err(BleError::InvalidArgument(_))));
      Ok(())
   }
}
