//! Interactive shell over one adapter: scanning, one GATT session at a
//! time, and the device table.

use std::{
   fmt::Write as _,
   time::{Duration, Instant},
};

use log::{debug, warn};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::{
   bluetooth::{Radio, adapter::Adapter},
   config::Config,
   discovery::{DeviceRegistry, Scanner, scanner::find_device},
   error::{BleError, Result},
   gatt::GattSession,
   render,
};

const PROMPT: &str = "bletap> ";

const HELP: &str = "\
devices               show discovered devices
scan on|off           start or stop background scanning
connect <address>     open a GATT session (closes the current one)
chars                 list characteristics of the connected device
read [uuid]           read a characteristic (default: first readable)
write <uuid> <hex>    write a characteristic
disconnect            close the GATT session
help                  show this help
quit                  leave the shell
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
   Continue,
   Quit,
}

pub struct Shell<R: Radio> {
   adapter: Adapter<R>,
   registry: DeviceRegistry,
   scanner: Scanner<R>,
   session: Option<GattSession<R>>,
   config: Config,
}

impl<R: Radio> Shell<R> {
   pub fn new(adapter: Adapter<R>, registry: DeviceRegistry, config: Config) -> Self {
      Self {
         scanner: Scanner::new(adapter.clone(), registry.clone()),
         adapter,
         registry,
         session: None,
         config,
      }
   }

   /// Reads commands from stdin until `quit` or end of input.
   pub async fn run(mut self) -> Result<()> {
      let mut stdout = io::stdout();
      let mut lines = BufReader::new(io::stdin()).lines();
      stdout
         .write_all(format!("Using {}; type help for commands\n", self.adapter.name()).as_bytes())
         .await?;

      loop {
         stdout.write_all(PROMPT.as_bytes()).await?;
         stdout.flush().await?;
         let Some(line) = lines.next_line().await? else {
            break;
         };

         let mut out = String::new();
         let flow = match self.execute(&line, &mut out).await {
            Ok(flow) => flow,
            Err(e) => {
               let _ = writeln!(out, "{}", describe(&e));
               Flow::Continue
            },
         };
         stdout.write_all(out.as_bytes()).await?;
         if flow == Flow::Quit {
            break;
         }
      }

      if let Some(session) = self.session.take() {
         session.disconnect().await;
      }
      self.scanner.stop();
      Ok(())
   }

   /// Runs one command line, appending its output to `out`.
   pub async fn execute(&mut self, line: &str, out: &mut String) -> Result<Flow> {
      let mut words = line.split_whitespace();
      let Some(command) = words.next() else {
         return Ok(Flow::Continue);
      };
      let args: Vec<&str> = words.collect();
      debug!("shell: {command} {args:?}");

      match (command, args.as_slice()) {
         ("help" | "?", []) => out.push_str(HELP),
         ("quit" | "exit", []) => return Ok(Flow::Quit),
         ("devices", []) => {
            let records = self.registry.snapshot();
            let _ = writeln!(out, "{}", render::scan_header(&records));
            out.push_str(&render::devices(&records, Instant::now()));
         },
         ("scan", ["on"]) => {
            self.scanner.start().await?;
            out.push_str("Scanning\n");
         },
         ("scan", ["off"]) => {
            self.scanner.stop();
            out.push_str("Scanning stopped\n");
         },
         ("connect", [address]) => self.connect(address, out).await?,
         ("chars", []) => {
            let characteristics = self.session()?.characteristics().await?;
            out.push_str(&render::characteristics(&characteristics, &[]));
         },
         ("read", [] | [_]) => {
            let uuid = args.first().map(|u| render::parse_uuid(u)).transpose()?;
            let timeout = self.config.session.operation_timeout();
            let (uuid, value) = read_value(self.session()?, uuid, timeout).await?;
            let _ = writeln!(out, "{uuid}: {} ({} bytes)", render::value(&value), value.len());
         },
         ("write", [uuid, value]) => {
            let uuid = render::parse_uuid(uuid)?;
            let value = render::parse_hex(value)?;
            let timeout = self.config.session.operation_timeout();
            self.session()?.write(uuid, &value, timeout).await?;
            let _ = writeln!(out, "Wrote {} bytes to {uuid}", value.len());
         },
         ("disconnect", []) => match self.session.take() {
            Some(session) => {
               session.disconnect().await;
               let _ = writeln!(out, "Disconnected from {}", session.address());
            },
            None => out.push_str("Not connected\n"),
         },
         _ => {
            return Err(BleError::InvalidArgument(format!(
               "unrecognised command {line:?}; type help for commands"
            )));
         },
      }
      Ok(Flow::Continue)
   }

   async fn connect(&mut self, address: &str, out: &mut String) -> Result<()> {
      let address = render::parse_address(address)?;
      if let Some(previous) = self.session.take() {
         previous.disconnect().await;
      }

      find_device(
         &self.adapter,
         &self.registry,
         address,
         self.config.scan.find_timeout(),
      )
      .await?;
      let session = GattSession::open(self.adapter.clone(), &self.registry, address)?
         .with_discovery_timeout(self.config.session.discovery_timeout());
      if let Err(e) = session.connect(self.config.session.connect_timeout()).await {
         session.disconnect().await;
         return Err(e);
      }

      match session.characteristics().await {
         Ok(characteristics) => {
            let _ = writeln!(
               out,
               "Connected to {address} ({} characteristics)",
               characteristics.len()
            );
         },
         Err(e) => {
            warn!("{address}: Connected but discovery failed: {e}");
            let _ = writeln!(out, "Connected to {address} (discovery failed: {e})");
         },
      }
      self.session = Some(session);
      Ok(())
   }

   fn session(&self) -> Result<&GattSession<R>> {
      self
         .session
         .as_ref()
         .ok_or_else(|| BleError::InvalidArgument("not connected; use connect <address>".into()))
   }
}

/// Reads `uuid`, or the first readable characteristic when none is given.
pub async fn read_value<R: Radio>(
   session: &GattSession<R>,
   uuid: Option<Uuid>,
   timeout: Duration,
) -> Result<(Uuid, Vec<u8>)> {
   let uuid = match uuid {
      Some(uuid) => uuid,
      None => session
         .characteristics()
         .await?
         .iter()
         .find(|c| c.capabilities.readable())
         .map(|c| c.uuid)
         .ok_or_else(|| {
            BleError::UnsupportedOperation(format!(
               "{} has no readable characteristic",
               session.address()
            ))
         })?,
   };
   let value = session.read(uuid, timeout).await?;
   Ok((uuid, value))
}

/// User-facing message that keeps "never seen" apart from "seen but the
/// link failed".
pub fn describe(err: &BleError) -> String {
   match err {
      BleError::NotFound(address) => {
         format!("Device {address} not found: no advertisement seen (is it in range?)")
      },
      e if e.is_connect_failure() => format!("Connect failed: {e}"),
      e => format!("Error: {e}"),
   }
}
