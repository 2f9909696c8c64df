//! BLE Tap
//!
//! Command-line front end over BlueZ: adapter listing, live scanning with a
//! device table, one-shot GATT reads and writes, an interactive shell, and
//! a live HCI capture view.

use std::{path::PathBuf, process::ExitCode, time::Duration, time::Instant};

use bluer::Address;
use clap::{Parser, Subcommand};
use log::{debug, info, warn};
use tokio::{signal, time};
use uuid::Uuid;

use bluetooth::{Radio, adapter::Adapter, adapter::AdapterRegistry, bluez::BluezRadio};
use capture::CaptureStream;
use config::{CaptureSource, Config};
use discovery::{DeviceRegistry, Scanner, scanner::find_device};
use gatt::GattSession;

mod bluetooth;
mod capture;
mod config;
mod discovery;
mod error;
mod gatt;
mod render;
mod shell;

use crate::error::{BleError, Result};

#[derive(Parser)]
#[command(name = "bletap", version, about)]
struct Cli {
   /// Adapter to use (hci0, ...); defaults to the configured or first powered one
   #[arg(short, long, global = true)]
   adapter: Option<String>,

   /// Configuration file to use instead of the default location
   #[arg(short, long, global = true)]
   config: Option<PathBuf>,

   /// Connect timeout in milliseconds
   #[arg(long, global = true)]
   connect_timeout: Option<u64>,

   /// Read/write timeout in milliseconds
   #[arg(long, global = true)]
   timeout: Option<u64>,

   #[command(subcommand)]
   command: Command,
}

#[derive(Subcommand)]
enum Command {
   /// List local Bluetooth adapters
   Adapters,
   /// Scan for advertising devices and show a live table
   Scan {
      /// Stop after this many seconds
      #[arg(short, long)]
      duration: Option<u64>,
      /// Table refresh interval in milliseconds
      #[arg(short, long)]
      interval: Option<u64>,
      /// Print the final table as JSON instead
      #[arg(long)]
      json: bool,
   },
   /// Connect and list the characteristics of a device with their values
   Gatt {
      #[arg(value_parser = render::parse_address)]
      address: Address,
   },
   /// Read one characteristic
   Read {
      #[arg(value_parser = render::parse_address)]
      address: Address,
      /// Characteristic to read; defaults to the first readable one
      #[arg(value_parser = render::parse_uuid)]
      uuid: Option<Uuid>,
   },
   /// Write one characteristic
   Write {
      #[arg(value_parser = render::parse_address)]
      address: Address,
      #[arg(value_parser = render::parse_uuid)]
      uuid: Uuid,
      /// Hex bytes, e.g. 0x0102 or 01:02
      value: String,
   },
   /// Show live adapter traffic
   Capture {
      /// Stop after this many seconds
      #[arg(short, long)]
      duration: Option<u64>,
      /// Frames that may wait before the oldest are dropped
      #[arg(long)]
      capacity: Option<usize>,
      /// Tap the raw HCI monitor channel (needs CAP_NET_RAW)
      #[arg(long)]
      monitor: bool,
   },
   /// Interactive shell
   Shell,
}

/// Exit status for a device that was never seen
const EXIT_NOT_FOUND: u8 = 2;
/// Exit status for a device that was seen but could not be used
const EXIT_CONNECT_FAILED: u8 = 3;

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(50);

#[tokio::main]
async fn main() -> ExitCode {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   let cli = Cli::parse();
   match run(cli).await {
      Ok(()) => ExitCode::SUCCESS,
      Err(e) => {
         eprintln!("{}", shell::describe(&e));
         match e {
            BleError::NotFound(_) => ExitCode::from(EXIT_NOT_FOUND),
            e if e.is_connect_failure() => ExitCode::from(EXIT_CONNECT_FAILED),
            _ => ExitCode::FAILURE,
         }
      },
   }
}

async fn run(cli: Cli) -> Result<()> {
   let mut config = match &cli.config {
      Some(path) => Config::load_from(path)?,
      None => Config::load()?,
   };
   if let Some(adapter) = cli.adapter {
      config.adapter = Some(adapter);
   }
   if let Some(ms) = cli.connect_timeout {
      config.session.connect_timeout_ms = ms;
   }
   if let Some(ms) = cli.timeout {
      config.session.operation_timeout_ms = ms;
   }
   if let Command::Capture {
      capacity, monitor, ..
   } = &cli.command
   {
      if let Some(capacity) = capacity {
         config.capture.queue_capacity = *capacity;
      }
      if *monitor {
         config.capture.source = CaptureSource::Monitor;
      }
   }

   let registry = AdapterRegistry::new(BluezRadio::new(&config).await?);
   if matches!(cli.command, Command::Adapters) {
      print!("{}", render::adapters(&registry.list().await?));
      return Ok(());
   }

   let adapter = registry.open(config.adapter.as_deref()).await?;
   info!("Using adapter {} ({})", adapter.name(), adapter.info().address);
   let devices = DeviceRegistry::with_staleness(config.scan.staleness());

   match cli.command {
      Command::Adapters => Ok(()),
      Command::Scan {
         duration,
         interval,
         json,
      } => {
         let interval = interval.map_or(config.scan.refresh_interval(), Duration::from_millis);
         scan(adapter, devices, duration.map(Duration::from_secs), interval, json).await
      },
      Command::Gatt { address } => {
         let session = open_session(&adapter, &devices, &config, address).await?;
         let result = list_characteristics(&session, &config).await;
         session.disconnect().await;
         result
      },
      Command::Read { address, uuid } => {
         let session = open_session(&adapter, &devices, &config, address).await?;
         let result = shell::read_value(&session, uuid, config.session.operation_timeout()).await;
         session.disconnect().await;
         let (uuid, value) = result?;
         println!("{uuid}: {} ({} bytes)", render::value(&value), value.len());
         Ok(())
      },
      Command::Write {
         address,
         uuid,
         value,
      } => {
         let value = render::parse_hex(&value)?;
         let session = open_session(&adapter, &devices, &config, address).await?;
         let result = session
            .write(uuid, &value, config.session.operation_timeout())
            .await;
         session.disconnect().await;
         result?;
         println!("Wrote {} bytes to {uuid}", value.len());
         Ok(())
      },
      Command::Capture { duration, .. } => {
         capture(
            &adapter,
            config.capture.queue_capacity,
            duration.map(Duration::from_secs),
         )
         .await
      },
      Command::Shell => shell::Shell::new(adapter, devices, config).run().await,
   }
}

/// Resolves to the end of `duration`, or never.
async fn deadline(duration: Option<Duration>) {
   match duration {
      Some(duration) => time::sleep(duration).await,
      None => std::future::pending().await,
   }
}

async fn scan<R: Radio>(
   adapter: Adapter<R>,
   devices: DeviceRegistry,
   duration: Option<Duration>,
   interval: Duration,
   json: bool,
) -> Result<()> {
   let mut scanner = Scanner::new(adapter, devices.clone());
   scanner.start().await?;

   let stop = deadline(duration);
   tokio::pin!(stop);
   let mut refresh = time::interval(interval.max(MIN_REFRESH_INTERVAL));
   loop {
      tokio::select! {
         _ = refresh.tick() => {
            let pruned = devices.prune();
            if pruned > 0 {
               debug!("Pruned {pruned} stale devices, {} left", devices.len());
            }
            if !json {
               let records = devices.snapshot();
               println!("{}", render::scan_header(&records));
               print!("{}", render::devices(&records, Instant::now()));
               println!();
            }
         },
         () = &mut stop => break,
         result = signal::ctrl_c() => {
            result?;
            break;
         },
      }
   }
   scanner.stop();

   let records = devices.snapshot();
   if json {
      let out = serde_json::to_string_pretty(&render::devices_json(&records, Instant::now()))?;
      println!("{out}");
   } else {
      println!("{}", render::scan_header(&records));
      print!("{}", render::devices(&records, Instant::now()));
   }
   Ok(())
}

/// Finds the device (scanning briefly if it has not been seen yet) and
/// connects a session to it.
async fn open_session<R: Radio>(
   adapter: &Adapter<R>,
   devices: &DeviceRegistry,
   config: &Config,
   address: Address,
) -> Result<GattSession<R>> {
   find_device(adapter, devices, address, config.scan.find_timeout()).await?;
   let session = GattSession::open(adapter.clone(), devices, address)?
      .with_discovery_timeout(config.session.discovery_timeout());
   if let Err(e) = session.connect(config.session.connect_timeout()).await {
      session.disconnect().await;
      return Err(e);
   }
   Ok(session)
}

async fn list_characteristics<R: Radio>(session: &GattSession<R>, config: &Config) -> Result<()> {
   let characteristics = session.characteristics().await?;
   let mut values = Vec::with_capacity(characteristics.len());
   for characteristic in characteristics.iter() {
      if !characteristic.capabilities.readable() {
         values.push(None);
         continue;
      }
      match session
         .read(characteristic.uuid, config.session.operation_timeout())
         .await
      {
         Ok(value) => values.push(Some(value)),
         Err(e) => {
            warn!("{}: Reading {} failed: {e}", session.address(), characteristic.uuid);
            values.push(None);
         },
      }
   }
   print!("{}", render::characteristics(&characteristics, &values));
   Ok(())
}

async fn capture<R: Radio>(
   adapter: &Adapter<R>,
   capacity: usize,
   duration: Option<Duration>,
) -> Result<()> {
   let mut stream = CaptureStream::open(adapter, capacity).await?;
   let mut reported = 0;

   let stop = deadline(duration);
   tokio::pin!(stop);
   loop {
      tokio::select! {
         frame = stream.next() => {
            let Some(frame) = frame else { break };
            let dropped = stream.frames_dropped();
            if dropped > reported {
               println!("{}", render::drop_notice(dropped - reported, dropped));
               reported = dropped;
            }
            println!("{}", render::frame(&frame, stream.elapsed(&frame)));
         },
         () = &mut stop => break,
         result = signal::ctrl_c() => {
            result?;
            break;
         },
      }
   }

   let dropped = stream.frames_dropped();
   stream.close();
   if dropped > 0 {
      println!("{dropped} frames dropped in total");
   }
   Ok(())
}
