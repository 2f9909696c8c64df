//! Advertisement discovery: the scanner task and the device registry it
//! feeds.

pub mod registry;
pub mod scanner;

pub use registry::{DeviceRecord, DeviceRegistry, StalenessPolicy};
pub use scanner::Scanner;
