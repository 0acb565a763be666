//! ADB transport for the provider.
//!
//! Everything the higher layers need from the debug bridge goes through this
//! crate: device enumeration, a hotplug event stream, shell execution, file
//! push with a final mode, port forwarding, and package metadata lookup.
//! All of it shells out to the `adb` binary; no wire protocol is spoken here.
//!
//! The per-device surface is behind [`DeviceTransport`] so the provisioning
//! and install pipelines can run against a test double.

mod client;
mod device;
mod error;
mod watcher;

pub use client::{Adb, DeviceListing};
pub use device::{AdbDevice, DeviceProperties, DeviceTransport};
pub use error::AdbError;
pub use watcher::{watch_devices, DeviceEvent};
