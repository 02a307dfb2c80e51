//! Device discovery: enumerating attached USB devices and watching for
//! connect/disconnect events.
//!
//! The production backend ([`macos::MacosDiscovery`]) is backed by IOKit.
//! Everything above this trait — the request processor, the device monitor,
//! the server coordinator — is generic over [`Discovery`] so it can be driven
//! by [`mock::MockDiscovery`] in tests without touching real hardware.

#[cfg(target_os = "macos")]
pub mod macos;
pub mod mock;

use thiserror::Error;

use crate::device::UsbDevice;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create an IOKit matching dictionary")]
    FailedToCreateMatchingDictionary,
    #[error("IOKit call failed with code {code:#x}: {message}")]
    IoKitError { code: i32, message: String },
    #[error("device is missing required property `{0}`")]
    MissingProperty(String),
    #[error("device property `{0}` had an unexpected type")]
    InvalidPropertyType(String),
    #[error("failed to create an IOKit notification port")]
    FailedToCreateNotificationPort,
    #[error("failed to register an IOKit matching notification, code {0:#x}")]
    FailedToAddNotification(i32),
}

pub type DeviceHook = Box<dyn Fn(UsbDevice) + Send + Sync>;

/// An abstraction over the host's USB enumeration facility.
pub trait Discovery: Send + Sync {
    /// A snapshot of currently attached devices.
    fn discover_devices(&self) -> Result<Vec<UsbDevice>, Error>;

    /// Looks a device up directly by its `(busID, deviceID)` pair.
    fn get_device(&self, bus_id: &str, device_id: &str) -> Option<UsbDevice>;

    /// Begins asynchronous device-event delivery. Idempotent.
    fn start_notifications(&self) -> Result<(), Error>;

    /// Ends asynchronous device-event delivery. Safe to call when not
    /// started; never raises.
    fn stop_notifications(&self);

    /// Registers the hook invoked when a device is attached. May be called
    /// from any thread.
    fn on_device_connected(&self, hook: DeviceHook);

    /// Registers the hook invoked when a device is removed. May be called
    /// from any thread.
    fn on_device_disconnected(&self, hook: DeviceHook);
}
