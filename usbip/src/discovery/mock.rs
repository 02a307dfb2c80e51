//! In-memory [`Discovery`] backend used by tests and on non-macOS hosts.

use std::sync::Mutex;

use super::{DeviceHook, Discovery, Error};
use crate::device::UsbDevice;

#[derive(Default)]
struct Hooks {
    connected: Option<DeviceHook>,
    disconnected: Option<DeviceHook>,
}

/// A `Vec<UsbDevice>` behind a mutex with explicit `inject_connect` /
/// `inject_disconnect` calls that synchronously fire the registered hooks.
pub struct MockDiscovery {
    devices: Mutex<Vec<UsbDevice>>,
    hooks: Mutex<Hooks>,
    notifying: Mutex<bool>,
}

impl MockDiscovery {
    pub fn new(devices: Vec<UsbDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            hooks: Mutex::new(Hooks::default()),
            notifying: Mutex::new(false),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Adds a device to the set and, if notifications are started, invokes
    /// the connected hook synchronously.
    pub fn inject_connect(&self, device: UsbDevice) {
        self.devices.lock().unwrap().push(device.clone());

        if *self.notifying.lock().unwrap() {
            if let Some(hook) = self.hooks.lock().unwrap().connected.as_ref() {
                hook(device);
            }
        }
    }

    /// Removes a device by `(busID, deviceID)` and, if notifications are
    /// started, invokes the disconnected hook synchronously.
    pub fn inject_disconnect(&self, bus_id: &str, device_id: &str) {
        let removed = {
            let mut devices = self.devices.lock().unwrap();
            let index = devices
                .iter()
                .position(|d| d.bus_id == bus_id && d.device_id == device_id);

            index.map(|i| devices.remove(i))
        };

        let Some(device) = removed else { return };

        if *self.notifying.lock().unwrap() {
            if let Some(hook) = self.hooks.lock().unwrap().disconnected.as_ref() {
                hook(device);
            }
        }
    }
}

impl Discovery for MockDiscovery {
    fn discover_devices(&self) -> Result<Vec<UsbDevice>, Error> {
        Ok(self.devices.lock().unwrap().clone())
    }

    fn get_device(&self, bus_id: &str, device_id: &str) -> Option<UsbDevice> {
        if bus_id.is_empty() || device_id.is_empty() {
            return None;
        }

        self.devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.bus_id == bus_id && d.device_id == device_id)
            .cloned()
    }

    fn start_notifications(&self) -> Result<(), Error> {
        *self.notifying.lock().unwrap() = true;
        Ok(())
    }

    fn stop_notifications(&self) {
        *self.notifying.lock().unwrap() = false;
    }

    fn on_device_connected(&self, hook: DeviceHook) {
        self.hooks.lock().unwrap().connected = Some(hook);
    }

    fn on_device_disconnected(&self, hook: DeviceHook) {
        self.hooks.lock().unwrap().disconnected = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Speed;
    use std::sync::{Arc, Mutex as StdMutex};

    fn sample_device(bus_id: &str, device_id: &str) -> UsbDevice {
        UsbDevice {
            bus_id: bus_id.into(),
            device_id: device_id.into(),
            path: format!("IODeviceTree:/usb@{bus_id}/device@{device_id}"),
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_class: 0,
            device_sub_class: 0,
            device_protocol: 0,
            speed: Speed::High,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn discover_devices_on_empty_set_yields_no_errors() {
        let discovery = MockDiscovery::empty();
        assert_eq!(discovery.discover_devices().unwrap(), vec![]);
    }

    #[test]
    fn get_device_matches_discover_devices_snapshot() {
        let device = sample_device("1-1", "1");
        let discovery = MockDiscovery::new(vec![device.clone()]);

        let snapshot = discovery.discover_devices().unwrap();
        let looked_up = discovery.get_device("1-1", "1").unwrap();

        assert_eq!(snapshot[0], looked_up);
    }

    #[test]
    fn inject_connect_fires_hook_only_once_notifications_started() {
        let discovery = MockDiscovery::empty();
        let seen: Arc<StdMutex<Vec<UsbDevice>>> = Arc::new(StdMutex::new(Vec::new()));

        let seen_clone = seen.clone();
        discovery.on_device_connected(Box::new(move |d| seen_clone.lock().unwrap().push(d)));

        discovery.inject_connect(sample_device("1-1", "1"));
        assert!(seen.lock().unwrap().is_empty());

        discovery.start_notifications().unwrap();
        discovery.inject_connect(sample_device("1-2", "1"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
