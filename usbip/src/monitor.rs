//! A thin layer above [`Discovery`] that maintains a de-duplicated set of
//! known devices and republishes connect/disconnect events to a single
//! subscriber.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::device::UsbDevice;
use crate::discovery::{Discovery, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Connected(UsbDevice),
    Disconnected(UsbDevice),
}

pub type DeviceEventHook = Box<dyn Fn(DeviceEvent) + Send + Sync>;

pub struct DeviceMonitor<D: Discovery> {
    discovery: Arc<D>,
    known: Arc<Mutex<HashSet<(String, String)>>>,
    subscriber: Arc<Mutex<Option<DeviceEventHook>>>,
    running: Mutex<bool>,
}

impl<D: Discovery + 'static> DeviceMonitor<D> {
    pub fn new(discovery: Arc<D>) -> Self {
        Self {
            discovery,
            known: Arc::new(Mutex::new(HashSet::new())),
            subscriber: Arc::new(Mutex::new(None)),
            running: Mutex::new(false),
        }
    }

    pub fn on_device_event(&self, hook: DeviceEventHook) {
        *self.subscriber.lock().unwrap() = Some(hook);
    }

    /// Seeds the known-device set from a snapshot and starts receiving
    /// connect/disconnect notifications. Idempotent.
    pub fn start_monitoring(&self) -> Result<(), Error> {
        let mut running = self.running.lock().unwrap();
        if *running {
            return Ok(());
        }

        let devices = self.discovery.discover_devices()?;
        {
            let mut known = self.known.lock().unwrap();
            known.clear();
            known.extend(devices.into_iter().map(|d| (d.bus_id, d.device_id)));
        }

        let known_connected = self.known.clone();
        let subscriber_connected = self.subscriber.clone();
        self.discovery.on_device_connected(Box::new(move |device| {
            known_connected
                .lock()
                .unwrap()
                .insert((device.bus_id.clone(), device.device_id.clone()));

            if let Some(hook) = subscriber_connected.lock().unwrap().as_ref() {
                hook(DeviceEvent::Connected(device));
            }
        }));

        let known_disconnected = self.known.clone();
        let subscriber_disconnected = self.subscriber.clone();
        self.discovery
            .on_device_disconnected(Box::new(move |device| {
                known_disconnected
                    .lock()
                    .unwrap()
                    .remove(&(device.bus_id.clone(), device.device_id.clone()));

                if let Some(hook) = subscriber_disconnected.lock().unwrap().as_ref() {
                    hook(DeviceEvent::Disconnected(device));
                }
            }));

        self.discovery.start_notifications()?;
        *running = true;

        Ok(())
    }

    /// Clears the known-device set and stops notifications. Idempotent.
    pub fn stop_monitoring(&self) {
        let mut running = self.running.lock().unwrap();
        if !*running {
            return;
        }

        self.discovery.stop_notifications();
        self.known.lock().unwrap().clear();
        *running = false;
    }

    pub fn known_devices(&self) -> Vec<(String, String)> {
        self.known.lock().unwrap().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Speed;
    use crate::discovery::mock::MockDiscovery;
    use std::sync::{Arc as StdArc, Mutex as StdMutex};

    fn sample_device(bus_id: &str) -> UsbDevice {
        UsbDevice {
            bus_id: bus_id.into(),
            device_id: "1".into(),
            path: format!("IODeviceTree:/usb@{bus_id}/device@1"),
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
    fn start_monitoring_seeds_known_devices_from_discovery() {
        let discovery = Arc::new(MockDiscovery::new(vec![sample_device("1-1")]));
        let monitor = DeviceMonitor::new(discovery);

        monitor.start_monitoring().unwrap();
        assert_eq!(monitor.known_devices().len(), 1);
    }

    #[test]
    fn connect_and_disconnect_events_update_known_set_and_notify_subscriber() {
        let discovery = Arc::new(MockDiscovery::empty());
        let monitor = DeviceMonitor::new(discovery.clone());

        let events: StdArc<StdMutex<Vec<DeviceEvent>>> = StdArc::new(StdMutex::new(Vec::new()));
        let events_clone = events.clone();
        monitor.on_device_event(Box::new(move |e| events_clone.lock().unwrap().push(e)));

        monitor.start_monitoring().unwrap();
        discovery.inject_connect(sample_device("1-1"));
        assert_eq!(monitor.known_devices().len(), 1);

        discovery.inject_disconnect("1-1", "1");
        assert_eq!(monitor.known_devices().len(), 0);

        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn start_stop_cycles_are_idempotent() {
        let discovery = Arc::new(MockDiscovery::empty());
        let monitor = DeviceMonitor::new(discovery);

        monitor.start_monitoring().unwrap();
        monitor.start_monitoring().unwrap();
        monitor.stop_monitoring();
        monitor.stop_monitoring();
    }
}
