//! IOKit-backed device discovery for macOS.
//!
//! Enumeration keys off a matching dictionary for the `IOUSBHostDevice`
//! service class. Device-change notifications are delivered by a background
//! thread that polls [`enumerate`] on an interval and diffs the result
//! against the last-seen set, firing the connect/disconnect hooks for
//! whatever changed. IOKit can deliver these as true asynchronous
//! notifications via `IONotificationPortCreate` and a `CFRunLoop` source, but
//! polling is simpler to reason about and gives the same observable
//! behavior to [`Discovery`] callers.

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use core_foundation::base::{CFType, TCFType};
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use core_foundation_sys::base::{CFAllocatorRef, kCFAllocatorDefault};
use io_kit_sys::keys::kIOMasterPortDefault;
use io_kit_sys::ret::{kIOReturnSuccess, IOReturn};
use io_kit_sys::types::{io_iterator_t, io_object_t, io_service_t};
use io_kit_sys::{
    IOIteratorNext, IOObjectRelease, IORegistryEntryCreateCFProperties, IORegistryEntryGetPath,
    IOServiceGetMatchingServices, IOServiceMatching,
};
use tracing::debug;

use super::{DeviceHook, Discovery, Error};
use crate::device::{Speed, UsbDevice, derive_bus_device_id};

const USB_DEVICE_CLASS: &str = "IOUSBHostDevice";
const SERVICE_PLANE: &str = "IOService";
/// IOKit registry paths are NUL-terminated C strings; 512 bytes comfortably
/// fits any path `IORegistryEntryGetPath` produces for a real device tree.
const REGISTRY_PATH_BUFFER_LEN: usize = 512;
const NOTIFICATION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// RAII guard around an IOKit object handle (`io_iterator_t`, `io_service_t`,
/// ...). Always releases on drop, including on error paths.
struct IoObject(io_object_t);

impl IoObject {
    fn new(handle: io_object_t) -> Self {
        Self(handle)
    }

    fn get(&self) -> io_object_t {
        self.0
    }
}

impl Drop for IoObject {
    fn drop(&mut self) {
        if self.0 != 0 {
            unsafe {
                IOObjectRelease(self.0);
            }
        }
    }
}

fn matching_dictionary() -> Result<*mut std::os::raw::c_void, Error> {
    let class = CString::new(USB_DEVICE_CLASS).unwrap();
    let dict = unsafe { IOServiceMatching(class.as_ptr()) };

    if dict.is_null() {
        return Err(Error::FailedToCreateMatchingDictionary);
    }

    Ok(dict as *mut _)
}

fn get_device_iterator() -> Result<IoObject, Error> {
    let matching = matching_dictionary()?;

    let mut iterator: io_iterator_t = 0;
    let rc: IOReturn = unsafe {
        IOServiceGetMatchingServices(kIOMasterPortDefault, matching as *mut _, &mut iterator)
    };

    if rc != kIOReturnSuccess {
        return Err(Error::IoKitError {
            code: rc,
            message: "IOServiceGetMatchingServices failed".into(),
        });
    }

    Ok(IoObject::new(iterator))
}

fn numeric_property(props: &CFDictionary<CFString, CFType>, key: &str) -> Option<i64> {
    let key = CFString::new(key);
    props
        .find(&key)
        .and_then(|v| v.downcast::<CFNumber>())
        .and_then(|n| n.to_i64())
}

fn string_property(props: &CFDictionary<CFString, CFType>, key: &str) -> Option<String> {
    let key = CFString::new(key);
    props
        .find(&key)
        .and_then(|v| v.downcast::<CFString>())
        .map(|s| s.to_string())
}

/// Resolves `service`'s path in the IOService registry plane, e.g.
/// `IOService:/AppleACPIPlatformExpert/.../IOUSBHostDevice@14100000`. Returns
/// an empty string when IOKit can't produce one.
fn registry_path(service: io_service_t) -> String {
    let plane = CString::new(SERVICE_PLANE).unwrap();
    let mut buf = [0 as c_char; REGISTRY_PATH_BUFFER_LEN];

    let rc = unsafe { IORegistryEntryGetPath(service, plane.as_ptr(), buf.as_mut_ptr()) };
    if rc != kIOReturnSuccess {
        return String::new();
    }

    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_str()
        .map(str::to_owned)
        .unwrap_or_default()
}

/// Reads the IOKit properties for `service` and produces a [`UsbDevice`],
/// skipping devices missing `vendorID`/`productID`.
fn extract_device(service: io_service_t) -> Option<UsbDevice> {
    let mut props_ref: core_foundation_sys::dictionary::CFMutableDictionaryRef = ptr::null_mut();

    let rc = unsafe {
        IORegistryEntryCreateCFProperties(
            service,
            &mut props_ref,
            kCFAllocatorDefault as CFAllocatorRef,
            0,
        )
    };

    if rc != kIOReturnSuccess || props_ref.is_null() {
        return None;
    }

    let props: CFDictionary<CFString, CFType> =
        unsafe { CFDictionary::wrap_under_create_rule(props_ref as _) };

    let Some(vendor_id) = numeric_property(&props, "idVendor") else {
        debug!("skipping device missing idVendor");
        return None;
    };
    let Some(product_id) = numeric_property(&props, "idProduct") else {
        debug!("skipping device missing idProduct");
        return None;
    };

    let location_id = numeric_property(&props, "locationID").unwrap_or(0) as u32;
    let (bus_id, device_id) = derive_bus_device_id(location_id);

    let speed = numeric_property(&props, "Device Speed")
        .map(|s| Speed::from_platform_code(s as u32))
        .unwrap_or(Speed::Unknown);

    Some(UsbDevice {
        bus_id,
        device_id,
        path: registry_path(service),
        vendor_id: vendor_id as u16,
        product_id: product_id as u16,
        device_class: numeric_property(&props, "bDeviceClass").unwrap_or(0) as u8,
        device_sub_class: numeric_property(&props, "bDeviceSubClass").unwrap_or(0) as u8,
        device_protocol: numeric_property(&props, "bDeviceProtocol").unwrap_or(0) as u8,
        speed,
        manufacturer: string_property(&props, "USB Vendor Name"),
        product: string_property(&props, "USB Product Name"),
        serial: string_property(&props, "USB Serial Number"),
    })
}

fn enumerate() -> Result<Vec<UsbDevice>, Error> {
    let iterator = get_device_iterator()?;
    let mut devices = Vec::new();

    loop {
        let service = unsafe { IOIteratorNext(iterator.get()) };
        if service == 0 {
            break;
        }

        let guard = IoObject::new(service);
        if let Some(device) = extract_device(guard.get()) {
            devices.push(device);
        }
    }

    Ok(devices)
}

#[derive(Default)]
struct Hooks {
    connected: Option<DeviceHook>,
    disconnected: Option<DeviceHook>,
}

struct NotificationThread {
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// Production [`Discovery`] backend for macOS, backed by IOKit.
pub struct MacosDiscovery {
    hooks: Arc<Mutex<Hooks>>,
    notification: Mutex<Option<NotificationThread>>,
}

/// Key used to recognize the same physical device across two enumerations.
type DeviceKey = (String, String);

fn device_key(device: &UsbDevice) -> DeviceKey {
    (device.bus_id.clone(), device.device_id.clone())
}

impl MacosDiscovery {
    pub fn new() -> Self {
        Self {
            hooks: Arc::new(Mutex::new(Hooks::default())),
            notification: Mutex::new(None),
        }
    }
}

impl Default for MacosDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery for MacosDiscovery {
    fn discover_devices(&self) -> Result<Vec<UsbDevice>, Error> {
        enumerate()
    }

    fn get_device(&self, bus_id: &str, device_id: &str) -> Option<UsbDevice> {
        if bus_id.is_empty() || device_id.is_empty() {
            return None;
        }

        if let Ok(devices) = enumerate() {
            return devices
                .into_iter()
                .find(|d| d.bus_id == bus_id && d.device_id == device_id);
        }

        None
    }

    fn start_notifications(&self) -> Result<(), Error> {
        let mut notification = self.notification.lock().unwrap();
        if notification.is_some() {
            return Ok(());
        }

        let mut known: HashMap<DeviceKey, UsbDevice> = enumerate()?
            .into_iter()
            .map(|d| (device_key(&d), d))
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let hooks = self.hooks.clone();

        let handle = std::thread::spawn(move || {
            while !stop_clone.load(Ordering::Relaxed) {
                std::thread::sleep(NOTIFICATION_POLL_INTERVAL);
                if stop_clone.load(Ordering::Relaxed) {
                    break;
                }

                let Ok(current) = enumerate() else {
                    continue;
                };

                let mut seen = HashSet::with_capacity(current.len());
                for device in current {
                    let key = device_key(&device);
                    seen.insert(key.clone());

                    if !known.contains_key(&key) {
                        known.insert(key, device.clone());
                        if let Some(hook) = hooks.lock().unwrap().connected.as_ref() {
                            hook(device);
                        }
                    }
                }

                let gone: Vec<DeviceKey> =
                    known.keys().filter(|k| !seen.contains(*k)).cloned().collect();
                for key in gone {
                    if let Some(device) = known.remove(&key) {
                        if let Some(hook) = hooks.lock().unwrap().disconnected.as_ref() {
                            hook(device);
                        }
                    }
                }
            }
        });

        *notification = Some(NotificationThread {
            handle: Some(handle),
            stop,
        });

        Ok(())
    }

    fn stop_notifications(&self) {
        let mut notification = self.notification.lock().unwrap();
        if let Some(mut n) = notification.take() {
            n.stop.store(true, Ordering::Relaxed);
            if let Some(handle) = n.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn on_device_connected(&self, hook: DeviceHook) {
        self.hooks.lock().unwrap().connected = Some(hook);
    }

    fn on_device_disconnected(&self, hook: DeviceHook) {
        self.hooks.lock().unwrap().disconnected = Some(hook);
    }
}

impl Drop for MacosDiscovery {
    fn drop(&mut self) {
        self.stop_notifications();
    }
}

#[cfg(all(test, target_os = "macos"))]
mod tests {
    use super::*;

    #[test]
    fn stop_notifications_before_start_does_not_panic() {
        let discovery = MacosDiscovery::new();
        discovery.stop_notifications();
    }

    #[test]
    fn start_stop_cycles_are_idempotent() {
        let discovery = MacosDiscovery::new();
        discovery.start_notifications().unwrap();
        discovery.start_notifications().unwrap();
        discovery.stop_notifications();
        discovery.stop_notifications();
    }
}
