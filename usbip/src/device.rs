//! The canonical in-process USB device record.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// USB signaling speed, as reported on the wire.
///
/// Ordinal values are stable and part of the external contract: anything the
/// platform backend doesn't recognize maps to [`Speed::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Speed {
    Unknown = 0,
    Low = 1,
    Full = 2,
    High = 3,
    Super = 4,
}

impl Speed {
    pub fn from_platform_code(code: u32) -> Self {
        match code {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 | 5 => Self::Super,
            _ => Self::Unknown,
        }
    }
}

/// A normalized USB device, independent of the platform that discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    pub bus_id: String,
    pub device_id: String,
    /// Path to this device in the host's device tree, e.g. an IOKit registry
    /// entry path on macOS. Empty when the backend couldn't resolve one.
    pub path: String,

    pub vendor_id: u16,
    pub product_id: u16,
    pub device_class: u8,
    pub device_sub_class: u8,
    pub device_protocol: u8,
    pub speed: Speed,

    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

impl UsbDevice {
    /// A stable `"busID:deviceID"` identifier, matching the form device-import
    /// requests carry on the wire.
    pub fn import_id(&self) -> String {
        format!("{}:{}", self.bus_id, self.device_id)
    }
}

/// Splits `"{busID}:{deviceID}"` into its two non-empty halves, as used by a
/// device-import request body.
pub fn split_import_id(raw: &str) -> Option<(&str, &str)> {
    let (bus_id, device_id) = raw.split_once(':')?;

    if bus_id.is_empty() || device_id.is_empty() {
        return None;
    }

    Some((bus_id, device_id))
}

/// Derives the stable `(busID, deviceID)` pair for a platform `locationID`.
///
/// The high byte of a macOS IOKit `locationID` names the USB controller/root
/// hub port a device is attached under; everything else about the location
/// path is specific to a particular hub topology, so we use it only to assign
/// a small per-bus counter. Each distinct `locationID` is memoized the first
/// time it's seen, so repeated enumeration of the same physical device always
/// yields the same `deviceID` — re-plugging a device into a different port
/// (and hence a new `locationID`) is the only thing that changes its identity.
pub fn derive_bus_device_id(location_id: u32) -> (String, String) {
    static REGISTRY: Mutex<Option<(HashMap<u32, u32>, HashMap<u32, String>)>> = Mutex::new(None);

    let bus = location_id >> 24;
    let bus_id = bus.to_string();

    let mut registry = REGISTRY.lock().unwrap();
    let (bus_counters, assigned) = registry.get_or_insert_with(Default::default);

    let device_id = assigned
        .entry(location_id)
        .or_insert_with(|| {
            let counter = bus_counters.entry(bus).or_insert(0);
            *counter += 1;
            counter.to_string()
        })
        .clone();

    (bus_id, device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecognized_speed_codes_map_to_unknown() {
        assert_eq!(Speed::from_platform_code(0), Speed::Unknown);
        assert_eq!(Speed::from_platform_code(255), Speed::Unknown);
        assert_eq!(Speed::from_platform_code(3), Speed::High);
    }

    #[test]
    fn split_import_id_requires_both_halves_nonempty() {
        assert_eq!(split_import_id("1-1:1.0"), Some(("1-1", "1.0")));
        assert_eq!(split_import_id(":1.0"), None);
        assert_eq!(split_import_id("1-1:"), None);
        assert_eq!(split_import_id("no-colon"), None);
    }

    #[test]
    fn bus_id_is_derived_from_the_high_byte_of_location_id() {
        let (bus_id, _) = derive_bus_device_id(0x0100_0000);
        assert_eq!(bus_id, "1");

        let (bus_id, _) = derive_bus_device_id(0x0200_0000);
        assert_eq!(bus_id, "2");
    }
}
