//! The request processor: routes a decoded USB/IP message to device
//! discovery and builds the encoded response.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::claim::{DeviceClaim, NoopClaim};
use crate::device::split_import_id;
use crate::discovery::{self, Discovery};
use crate::proto::{self, Command, Message};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] proto::Error),
    #[error(transparent)]
    Discovery(#[from] discovery::Error),
}

pub struct RequestProcessor<D: Discovery> {
    discovery: Arc<D>,
    claim: Mutex<Box<dyn DeviceClaim>>,
    allowed_devices: Vec<String>,
    auto_bind_devices: bool,
}

impl<D: Discovery> RequestProcessor<D> {
    pub fn new(discovery: Arc<D>, allowed_devices: Vec<String>, auto_bind_devices: bool) -> Self {
        Self {
            discovery,
            claim: Mutex::new(Box::new(NoopClaim)),
            allowed_devices,
            auto_bind_devices,
        }
    }

    pub fn with_claim(mut self, claim: Box<dyn DeviceClaim>) -> Self {
        self.claim = Mutex::new(claim);
        self
    }

    fn is_allowed(&self, bus_id: &str) -> bool {
        self.allowed_devices.is_empty() || self.allowed_devices.iter().any(|b| b == bus_id)
    }

    /// Decodes `bytes`, dispatches on command, and returns the encoded
    /// response. A single bad request is this function returning `Err`; the
    /// caller (the TCP server) closes the connection but keeps serving
    /// others.
    pub fn process_request(&self, bytes: &[u8]) -> Result<Vec<u8>, Error> {
        match proto::decode_any(bytes)? {
            Message::DeviceListRequest(_) => {
                let mut devices = self.discovery.discover_devices()?;

                if !self.allowed_devices.is_empty() {
                    devices.retain(|d| self.is_allowed(&d.bus_id));
                }

                Ok(proto::encode_device_list_response(&devices)?)
            }
            Message::DeviceImportRequest(req) => {
                let Some((bus_id, device_id)) = split_import_id(&req.bus_id) else {
                    return Ok(proto::encode_device_import_response(1));
                };

                let Some(device) = self.discovery.get_device(bus_id, device_id) else {
                    return Ok(proto::encode_device_import_response(1));
                };

                if !self.is_allowed(&device.bus_id) {
                    return Ok(proto::encode_device_import_response(1));
                }

                if self.auto_bind_devices {
                    let claimed = self.claim.lock().unwrap().claim(&device.bus_id);
                    if !claimed {
                        return Ok(proto::encode_device_import_response(1));
                    }
                }

                Ok(proto::encode_device_import_response(0))
            }
            // A client is never supposed to send us a reply frame; decode_any
            // still parses them structurally, so reject them here.
            Message::DeviceListResponse(_) => Err(Error::Protocol(
                proto::Error::UnsupportedCommand(Command::ReplyDeviceList.code()),
            )),
            Message::DeviceImportResponse(_) => Err(Error::Protocol(
                proto::Error::UnsupportedCommand(Command::ReplyDeviceImport.code()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Speed, UsbDevice};
    use crate::discovery::mock::MockDiscovery;
    use crate::proto::{decode_any, encode_device_import_request, encode_device_list_request};

    fn sample_device() -> UsbDevice {
        UsbDevice {
            bus_id: "1-1".into(),
            device_id: "1.0".into(),
            path: "IODeviceTree:/usb@1/device@1".into(),
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_class: 9,
            device_sub_class: 0,
            device_protocol: 0,
            speed: Speed::High,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    #[test]
    fn list_with_no_devices_returns_empty_reply() {
        let discovery = Arc::new(MockDiscovery::empty());
        let processor = RequestProcessor::new(discovery, Vec::new(), false);

        let response = processor
            .process_request(&encode_device_list_request())
            .unwrap();

        assert_eq!(response.len(), 16);
    }

    #[test]
    fn import_of_existing_device_succeeds() {
        let discovery = Arc::new(MockDiscovery::new(vec![sample_device()]));
        let processor = RequestProcessor::new(discovery, Vec::new(), false);

        let request = encode_device_import_request("1-1:1.0").unwrap();
        let response = processor.process_request(&request).unwrap();

        match decode_any(&response).unwrap() {
            Message::DeviceImportResponse(r) => assert_eq!(r.return_code, 0),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn import_of_missing_device_fails_gracefully() {
        let discovery = Arc::new(MockDiscovery::empty());
        let processor = RequestProcessor::new(discovery, Vec::new(), false);

        let request = encode_device_import_request("1-1:1.0").unwrap();
        let response = processor.process_request(&request).unwrap();

        match decode_any(&response).unwrap() {
            Message::DeviceImportResponse(r) => assert_eq!(r.return_code, 1),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn allowed_devices_whitelist_filters_device_list() {
        let discovery = Arc::new(MockDiscovery::new(vec![sample_device()]));
        let processor = RequestProcessor::new(discovery, vec!["9-9".into()], false);

        let response = processor
            .process_request(&encode_device_list_request())
            .unwrap();

        assert_eq!(response.len(), 16);
    }

    #[test]
    fn allowed_devices_whitelist_rejects_import_of_unlisted_device() {
        let discovery = Arc::new(MockDiscovery::new(vec![sample_device()]));
        let processor = RequestProcessor::new(discovery, vec!["9-9".into()], false);

        let request = encode_device_import_request("1-1:1.0").unwrap();
        let response = processor.process_request(&request).unwrap();

        match decode_any(&response).unwrap() {
            Message::DeviceImportResponse(r) => assert_eq!(r.return_code, 1),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn reply_frame_arriving_as_a_request_is_rejected() {
        let discovery = Arc::new(MockDiscovery::empty());
        let processor = RequestProcessor::new(discovery, Vec::new(), false);

        let bytes = proto::encode_device_import_response(0);
        assert!(processor.process_request(&bytes).is_err());
    }

    #[test]
    fn malformed_header_propagates_as_an_error() {
        let discovery = Arc::new(MockDiscovery::empty());
        let processor = RequestProcessor::new(discovery, Vec::new(), false);

        let bytes = [0xffu8; 8];
        assert!(processor.process_request(&bytes).is_err());
    }
}
