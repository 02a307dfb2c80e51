//! Wire-level USB/IP message codec.
//!
//! Every message on the wire starts with an 8-byte [`Header`]. The command
//! code in the header selects which body follows. This module only knows how
//! to turn bytes into [`Message`] values and back; it has no opinion about
//! what a server should *do* with a decoded message (see
//! [`crate::request`]).

pub mod char_buf;

use endian_codec::{DecodeBE, EncodeBE, PackedSize};
use thiserror::Error;

use crate::{
    codec::{StringCodecError, decode_fixed_string, encode_fixed_string},
    device::{Speed, UsbDevice},
};
use char_buf::CharBuf;

pub const USBIP_VERSION: u16 = 0x0111;

const PATH_LEN: usize = 256;
const BUS_ID_LEN: usize = 32;

pub const HEADER_LEN: usize = 8;
pub const DEVICE_LIST_REQUEST_LEN: usize = HEADER_LEN;
pub const DEVICE_IMPORT_REQUEST_LEN: usize = HEADER_LEN + BUS_ID_LEN;
pub const DEVICE_IMPORT_RESPONSE_LEN: usize = HEADER_LEN + 4;
pub const EXPORTED_DEVICE_LEN: usize = 312;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("buffer of {actual} bytes is too short for this message")]
    InvalidDataLength { actual: usize },
    #[error("unsupported protocol version {0:#06x}")]
    UnsupportedVersion(u16),
    #[error("unsupported command code {0:#06x}")]
    UnsupportedCommand(u16),
    #[error("message body does not match the length required by its command")]
    InvalidMessageFormat,
    #[error("a fixed-length string field held invalid data: {0}")]
    StringDecodingFailure(StringCodecError),
}

impl From<StringCodecError> for Error {
    fn from(e: StringCodecError) -> Self {
        Error::StringDecodingFailure(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    RequestDeviceList = 0x8005,
    ReplyDeviceList = 0x0005,
    RequestDeviceImport = 0x8003,
    ReplyDeviceImport = 0x0003,
}

impl Command {
    pub fn from_code(code: u16) -> Result<Self, Error> {
        match code {
            0x8005 => Ok(Self::RequestDeviceList),
            0x0005 => Ok(Self::ReplyDeviceList),
            0x8003 => Ok(Self::RequestDeviceImport),
            0x0003 => Ok(Self::ReplyDeviceImport),
            other => Err(Error::UnsupportedCommand(other)),
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
pub struct Header {
    pub version: u16,
    pub command: u16,
    pub status: u32,
}

impl Header {
    pub fn new(command: Command, status: u32) -> Self {
        Self {
            version: USBIP_VERSION,
            command: command.code(),
            status,
        }
    }
}

#[derive(Debug, Clone, PackedSize, EncodeBE, DecodeBE)]
#[repr(C)]
struct ExportedDeviceRecord {
    path: CharBuf<PATH_LEN>,
    bus_id: CharBuf<BUS_ID_LEN>,
    bus_num: u32,
    dev_num: u32,
    speed: u32,
    id_vendor: u16,
    id_product: u16,
    bcd_device: u16,
    b_device_class: u8,
    b_device_sub_class: u8,
    b_device_protocol: u8,
    b_configuration_value: u8,
    b_num_configurations: u8,
    b_num_interfaces: u8,
}

const _: () = assert!(ExportedDeviceRecord::PACKED_LEN == EXPORTED_DEVICE_LEN);

fn speed_code(speed: Speed) -> u32 {
    match speed {
        Speed::Unknown => 0,
        Speed::Low => 1_500_000,
        Speed::Full => 12_000_000,
        Speed::High => 480_000_000,
        Speed::Super => 5_000_000_000,
    }
}

fn speed_from_code(code: u32) -> Speed {
    match code {
        1_500_000 => Speed::Low,
        12_000_000 => Speed::Full,
        480_000_000 => Speed::High,
        5_000_000_000 => Speed::Super,
        _ => Speed::Unknown,
    }
}

fn encode_exported_device(device: &UsbDevice) -> Result<[u8; EXPORTED_DEVICE_LEN], Error> {
    let record = ExportedDeviceRecord {
        path: CharBuf::new_truncated(&device.path),
        bus_id: CharBuf::new(&device.bus_id)
            .ok_or(Error::StringDecodingFailure(StringCodecError::TooLong {
                len: BUS_ID_LEN,
            }))?,
        bus_num: device.bus_id.parse().unwrap_or(0),
        dev_num: device.device_id.parse().unwrap_or(0),
        speed: speed_code(device.speed),
        id_vendor: device.vendor_id,
        id_product: device.product_id,
        bcd_device: 0,
        b_device_class: device.device_class,
        b_device_sub_class: device.device_sub_class,
        b_device_protocol: device.device_protocol,
        b_configuration_value: 1,
        b_num_configurations: 1,
        b_num_interfaces: 0,
    };

    let mut buf = [0u8; EXPORTED_DEVICE_LEN];
    record.encode_as_be_bytes(&mut buf);
    Ok(buf)
}

/// Decodes the exported-device record starting at `offset` in `bytes`,
/// mirroring [`encode_exported_device`]'s field layout in reverse.
///
/// The wire format carries no string field for `deviceID`, `manufacturer`,
/// `product`, or `serial`; `deviceID` is reconstructed from `dev_num`, and the
/// rest decode to `None`.
fn decode_exported_device(bytes: &[u8], offset: usize) -> Result<UsbDevice, Error> {
    let path = decode_fixed_string(bytes, offset, PATH_LEN)?;
    let bus_id = decode_fixed_string(bytes, offset + PATH_LEN, BUS_ID_LEN)?;

    let dev_num_offset = offset + PATH_LEN + BUS_ID_LEN + 4;
    let dev_num = u32::from_be_bytes(bytes[dev_num_offset..dev_num_offset + 4].try_into().unwrap());

    let speed_offset = dev_num_offset + 4;
    let speed = u32::from_be_bytes(bytes[speed_offset..speed_offset + 4].try_into().unwrap());

    let id_vendor_offset = speed_offset + 4;
    let vendor_id =
        u16::from_be_bytes(bytes[id_vendor_offset..id_vendor_offset + 2].try_into().unwrap());

    let id_product_offset = id_vendor_offset + 2;
    let product_id =
        u16::from_be_bytes(bytes[id_product_offset..id_product_offset + 2].try_into().unwrap());

    // id_product_offset + 2 is bcd_device (2 bytes), which has no UsbDevice
    // counterpart and is skipped.
    let class_offset = id_product_offset + 2 + 2;

    Ok(UsbDevice {
        bus_id,
        device_id: dev_num.to_string(),
        path,
        vendor_id,
        product_id,
        device_class: bytes[class_offset],
        device_sub_class: bytes[class_offset + 1],
        device_protocol: bytes[class_offset + 2],
        speed: speed_from_code(speed),
        manufacturer: None,
        product: None,
        serial: None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListResponse {
    pub devices: Vec<UsbDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceImportRequest {
    pub bus_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceImportResponse {
    pub return_code: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    DeviceListRequest(DeviceListRequest),
    DeviceListResponse(DeviceListResponse),
    DeviceImportRequest(DeviceImportRequest),
    DeviceImportResponse(DeviceImportResponse),
}

/// Reads bytes `2..4` and returns the command code without consuming the
/// buffer. Fails on a too-short buffer or an unrecognized command.
pub fn peek_command(bytes: &[u8]) -> Result<Command, Error> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidDataLength {
            actual: bytes.len(),
        });
    }

    let code = u16::from_be_bytes([bytes[2], bytes[3]]);
    Command::from_code(code)
}

/// Checks length, version, and command, returning the decoded header.
pub fn validate_header(bytes: &[u8]) -> Result<Header, Error> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InvalidDataLength {
            actual: bytes.len(),
        });
    }

    let header = Header::decode_from_be_bytes(&bytes[..HEADER_LEN]);

    if header.version != USBIP_VERSION {
        return Err(Error::UnsupportedVersion(header.version));
    }

    Command::from_code(header.command)?;

    Ok(header)
}

/// Validates the header then dispatches on command to the matching decoder.
pub fn decode_any(bytes: &[u8]) -> Result<Message, Error> {
    let header = validate_header(bytes)?;
    let command = Command::from_code(header.command)?;

    match command {
        Command::RequestDeviceList => {
            if bytes.len() != DEVICE_LIST_REQUEST_LEN {
                return Err(Error::InvalidMessageFormat);
            }
            Ok(Message::DeviceListRequest(DeviceListRequest))
        }
        Command::RequestDeviceImport => {
            if bytes.len() != DEVICE_IMPORT_REQUEST_LEN {
                return Err(Error::InvalidMessageFormat);
            }
            let bus_id = decode_fixed_string(bytes, HEADER_LEN, BUS_ID_LEN)?;
            Ok(Message::DeviceImportRequest(DeviceImportRequest { bus_id }))
        }
        Command::ReplyDeviceImport => {
            if bytes.len() != DEVICE_IMPORT_RESPONSE_LEN {
                return Err(Error::InvalidMessageFormat);
            }
            let return_code = u32::from_be_bytes(
                bytes[HEADER_LEN..HEADER_LEN + 4].try_into().unwrap(),
            );
            Ok(Message::DeviceImportResponse(DeviceImportResponse {
                return_code,
            }))
        }
        Command::ReplyDeviceList => {
            if bytes.len() < HEADER_LEN + 8 {
                return Err(Error::InvalidMessageFormat);
            }

            let device_count =
                u32::from_be_bytes(bytes[HEADER_LEN..HEADER_LEN + 4].try_into().unwrap())
                    as usize;

            let expected_len = HEADER_LEN + 8 + device_count * EXPORTED_DEVICE_LEN;
            if bytes.len() != expected_len {
                return Err(Error::InvalidMessageFormat);
            }

            let records_start = HEADER_LEN + 8;
            let devices = (0..device_count)
                .map(|i| decode_exported_device(bytes, records_start + i * EXPORTED_DEVICE_LEN))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(Message::DeviceListResponse(DeviceListResponse { devices }))
        }
    }
}

/// True when [`decode_any`] would succeed, without constructing the result.
/// Never panics.
pub fn validate_integrity(bytes: &[u8]) -> bool {
    decode_any(bytes).is_ok()
}

pub fn encode_device_list_response(devices: &[UsbDevice]) -> Result<Vec<u8>, Error> {
    let mut buf =
        Vec::with_capacity(HEADER_LEN + 8 + devices.len() * EXPORTED_DEVICE_LEN);

    let mut header_bytes = [0u8; HEADER_LEN];
    Header::new(Command::ReplyDeviceList, 0).encode_as_be_bytes(&mut header_bytes);
    buf.extend_from_slice(&header_bytes);

    buf.extend_from_slice(&(devices.len() as u32).to_be_bytes());
    buf.extend_from_slice(&0u32.to_be_bytes());

    for device in devices {
        buf.extend_from_slice(&encode_exported_device(device)?);
    }

    Ok(buf)
}

pub fn encode_device_import_response(return_code: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(DEVICE_IMPORT_RESPONSE_LEN);

    let mut header_bytes = [0u8; HEADER_LEN];
    Header::new(Command::ReplyDeviceImport, 0).encode_as_be_bytes(&mut header_bytes);
    buf.extend_from_slice(&header_bytes);
    buf.extend_from_slice(&return_code.to_be_bytes());

    buf
}

pub fn encode_device_list_request() -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    Header::new(Command::RequestDeviceList, 0).encode_as_be_bytes(&mut buf);
    buf
}

pub fn encode_device_import_request(bus_id: &str) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; DEVICE_IMPORT_REQUEST_LEN];
    Header::new(Command::RequestDeviceImport, 0).encode_as_be_bytes(&mut buf[..HEADER_LEN]);
    buf[HEADER_LEN..].copy_from_slice(&encode_fixed_string(bus_id, BUS_ID_LEN)?);
    Ok(buf)
}
