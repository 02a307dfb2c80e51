pub mod claim;
pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod monitor;
pub mod net;
pub mod proto;
pub mod request;
pub mod server;

pub use device::{Speed, UsbDevice};
