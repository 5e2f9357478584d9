pub mod configuration;
pub mod davis;
pub mod decoder;
pub mod device;
pub mod devices;
pub mod error;
pub mod exchange;
pub mod usb;

pub use crate::davis::Device;
pub use crate::davis::Error;
pub use crate::davis::Info;
pub use crate::devices::list_devices;
pub use crate::devices::open;
pub use crate::devices::Type;
pub use crate::usb::Configuration as UsbConfiguration;

pub use bincode;
pub use davis_types as types;
pub use libc;
pub use libusb1_sys;
pub use rusb;
