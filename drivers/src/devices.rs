use crate::davis;
use crate::usb;
use rusb::UsbContext;

pub struct ListedDevice {
    pub device_type: Type,
    pub bus_number: u8,
    pub address: u8,
    pub speed: usb::Speed,
    pub serial: Option<String>,
}

macro_rules! register {
    ($($module:ident),+ $(,)?) => {
        $(
            pub mod $module;
        )+

        paste::paste! {
            #[derive(Debug, Copy, Clone, PartialEq, Eq)]
            pub enum Type {
                $(
                    [<$module:camel>],
                )+
            }

            impl Type {
                pub fn properties(self) -> &'static crate::device::Properties {
                    match self {
                        $(
                            Type::[<$module:camel>] => &$module::PROPERTIES,
                        )+
                    }
                }

                pub fn name(self) -> &'static str {
                    self.properties().name
                }
            }

            impl std::fmt::Display for Type {
                fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $(
                            Self::[<$module:camel>] => write!(formatter, stringify!($module)),
                        )+
                    }
                }
            }

            #[derive(Debug, PartialEq, Eq)]
            pub struct ParseTypeError {
                on: String,
            }

            impl std::fmt::Display for ParseTypeError {
                fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                    write!(formatter, "unknown device type \"{}\"", self.on)
                }
            }

            impl std::str::FromStr for Type {
                type Err = ParseTypeError;

                fn from_str(string: &str) -> Result<Self, Self::Err> {
                    match string {
                        $(
                            stringify!($module) => Ok(Self::[<$module:camel>]),
                        )+
                        _ => Err(Self::Err { on: string.to_owned() }),
                    }
                }
            }

            /// Opens a specific board, or the first one found when
            /// `device_type` is `None`.
            pub fn open(
                device_type: Option<Type>,
                serial: Option<&str>,
                bus_number: Option<u8>,
                address: Option<u8>,
            ) -> Result<davis::Device, davis::Error> {
                match device_type {
                    Some(device_type) => davis::Device::open(
                        device_type.properties(),
                        serial,
                        bus_number,
                        address,
                    ),
                    None => {
                        $(
                            match davis::Device::open(
                                &$module::PROPERTIES,
                                serial,
                                bus_number,
                                address,
                            ) {
                                Ok(device) => return Ok(device),
                                Err(davis::Error::Usb(usb::Error::Device)) => (),
                                Err(error) => return Err(error),
                            }
                        )+
                        Err(match serial {
                            Some(serial) => usb::Error::Serial(serial.to_owned()).into(),
                            None => usb::Error::Device.into(),
                        })
                    }
                }
            }

            /// Enumerates every registered board on the bus. Serials are
            /// best effort (a device already opened elsewhere reports
            /// `None`).
            pub fn list_devices() -> Result<Vec<ListedDevice>, usb::Error> {
                let context = rusb::Context::new()?;
                let mut result = Vec::new();
                for device in context.devices()?.iter() {
                    let descriptor = match device.device_descriptor() {
                        Ok(descriptor) => descriptor,
                        Err(_) => continue,
                    };
                    $(
                        if descriptor.vendor_id() == $module::PROPERTIES.vendor_id
                            && descriptor.product_id() == $module::PROPERTIES.product_id
                            && descriptor.device_version().major()
                                == $module::PROPERTIES.device_type
                        {
                            let serial = device
                                .open()
                                .ok()
                                .and_then(|handle| usb::read_serial(&handle).ok());
                            result.push(ListedDevice {
                                device_type: Type::[<$module:camel>],
                                bus_number: device.bus_number(),
                                address: device.address(),
                                speed: device.speed().into(),
                                serial,
                            });
                        }
                    )+
                }
                Ok(result)
            }
        }
    }
}

register! { davis_fx2, davis_fx3 }
