use crate::davis;
use crate::device;

pub const PROPERTIES: device::Properties = device::Properties {
    name: "DAVIS FX3",
    vendor_id: 0x152A,
    product_id: 0x841A,
    device_type: 0x01,
    required_logic_revision: 2940,
};

pub fn open(
    serial: Option<&str>,
    bus_number: Option<u8>,
    address: Option<u8>,
) -> Result<davis::Device, davis::Error> {
    davis::Device::open(&PROPERTIES, serial, bus_number, address)
}
