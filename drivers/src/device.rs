/// Static description of one board of the DAVIS family. The device-type
/// byte distinguishes boards sharing a VID/PID space and is carried in the
/// high byte of the USB `bcdDevice` field.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Properties {
    pub name: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_type: u8,
    pub required_logic_revision: u16,
}
