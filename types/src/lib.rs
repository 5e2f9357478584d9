#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DvsPolarity {
    Off = 0,
    On = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DvsEvent {
    pub t: u32,
    pub x: u16,
    pub y: u16,
    pub polarity: DvsPolarity,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpecialEventKind {
    TimestampReset,
    ExternalInputFallingEdge,
    ExternalInputRisingEdge,
    ExternalInputPulse,
    DvsRowOnly,
}

/// Out-of-band marker. `data` carries the orphaned row address for
/// `DvsRowOnly` and is zero otherwise.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SpecialEvent {
    pub t: u32,
    pub kind: SpecialEventKind,
    pub data: u16,
}

/// One readout of the active pixel sensor. Pixels are 16-bit grayscale,
/// row-major, `width * height * channels` samples, left-justified to the
/// full 16-bit range.
///
/// A frame whose column counts did not line up at frame end is still
/// emitted, with `valid` cleared.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEvent {
    pub t_start_of_frame: u32,
    pub t_end_of_frame: u32,
    pub t_start_of_exposure: u32,
    pub t_end_of_exposure: u32,
    pub width: u16,
    pub height: u16,
    pub channels: u8,
    pub valid: bool,
    pub pixels: Vec<u16>,
}

impl FrameEvent {
    pub fn new(width: u16, height: u16, channels: u8) -> Self {
        Self {
            t_start_of_frame: 0,
            t_end_of_frame: 0,
            t_start_of_exposure: 0,
            t_end_of_exposure: 0,
            width,
            height,
            channels,
            valid: false,
            pixels: vec![0; width as usize * height as usize * channels as usize],
        }
    }

    pub fn pixel(&self, x: u16, y: u16) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }
}

/// Six-axis inertial sample. Acceleration in g, angular rate in °/s,
/// temperature in °C.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Imu6Event {
    pub t: u32,
    pub accel_x: f32,
    pub accel_y: f32,
    pub accel_z: f32,
    pub gyro_x: f32,
    pub gyro_y: f32,
    pub gyro_z: f32,
    pub temperature: f32,
}

/// The unit exchanged with the consumer: at most one committed packet of
/// each event type. Events within a packet are in device order; ordering
/// across packets is only given by the per-event timestamps.
#[derive(Debug, Default)]
pub struct PacketContainer {
    pub polarity: Option<Vec<DvsEvent>>,
    pub special: Option<Vec<SpecialEvent>>,
    pub frames: Option<Vec<FrameEvent>>,
    pub imu6: Option<Vec<Imu6Event>>,
}

impl PacketContainer {
    pub fn is_empty(&self) -> bool {
        self.polarity.is_none()
            && self.special.is_none()
            && self.frames.is_none()
            && self.imu6.is_none()
    }

    pub fn event_count(&self) -> usize {
        self.polarity.as_ref().map_or(0, Vec::len)
            + self.special.as_ref().map_or(0, Vec::len)
            + self.frames.as_ref().map_or(0, Vec::len)
            + self.imu6.as_ref().map_or(0, Vec::len)
    }
}
