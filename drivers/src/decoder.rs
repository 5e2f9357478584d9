use crate::configuration;
use crate::exchange;
use davis_types::{
    DvsEvent, DvsPolarity, FrameEvent, Imu6Event, PacketContainer, SpecialEvent, SpecialEventKind,
};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// ADC resolution of the APS readout; pixels are left-justified to 16 bits.
pub const ADC_DEPTH: u16 = 10;

/// Data bytes in one IMU6 record (accel XYZ, temperature, gyro XYZ,
/// big-endian 16-bit each).
const IMU_BYTES: u8 = 14;

/// `imu_count` state: slot 0 is consumed by the scale-config marker, the
/// record bytes occupy slots 1..=IMU_BYTES.
const IMU_DONE: u8 = IMU_BYTES + 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Chip {
    Davis240A,
    Davis240B,
    Davis240C,
    Davis128,
    Davis346A,
    Davis346B,
    Davis640,
    Davis208,
    Davis346C,
    DavisRgb,
    Unknown(u16),
}

impl Chip {
    pub fn from_id(id: u16) -> Self {
        match id {
            0 => Self::Davis240A,
            1 => Self::Davis240B,
            2 => Self::Davis240C,
            3 => Self::Davis128,
            4 => Self::Davis346A,
            5 => Self::Davis346B,
            6 => Self::Davis640,
            7 => Self::Davis208,
            8 => Self::Davis346C,
            9 => Self::DavisRgb,
            id => Self::Unknown(id),
        }
    }
}

/// APS column readout phase. Kept as an enum rather than a flag so that
/// further phases can be added without touching the counters' layout.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Readout {
    Reset = 0,
    Signal = 1,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RgbOffsetDirection {
    Increasing,
    Decreasing,
}

/// Sensor geometry as reported by the device. Sizes are the raw (pre
/// orientation) values; inversion and flips are applied at event emission.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub dvs_size_x: u16,
    pub dvs_size_y: u16,
    pub dvs_invert_xy: bool,
    pub aps_size_x: u16,
    pub aps_size_y: u16,
    pub aps_invert_xy: bool,
    pub aps_flip_x: bool,
    pub aps_flip_y: bool,
    pub aps_window0_start_x: u16,
    pub aps_window0_start_y: u16,
    pub aps_window0_size_x: u16,
    pub aps_window0_size_y: u16,
    pub aps_channels: u8,
    pub chip: Chip,
}

/// Shutter and scale state read from the device registers when streaming
/// starts, seeding the decoder until the stream carries its own markers.
#[derive(Debug, Clone, Copy)]
pub struct Defaults {
    pub global_shutter: bool,
    pub reset_read: bool,
    pub accel_scale: f32,
    pub gyro_scale: f32,
}

pub fn accel_scale_from_config(config: u8) -> f32 {
    // 0: ±2 g (16384 LSB/g) .. 3: ±16 g (2048 LSB/g)
    65536.0 / (4 * (1u32 << config)) as f32
}

pub fn gyro_scale_from_config(config: u8) -> f32 {
    // 0: ±250 °/s (131 LSB/°/s) .. 3: ±2000 °/s (16.4 LSB/°/s)
    65536.0 / (500 * (1u32 << config)) as f32
}

struct Pending<T> {
    events: Vec<T>,
    capacity: usize,
}

impl<T> Pending<T> {
    fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    fn ready(&self, interval: u32, t: impl Fn(&T) -> u32) -> bool {
        if self.events.len() >= self.capacity {
            return true;
        }
        if self.events.len() > 1 {
            let first = t(&self.events[0]);
            // unwrap: len > 1
            let last = t(self.events.last().unwrap());
            return last.saturating_sub(first) >= interval;
        }
        false
    }
}

/// Wire translator. Consumes the raw bulk payloads, reconstructs the
/// 32-bit timeline, assembles the four event streams, and hands committed
/// packet containers to the exchange buffer.
///
/// Runs entirely on the acquisition thread; steady-state decoding does not
/// allocate, packet memory is only allocated at commit points and frame
/// pixel buffers at frame starts.
pub struct Decoder {
    geometry: Geometry,
    configuration: Arc<configuration::Configuration>,
    exchange: Arc<exchange::Buffer>,
    notify_increase: Arc<dyn Fn() + Send + Sync>,

    wrap_add: u32,
    current_timestamp: i32,
    last_timestamp: i32,

    dvs_timestamp: i32,
    dvs_got_y: bool,
    dvs_last_y: u16,

    aps_readout: Readout,
    aps_count_x: [u16; 2],
    aps_count_y: [u16; 2],
    aps_global_shutter: bool,
    aps_reset_read: bool,
    aps_ignore_events: bool,
    aps_rgb_pixel_offset: i16,
    aps_rgb_offset_direction: RgbOffsetDirection,
    // Staging buffer for correlated double sampling, full sensor size so
    // reset reads can be reused across windowed frames.
    aps_reset_frame: Vec<u16>,
    current_frame: Option<FrameEvent>,

    imu_count: u8,
    imu_tmp_data: u8,
    imu_ignore_events: bool,
    imu_accel_scale: f32,
    imu_gyro_scale: f32,
    current_imu6: Imu6Event,

    polarity: Pending<DvsEvent>,
    special: Pending<SpecialEvent>,
    frames: Pending<FrameEvent>,
    imu6: Pending<Imu6Event>,
}

impl Decoder {
    pub fn new(
        geometry: Geometry,
        defaults: Defaults,
        configuration: Arc<configuration::Configuration>,
        exchange: Arc<exchange::Buffer>,
        notify_increase: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        let reset_frame_length = geometry.aps_size_x as usize
            * geometry.aps_size_y as usize
            * geometry.aps_channels as usize;
        let polarity_capacity =
            configuration.max_polarity_packet_size.load(Ordering::Relaxed) as usize;
        let special_capacity =
            configuration.max_special_packet_size.load(Ordering::Relaxed) as usize;
        let frame_capacity = configuration.max_frame_packet_size.load(Ordering::Relaxed) as usize;
        let imu6_capacity = configuration.max_imu6_packet_size.load(Ordering::Relaxed) as usize;
        Self {
            geometry,
            configuration,
            exchange,
            notify_increase,
            wrap_add: 0,
            current_timestamp: 0,
            last_timestamp: 0,
            dvs_timestamp: 0,
            dvs_got_y: false,
            dvs_last_y: 0,
            aps_readout: Readout::Reset,
            aps_count_x: [0; 2],
            aps_count_y: [0; 2],
            aps_global_shutter: defaults.global_shutter,
            aps_reset_read: defaults.reset_read,
            aps_ignore_events: false,
            aps_rgb_pixel_offset: 1,
            aps_rgb_offset_direction: RgbOffsetDirection::Increasing,
            aps_reset_frame: vec![0; reset_frame_length],
            current_frame: None,
            imu_count: 0,
            imu_tmp_data: 0,
            imu_ignore_events: false,
            imu_accel_scale: defaults.accel_scale,
            imu_gyro_scale: defaults.gyro_scale,
            current_imu6: Imu6Event::default(),
            polarity: Pending::new(polarity_capacity),
            special: Pending::new(special_capacity),
            frames: Pending::new(frame_capacity),
            imu6: Pending::new(imu6_capacity),
        }
    }

    pub fn current_timestamp(&self) -> i32 {
        self.current_timestamp
    }

    pub fn pending_polarity(&self) -> &[DvsEvent] {
        &self.polarity.events
    }

    pub fn pending_special(&self) -> &[SpecialEvent] {
        &self.special.events
    }

    pub fn pending_frames(&self) -> &[FrameEvent] {
        &self.frames.events
    }

    pub fn pending_imu6(&self) -> &[Imu6Event] {
        &self.imu6.events
    }

    /// Translates one bulk payload. Words are 16-bit little-endian; an odd
    /// trailing byte cannot belong to any event and is discarded.
    pub fn translate(&mut self, buffer: &[u8]) {
        let mut length = buffer.len();
        if length % 2 != 0 {
            warn!("{length} bytes received via USB, which is not a multiple of two");
            length -= 1;
        }
        for index in (0..length).step_by(2) {
            let word = u16::from_le_bytes([buffer[index], buffer[index + 1]]);
            if word & 0x8000 != 0 {
                // Timestamp word, 15-bit tick in µs over the wrap base.
                self.last_timestamp = self.current_timestamp;
                self.current_timestamp = self.wrap_add.wrapping_add(u32::from(word & 0x7FFF)) as i32;
                self.check_monotonic_timestamp();
            } else {
                let code = (word >> 12) & 0x07;
                let data = word & 0x0FFF;
                match code {
                    0 => self.special_event(data),
                    1 => self.dvs_y_address(data),
                    2 | 3 => self.dvs_x_address(data, code == 3),
                    4 => self.aps_sample(data),
                    5 => self.misc8(data),
                    7 => self.timestamp_wrap(data),
                    _ => error!("caught event with code {code} that cannot be handled"),
                }
            }
            self.commit_ready_packets();
        }
    }

    fn check_monotonic_timestamp(&self) {
        if self.current_timestamp <= self.last_timestamp {
            error!(
                "non strictly-monotonic timestamp detected: last={}, current={}, difference={}",
                self.last_timestamp,
                self.current_timestamp,
                self.last_timestamp - self.current_timestamp,
            );
        }
    }

    fn timestamp_wrap(&mut self, data: u16) {
        // Each wrap is 2^15 µs, multiplied by the wrap counter in the data
        // field.
        self.wrap_add = self.wrap_add.wrapping_add(0x8000 * u32::from(data));
        self.last_timestamp = self.current_timestamp;
        self.current_timestamp = self.wrap_add as i32;
        self.check_monotonic_timestamp();
        debug!("timestamp wrap with multiplier {data}");
    }

    fn special_event(&mut self, data: u16) {
        match data {
            0 => error!("caught special reserved event"),
            1 => self.timestamp_reset(),
            2 => self.push_special(SpecialEventKind::ExternalInputFallingEdge, 0),
            3 => self.push_special(SpecialEventKind::ExternalInputRisingEdge, 0),
            4 => self.push_special(SpecialEventKind::ExternalInputPulse, 0),
            5 => {
                debug!("IMU6 start");
                self.imu_ignore_events = false;
                self.imu_count = 0;
                self.current_imu6 = Imu6Event {
                    t: self.current_timestamp as u32,
                    ..Imu6Event::default()
                };
            }
            7 => {
                debug!("IMU6 end");
                if self.imu_ignore_events {
                    return;
                }
                if self.imu_count == IMU_DONE {
                    self.imu6.events.push(self.current_imu6);
                } else {
                    info!(
                        "IMU6 end: sample count {} does not match a complete record, discarding",
                        self.imu_count,
                    );
                }
            }
            8 => self.aps_frame_start(true, true),
            9 => self.aps_frame_start(false, true),
            10 => self.aps_frame_end(),
            11 => self.aps_column_start(Readout::Reset),
            12 => self.aps_column_start(Readout::Signal),
            13 => self.aps_column_end(),
            14 => self.aps_frame_start(true, false),
            15 => self.aps_frame_start(false, false),
            16..=31 => self.imu_scale_config(data),
            _ => error!("caught special event {data} that cannot be handled"),
        }
    }

    /// The reset marker must reach the consumer and must not share a
    /// container with pre-reset events: leftovers are flushed first
    /// (best effort), then the marker is committed alone, retried until
    /// the exchange buffer accepts it.
    fn timestamp_reset(&mut self) {
        self.wrap_add = 0;
        self.last_timestamp = 0;
        self.current_timestamp = 0;
        self.dvs_timestamp = 0;
        info!("timestamp reset event received");
        self.flush_pending_packets();
        self.special.events.push(SpecialEvent {
            t: u32::MAX,
            kind: SpecialEventKind::TimestampReset,
            data: 0,
        });
        self.commit_special(true);
        // Anything mid-assembly straddles the reset; resynchronize on the
        // next start markers.
        self.current_frame = None;
        self.aps_ignore_events = true;
        self.imu_ignore_events = true;
    }

    fn push_special(&mut self, kind: SpecialEventKind, data: u16) {
        self.special.events.push(SpecialEvent {
            t: self.current_timestamp as u32,
            kind,
            data,
        });
    }

    fn dvs_y_address(&mut self, data: u16) {
        if data >= self.geometry.dvs_size_y {
            error!(
                "DVS: Y address out of range (0-{}): {data}",
                self.geometry.dvs_size_y - 1,
            );
            return;
        }
        if self.dvs_got_y {
            // The previous Y never paired with an X; report it at the
            // timestamp it was latched with.
            self.special.events.push(SpecialEvent {
                t: self.dvs_timestamp as u32,
                kind: SpecialEventKind::DvsRowOnly,
                data: self.dvs_last_y,
            });
            debug!("DVS: row-only event for address y={}", self.dvs_last_y);
        }
        self.dvs_last_y = data;
        self.dvs_got_y = true;
        self.dvs_timestamp = self.current_timestamp;
    }

    fn dvs_x_address(&mut self, data: u16, on: bool) {
        if data >= self.geometry.dvs_size_x {
            error!(
                "DVS: X address out of range (0-{}): {data}",
                self.geometry.dvs_size_x - 1,
            );
            return;
        }
        // DAVIS208 pixels below column 192 sit behind a negative-gain
        // pre-amplifier and report inverted polarity.
        let inverted = self.geometry.chip == Chip::Davis208 && data < 192;
        let polarity = if on != inverted {
            DvsPolarity::On
        } else {
            DvsPolarity::Off
        };
        let (x, y) = if self.geometry.dvs_invert_xy {
            (self.dvs_last_y, data)
        } else {
            (data, self.dvs_last_y)
        };
        self.polarity.events.push(DvsEvent {
            t: self.dvs_timestamp as u32,
            x,
            y,
            polarity,
        });
        self.dvs_got_y = false;
    }

    fn aps_frame_start(&mut self, global_shutter: bool, reset_read: bool) {
        debug!(
            "APS frame start (global_shutter={global_shutter}, reset_read={reset_read})"
        );
        self.aps_ignore_events = false;
        self.aps_global_shutter = global_shutter;
        self.aps_reset_read = reset_read;
        self.aps_readout = Readout::Reset;
        self.aps_count_x = [0; 2];
        self.aps_count_y = [0; 2];
        let mut frame = FrameEvent::new(
            self.geometry.aps_window0_size_x,
            self.geometry.aps_window0_size_y,
            self.geometry.aps_channels,
        );
        frame.t_start_of_frame = self.current_timestamp as u32;
        if !reset_read {
            // Without reset reads the start of frame is the closest
            // approximation of the start of exposure.
            frame.t_start_of_exposure = self.current_timestamp as u32;
        }
        self.current_frame = Some(frame);
    }

    fn aps_column_start(&mut self, readout: Readout) {
        if self.aps_ignore_events {
            return;
        }
        debug!("APS column start ({readout:?})");
        self.aps_readout = readout;
        self.aps_count_y[readout as usize] = 0;
        self.aps_rgb_offset_direction = RgbOffsetDirection::Increasing;
        // First pixel of a column is always even on the striped readout.
        self.aps_rgb_pixel_offset = 1;
        match readout {
            Readout::Reset => {
                // The first reset column starts the exposure on a rolling
                // shutter.
                if !self.aps_global_shutter && self.aps_count_x[Readout::Reset as usize] == 0 {
                    if let Some(frame) = self.current_frame.as_mut() {
                        frame.t_start_of_exposure = self.current_timestamp as u32;
                    }
                }
            }
            Readout::Signal => {
                // The first signal column always ends the exposure.
                if self.aps_count_x[Readout::Signal as usize] == 0 {
                    if let Some(frame) = self.current_frame.as_mut() {
                        frame.t_end_of_exposure = self.current_timestamp as u32;
                    }
                }
            }
        }
    }

    fn aps_column_end(&mut self) {
        if self.aps_ignore_events {
            return;
        }
        let readout = self.aps_readout;
        let index = readout as usize;
        let Some(frame) = self.current_frame.as_mut() else {
            return;
        };
        trace!(
            "APS column end ({readout:?}): count_x={}, count_y={}",
            self.aps_count_x[index],
            self.aps_count_y[index],
        );
        if self.aps_count_y[index] != frame.height {
            error!(
                "APS column end: wrong row count ({readout:?}, {})",
                self.aps_count_y[index],
            );
        }
        self.aps_count_x[index] += 1;
        // The last reset column ends the reset pass; on a global shutter
        // this is where the frame-wide exposure begins.
        if self.aps_global_shutter
            && readout == Readout::Reset
            && self.aps_count_x[Readout::Reset as usize] == frame.width
        {
            frame.t_start_of_exposure = self.current_timestamp as u32;
        }
    }

    fn aps_frame_end(&mut self) {
        if self.aps_ignore_events {
            return;
        }
        let Some(mut frame) = self.current_frame.take() else {
            return;
        };
        debug!("APS frame end");
        let mut valid = true;
        for (index, count) in self.aps_count_x.iter().enumerate() {
            let expected = if index == Readout::Reset as usize && !self.aps_reset_read {
                0
            } else {
                frame.width
            };
            if *count != expected {
                error!("APS frame end: wrong column count ({index}, {count})");
                valid = false;
            }
        }
        frame.t_end_of_frame = self.current_timestamp as u32;
        frame.valid = valid;
        // An invalid frame still occupies a packet slot.
        self.frames.events.push(frame);
    }

    fn aps_sample(&mut self, data: u16) {
        if self.aps_ignore_events {
            return;
        }
        let readout = self.aps_readout;
        let index = readout as usize;
        let Some(frame) = self.current_frame.as_mut() else {
            return;
        };
        // Excess samples arrive when row or column markers were lost on a
        // stalled transfer.
        if self.aps_count_y[index] >= frame.height || self.aps_count_x[index] >= frame.width {
            trace!("APS sample: readout counters are at maximum, discarding");
            return;
        }
        let mut x_position = if self.geometry.aps_flip_x {
            frame.width - 1 - self.aps_count_x[index]
        } else {
            self.aps_count_x[index]
        };
        let mut y_position = if self.geometry.aps_flip_y {
            frame.height - 1 - self.aps_count_y[index]
        } else {
            self.aps_count_y[index]
        };
        if self.geometry.chip == Chip::DavisRgb {
            y_position = (i32::from(y_position) + i32::from(self.aps_rgb_pixel_offset)).max(0) as u16;
        }
        if self.geometry.aps_invert_xy {
            std::mem::swap(&mut x_position, &mut y_position);
        }
        let pixel_position = y_position as usize * frame.width as usize + x_position as usize;
        let absolute_position = (y_position + self.geometry.aps_window0_start_y) as usize
            * self.geometry.aps_size_x as usize
            + (x_position + self.geometry.aps_window0_start_x) as usize;
        // DAVIS RGB in global shutter reads the signal level first, so the
        // roles of the two passes are swapped.
        let swapped_reads = self.geometry.chip == Chip::DavisRgb && self.aps_global_shutter;
        let store_raw = match readout {
            Readout::Reset => !swapped_reads,
            Readout::Signal => swapped_reads,
        };
        if store_raw {
            if let Some(slot) = self.aps_reset_frame.get_mut(absolute_position) {
                *slot = data;
            }
        } else {
            let reset = self
                .aps_reset_frame
                .get(absolute_position)
                .copied()
                .unwrap_or(0);
            let difference = if swapped_reads {
                i32::from(data) - i32::from(reset)
            } else {
                i32::from(reset) - i32::from(data)
            };
            let pixel = (difference.max(0) as u16) << (16 - ADC_DEPTH);
            if let Some(slot) = frame.pixels.get_mut(pixel_position) {
                *slot = pixel;
            }
        }
        trace!(
            "APS sample: column={}, row={}, x={x_position}, y={y_position}, data={data}",
            self.aps_count_x[index],
            self.aps_count_y[index],
        );
        self.aps_count_y[index] += 1;
        // Striped readout of the RGB sensor: the first 320 rows of a column
        // are the even-indexed ones, then the odd rows come back down.
        if self.geometry.chip == Chip::DavisRgb {
            match self.aps_rgb_offset_direction {
                RgbOffsetDirection::Increasing => {
                    self.aps_rgb_pixel_offset += 1;
                    if self.aps_rgb_pixel_offset == 321 {
                        self.aps_rgb_offset_direction = RgbOffsetDirection::Decreasing;
                        self.aps_rgb_pixel_offset = 318;
                    }
                }
                RgbOffsetDirection::Decreasing => {
                    self.aps_rgb_pixel_offset -= 3;
                }
            }
        }
    }

    fn misc8(&mut self, data: u16) {
        let code = (data >> 8) & 0x0F;
        let byte = (data & 0x00FF) as u8;
        match code {
            0 => self.imu_sample(byte),
            _ => error!("caught misc8 event with code {code} that cannot be handled"),
        }
    }

    fn imu_sample(&mut self, byte: u8) {
        if self.imu_ignore_events {
            return;
        }
        if self.imu_count == 0 {
            error!(
                "IMU data: missing IMU scale config event, \
                 accel/gyro conversions may be inaccurate"
            );
            self.imu_count = 1;
        }
        if self.imu_count > IMU_BYTES {
            info!("IMU data: sample count is at maximum, discarding further samples");
            return;
        }
        if self.imu_count % 2 == 1 {
            self.imu_tmp_data = byte;
        } else {
            let value = i16::from_be_bytes([self.imu_tmp_data, byte]);
            match self.imu_count {
                2 => self.current_imu6.accel_x = f32::from(value) / self.imu_accel_scale,
                4 => self.current_imu6.accel_y = f32::from(value) / self.imu_accel_scale,
                6 => self.current_imu6.accel_z = f32::from(value) / self.imu_accel_scale,
                // Signed temperature, converted with the MPU-6x00 formula.
                8 => self.current_imu6.temperature = f32::from(value) / 340.0 + 36.53,
                10 => self.current_imu6.gyro_x = f32::from(value) / self.imu_gyro_scale,
                12 => self.current_imu6.gyro_y = f32::from(value) / self.imu_gyro_scale,
                14 => self.current_imu6.gyro_z = f32::from(value) / self.imu_gyro_scale,
                _ => (),
            }
        }
        self.imu_count += 1;
    }

    fn imu_scale_config(&mut self, data: u16) {
        debug!("IMU scale config event ({data})");
        if self.imu_ignore_events {
            return;
        }
        self.imu_accel_scale = accel_scale_from_config(((data >> 2) & 0x03) as u8);
        self.imu_gyro_scale = gyro_scale_from_config((data & 0x03) as u8);
        if self.imu_count != 0 {
            info!("IMU scale config: previous IMU start event missed, attempting recovery");
        }
        // Occupies slot 0 of the record, so a skipped start marker is
        // recoverable and a skipped scale config is detectable.
        self.imu_count = 1;
    }

    fn commit_ready_packets(&mut self) {
        let interval = self
            .configuration
            .max_polarity_packet_interval
            .load(Ordering::Relaxed);
        if self.polarity.ready(interval, |event| event.t) {
            self.commit_polarity();
        }
        let interval = self
            .configuration
            .max_frame_packet_interval
            .load(Ordering::Relaxed);
        if self
            .frames
            .ready(interval, |event| event.t_start_of_exposure)
        {
            self.commit_frames();
        }
        let interval = self
            .configuration
            .max_imu6_packet_interval
            .load(Ordering::Relaxed);
        if self.imu6.ready(interval, |event| event.t) {
            self.commit_imu6();
        }
        let interval = self
            .configuration
            .max_special_packet_interval
            .load(Ordering::Relaxed);
        if self.special.ready(interval, |event| event.t) {
            self.commit_special(false);
        }
    }

    fn commit_polarity(&mut self) {
        let capacity = self
            .configuration
            .max_polarity_packet_size
            .load(Ordering::Relaxed) as usize;
        let packet = std::mem::replace(&mut self.polarity, Pending::new(capacity));
        let container = PacketContainer {
            polarity: Some(packet.events),
            ..Default::default()
        };
        match self.exchange.put(container) {
            Ok(()) => (self.notify_increase)(),
            Err(_) => info!("dropped polarity event packet, data exchange buffer is full"),
        }
    }

    fn commit_frames(&mut self) {
        let capacity = self
            .configuration
            .max_frame_packet_size
            .load(Ordering::Relaxed) as usize;
        let packet = std::mem::replace(&mut self.frames, Pending::new(capacity));
        let container = PacketContainer {
            frames: Some(packet.events),
            ..Default::default()
        };
        match self.exchange.put(container) {
            Ok(()) => (self.notify_increase)(),
            Err(_) => {
                info!("dropped frame event packet, data exchange buffer is full");
                self.aps_ignore_events = true;
            }
        }
    }

    fn commit_imu6(&mut self) {
        let capacity = self
            .configuration
            .max_imu6_packet_size
            .load(Ordering::Relaxed) as usize;
        let packet = std::mem::replace(&mut self.imu6, Pending::new(capacity));
        let container = PacketContainer {
            imu6: Some(packet.events),
            ..Default::default()
        };
        match self.exchange.put(container) {
            Ok(()) => (self.notify_increase)(),
            Err(_) => {
                info!("dropped IMU6 event packet, data exchange buffer is full");
                self.imu_ignore_events = true;
            }
        }
    }

    /// `critical` marks packets carrying a timestamp reset: those must
    /// never be lost, so a full exchange buffer is spun on until the
    /// packet fits.
    fn commit_special(&mut self, critical: bool) {
        let capacity = self
            .configuration
            .max_special_packet_size
            .load(Ordering::Relaxed) as usize;
        let packet = std::mem::replace(&mut self.special, Pending::new(capacity));
        let mut container = PacketContainer {
            special: Some(packet.events),
            ..Default::default()
        };
        if critical {
            loop {
                match self.exchange.put(container) {
                    Ok(()) => {
                        (self.notify_increase)();
                        return;
                    }
                    Err(returned) => {
                        container = returned;
                        std::hint::spin_loop();
                    }
                }
            }
        }
        match self.exchange.put(container) {
            Ok(()) => (self.notify_increase)(),
            Err(_) => info!("dropped special event packet, data exchange buffer is full"),
        }
    }

    /// Flushes every non-empty in-progress packet in a single container,
    /// best effort. Used at a timestamp reset to drain pre-reset events
    /// before the reset marker is published.
    fn flush_pending_packets(&mut self) {
        let mut container = PacketContainer::default();
        if !self.polarity.events.is_empty() {
            let capacity = self
                .configuration
                .max_polarity_packet_size
                .load(Ordering::Relaxed) as usize;
            let packet = std::mem::replace(&mut self.polarity, Pending::new(capacity));
            container.polarity = Some(packet.events);
        }
        if !self.frames.events.is_empty() {
            let capacity = self
                .configuration
                .max_frame_packet_size
                .load(Ordering::Relaxed) as usize;
            let packet = std::mem::replace(&mut self.frames, Pending::new(capacity));
            container.frames = Some(packet.events);
        }
        if !self.imu6.events.is_empty() {
            let capacity = self
                .configuration
                .max_imu6_packet_size
                .load(Ordering::Relaxed) as usize;
            let packet = std::mem::replace(&mut self.imu6, Pending::new(capacity));
            container.imu6 = Some(packet.events);
        }
        if !self.special.events.is_empty() {
            let capacity = self
                .configuration
                .max_special_packet_size
                .load(Ordering::Relaxed) as usize;
            let packet = std::mem::replace(&mut self.special, Pending::new(capacity));
            container.special = Some(packet.events);
        }
        if container.is_empty() {
            return;
        }
        match self.exchange.put(container) {
            Ok(()) => (self.notify_increase)(),
            Err(_) => info!("dropped in-progress packets, data exchange buffer is full"),
        }
    }
}
