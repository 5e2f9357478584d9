use crate::configuration;
use crate::decoder;
use crate::device;
use crate::error;
use crate::exchange;
use crate::usb;
use log::{debug, info};
use rusb::UsbContext;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Register bank addresses (module, then per-module parameters) reachable
/// over the FPGA configuration channel.
pub mod config {
    pub const MUX: u8 = 0;
    pub const DVS: u8 = 1;
    pub const APS: u8 = 2;
    pub const IMU: u8 = 3;
    pub const EXTINPUT: u8 = 4;
    pub const BIAS: u8 = 5;
    pub const SYSINFO: u8 = 6;
    pub const USB: u8 = 9;

    pub mod sysinfo {
        pub const LOGIC_VERSION: u8 = 0;
        pub const CHIP_IDENTIFIER: u8 = 1;
        pub const DEVICE_IS_MASTER: u8 = 2;
        pub const LOGIC_CLOCK: u8 = 3;
        pub const ADC_CLOCK: u8 = 4;
    }

    pub mod dvs {
        pub const SIZE_COLUMNS: u8 = 0;
        pub const SIZE_ROWS: u8 = 1;
        pub const ORIENTATION_INFO: u8 = 2;
        pub const HAS_PIXEL_FILTER: u8 = 10;
        pub const HAS_BACKGROUND_ACTIVITY_FILTER: u8 = 11;
        pub const HAS_TEST_EVENT_GENERATOR: u8 = 12;
    }

    pub mod aps {
        pub const SIZE_COLUMNS: u8 = 0;
        pub const SIZE_ROWS: u8 = 1;
        pub const ORIENTATION_INFO: u8 = 2;
        pub const COLOR_FILTER: u8 = 3;
        pub const GLOBAL_SHUTTER: u8 = 8;
        pub const RESET_READ: u8 = 9;
        pub const START_COLUMN_0: u8 = 12;
        pub const START_ROW_0: u8 = 13;
        pub const END_COLUMN_0: u8 = 14;
        pub const END_ROW_0: u8 = 15;
        pub const HAS_GLOBAL_SHUTTER: u8 = 32;
        pub const HAS_QUAD_ROI: u8 = 33;
        pub const HAS_EXTERNAL_ADC: u8 = 34;
        pub const HAS_INTERNAL_ADC: u8 = 35;
    }

    pub mod imu {
        pub const RUN: u8 = 0;
        pub const ACCEL_FULL_SCALE: u8 = 6;
        pub const GYRO_FULL_SCALE: u8 = 9;
    }

    pub mod extinput {
        pub const HAS_GENERATOR: u8 = 10;
    }
}

/// Immutable device information captured while opening.
///
/// The reported sensor sizes already account for the XY inversion of the
/// chip orientation; the acquisition pipeline keeps working on the raw
/// device geometry and applies the orientation when emitting events.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Info {
    pub name: &'static str,
    pub serial: String,
    pub bus_number: u8,
    pub address: u8,
    pub logic_version: u16,
    pub device_is_master: bool,
    pub logic_clock: u16,
    pub adc_clock: u16,
    pub chip_id: u16,
    pub dvs_size_x: u16,
    pub dvs_size_y: u16,
    pub dvs_has_pixel_filter: bool,
    pub dvs_has_background_activity_filter: bool,
    pub dvs_has_test_event_generator: bool,
    pub aps_size_x: u16,
    pub aps_size_y: u16,
    pub aps_color_filter: u8,
    pub aps_has_global_shutter: bool,
    pub aps_has_quad_roi: bool,
    pub aps_has_external_adc: bool,
    pub aps_has_internal_adc: bool,
    pub ext_input_has_generator: bool,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Usb(#[from] usb::Error),

    #[error("device serial \"{device}\" does not match \"{requested}\"")]
    SerialMismatch { device: String, requested: String },

    #[error(
        "device logic revision too old (revision {version}, at least {required} is required)"
    )]
    LogicVersion { version: u16, required: u16 },

    #[error("data acquisition is already running")]
    AlreadyRunning,
}

impl From<rusb::Error> for Error {
    fn from(error: rusb::Error) -> Self {
        usb::Error::from(error).into()
    }
}

struct Stream {
    running: Arc<std::sync::atomic::AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    exchange: Arc<exchange::Buffer>,
    notify_decrease: Box<dyn Fn() + Send + Sync>,
}

/// An open DAVIS device. Dropping the handle stops any running stream;
/// closing the underlying USB handle releases the claimed interface.
pub struct Device {
    event_context: rusb::Context,
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    properties: &'static device::Properties,
    info: Info,
    geometry: decoder::Geometry,
    configuration: Arc<configuration::Configuration>,
    error_flag: error::Flag<Error>,
    stream: Option<Stream>,
}

impl Device {
    /// Connects to the first matching device, verifies its identity, and
    /// reads the sensor geometry and capability bits.
    ///
    /// Each device owns its own USB context so that one acquisition thread
    /// per device can pump events independently.
    pub fn open(
        properties: &'static device::Properties,
        serial: Option<&str>,
        bus_number: Option<u8>,
        address: Option<u8>,
    ) -> Result<Self, Error> {
        let event_context = rusb::Context::new().map_err(usb::Error::from)?;
        let handle = usb::open_device(
            &event_context,
            properties.vendor_id,
            properties.product_id,
            properties.device_type,
            bus_number,
            address,
        )?;
        let device_serial = usb::read_serial(&handle).unwrap_or_default();
        if let Some(serial) = serial {
            if serial != device_serial {
                return Err(Error::SerialMismatch {
                    device: device_serial,
                    requested: serial.to_owned(),
                });
            }
        }
        let logic_version =
            usb::spi_config_receive(&handle, config::SYSINFO, config::sysinfo::LOGIC_VERSION)?
                as u16;
        if logic_version < properties.required_logic_revision {
            return Err(Error::LogicVersion {
                version: logic_version,
                required: properties.required_logic_revision,
            });
        }
        let chip_id =
            usb::spi_config_receive(&handle, config::SYSINFO, config::sysinfo::CHIP_IDENTIFIER)?
                as u16;
        let dvs_size_x =
            usb::spi_config_receive(&handle, config::DVS, config::dvs::SIZE_COLUMNS)? as u16;
        let dvs_size_y =
            usb::spi_config_receive(&handle, config::DVS, config::dvs::SIZE_ROWS)? as u16;
        let dvs_orientation =
            usb::spi_config_receive(&handle, config::DVS, config::dvs::ORIENTATION_INFO)?;
        let dvs_invert_xy = dvs_orientation & 0x04 != 0;
        let aps_size_x =
            usb::spi_config_receive(&handle, config::APS, config::aps::SIZE_COLUMNS)? as u16;
        let aps_size_y =
            usb::spi_config_receive(&handle, config::APS, config::aps::SIZE_ROWS)? as u16;
        let aps_orientation =
            usb::spi_config_receive(&handle, config::APS, config::aps::ORIENTATION_INFO)?;
        let aps_invert_xy = aps_orientation & 0x04 != 0;
        let aps_flip_x = aps_orientation & 0x02 != 0;
        let aps_flip_y = aps_orientation & 0x01 != 0;
        let aps_color_filter =
            usb::spi_config_receive(&handle, config::APS, config::aps::COLOR_FILTER)? as u8;
        // RGBG and RGBW layouts are both four channels.
        let aps_channels = if aps_color_filter == 0 { 1 } else { 4 };
        let info = Info {
            name: properties.name,
            serial: device_serial,
            bus_number: handle.device().bus_number(),
            address: handle.device().address(),
            logic_version,
            device_is_master: usb::spi_config_receive(
                &handle,
                config::SYSINFO,
                config::sysinfo::DEVICE_IS_MASTER,
            )? != 0,
            logic_clock: usb::spi_config_receive(
                &handle,
                config::SYSINFO,
                config::sysinfo::LOGIC_CLOCK,
            )? as u16,
            adc_clock: usb::spi_config_receive(
                &handle,
                config::SYSINFO,
                config::sysinfo::ADC_CLOCK,
            )? as u16,
            chip_id,
            dvs_size_x: if dvs_invert_xy { dvs_size_y } else { dvs_size_x },
            dvs_size_y: if dvs_invert_xy { dvs_size_x } else { dvs_size_y },
            dvs_has_pixel_filter: usb::spi_config_receive(
                &handle,
                config::DVS,
                config::dvs::HAS_PIXEL_FILTER,
            )? != 0,
            dvs_has_background_activity_filter: usb::spi_config_receive(
                &handle,
                config::DVS,
                config::dvs::HAS_BACKGROUND_ACTIVITY_FILTER,
            )? != 0,
            dvs_has_test_event_generator: usb::spi_config_receive(
                &handle,
                config::DVS,
                config::dvs::HAS_TEST_EVENT_GENERATOR,
            )? != 0,
            aps_size_x: if aps_invert_xy { aps_size_y } else { aps_size_x },
            aps_size_y: if aps_invert_xy { aps_size_x } else { aps_size_y },
            aps_color_filter,
            aps_has_global_shutter: usb::spi_config_receive(
                &handle,
                config::APS,
                config::aps::HAS_GLOBAL_SHUTTER,
            )? != 0,
            aps_has_quad_roi: usb::spi_config_receive(
                &handle,
                config::APS,
                config::aps::HAS_QUAD_ROI,
            )? != 0,
            aps_has_external_adc: usb::spi_config_receive(
                &handle,
                config::APS,
                config::aps::HAS_EXTERNAL_ADC,
            )? != 0,
            aps_has_internal_adc: usb::spi_config_receive(
                &handle,
                config::APS,
                config::aps::HAS_INTERNAL_ADC,
            )? != 0,
            ext_input_has_generator: usb::spi_config_receive(
                &handle,
                config::EXTINPUT,
                config::extinput::HAS_GENERATOR,
            )? != 0,
        };
        let geometry = decoder::Geometry {
            dvs_size_x,
            dvs_size_y,
            dvs_invert_xy,
            aps_size_x,
            aps_size_y,
            aps_invert_xy,
            aps_flip_x,
            aps_flip_y,
            aps_window0_start_x: 0,
            aps_window0_start_y: 0,
            aps_window0_size_x: aps_size_x,
            aps_window0_size_y: aps_size_y,
            aps_channels,
            chip: decoder::Chip::from_id(chip_id),
        };
        debug!(
            "initialized {} SN-{} [{}:{}]",
            info.name, info.serial, info.bus_number, info.address,
        );
        Ok(Self {
            event_context,
            handle: Arc::new(handle),
            properties,
            info,
            geometry,
            configuration: Arc::new(configuration::Configuration::default()),
            error_flag: error::Flag::new(),
            stream: None,
        })
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn properties(&self) -> &'static device::Properties {
        self.properties
    }

    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    pub fn speed(&self) -> usb::Speed {
        self.handle.device().speed().into()
    }

    /// Host-side knobs. USB knobs apply at the next `data_start`, the
    /// exchange and packet knobs are read live.
    pub fn configuration(&self) -> &configuration::Configuration {
        &self.configuration
    }

    /// First error raised on the acquisition thread, if any.
    pub fn poll_error(&self) -> Option<Error> {
        self.error_flag.load()
    }

    /// Writes a device register. Streaming and configuration use separate
    /// endpoints, so this is safe while a stream is running.
    pub fn config_set(&self, module: u8, parameter: u8, value: u32) -> Result<(), Error> {
        Ok(usb::spi_config_send(&self.handle, module, parameter, value)?)
    }

    /// Reads a device register.
    pub fn config_get(&self, module: u8, parameter: u8) -> Result<u32, Error> {
        Ok(usb::spi_config_receive(&self.handle, module, parameter)?)
    }

    /// Starts streaming. `notify_increase` runs on the acquisition thread
    /// whenever a container is enqueued; `notify_decrease` runs on the
    /// caller's thread for every container handed out or drained.
    pub fn data_start(
        &mut self,
        notify_increase: impl Fn() + Send + Sync + 'static,
        notify_decrease: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), Error> {
        if self.stream.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let exchange = Arc::new(exchange::Buffer::new(
            self.configuration
                .data_exchange_buffer_size
                .load(Ordering::Relaxed) as usize,
        ));

        // Seed the decoder with the shutter, window, and scale state the
        // device is currently configured with; the stream itself carries
        // updates from here on.
        let accel_config =
            usb::spi_config_receive(&self.handle, config::IMU, config::imu::ACCEL_FULL_SCALE)?;
        let gyro_config =
            usb::spi_config_receive(&self.handle, config::IMU, config::imu::GYRO_FULL_SCALE)?;
        let defaults = decoder::Defaults {
            global_shutter: usb::spi_config_receive(
                &self.handle,
                config::APS,
                config::aps::GLOBAL_SHUTTER,
            )? != 0,
            reset_read: usb::spi_config_receive(
                &self.handle,
                config::APS,
                config::aps::RESET_READ,
            )? != 0,
            accel_scale: decoder::accel_scale_from_config((accel_config & 0x03) as u8),
            gyro_scale: decoder::gyro_scale_from_config((gyro_config & 0x03) as u8),
        };
        let mut geometry = self.geometry.clone();
        let start_column =
            usb::spi_config_receive(&self.handle, config::APS, config::aps::START_COLUMN_0)?;
        let end_column =
            usb::spi_config_receive(&self.handle, config::APS, config::aps::END_COLUMN_0)?;
        let start_row =
            usb::spi_config_receive(&self.handle, config::APS, config::aps::START_ROW_0)?;
        let end_row = usb::spi_config_receive(&self.handle, config::APS, config::aps::END_ROW_0)?;
        geometry.aps_window0_start_x = start_column as u16;
        geometry.aps_window0_start_y = start_row as u16;
        geometry.aps_window0_size_x = (end_column + 1).saturating_sub(start_column) as u16;
        geometry.aps_window0_size_y = (end_row + 1).saturating_sub(start_row) as u16;

        let translator = decoder::Decoder::new(
            geometry,
            defaults,
            self.configuration.clone(),
            exchange.clone(),
            Arc::new(notify_increase),
        );
        let usb_configuration = usb::Configuration {
            buffer_number: self.configuration.usb_buffer_number.load(Ordering::Relaxed),
            buffer_size: self.configuration.usb_buffer_size.load(Ordering::Relaxed),
        };
        let ring_error_flag = self.error_flag.clone();
        let ring = usb::Ring::new(
            self.handle.clone(),
            self.event_context.clone(),
            &usb_configuration,
            translator,
            move |usb_error| {
                ring_error_flag.store_if_not_set(Error::from(usb_error));
            },
        )?;

        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let thread_running = running.clone();
        let thread_context = self.event_context.clone();
        let thread_error_flag = self.error_flag.clone();
        // The pump tick tracks the shortest packet interval so aging
        // commits are never delayed by a quiet bus.
        let tick = std::time::Duration::from_micros(u64::from(
            self.configuration.shortest_packet_interval(),
        ))
        .clamp(
            std::time::Duration::from_millis(1),
            std::time::Duration::from_secs(1),
        );
        let thread = std::thread::spawn(move || {
            while thread_running.load(Ordering::Acquire) {
                if let Err(handle_events_error) = thread_context.handle_events(Some(tick)) {
                    thread_error_flag.store_if_not_set(Error::from(handle_events_error));
                }
            }
            // Cancels outstanding transfers and pumps the event loop until
            // every completion has drained.
            drop(ring);
        });
        self.stream = Some(Stream {
            running,
            thread: Some(thread),
            exchange,
            notify_decrease: Box::new(notify_decrease),
        });
        info!("started data acquisition for {}", self.info.name);
        Ok(())
    }

    /// Stops streaming, joins the acquisition thread, and drains leftover
    /// containers (calling `notify_decrease` for each).
    pub fn data_stop(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            return;
        };
        stream.running.store(false, Ordering::Release);
        if let Some(thread) = stream.thread.take() {
            thread.join().expect("acquisition thread joined itself");
        }
        while stream.exchange.get().is_some() {
            (stream.notify_decrease)();
        }
        info!("stopped data acquisition for {}", self.info.name);
    }

    /// Next committed container. With `data_exchange_blocking` set this
    /// spins until the acquisition thread commits something.
    pub fn data_get(&self) -> Option<davis_types::PacketContainer> {
        let stream = self.stream.as_ref()?;
        loop {
            if let Some(container) = stream.exchange.get() {
                (stream.notify_decrease)();
                return Some(container);
            }
            if !self
                .configuration
                .data_exchange_blocking
                .load(Ordering::Relaxed)
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.data_stop();
    }
}
