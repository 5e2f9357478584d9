use crate::decoder;
use log::{error, warn};
use rusb::UsbContext;

/// Vendor control request addressing the FPGA register bank.
pub const VENDOR_REQUEST_FPGA_CONFIG: u8 = 0xBF;

/// Bulk IN endpoint carrying the event stream.
pub const DATA_ENDPOINT: u8 = 0x82;

pub const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Snapshot of the USB knobs taken when a stream starts.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    pub buffer_number: u32,
    pub buffer_size: u32,
}

impl Configuration {
    pub fn deserialize_bincode(data: &[u8]) -> bincode::Result<Configuration> {
        bincode::deserialize(data)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            buffer_number: 8,
            buffer_size: 4096,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error(transparent)]
    Rusb(#[from] rusb::Error),

    #[error("device with serial \"{0}\" not found")]
    Serial(String),

    #[error("device not found")]
    Device,

    #[error("no bulk transfer could be submitted")]
    NoActiveTransfer,
}

#[derive(Debug, Copy, Clone, serde::Serialize, serde::Deserialize)]
pub enum Speed {
    Unknown,
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl From<rusb::Speed> for Speed {
    fn from(speed: rusb::Speed) -> Self {
        match speed {
            rusb::Speed::Low => Self::Low,
            rusb::Speed::Full => Self::Full,
            rusb::Speed::High => Self::High,
            rusb::Speed::Super => Self::Super,
            rusb::Speed::SuperPlus => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for Speed {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(match self {
            Self::Unknown => "USB Unknown speed",
            Self::Low => "USB 1.0 Low Speed (1.5 Mb/s)",
            Self::Full => "USB 1.1 Full Speed (12 Mb/s)",
            Self::High => "USB 2.0 High Speed (480 Mb/s)",
            Self::Super => "USB 3.0 SuperSpeed (5.0 Gb/s)",
            Self::SuperPlus => "USB 3.1 SuperSpeed+ (10.0 Gb/s)",
        })
    }
}

/// Opens the first device matching the identifiers and the optional bus /
/// address restrictions, selects configuration 1, and claims interface 0.
/// The device-type byte is matched against the high byte of `bcdDevice`.
pub fn open_device(
    context: &rusb::Context,
    vendor_id: u16,
    product_id: u16,
    device_type: u8,
    bus_number: Option<u8>,
    address: Option<u8>,
) -> Result<rusb::DeviceHandle<rusb::Context>, Error> {
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(_) => continue,
        };
        if descriptor.vendor_id() != vendor_id
            || descriptor.product_id() != product_id
            || descriptor.device_version().major() != device_type
        {
            continue;
        }
        if bus_number.is_some_and(|bus_number| device.bus_number() != bus_number) {
            continue;
        }
        if address.is_some_and(|address| device.address() != address) {
            continue;
        }
        let mut handle = match device.open() {
            Ok(handle) => handle,
            Err(_) => continue,
        };
        let _ = handle.set_auto_detach_kernel_driver(true);
        match handle.active_configuration() {
            Ok(1) => (),
            Ok(_) => {
                if handle.set_active_configuration(1).is_err() {
                    continue;
                }
            }
            Err(_) => continue,
        }
        if handle.claim_interface(0).is_err() {
            continue;
        }
        return Ok(handle);
    }
    Err(Error::Device)
}

/// Reads the serial from string descriptor 3 over the first supported
/// language.
pub fn read_serial(handle: &rusb::DeviceHandle<rusb::Context>) -> Result<String, Error> {
    let languages = handle.read_languages(TIMEOUT)?;
    let language = *languages.first().ok_or(rusb::Error::NotFound)?;
    Ok(handle.read_string_descriptor(language, 3, TIMEOUT)?)
}

/// Writes one 32-bit parameter to the device register bank (big-endian
/// payload over a vendor control transfer).
pub fn spi_config_send(
    handle: &rusb::DeviceHandle<rusb::Context>,
    module: u8,
    parameter: u8,
    value: u32,
) -> Result<(), Error> {
    handle.write_control(
        rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        ),
        VENDOR_REQUEST_FPGA_CONFIG,
        u16::from(module),
        u16::from(parameter),
        &value.to_be_bytes(),
        TIMEOUT,
    )?;
    Ok(())
}

/// Reads one 32-bit parameter from the device register bank.
pub fn spi_config_receive(
    handle: &rusb::DeviceHandle<rusb::Context>,
    module: u8,
    parameter: u8,
) -> Result<u32, Error> {
    let mut buffer = [0u8; 4];
    let read = handle.read_control(
        rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        ),
        VENDOR_REQUEST_FPGA_CONFIG,
        u16::from(module),
        u16::from(parameter),
        &mut buffer,
        TIMEOUT,
    )?;
    if read != buffer.len() {
        return Err(rusb::Error::Io.into());
    }
    Ok(u32::from_be_bytes(buffer))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TransferStatus {
    Active,
    Cancelling,
    Complete,
    Freed,
}

struct RingState {
    statuses: Vec<TransferStatus>,
    active: usize,
    translator: decoder::Decoder,
}

struct SharedRingContext {
    shared: std::sync::Mutex<RingState>,
    on_error: Box<dyn Fn(Error) + Send + Sync>,
}

struct TransferContext {
    ring: std::sync::Arc<SharedRingContext>,
    transfer_index: usize,
}

struct LibusbTransfer(std::ptr::NonNull<libusb1_sys::libusb_transfer>);

unsafe impl Send for LibusbTransfer {}

impl LibusbTransfer {
    /// unsafe: the transfer must be allocated and not concurrently mutated
    unsafe fn as_mut(&mut self) -> &mut libusb1_sys::libusb_transfer {
        self.0.as_mut()
    }

    fn as_ptr(&self) -> *mut libusb1_sys::libusb_transfer {
        self.0.as_ptr()
    }
}

fn submit_error(status: i32) -> rusb::Error {
    match status {
        libusb1_sys::constants::LIBUSB_ERROR_IO => rusb::Error::Io,
        libusb1_sys::constants::LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        libusb1_sys::constants::LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        libusb1_sys::constants::LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        libusb1_sys::constants::LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        libusb1_sys::constants::LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        libusb1_sys::constants::LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        libusb1_sys::constants::LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        libusb1_sys::constants::LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        libusb1_sys::constants::LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        libusb1_sys::constants::LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        libusb1_sys::constants::LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

fn transfer_error(status: i32) -> rusb::Error {
    match status {
        libusb1_sys::constants::LIBUSB_TRANSFER_ERROR
        | libusb1_sys::constants::LIBUSB_TRANSFER_CANCELLED => rusb::Error::Io,
        libusb1_sys::constants::LIBUSB_TRANSFER_STALL => rusb::Error::Pipe,
        libusb1_sys::constants::LIBUSB_TRANSFER_NO_DEVICE => rusb::Error::NoDevice,
        libusb1_sys::constants::LIBUSB_TRANSFER_OVERFLOW => rusb::Error::Overflow,
        _ => rusb::Error::Other,
    }
}

extern "system" fn transfer_callback(transfer_pointer: *mut libusb1_sys::libusb_transfer) {
    let mut resubmit = false;
    {
        // unsafe: transfer is not null (libusb callback)
        let transfer = unsafe { &mut *transfer_pointer };
        let context_pointer = transfer.user_data;
        assert!(!context_pointer.is_null(), "context is null");
        // unsafe: user_data is a *mut TransferContext set at ring creation
        let context = unsafe { &*(context_pointer as *mut TransferContext) };
        let mut dead_status = None;
        {
            let mut shared = context
                .ring
                .shared
                .lock()
                .expect("ring context's lock is poisoned");
            if transfer.status == libusb1_sys::constants::LIBUSB_TRANSFER_COMPLETED {
                // unsafe: buffer holds actual_length bytes written by libusb
                let payload = unsafe {
                    std::slice::from_raw_parts(transfer.buffer, transfer.actual_length as usize)
                };
                shared.translator.translate(payload);
            }
            match shared.statuses[context.transfer_index] {
                TransferStatus::Active => {
                    if transfer.status != libusb1_sys::constants::LIBUSB_TRANSFER_CANCELLED
                        && transfer.status != libusb1_sys::constants::LIBUSB_TRANSFER_NO_DEVICE
                    {
                        resubmit = true;
                    } else {
                        shared.statuses[context.transfer_index] = TransferStatus::Complete;
                        shared.active -= 1;
                        dead_status = Some(transfer.status);
                    }
                }
                TransferStatus::Cancelling => {
                    shared.statuses[context.transfer_index] = TransferStatus::Complete;
                    shared.active -= 1;
                }
                TransferStatus::Complete | TransferStatus::Freed => {
                    panic!("callback called for a transfer marked as dead")
                }
            }
        }
        if let Some(status) = dead_status {
            (context.ring.on_error)(transfer_error(status).into());
        }
    }
    if resubmit {
        // unsafe: transfer is allocated and was filled at ring creation
        match unsafe { libusb1_sys::libusb_submit_transfer(transfer_pointer) } {
            0 => (),
            submit_status => {
                // unsafe: transfer is not null (libusb callback)
                let transfer = unsafe { &mut *transfer_pointer };
                let context_pointer = transfer.user_data;
                assert!(!context_pointer.is_null(), "context is null");
                // unsafe: user_data is a *mut TransferContext set at ring creation
                let context = unsafe { &*(context_pointer as *mut TransferContext) };
                {
                    let mut shared = context
                        .ring
                        .shared
                        .lock()
                        .expect("ring context's lock is poisoned");
                    shared.statuses[context.transfer_index] = TransferStatus::Complete;
                    shared.active -= 1;
                }
                (context.ring.on_error)(submit_error(submit_status).into());
            }
        }
    }
}

/// Fixed set of pre-submitted bulk IN transfers. Completions are decoded
/// in place on the thread pumping the USB event loop; a completed transfer
/// re-arms itself until it is cancelled or its device disappears.
pub struct Ring {
    transfers: Vec<LibusbTransfer>,
    buffers: Vec<Box<[u8]>>,
    #[allow(dead_code)]
    handle: std::sync::Arc<rusb::DeviceHandle<rusb::Context>>,
    event_context: rusb::Context,
    context: std::sync::Arc<SharedRingContext>,
}

// The ring is moved onto the acquisition thread; the raw transfer
// pointers it carries are only dereferenced from libusb callbacks and
// from teardown, both on that thread.
unsafe impl Send for Ring {}

impl Ring {
    pub fn new<OnError>(
        handle: std::sync::Arc<rusb::DeviceHandle<rusb::Context>>,
        event_context: rusb::Context,
        configuration: &Configuration,
        translator: decoder::Decoder,
        on_error: OnError,
    ) -> Result<Self, Error>
    where
        OnError: Fn(Error) + Send + Sync + 'static,
    {
        let buffer_number = configuration.buffer_number.max(1) as usize;
        let buffer_size = configuration.buffer_size.max(2) as usize;
        let mut buffers = Vec::with_capacity(buffer_number);
        for _ in 0..buffer_number {
            buffers.push(vec![0u8; buffer_size].into_boxed_slice());
        }
        let context = std::sync::Arc::new(SharedRingContext {
            shared: std::sync::Mutex::new(RingState {
                statuses: vec![TransferStatus::Active; buffer_number],
                active: 0,
                translator,
            }),
            on_error: Box::new(on_error),
        });
        let mut transfers: Vec<LibusbTransfer> = Vec::with_capacity(buffer_number);
        for index in 0..buffer_number {
            // unsafe: libusb1_sys wrapper
            let transfer = match std::ptr::NonNull::new(unsafe {
                libusb1_sys::libusb_alloc_transfer(0)
            }) {
                Some(transfer) => LibusbTransfer(transfer),
                None => {
                    for transfer in transfers.iter_mut() {
                        // unsafe: transfer is allocated and user_data is an
                        // allocated *mut TransferContext
                        unsafe {
                            let _ = Box::from_raw(transfer.as_mut().user_data
                                as *mut TransferContext);
                            libusb1_sys::libusb_free_transfer(transfer.as_ptr());
                        }
                    }
                    return Err(rusb::Error::NoMem.into());
                }
            };
            let transfer_context = Box::into_raw(Box::new(TransferContext {
                ring: context.clone(),
                transfer_index: index,
            }));
            // unsafe: libusb_alloc_transfer succeeded, buffer outlives the
            // transfer (teardown waits for completion before freeing)
            unsafe {
                libusb1_sys::libusb_fill_bulk_transfer(
                    transfer.as_ptr(),
                    handle.as_raw(),
                    DATA_ENDPOINT,
                    buffers[index].as_mut_ptr(),
                    buffer_size as libc::c_int,
                    transfer_callback,
                    transfer_context as *mut libc::c_void,
                    0,
                );
            }
            transfers.push(transfer);
        }
        let result = Self {
            transfers,
            buffers,
            handle,
            event_context,
            context,
        };
        for (index, transfer) in result.transfers.iter().enumerate() {
            // unsafe: transfer is allocated and filled
            match unsafe { libusb1_sys::libusb_submit_transfer(transfer.as_ptr()) } {
                0 => {
                    let mut shared = result
                        .context
                        .shared
                        .lock()
                        .expect("ring context's lock is poisoned");
                    shared.active += 1;
                }
                submit_status => {
                    error!(
                        "unable to submit bulk transfer {index}: {}",
                        submit_error(submit_status),
                    );
                    let mut shared = result
                        .context
                        .shared
                        .lock()
                        .expect("ring context's lock is poisoned");
                    shared.statuses[index] = TransferStatus::Complete;
                }
            }
        }
        {
            let shared = result
                .context
                .shared
                .lock()
                .expect("ring context's lock is poisoned");
            if shared.active == 0 {
                return Err(Error::NoActiveTransfer);
            }
            if shared.active < buffer_number {
                warn!(
                    "only {} of {buffer_number} bulk transfers submitted",
                    shared.active,
                );
            }
        }
        Ok(result)
    }

    pub fn active_transfers(&self) -> usize {
        self.context
            .shared
            .lock()
            .expect("ring context's lock is poisoned")
            .active
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        {
            let mut shared = self
                .context
                .shared
                .lock()
                .expect("ring context's lock is poisoned");
            for index in 0..self.transfers.len() {
                if shared.statuses[index] == TransferStatus::Active {
                    // A transfer whose completion is already queued returns
                    // NOT_FOUND here; its callback still runs below and the
                    // Cancelling status keeps it from re-arming.
                    // unsafe: transfer is allocated
                    let _ = unsafe {
                        libusb1_sys::libusb_cancel_transfer(self.transfers[index].as_ptr())
                    };
                    shared.statuses[index] = TransferStatus::Cancelling;
                }
            }
        }
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(1);
        let mut abandoned = false;
        while self.active_transfers() > 0 {
            let _ = self
                .event_context
                .handle_events(Some(std::time::Duration::from_millis(100)));
            if std::time::Instant::now() > deadline {
                // Better to leak the buffers than to loop forever.
                error!("bulk transfers were not freed after one second, leaking buffers");
                abandoned = true;
                break;
            }
        }
        {
            let mut shared = self
                .context
                .shared
                .lock()
                .expect("ring context's lock is poisoned");
            for index in 0..self.transfers.len() {
                if shared.statuses[index] == TransferStatus::Complete {
                    // unsafe: transfer is allocated and user_data is an
                    // allocated *mut TransferContext
                    unsafe {
                        let _ = Box::from_raw(
                            self.transfers[index].as_mut().user_data as *mut TransferContext,
                        );
                        libusb1_sys::libusb_free_transfer(self.transfers[index].as_ptr());
                    }
                    shared.statuses[index] = TransferStatus::Freed;
                }
            }
        }
        if abandoned {
            std::mem::forget(std::mem::take(&mut self.buffers));
        }
    }
}
