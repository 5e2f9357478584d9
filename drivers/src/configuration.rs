use std::sync::atomic::{AtomicBool, AtomicU32};

/// Host-side knobs, shared between the owner thread and the acquisition
/// worker. USB knobs take effect at the next stream start, exchange and
/// packet knobs are read live by the commit policies.
#[derive(Debug)]
pub struct Configuration {
    pub usb_buffer_number: AtomicU32,
    pub usb_buffer_size: AtomicU32,
    pub data_exchange_buffer_size: AtomicU32,
    pub data_exchange_blocking: AtomicBool,
    pub max_polarity_packet_size: AtomicU32,
    pub max_polarity_packet_interval: AtomicU32,
    pub max_special_packet_size: AtomicU32,
    pub max_special_packet_interval: AtomicU32,
    pub max_frame_packet_size: AtomicU32,
    pub max_frame_packet_interval: AtomicU32,
    pub max_imu6_packet_size: AtomicU32,
    pub max_imu6_packet_interval: AtomicU32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            usb_buffer_number: AtomicU32::new(8),
            usb_buffer_size: AtomicU32::new(4096),
            data_exchange_buffer_size: AtomicU32::new(64),
            data_exchange_blocking: AtomicBool::new(false),
            max_polarity_packet_size: AtomicU32::new(4096),
            max_polarity_packet_interval: AtomicU32::new(5000),
            max_special_packet_size: AtomicU32::new(128),
            max_special_packet_interval: AtomicU32::new(1000),
            max_frame_packet_size: AtomicU32::new(4),
            max_frame_packet_interval: AtomicU32::new(50000),
            max_imu6_packet_size: AtomicU32::new(8),
            max_imu6_packet_interval: AtomicU32::new(5000),
        }
    }
}

impl Configuration {
    /// Shortest packet interval, used to bound the USB event pump tick.
    pub fn shortest_packet_interval(&self) -> u32 {
        use std::sync::atomic::Ordering;
        self.max_polarity_packet_interval
            .load(Ordering::Relaxed)
            .min(self.max_special_packet_interval.load(Ordering::Relaxed))
            .min(self.max_frame_packet_interval.load(Ordering::Relaxed))
            .min(self.max_imu6_packet_interval.load(Ordering::Relaxed))
    }
}
