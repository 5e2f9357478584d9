use davis_drivers::configuration;
use davis_drivers::decoder::{self, Decoder};
use davis_drivers::exchange;
use davis_drivers::types::{DvsPolarity, SpecialEventKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn ts(tick: u16) -> u16 {
    0x8000 | tick
}

fn special(subtype: u16) -> u16 {
    subtype
}

fn dvs_y(y: u16) -> u16 {
    0x1000 | y
}

fn dvs_x_off(x: u16) -> u16 {
    0x2000 | x
}

fn dvs_x_on(x: u16) -> u16 {
    0x3000 | x
}

fn adc_sample(sample: u16) -> u16 {
    0x4000 | sample
}

fn imu_byte(byte: u8) -> u16 {
    0x5000 | u16::from(byte)
}

fn wrap(multiplier: u16) -> u16 {
    0x7000 | multiplier
}

fn bytes(words: &[u16]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

fn dvs_geometry() -> decoder::Geometry {
    decoder::Geometry {
        dvs_size_x: 240,
        dvs_size_y: 180,
        dvs_invert_xy: false,
        aps_size_x: 240,
        aps_size_y: 180,
        aps_invert_xy: false,
        aps_flip_x: false,
        aps_flip_y: false,
        aps_window0_start_x: 0,
        aps_window0_start_y: 0,
        aps_window0_size_x: 240,
        aps_window0_size_y: 180,
        aps_channels: 1,
        chip: decoder::Chip::Davis240C,
    }
}

fn frame_geometry(width: u16, height: u16) -> decoder::Geometry {
    decoder::Geometry {
        aps_size_x: width,
        aps_size_y: height,
        aps_window0_size_x: width,
        aps_window0_size_y: height,
        ..dvs_geometry()
    }
}

struct Harness {
    decoder: Decoder,
    exchange: Arc<exchange::Buffer>,
    notifications: Arc<AtomicUsize>,
}

impl Harness {
    fn new(geometry: decoder::Geometry) -> Self {
        Self::with(geometry, configuration::Configuration::default(), 64)
    }

    fn with(
        geometry: decoder::Geometry,
        configuration: configuration::Configuration,
        exchange_capacity: usize,
    ) -> Self {
        let configuration = Arc::new(configuration);
        let exchange = Arc::new(exchange::Buffer::new(exchange_capacity));
        let notifications = Arc::new(AtomicUsize::new(0));
        let notified = notifications.clone();
        let decoder = Decoder::new(
            geometry,
            decoder::Defaults {
                global_shutter: false,
                reset_read: true,
                accel_scale: decoder::accel_scale_from_config(0),
                gyro_scale: decoder::gyro_scale_from_config(0),
            },
            configuration,
            exchange.clone(),
            Arc::new(move || {
                notified.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Self {
            decoder,
            exchange,
            notifications,
        }
    }

    fn translate(&mut self, words: &[u16]) {
        self.decoder.translate(&bytes(words));
    }
}

#[test]
fn polarity_pairing() {
    let mut harness = Harness::new(dvs_geometry());
    harness.translate(&[ts(0x10), dvs_y(5), dvs_x_off(3)]);
    let events = harness.decoder.pending_polarity();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].t, 0x10);
    assert_eq!(events[0].x, 3);
    assert_eq!(events[0].y, 5);
    assert_eq!(events[0].polarity, DvsPolarity::Off);
    assert!(harness.decoder.pending_special().is_empty());
}

#[test]
fn orphaned_row_emits_row_only_event() {
    let mut harness = Harness::new(dvs_geometry());
    harness.translate(&[ts(0x10), dvs_y(5), ts(0x20), dvs_y(7), dvs_x_on(2)]);
    let special_events = harness.decoder.pending_special();
    assert_eq!(special_events.len(), 1);
    assert_eq!(special_events[0].kind, SpecialEventKind::DvsRowOnly);
    assert_eq!(special_events[0].t, 0x10);
    assert_eq!(special_events[0].data, 5);
    let polarity_events = harness.decoder.pending_polarity();
    assert_eq!(polarity_events.len(), 1);
    assert_eq!(polarity_events[0].t, 0x20);
    assert_eq!(polarity_events[0].x, 2);
    assert_eq!(polarity_events[0].y, 7);
    assert_eq!(polarity_events[0].polarity, DvsPolarity::On);
}

#[test]
fn out_of_range_addresses_are_discarded() {
    let mut harness = Harness::new(dvs_geometry());
    // The out-of-range Y must not disturb the latched row.
    harness.translate(&[ts(0x10), dvs_y(5), dvs_y(700), dvs_x_on(3), dvs_x_on(400)]);
    let polarity_events = harness.decoder.pending_polarity();
    assert_eq!(polarity_events.len(), 1);
    assert_eq!(polarity_events[0].y, 5);
    assert!(harness.decoder.pending_special().is_empty());
}

#[test]
fn inverted_geometry_swaps_coordinates() {
    let mut geometry = dvs_geometry();
    geometry.dvs_invert_xy = true;
    let mut harness = Harness::new(geometry);
    harness.translate(&[ts(0x10), dvs_y(5), dvs_x_on(3)]);
    let events = harness.decoder.pending_polarity();
    assert_eq!(events[0].x, 5);
    assert_eq!(events[0].y, 3);
}

#[test]
fn davis208_low_columns_invert_polarity() {
    let mut geometry = dvs_geometry();
    geometry.chip = decoder::Chip::Davis208;
    let mut harness = Harness::new(geometry);
    harness.translate(&[ts(0x10), dvs_y(5), dvs_x_on(100), dvs_y(6), dvs_x_on(200)]);
    let events = harness.decoder.pending_polarity();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].polarity, DvsPolarity::Off);
    assert_eq!(events[1].polarity, DvsPolarity::On);
}

#[test]
fn wrap_extends_the_timeline() {
    let mut harness = Harness::new(dvs_geometry());
    harness.translate(&[ts(0), wrap(1), ts(5)]);
    assert_eq!(harness.decoder.current_timestamp(), 0x8005);
    harness.translate(&[wrap(2)]);
    assert_eq!(harness.decoder.current_timestamp(), 0x8000 + 0x8000 * 2);
}

#[test]
fn reconstructed_timestamps_are_non_decreasing() {
    let mut harness = Harness::new(dvs_geometry());
    let mut previous = 0;
    let words = [
        ts(0x0001),
        ts(0x4000),
        ts(0x7FFF),
        wrap(1),
        ts(0x0001),
        ts(0x2000),
        wrap(3),
        ts(0x0100),
    ];
    for word in words {
        harness.translate(&[word]);
        let current = harness.decoder.current_timestamp();
        assert!(current >= previous, "{current} went backwards from {previous}");
        previous = current;
    }
    assert_eq!(previous, 0x8000 + 0x8000 * 3 + 0x0100);
}

#[test]
fn timestamp_reset_commits_a_clean_boundary() {
    let mut harness = Harness::new(dvs_geometry());
    harness.translate(&[ts(0x10), dvs_y(5), dvs_x_on(3)]);
    harness.translate(&[special(1)]);
    assert_eq!(harness.decoder.current_timestamp(), 0);
    assert!(harness.decoder.pending_polarity().is_empty());
    assert!(harness.decoder.pending_special().is_empty());

    // Pre-reset leftovers come out first.
    let flushed = harness.exchange.get().unwrap();
    let polarity = flushed.polarity.unwrap();
    assert_eq!(polarity.len(), 1);
    assert_eq!(polarity[0].t, 0x10);
    assert!(flushed.special.is_none());

    // The container carrying the reset marker holds nothing else.
    let boundary = harness.exchange.get().unwrap();
    let special_events = boundary.special.unwrap();
    assert_eq!(special_events.len(), 1);
    assert_eq!(special_events[0].kind, SpecialEventKind::TimestampReset);
    assert_eq!(special_events[0].t, u32::MAX);
    assert!(boundary.polarity.is_none());
    assert!(boundary.frames.is_none());
    assert!(boundary.imu6.is_none());

    assert!(harness.exchange.get().is_none());
    assert_eq!(harness.notifications.load(Ordering::SeqCst), 2);
}

#[test]
fn global_shutter_frame_with_double_sampling() {
    let mut harness = Harness::new(frame_geometry(1, 1));
    harness.translate(&[
        ts(0x64),
        special(8),
        special(11),
        adc_sample(800),
        special(13),
        special(12),
        adc_sample(200),
        special(13),
        special(10),
    ]);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame.valid);
    assert_eq!(frame.width, 1);
    assert_eq!(frame.height, 1);
    assert_eq!(frame.pixels, vec![(800 - 200) << 6]);
    assert_eq!(frame.pixel(0, 0), Some(0x9600));
    assert_eq!(frame.t_start_of_frame, 0x64);
    // On a global shutter the exposure spans from the last reset column to
    // the first signal column.
    assert_eq!(frame.t_start_of_exposure, 0x64);
    assert_eq!(frame.t_end_of_exposure, 0x64);
    assert_eq!(frame.t_end_of_frame, 0x64);
}

#[test]
fn rolling_shutter_exposure_timestamps() {
    let mut harness = Harness::new(frame_geometry(1, 1));
    harness.translate(&[
        ts(0x05),
        special(9),
        ts(0x06),
        special(11),
        adc_sample(500),
        special(13),
        ts(0x07),
        special(12),
        adc_sample(100),
        special(13),
        ts(0x08),
        special(10),
    ]);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame.valid);
    assert_eq!(frame.t_start_of_frame, 0x05);
    assert_eq!(frame.t_start_of_exposure, 0x06);
    assert_eq!(frame.t_end_of_exposure, 0x07);
    assert_eq!(frame.t_end_of_frame, 0x08);
    assert_eq!(frame.pixels, vec![(500 - 100) << 6]);
}

#[test]
fn frame_without_reset_read_skips_the_reset_pass() {
    let mut harness = Harness::new(frame_geometry(1, 1));
    harness.translate(&[
        ts(0x40),
        special(15),
        special(12),
        adc_sample(0),
        special(13),
        special(10),
    ]);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].valid);
    // Start of frame doubles as start of exposure without reset reads.
    assert_eq!(frames[0].t_start_of_exposure, 0x40);
    assert_eq!(frames[0].t_start_of_frame, 0x40);
}

#[test]
fn incomplete_frame_is_emitted_invalid() {
    let mut harness = Harness::new(frame_geometry(2, 1));
    harness.translate(&[
        ts(0x64),
        special(8),
        special(11),
        adc_sample(800),
        special(13),
        special(11),
        adc_sample(700),
        special(13),
        special(12),
        adc_sample(200),
        special(13),
        // Second signal column missing.
        special(10),
    ]);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames.len(), 1);
    assert!(!frames[0].valid);
}

#[test]
fn double_sampling_clamps_negative_differences() {
    let mut harness = Harness::new(frame_geometry(1, 1));
    harness.translate(&[
        ts(0x64),
        special(8),
        special(11),
        adc_sample(100),
        special(13),
        special(12),
        adc_sample(200),
        special(13),
        special(10),
    ]);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames[0].pixels, vec![0]);
}

#[test]
fn flipped_rows_mirror_the_frame() {
    let mut geometry = frame_geometry(1, 2);
    geometry.aps_flip_y = true;
    let mut harness = Harness::new(geometry);
    harness.translate(&[
        ts(0x64),
        special(8),
        special(11),
        adc_sample(800),
        adc_sample(600),
        special(13),
        special(12),
        adc_sample(200),
        adc_sample(100),
        special(13),
        special(10),
    ]);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].valid);
    // Sample order runs bottom-up when rows are flipped.
    assert_eq!(
        frames[0].pixels,
        vec![(600 - 100) << 6, (800 - 200) << 6],
    );
}

#[test]
fn davis_rgb_global_shutter_swaps_reads_and_walks_rows() {
    // The RGB sensor reads 640 rows per column; the first 320 samples land
    // on ascending odd rows, the rest walk the even rows back down.
    let mut geometry = frame_geometry(1, 640);
    geometry.chip = decoder::Chip::DavisRgb;
    let mut harness = Harness::new(geometry);
    let mut words = vec![ts(0x64), special(8)];
    // Signal readout comes first on this chip and is staged raw.
    words.push(special(12));
    words.extend(std::iter::repeat(adc_sample(5)).take(640));
    words.push(special(13));
    // The reset readout then subtracts the staged signal level.
    words.push(special(11));
    for value in 0..640 {
        words.push(adc_sample(value + 5));
    }
    words.push(special(13));
    words.push(special(10));
    harness.translate(&words);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame.valid);
    // Sample k of the reset pass carried k + 5 against a staged 5, so the
    // row that sample k maps to must hold k << 6. Ascending odd rows first:
    assert_eq!(frame.pixels[1], 0);
    assert_eq!(frame.pixels[3], 1 << 6);
    assert_eq!(frame.pixels[639], 319 << 6);
    // The offset direction switches after the 320th sample of a column.
    assert_eq!(frame.pixels[638], 320 << 6);
    assert_eq!(frame.pixels[636], 321 << 6);
    assert_eq!(frame.pixels[0], 639 << 6);
}

#[test]
fn windowed_readout_stages_against_the_full_sensor() {
    // 2x2 window at (1, 1) of a 4x4 sensor; staging indices use the full
    // sensor stride while the emitted frame stays window-relative.
    let mut geometry = frame_geometry(2, 2);
    geometry.aps_size_x = 4;
    geometry.aps_size_y = 4;
    geometry.aps_window0_start_x = 1;
    geometry.aps_window0_start_y = 1;
    let mut harness = Harness::new(geometry);
    harness.translate(&[
        ts(0x10),
        special(8),
        special(11),
        adc_sample(900),
        adc_sample(800),
        special(13),
        special(11),
        adc_sample(700),
        adc_sample(600),
        special(13),
        special(12),
        adc_sample(100),
        adc_sample(50),
        special(13),
        special(12),
        adc_sample(30),
        adc_sample(20),
        special(13),
        special(10),
    ]);
    // A second frame without reset reads must subtract against the values
    // staged by the first frame.
    harness.translate(&[
        special(14),
        special(12),
        adc_sample(200),
        adc_sample(100),
        special(13),
        special(12),
        adc_sample(150),
        adc_sample(50),
        special(13),
        special(10),
    ]);
    let frames = harness.decoder.pending_frames();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].valid);
    assert_eq!(frames[0].width, 2);
    assert_eq!(frames[0].height, 2);
    assert_eq!(
        frames[0].pixels,
        vec![
            (900 - 100) << 6,
            (700 - 30) << 6,
            (800 - 50) << 6,
            (600 - 20) << 6,
        ],
    );
    assert!(frames[1].valid);
    assert_eq!(
        frames[1].pixels,
        vec![
            (900 - 200) << 6,
            (700 - 150) << 6,
            (800 - 100) << 6,
            (600 - 50) << 6,
        ],
    );
}

#[test]
fn imu_record_assembles_and_converts() {
    let mut harness = Harness::new(dvs_geometry());
    let mut words = vec![ts(0x32), special(5), special(16)];
    // Accel X = 16384 (1 g at ±2 g full scale), everything else zero.
    words.push(imu_byte(0x40));
    words.push(imu_byte(0x00));
    words.extend(std::iter::repeat(imu_byte(0)).take(12));
    words.push(special(7));
    harness.translate(&words);
    let events = harness.decoder.pending_imu6();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.t, 0x32);
    assert!((event.accel_x - 1.0).abs() < 1e-6);
    assert!(event.accel_y.abs() < 1e-6);
    assert!(event.accel_z.abs() < 1e-6);
    assert!(event.gyro_x.abs() < 1e-6);
    assert!((event.temperature - 36.53).abs() < 1e-4);
}

#[test]
fn imu_recovers_from_missing_scale_config() {
    let mut harness = Harness::new(dvs_geometry());
    let mut words = vec![ts(0x32), special(5)];
    words.push(imu_byte(0x40));
    words.push(imu_byte(0x00));
    words.extend(std::iter::repeat(imu_byte(0)).take(12));
    words.push(special(7));
    harness.translate(&words);
    let events = harness.decoder.pending_imu6();
    assert_eq!(events.len(), 1);
    assert!((events[0].accel_x - 1.0).abs() < 1e-6);
}

#[test]
fn incomplete_imu_record_is_discarded() {
    let mut harness = Harness::new(dvs_geometry());
    let mut words = vec![ts(0x32), special(5), special(16)];
    words.extend(std::iter::repeat(imu_byte(0)).take(13));
    words.push(special(7));
    harness.translate(&words);
    assert!(harness.decoder.pending_imu6().is_empty());
}

#[test]
fn excess_imu_samples_are_discarded() {
    let mut harness = Harness::new(dvs_geometry());
    let mut words = vec![ts(0x32), special(5), special(16)];
    words.push(imu_byte(0x40));
    words.push(imu_byte(0x00));
    words.extend(std::iter::repeat(imu_byte(0x7F)).take(14));
    words.push(special(7));
    harness.translate(&words);
    let events = harness.decoder.pending_imu6();
    assert_eq!(events.len(), 1);
    assert!((events[0].accel_x - 1.0).abs() < 1e-6);
    // The 15th byte must not have corrupted the record.
    assert!((events[0].gyro_z - f32::from(i16::from_be_bytes([0x7F, 0x7F])) / 131.072).abs() < 1e-3);
}

#[test]
fn packets_commit_at_capacity() {
    let configuration = configuration::Configuration::default();
    configuration
        .max_polarity_packet_size
        .store(2, Ordering::Relaxed);
    let mut harness = Harness::with(dvs_geometry(), configuration, 64);
    harness.translate(&[ts(0x10), dvs_y(1), dvs_x_on(1), dvs_y(2), dvs_x_on(2)]);
    assert!(harness.decoder.pending_polarity().is_empty());
    let container = harness.exchange.get().unwrap();
    assert_eq!(container.polarity.unwrap().len(), 2);
    assert_eq!(harness.notifications.load(Ordering::SeqCst), 1);
}

#[test]
fn packets_commit_when_the_interval_elapses() {
    let configuration = configuration::Configuration::default();
    configuration
        .max_polarity_packet_interval
        .store(50, Ordering::Relaxed);
    let mut harness = Harness::with(dvs_geometry(), configuration, 64);
    harness.translate(&[ts(0x00), dvs_y(1), dvs_x_on(1)]);
    assert_eq!(harness.decoder.pending_polarity().len(), 1);
    harness.translate(&[ts(0x3C), dvs_y(2), dvs_x_on(2)]);
    assert!(harness.decoder.pending_polarity().is_empty());
    let container = harness.exchange.get().unwrap();
    let events = container.polarity.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].t - events[0].t, 0x3C);
}

#[test]
fn overflowing_the_exchange_drops_the_newest_packet() {
    let configuration = configuration::Configuration::default();
    configuration
        .max_polarity_packet_size
        .store(2, Ordering::Relaxed);
    let mut harness = Harness::with(dvs_geometry(), configuration, 1);
    harness.translate(&[ts(0x10), dvs_y(1), dvs_x_on(1), dvs_y(2), dvs_x_on(2)]);
    assert_eq!(harness.exchange.len(), 1);
    // The exchange is full now; the next commit is dropped.
    harness.translate(&[ts(0x20), dvs_y(3), dvs_x_on(3), dvs_y(4), dvs_x_on(4)]);
    assert_eq!(harness.exchange.len(), 1);
    assert_eq!(harness.notifications.load(Ordering::SeqCst), 1);
    let container = harness.exchange.get().unwrap();
    assert_eq!(container.polarity.unwrap()[0].t, 0x10);
}

#[test]
fn dropped_frame_packet_ignores_aps_until_next_start() {
    let configuration = configuration::Configuration::default();
    configuration
        .max_frame_packet_size
        .store(1, Ordering::Relaxed);
    configuration
        .max_polarity_packet_size
        .store(2, Ordering::Relaxed);
    let mut harness = Harness::with(frame_geometry(1, 1), configuration, 1);
    // Fill the exchange so the frame commit below has nowhere to go.
    harness.translate(&[ts(0x10), dvs_y(1), dvs_x_on(1), dvs_y(2), dvs_x_on(2)]);
    assert_eq!(harness.exchange.len(), 1);
    harness.translate(&[
        ts(0x64),
        special(8),
        special(11),
        adc_sample(800),
        special(13),
        special(12),
        adc_sample(200),
        special(13),
        special(10),
    ]);
    assert!(harness.decoder.pending_frames().is_empty());
    // Column and end markers without a fresh start must stay ignored.
    harness.translate(&[
        special(11),
        adc_sample(800),
        special(13),
        special(12),
        adc_sample(200),
        special(13),
        special(10),
    ]);
    assert!(harness.decoder.pending_frames().is_empty());
    // A new start resynchronizes the readout.
    let _ = harness.exchange.get();
    harness.translate(&[
        special(8),
        special(11),
        adc_sample(800),
        special(13),
        special(12),
        adc_sample(200),
        special(13),
        special(10),
    ]);
    assert_eq!(harness.exchange.len(), 1);
    let container = harness.exchange.get().unwrap();
    assert_eq!(container.frames.unwrap().len(), 1);
}

#[test]
fn reset_marker_is_never_lost_under_backpressure() {
    let configuration = configuration::Configuration::default();
    configuration
        .max_polarity_packet_size
        .store(2, Ordering::Relaxed);
    let mut harness = Harness::with(dvs_geometry(), configuration, 1);
    harness.translate(&[ts(0x10), dvs_y(1), dvs_x_on(1), dvs_y(2), dvs_x_on(2)]);
    assert_eq!(harness.exchange.len(), 1);
    let exchange = harness.exchange.clone();
    let consumer = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut popped = Vec::new();
        loop {
            if let Some(container) = exchange.get() {
                let done = container
                    .special
                    .as_ref()
                    .is_some_and(|events| {
                        events[0].kind == SpecialEventKind::TimestampReset
                    });
                popped.push(container);
                if done {
                    return popped;
                }
            }
            std::thread::yield_now();
        }
    });
    // Leave a polarity event pending so the flush has content, then reset;
    // the translate call spins until the consumer makes room.
    harness.translate(&[ts(0x20), dvs_y(3), dvs_x_on(3)]);
    harness.translate(&[special(1)]);
    let popped = consumer.join().unwrap();
    let last = popped.last().unwrap();
    assert_eq!(
        last.special.as_ref().unwrap()[0].kind,
        SpecialEventKind::TimestampReset,
    );
    assert!(last.polarity.is_none());
}

#[test]
fn odd_trailing_byte_is_discarded() {
    let mut harness = Harness::new(dvs_geometry());
    let mut payload = bytes(&[ts(0x10), dvs_y(5), dvs_x_on(3)]);
    payload.push(0xAB);
    harness.decoder.translate(&payload);
    assert_eq!(harness.decoder.pending_polarity().len(), 1);
    assert_eq!(harness.decoder.current_timestamp(), 0x10);
}
