use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;

use dsp_kit::dsp::LoopbackDevice;
use dsp_kit::dsp::loopback::capture_pattern;
use dsp_kit::mapped::volume_pan_to_percent;
use dsp_kit::{
    BufferMode, BufferPosition, DevicePaths, DeviceManager, Direction, DriverConfig, DriverError,
    LoopbackBackend, LoopbackSpec, PcmFormat, PositionNotification, Quirks,
};

fn format() -> PcmFormat {
    PcmFormat::stereo16(48_000)
}

fn loopback(quirks: Quirks) -> (DeviceManager, Arc<LoopbackDevice>) {
    let backend = Arc::new(LoopbackBackend::with_quirks(quirks));
    let device = backend.add_device(
        "/dev/dsp",
        LoopbackSpec {
            mixer: Some("/dev/mixer".to_string()),
            ..LoopbackSpec::default()
        },
    );
    let manager = DeviceManager::init(
        DriverConfig::with_devices(vec![DevicePaths::new("/dev/dsp", "/dev/mixer")]),
        backend,
    );
    (manager, device)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

#[test]
fn matching_length_maps_directly() {
    let (manager, device) = loopback(Quirks::empty());
    let mut buffer = manager
        .create_mapped_buffer(0, format(), 32_768, Direction::Output)
        .expect("create");
    assert_eq!(buffer.mode(), BufferMode::Direct);
    assert_eq!(buffer.len(), 32_768);
    assert!(matches!(
        buffer.lock(0, 1_024),
        Err(DriverError::Unsupported)
    ));

    let view = buffer.dma_view().expect("direct view");
    let data = pattern(32_768);
    assert_eq!(view.write_at(0, &data), data.len());

    buffer.play().expect("play");
    assert!(buffer.is_playing());
    thread::sleep(Duration::from_millis(60));
    buffer.stop().expect("stop");
    assert!(!buffer.is_playing());

    let played = device.played();
    assert!(!played.is_empty());
    let n = played.len().min(data.len());
    assert_eq!(played[..n], data[..n]);
}

#[test]
fn odd_length_is_staged() {
    let (manager, device) = loopback(Quirks::empty());
    let mut buffer = manager
        .create_mapped_buffer(0, format(), 30_000, Direction::Output)
        .expect("create");
    assert_eq!(buffer.mode(), BufferMode::Staged);
    assert!(buffer.dma_view().is_none());

    let data = pattern(30_000);
    {
        let mut lock = buffer.lock(20_000, 30_000).expect("lock");
        assert_eq!(lock.first().len(), 10_000);
        assert_eq!(lock.second().len(), 20_000);
        let mut rotated = data[20_000..].to_vec();
        rotated.extend_from_slice(&data[..20_000]);
        assert_eq!(lock.write(&rotated), 30_000);
    }

    buffer.play().expect("play");
    thread::sleep(Duration::from_millis(200));
    buffer.stop().expect("stop");

    // The staging buffer repeats as the device plays past its end.
    let played = device.played();
    assert!(played.len() > data.len(), "played {}", played.len());
    for (i, byte) in played.iter().enumerate() {
        assert_eq!(*byte, data[i % data.len()], "byte {i}");
    }
}

#[test]
fn short_staged_buffer_repeats_cleanly() {
    let (manager, device) = loopback(Quirks::empty());
    let mut buffer = manager
        .create_mapped_buffer(0, format(), 960, Direction::Output)
        .expect("create");
    assert_eq!(buffer.mode(), BufferMode::Staged);

    let data = pattern(960);
    {
        let mut lock = buffer.lock(0, 960).expect("lock");
        assert_eq!(lock.write(&data), 960);
    }

    buffer.play().expect("play");
    thread::sleep(Duration::from_millis(50));
    buffer.stop().expect("stop");

    let played = device.played();
    assert!(played.len() > 4 * data.len(), "played {}", played.len());
    for (i, byte) in played.iter().enumerate() {
        assert_eq!(*byte, data[i % data.len()], "byte {i}");
    }
}

#[test]
fn staged_capture_copies_device_data() {
    let (manager, _device) = loopback(Quirks::empty());
    let mut buffer = manager
        .create_mapped_buffer(0, format(), 30_000, Direction::Input)
        .expect("create");
    assert_eq!(buffer.mode(), BufferMode::Staged);

    buffer.play().expect("start");
    thread::sleep(Duration::from_millis(80));
    buffer.stop().expect("stop");

    let BufferPosition::Capture { capture, read } = buffer.position().expect("position") else {
        panic!("capture buffer reported a render position");
    };
    assert_eq!(capture, read);
    assert!(capture > 0);

    let mut out = vec![0u8; capture];
    let lock = buffer.lock(0, capture).expect("lock");
    assert_eq!(lock.read(&mut out), capture);
    for (i, byte) in out.iter().enumerate() {
        assert_eq!(*byte, capture_pattern(i as u64), "byte {i}");
    }
}

#[test]
fn notifications_fire_in_buffer_order() {
    let (manager, _device) = loopback(Quirks::empty());
    let buffer = manager
        .create_mapped_buffer(0, format(), 32_768, Direction::Output)
        .expect("create");

    let (tx, rx) = unbounded();
    let offsets = [24_576, 8_192, 16_384];
    buffer
        .set_notification_positions(
            offsets
                .iter()
                .map(|&offset| PositionNotification {
                    offset,
                    signal: tx.clone(),
                })
                .collect(),
        )
        .expect("notifications");

    buffer.play().expect("play");
    let fired: Vec<usize> = (0..4)
        .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("notification"))
        .collect();
    buffer.stop().expect("stop");
    assert_eq!(fired, vec![8_192, 16_384, 24_576, 8_192]);

    assert!(matches!(
        buffer.set_notification_positions(vec![PositionNotification {
            offset: 32_768,
            signal: tx,
        }]),
        Err(DriverError::FormatUnsupported(_))
    ));
}

#[test]
fn render_position_leads_by_a_fragment() {
    let (manager, _device) = loopback(Quirks::empty());
    let buffer = manager
        .create_mapped_buffer(0, format(), 32_768, Direction::Output)
        .expect("create");
    let BufferPosition::Render { play, write } = buffer.position().expect("position") else {
        panic!("render buffer reported a capture position");
    };
    assert_eq!(play, 0);
    assert_eq!(write, 2_048);
}

#[test]
fn stop_on_stubborn_backend_needs_recreate() {
    let (manager, _device) = loopback(Quirks::STOP_NEEDS_CLOSE);
    let mut buffer = manager
        .create_mapped_buffer(0, format(), 32_768, Direction::Output)
        .expect("create");
    buffer.play().expect("play");
    assert!(matches!(buffer.stop(), Err(DriverError::MustRecreate)));
    buffer.close().expect("close");
    assert!(matches!(buffer.play(), Err(DriverError::InvalidHandle)));
}

#[test]
fn length_must_be_whole_frames() {
    let (manager, _device) = loopback(Quirks::empty());
    assert!(matches!(
        manager.create_mapped_buffer(0, format(), 30_001, Direction::Output),
        Err(DriverError::FormatUnsupported(_))
    ));
}

#[test]
fn volume_and_pan_reach_the_mixer() {
    let (manager, _device) = loopback(Quirks::empty());
    let buffer = manager
        .create_mapped_buffer(0, format(), 32_768, Direction::Output)
        .expect("create");
    buffer.set_volume_pan(-600, 0).expect("volume");
    assert_eq!(
        manager.backend().mixer_volume("/dev/mixer").expect("mixer"),
        volume_pan_to_percent(-600, 0)
    );
    drop(buffer);

    let capture = manager
        .create_mapped_buffer(0, format(), 32_768, Direction::Input)
        .expect("create");
    assert!(matches!(
        capture.set_volume_pan(0, 0),
        Err(DriverError::Unsupported)
    ));
}

#[test]
fn pan_attenuates_the_far_channel() {
    assert_eq!(volume_pan_to_percent(0, 0), (100, 100));
    assert_eq!(volume_pan_to_percent(-2_000, 0), (10, 10));
    let (left, right) = volume_pan_to_percent(0, 600);
    assert_eq!(right, 100);
    assert!(left < right);
}
