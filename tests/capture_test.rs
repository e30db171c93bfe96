use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;

use dsp_kit::dsp::LoopbackDevice;
use dsp_kit::dsp::loopback::capture_pattern;
use dsp_kit::{
    DevicePaths, DeviceManager, DriverConfig, LoopbackBackend, LoopbackSpec, Notifier, PcmFormat,
    StreamState, WaveEvent, WaveHeader, WaveOpen,
};

const TIMEOUT: Duration = Duration::from_secs(3);

fn format() -> PcmFormat {
    PcmFormat::stereo16(48_000)
}

fn loopback() -> (DeviceManager, Arc<LoopbackDevice>) {
    let backend = Arc::new(LoopbackBackend::new());
    let device = backend.add_device("/dev/dsp", LoopbackSpec::default());
    let manager = DeviceManager::init(
        DriverConfig::with_devices(vec![DevicePaths::new("/dev/dsp", "/dev/mixer")]),
        backend,
    );
    (manager, device)
}

fn next_done(events: &Receiver<WaveEvent>) -> Arc<WaveHeader> {
    loop {
        match events.recv_timeout(TIMEOUT) {
            Ok(WaveEvent::Done(header)) => return header,
            Ok(_) => continue,
            Err(err) => panic!("no buffer returned: {err}"),
        }
    }
}

fn assert_pattern(header: &WaveHeader, start: u64) {
    let data = header.data();
    for (i, byte) in data[..header.bytes_recorded()].iter().enumerate() {
        assert_eq!(*byte, capture_pattern(start + i as u64), "byte {i}");
    }
}

#[test]
fn fragment_spreads_across_small_buffers() {
    let (manager, _device) = loopback();
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_input(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    // The 1024-byte fragment covers two and a half of these.
    const LEN: usize = 410;
    let first = Arc::new(WaveHeader::with_capacity(LEN));
    let second = Arc::new(WaveHeader::with_capacity(LEN));
    stream.submit(Arc::clone(&first)).expect("submit");
    stream.submit(Arc::clone(&second)).expect("submit");
    stream.start().expect("start");

    assert!(Arc::ptr_eq(&next_done(&events), &first));
    assert!(Arc::ptr_eq(&next_done(&events), &second));
    assert_eq!(first.bytes_recorded(), LEN);
    assert_eq!(second.bytes_recorded(), LEN);
    assert_pattern(&first, 0);
    assert_pattern(&second, LEN as u64);

    // The rest of the fragment is gone and nothing blocks waiting for room.
    thread::sleep(Duration::from_millis(30));
    assert_eq!(stream.recorded_bytes(), 1_024);
    assert_eq!(stream.read_bytes(), 1_024);
    assert_eq!(stream.queued(), 0);
    assert_eq!(stream.state(), StreamState::Playing);
    stream.stop().expect("stop");
}

#[test]
fn stop_returns_partial_buffer() {
    let (manager, _device) = loopback();
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_input(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    let header = Arc::new(WaveHeader::with_capacity(192_000));
    stream.submit(Arc::clone(&header)).expect("submit");
    stream.start().expect("start");
    thread::sleep(Duration::from_millis(60));
    stream.stop().expect("stop");

    let done = next_done(&events);
    assert!(Arc::ptr_eq(&done, &header));
    let recorded = header.bytes_recorded();
    assert!(recorded > 0 && recorded < header.len(), "recorded {recorded}");
    assert_pattern(&header, 0);
    assert_eq!(stream.state(), StreamState::Stopped);
}

#[test]
fn reset_returns_every_buffer() {
    let (manager, _device) = loopback();
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_input(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    let headers: Vec<_> = (0..3)
        .map(|_| Arc::new(WaveHeader::with_capacity(96_000)))
        .collect();
    for header in &headers {
        stream.submit(Arc::clone(header)).expect("submit");
    }
    stream.start().expect("start");
    thread::sleep(Duration::from_millis(20));
    stream.reset().expect("reset");

    for header in &headers {
        assert!(Arc::ptr_eq(&next_done(&events), header));
    }
    assert_eq!(stream.queued(), 0);
    assert_eq!(stream.recorded_bytes(), 0);
    assert_eq!(stream.state(), StreamState::Stopped);
}

#[test]
fn output_and_input_share_the_device() {
    let (manager, device) = loopback();
    let open = WaveOpen::strict(format());
    let mut playback = manager
        .open_output(0, &open, Notifier::None)
        .expect("output");
    let mut capture = manager.open_input(0, &open, Notifier::None).expect("input");

    let session = manager.session(0).expect("session");
    assert_eq!(session.open_count(), 2);

    playback.close().expect("close output");
    assert_eq!(session.open_count(), 1);
    assert!(device.is_open());

    capture.close().expect("close input");
    assert_eq!(session.open_count(), 0);
    assert!(!device.is_open());
}
