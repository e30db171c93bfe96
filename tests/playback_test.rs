use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use dsp_kit::dsp::LoopbackDevice;
use dsp_kit::{
    DevicePaths, DeviceManager, DriverConfig, DriverError, LoopbackBackend, LoopbackSpec, MmTime,
    Notifier, PcmFormat, StreamState, TimeFormat, Volume, WaveEvent, WaveHeader, WaveOpen,
};

const TIMEOUT: Duration = Duration::from_secs(3);

fn format() -> PcmFormat {
    PcmFormat::stereo16(48_000)
}

fn loopback(spec: LoopbackSpec) -> (DeviceManager, Arc<LoopbackDevice>) {
    let backend = Arc::new(LoopbackBackend::new());
    let device = backend.add_device("/dev/dsp", spec);
    let manager = DeviceManager::init(
        DriverConfig::with_devices(vec![DevicePaths::new("/dev/dsp", "/dev/mixer")]),
        backend,
    );
    (manager, device)
}

fn tone(len: usize, seed: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + seed * 97) % 253) as u8).collect()
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

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn buffers_return_in_order() {
    let (manager, device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let mut stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");
    assert!(matches!(events.recv_timeout(TIMEOUT), Ok(WaveEvent::Open)));

    const LEN: usize = 4_096;
    let headers: Vec<_> = (0..3)
        .map(|seed| Arc::new(WaveHeader::new(tone(LEN, seed))))
        .collect();
    for header in &headers {
        stream.submit(Arc::clone(header)).expect("submit");
    }

    for (k, expected) in headers.iter().enumerate() {
        let done = next_done(&events);
        assert!(Arc::ptr_eq(&done, expected), "buffer {k} returned out of order");
        assert!(done.is_done());
        assert!(stream.played_bytes() >= ((k + 1) * LEN) as u64);
    }

    wait_until("device to drain", || device.played_len() >= 3 * LEN);
    let expected: Vec<u8> = (0..3).flat_map(|seed| tone(LEN, seed)).collect();
    assert_eq!(device.played(), expected);
    assert_eq!(stream.queued(), 0);
    assert_eq!(stream.written_bytes(), (3 * LEN) as u64);
    stream.close().expect("close");
    assert!(matches!(events.recv_timeout(TIMEOUT), Ok(WaveEvent::Close)));
}

#[test]
fn loop_plays_each_pass_and_returns_once() {
    let (manager, device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    const LEN: usize = 4_096;
    let data = tone(LEN, 1);
    let header = Arc::new(WaveHeader::new(data.clone()).begin_loop(3).end_loop());
    stream.submit(Arc::clone(&header)).expect("submit");

    let done = next_done(&events);
    assert!(Arc::ptr_eq(&done, &header));
    assert_eq!(header.loops(), 3);

    wait_until("three passes", || device.played_len() >= 3 * LEN);
    assert_eq!(device.played(), data.repeat(3));
    thread::sleep(Duration::from_millis(50));
    assert!(
        !events.try_iter().any(|e| matches!(e, WaveEvent::Done(_))),
        "looped buffer returned more than once"
    );
}

#[test]
fn pause_and_restart_deliver_every_byte_once() {
    let (manager, device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    // A quarter second, longer than the hardware buffer.
    let data = tone(48_000, 2);
    let header = Arc::new(WaveHeader::new(data.clone()));
    stream.submit(Arc::clone(&header)).expect("submit");
    thread::sleep(Duration::from_millis(40));

    stream.pause().expect("pause");
    assert_eq!(stream.state(), StreamState::Paused);
    assert!(!header.is_done());
    let held = device.played_len();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(device.played_len(), held, "device kept playing while paused");

    stream.restart().expect("restart");
    assert_eq!(stream.state(), StreamState::Playing);
    let done = next_done(&events);
    assert!(Arc::ptr_eq(&done, &header));

    wait_until("device to drain", || device.played_len() >= data.len());
    thread::sleep(Duration::from_millis(20));
    assert_eq!(device.played(), data);
}

#[test]
fn reset_returns_partially_written_buffers() {
    let (manager, _device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    // Each is twice the hardware buffer, so the first can only be part written.
    let first = Arc::new(WaveHeader::new(tone(32_768, 3)));
    let second = Arc::new(WaveHeader::new(tone(32_768, 4)));
    stream.submit(Arc::clone(&first)).expect("submit");
    stream.submit(Arc::clone(&second)).expect("submit");
    thread::sleep(Duration::from_millis(20));

    stream.reset().expect("reset");
    let returned: Vec<_> = events
        .try_iter()
        .filter_map(|event| match event {
            WaveEvent::Done(header) => Some(header),
            _ => None,
        })
        .collect();
    assert_eq!(returned.len(), 2);
    assert!(Arc::ptr_eq(&returned[0], &first));
    assert!(Arc::ptr_eq(&returned[1], &second));
    assert!(first.is_done() && second.is_done());
    assert_eq!(stream.queued(), 0);
    assert_eq!(stream.state(), StreamState::Stopped);
    assert_eq!(stream.played_bytes(), 0);
}

#[test]
fn break_loop_ends_on_a_whole_pass() {
    let (manager, device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    const LEN: usize = 4_096;
    let data = tone(LEN, 6);
    let tail = tone(2_048, 7);
    let looped = Arc::new(WaveHeader::new(data.clone()).begin_loop(50).end_loop());
    let after = Arc::new(WaveHeader::new(tail.clone()));
    stream.submit(Arc::clone(&looped)).expect("submit loop");
    stream.submit(Arc::clone(&after)).expect("submit tail");
    thread::sleep(Duration::from_millis(150));

    stream.break_loop().expect("break loop");
    assert!(Arc::ptr_eq(&next_done(&events), &looped));
    assert!(Arc::ptr_eq(&next_done(&events), &after));
    thread::sleep(Duration::from_millis(50));
    assert!(
        !events.try_iter().any(|e| matches!(e, WaveEvent::Done(_))),
        "a buffer returned twice"
    );

    let played = device.played();
    let looped_len = played.len() - tail.len();
    assert_eq!(looped_len % LEN, 0, "loop stopped mid-buffer");
    let passes = looped_len / LEN;
    assert!((2..50).contains(&passes), "played {passes} passes");
    assert_eq!(played[..looped_len], data.repeat(passes)[..]);
    assert_eq!(played[looped_len..], tail[..]);
}

#[test]
fn reset_while_paused_returns_everything() {
    let (manager, _device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    let headers: Vec<_> = (0..3)
        .map(|seed| Arc::new(WaveHeader::new(tone(32_768, seed + 8))))
        .collect();
    for header in &headers {
        stream.submit(Arc::clone(header)).expect("submit");
    }
    thread::sleep(Duration::from_millis(20));
    stream.pause().expect("pause");
    assert_eq!(stream.state(), StreamState::Paused);

    stream.reset().expect("reset");
    let returned: Vec<_> = events
        .try_iter()
        .filter_map(|event| match event {
            WaveEvent::Done(header) => Some(header),
            _ => None,
        })
        .collect();
    assert_eq!(returned.len(), headers.len());
    for (done, expected) in returned.iter().zip(&headers) {
        assert!(Arc::ptr_eq(done, expected));
        assert!(done.is_done());
    }
    assert_eq!(stream.queued(), 0);
    assert_eq!(stream.state(), StreamState::Stopped);

    // The stream is usable again after the reset.
    let again = Arc::new(WaveHeader::new(tone(4_096, 11)));
    stream.submit(Arc::clone(&again)).expect("submit after reset");
    assert!(Arc::ptr_eq(&next_done(&events), &again));
}

#[test]
fn close_with_queued_buffers_is_refused() {
    let (manager, _device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let mut stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    let header = Arc::new(WaveHeader::new(tone(96_000, 5)));
    stream.submit(Arc::clone(&header)).expect("submit");
    assert!(matches!(
        stream.submit(Arc::clone(&header)),
        Err(DriverError::InvalidHandle)
    ));
    assert!(matches!(stream.close(), Err(DriverError::StillActive)));

    // Dropping resets first, so the buffer still comes back.
    drop(stream);
    assert!(Arc::ptr_eq(&next_done(&events), &header));
    assert!(matches!(events.recv_timeout(TIMEOUT), Ok(WaveEvent::Close)));
    assert_eq!(manager.session(0).expect("session").open_count(), 0);
}

#[test]
fn position_tracks_played_bytes() {
    let (manager, _device) = loopback(LoopbackSpec::default());
    let (notifier, events) = Notifier::channel();
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), notifier)
        .expect("open");

    stream
        .submit(Arc::new(WaveHeader::new(tone(19_200, 6))))
        .expect("submit");
    next_done(&events);

    assert_eq!(
        stream.position(TimeFormat::Bytes).expect("bytes"),
        MmTime::Bytes(19_200)
    );
    assert_eq!(
        stream.position(TimeFormat::Samples).expect("samples"),
        MmTime::Samples(4_800)
    );
    assert_eq!(
        stream.position(TimeFormat::Millis).expect("millis"),
        MmTime::Millis(100)
    );
}

#[test]
fn volume_goes_through_the_mixer() {
    let spec = LoopbackSpec {
        mixer: Some("/dev/mixer".to_string()),
        ..LoopbackSpec::default()
    };
    let (manager, _device) = loopback(spec);
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), Notifier::None)
        .expect("open");

    let volume = Volume::both(0x8000);
    stream.set_volume(volume).expect("set");
    assert_eq!(stream.volume().expect("get"), volume);

    let (manager, _device) = loopback(LoopbackSpec::default());
    let stream = manager
        .open_output(0, &WaveOpen::strict(format()), Notifier::None)
        .expect("open");
    assert!(matches!(
        stream.set_volume(volume),
        Err(DriverError::Unsupported)
    ));
}
