use std::thread;

use super::{loopback_manager, request};
use crate::config::Quirks;
use crate::dsp::{Access, DSP_CAP_REALTIME, DSP_CAP_TRIGGER, Direction, LoopbackSpec};
use crate::error::DriverError;
use crate::format::PcmFormat;
use crate::manager::WaveOpen;
use crate::session::{Capabilities, Negotiation};

#[test]
fn duplex_join_shares_one_descriptor() {
    let (manager, device) = loopback_manager(LoopbackSpec::default(), Quirks::empty());
    let format = PcmFormat::stereo16(48_000);

    let output = manager
        .acquire(0, request(Direction::Output, Access::ReadWrite, format))
        .expect("output");
    let input = manager
        .acquire(0, request(Direction::Input, Access::ReadWrite, format))
        .expect("input");

    let session = manager.session(0).expect("session");
    assert_eq!(session.open_count(), 2);
    assert_eq!(device.open_calls(), 4, "three probe opens plus one real open");
    assert!(session.is_armed(Direction::Output));
    assert!(session.is_armed(Direction::Input));

    manager.release(output);
    assert_eq!(session.open_count(), 1);
    assert!(device.is_open());
    manager.release(input);
    assert_eq!(session.open_count(), 0);
    assert!(!device.is_open());
}

#[test]
fn join_with_other_format_is_refused() {
    let (manager, _device) = loopback_manager(LoopbackSpec::default(), Quirks::empty());
    let _output = manager
        .acquire(
            0,
            request(Direction::Output, Access::ReadWrite, PcmFormat::stereo16(48_000)),
        )
        .expect("output");

    let err = manager
        .acquire(
            0,
            request(Direction::Input, Access::ReadWrite, PcmFormat::stereo16(22_050)),
        )
        .expect_err("mismatched format");
    assert!(matches!(err, DriverError::FormatUnsupported(_)));
    assert_eq!(manager.session(0).expect("session").open_count(), 1);
}

#[test]
fn half_duplex_device_refuses_second_direction() {
    let spec = LoopbackSpec {
        caps: DSP_CAP_TRIGGER | DSP_CAP_REALTIME,
        ..LoopbackSpec::default()
    };
    let (manager, _device) = loopback_manager(spec, Quirks::empty());
    let info = &manager.devices()[0];
    assert!(!info.capabilities.contains(Capabilities::DUPLEX));

    let format = PcmFormat::stereo16(48_000);
    let _output = manager
        .acquire(0, request(Direction::Output, Access::WriteOnly, format))
        .expect("output");
    let err = manager
        .acquire(0, request(Direction::Input, Access::ReadOnly, format))
        .expect_err("second direction");
    assert!(matches!(err, DriverError::FormatUnsupported(_)));
}

#[test]
fn other_thread_cannot_join() {
    let (manager, _device) = loopback_manager(LoopbackSpec::default(), Quirks::empty());
    let format = PcmFormat::stereo16(48_000);
    let _output = manager
        .acquire(0, request(Direction::Output, Access::ReadWrite, format))
        .expect("output");

    let result = thread::scope(|scope| {
        scope
            .spawn(|| manager.acquire(0, request(Direction::Input, Access::ReadWrite, format)))
            .join()
            .expect("join")
    });
    assert!(matches!(result, Err(DriverError::DeviceBusy)));
}

#[test]
fn rejected_trigger_retries_with_other_direction_flipped() {
    let spec = LoopbackSpec {
        reject_trigger: Some(0),
        ..LoopbackSpec::default()
    };
    let (manager, device) = loopback_manager(spec, Quirks::TRIGGER_SWAP_RETRY);
    let lease = manager
        .acquire(
            0,
            request(Direction::Output, Access::ReadWrite, PcmFormat::stereo16(48_000)),
        )
        .expect("output");

    lease.arm(false).expect("retried");
    let session = manager.session(0).expect("session");
    assert!(!session.is_armed(Direction::Output));
    assert!(session.is_armed(Direction::Input));
    assert_eq!(device.trigger(), Direction::Input.trigger_bit());
}

#[test]
fn rejected_trigger_without_quirk_fails() {
    let spec = LoopbackSpec {
        reject_trigger: Some(0),
        ..LoopbackSpec::default()
    };
    let (manager, _device) = loopback_manager(spec, Quirks::empty());
    let lease = manager
        .acquire(
            0,
            request(Direction::Output, Access::ReadWrite, PcmFormat::stereo16(48_000)),
        )
        .expect("output");
    assert!(matches!(lease.arm(false), Err(DriverError::Io(_))));
}

#[test]
fn strict_open_refuses_a_different_rate() {
    let (manager, _device) = loopback_manager(LoopbackSpec::default(), Quirks::empty());
    let requested = PcmFormat::stereo16(32_000);

    let err = manager
        .query_format(0, Direction::Output, &WaveOpen::strict(requested))
        .expect_err("strict");
    assert!(matches!(err, DriverError::FormatUnsupported(_)));

    let negotiation = manager
        .query_format(0, Direction::Output, &WaveOpen::new(requested))
        .expect("relaxed");
    assert_eq!(
        negotiation,
        Negotiation::Downgraded {
            requested,
            granted: PcmFormat::stereo16(22_050),
        }
    );
    assert_eq!(manager.session(0).expect("session").open_count(), 0);
}

#[test]
fn near_rate_counts_as_exact() {
    let spec = LoopbackSpec {
        rates: vec![44_000],
        ..LoopbackSpec::default()
    };
    let (manager, _device) = loopback_manager(spec, Quirks::empty());
    let requested = PcmFormat::stereo16(44_100);
    let negotiation = manager
        .query_format(0, Direction::Output, &WaveOpen::strict(requested))
        .expect("within tolerance");
    assert_eq!(negotiation, Negotiation::Exact(requested));
}

#[test]
fn shared_flush_leaves_the_device_alone() {
    let (manager, device) = loopback_manager(LoopbackSpec::default(), Quirks::empty());
    let format = PcmFormat::stereo16(48_000);
    let output = manager
        .acquire(0, request(Direction::Output, Access::ReadWrite, format))
        .expect("output");
    let _input = manager
        .acquire(0, request(Direction::Input, Access::ReadWrite, format))
        .expect("input");

    let halts = device.halt_calls();
    output.flush().expect("flush");
    assert_eq!(device.halt_calls(), halts);
}

#[test]
fn shutdown_invalidates_new_opens() {
    let (manager, _device) = loopback_manager(LoopbackSpec::default(), Quirks::empty());
    manager.shutdown();
    let err = manager
        .acquire(
            0,
            request(Direction::Output, Access::ReadWrite, PcmFormat::stereo16(48_000)),
        )
        .expect_err("after shutdown");
    assert!(matches!(err, DriverError::InvalidHandle));
}

#[test]
fn strict_join_refuses_a_downgraded_session() {
    let (manager, _device) = loopback_manager(LoopbackSpec::default(), Quirks::empty());
    let requested = PcmFormat::stereo16(32_000);
    let granted = PcmFormat::stereo16(22_050);

    let mut relaxed = request(Direction::Output, Access::ReadWrite, requested);
    relaxed.strict = false;
    let output_fragment = relaxed.fragment;
    let output = manager.acquire(0, relaxed).expect("relaxed output");
    assert!(output.negotiation().is_downgraded());

    let err = manager
        .acquire(0, request(Direction::Input, Access::ReadWrite, requested))
        .expect_err("strict join");
    assert!(matches!(err, DriverError::FormatUnsupported(_)));
    assert_eq!(manager.session(0).expect("session").open_count(), 1);

    let mut running = request(Direction::Input, Access::ReadWrite, granted);
    running.fragment = output_fragment;
    let input = manager
        .acquire(0, running)
        .expect("strict join at the running format");
    assert_eq!(input.negotiation(), Negotiation::Exact(granted));
    drop(input);

    let mut relaxed = request(Direction::Input, Access::ReadWrite, requested);
    relaxed.strict = false;
    let input = manager.acquire(0, relaxed).expect("relaxed join");
    assert_eq!(
        input.negotiation(),
        Negotiation::Downgraded { requested, granted }
    );
}
