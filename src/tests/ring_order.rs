use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::DriverError;
use crate::header::WaveHeader;
use crate::ring::{Command, CommandKind, CommandRing, RING_INCREMENT};

fn submit(id: usize) -> Command {
    Command::Submit(Arc::new(WaveHeader::new(vec![0; id])))
}

fn submitted_id(command: Command) -> usize {
    match command {
        Command::Submit(header) => header.len(),
        other => panic!("expected a submit, got {:?}", other.kind()),
    }
}

fn wait_for_len(ring: &CommandRing, len: usize) {
    for _ in 0..500 {
        if ring.len() == len {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("ring never reached {len} entries");
}

#[test]
fn waited_command_overtakes_queued_submissions() {
    let ring = Arc::new(CommandRing::new());
    ring.enqueue(submit(1), false).expect("submit");
    ring.enqueue(submit(2), false).expect("submit");

    let waiter = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || ring.enqueue(Command::Pause, true))
    };
    wait_for_len(&ring, 3);

    assert_eq!(ring.peek(), Some(CommandKind::Pause));
    let (command, ack) = ring.dequeue().expect("pause");
    assert_eq!(command.kind(), CommandKind::Pause);
    assert!(ack.is_waited());
    ack.complete();
    waiter.join().expect("join").expect("acknowledged");

    let (first, _) = ring.dequeue().expect("first");
    let (second, _) = ring.dequeue().expect("second");
    assert_eq!(submitted_id(first), 1);
    assert_eq!(submitted_id(second), 2);
    assert!(ring.is_empty());
}

#[test]
fn growth_keeps_order_when_wrapped() {
    let ring = CommandRing::new();
    for id in 0..40 {
        ring.enqueue(submit(id), false).expect("submit");
    }
    for id in 0..30 {
        let (command, _) = ring.dequeue().expect("dequeue");
        assert_eq!(submitted_id(command), id);
    }
    // Wraps past the end of the first allocation and then forces a grow.
    for id in 40..100 {
        ring.enqueue(submit(id), false).expect("submit");
    }
    assert_eq!(ring.capacity(), 2 * RING_INCREMENT);
    assert_eq!(ring.len(), 70);
    for id in 30..100 {
        let (command, _) = ring.dequeue().expect("dequeue");
        assert_eq!(submitted_id(command), id);
    }
    assert!(ring.dequeue().is_none());
}

#[test]
fn growth_from_unwrapped_full_ring() {
    let ring = CommandRing::new();
    for id in 0..RING_INCREMENT + 3 {
        ring.enqueue(submit(id), false).expect("submit");
    }
    assert_eq!(ring.capacity(), 2 * RING_INCREMENT);
    for id in 0..RING_INCREMENT + 3 {
        let (command, _) = ring.dequeue().expect("dequeue");
        assert_eq!(submitted_id(command), id);
    }
}

#[test]
fn dequeue_if_leaves_other_kinds_in_place() {
    let ring = CommandRing::new();
    ring.enqueue(Command::Start, false).expect("start");
    ring.enqueue(submit(7), false).expect("submit");

    assert!(ring.dequeue_if(CommandKind::Submit).is_none());
    assert_eq!(ring.len(), 2);
    let (command, _) = ring.dequeue().expect("start");
    assert_eq!(command.kind(), CommandKind::Start);
    let (command, _) = ring.dequeue_if(CommandKind::Submit).expect("submit");
    assert_eq!(submitted_id(command), 7);
}

#[test]
fn close_releases_blocked_callers() {
    let ring = Arc::new(CommandRing::new());
    let waiter = {
        let ring = Arc::clone(&ring);
        thread::spawn(move || ring.enqueue(Command::Reset, true))
    };
    wait_for_len(&ring, 1);
    let dropped = ring.close();
    assert_eq!(dropped.len(), 1);
    assert!(matches!(
        waiter.join().expect("join"),
        Err(DriverError::InvalidHandle)
    ));
    assert!(matches!(
        ring.enqueue(Command::Start, false),
        Err(DriverError::InvalidHandle)
    ));
}

#[test]
fn wait_times_out_on_empty_ring() {
    let ring = CommandRing::new();
    assert!(!ring.wait(Some(Duration::from_millis(5))));
    ring.enqueue(Command::Stop, false).expect("stop");
    assert!(ring.wait(Some(Duration::from_millis(5))));
}
