//! The ordered-fallback composite: first working candidate wins, losers
//! are closed, untouched candidates are never built, and a close restarts
//! the walk.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ev3_cockpit::error::TransportError;
use ev3_cockpit::protocol::Packet;
use ev3_cockpit::protocol::packet::{DIRECT_REPLY, SYSTEM_COMMAND_REPLY};
use ev3_cockpit::transport::{AutoTransport, SendOptions, Transport, TransportCandidate};

#[derive(Default)]
struct Counters {
    built: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

struct FakeTransport {
    fails: bool,
    open: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&mut self) -> Result<(), TransportError> {
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(TransportError::NotOpen);
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.open = false;
        Ok(())
    }

    async fn send(
        &mut self,
        packet: &Packet,
        _opts: &SendOptions,
    ) -> Result<Option<Packet>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        Ok(Some(Packet::new(packet.message_counter, DIRECT_REPLY, vec![])))
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

fn candidate(name: &str, fails: bool, counters: Arc<Counters>) -> TransportCandidate {
    TransportCandidate::new(name, move || {
        counters.built.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeTransport {
            fails,
            open: false,
            counters: counters.clone(),
        })
    })
}

#[tokio::test]
async fn picks_the_first_working_candidate_and_stops() {
    let a = Arc::new(Counters::default());
    let b = Arc::new(Counters::default());
    let c = Arc::new(Counters::default());
    let mut auto = AutoTransport::new(vec![
        candidate("usb", true, a.clone()),
        candidate("bluetooth", false, b.clone()),
        candidate("tcp", false, c.clone()),
    ]);

    auto.open().await.expect("walk finds bluetooth");
    assert_eq!(auto.selected(), Some("bluetooth"));
    assert_eq!(a.built.load(Ordering::SeqCst), 1);
    assert_eq!(a.closed.load(Ordering::SeqCst), 1, "loser is closed");
    assert_eq!(b.built.load(Ordering::SeqCst), 1);
    assert_eq!(c.built.load(Ordering::SeqCst), 0, "later candidates never built");

    let reply = auto
        .send(&Packet::new(3, SYSTEM_COMMAND_REPLY, vec![0x9d]), &SendOptions::expecting(3))
        .await
        .unwrap();
    assert!(reply.is_some());
}

#[tokio::test]
async fn close_then_open_restarts_the_walk() {
    let a = Arc::new(Counters::default());
    let b = Arc::new(Counters::default());
    let mut auto = AutoTransport::new(vec![
        candidate("usb", true, a.clone()),
        candidate("tcp", false, b.clone()),
    ]);

    auto.open().await.unwrap();
    auto.close().await.unwrap();
    assert_eq!(auto.selected(), None);
    auto.open().await.unwrap();

    assert_eq!(a.opened.load(Ordering::SeqCst), 2, "walk restarted from the top");
    assert_eq!(b.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn all_failures_are_reported_together() {
    let a = Arc::new(Counters::default());
    let b = Arc::new(Counters::default());
    let mut auto = AutoTransport::new(vec![
        candidate("usb", true, a),
        candidate("bluetooth", true, b),
    ]);

    let err = auto.open().await.unwrap_err();
    let TransportError::AutoTransportFailed(report) = err else {
        panic!("expected AutoTransportFailed, got {err}");
    };
    assert!(report.contains("usb:"), "{report}");
    assert!(report.contains("bluetooth:"), "{report}");
}

#[tokio::test]
async fn send_without_open_is_not_open() {
    let mut auto = AutoTransport::new(vec![]);
    let err = auto
        .send(&Packet::new(0, SYSTEM_COMMAND_REPLY, vec![]), &SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NotOpen));
}

#[tokio::test]
async fn open_is_idempotent_while_active() {
    let a = Arc::new(Counters::default());
    let mut auto = AutoTransport::new(vec![candidate("usb", false, a.clone())]);
    auto.open().await.unwrap();
    auto.open().await.unwrap();
    assert_eq!(a.opened.load(Ordering::SeqCst), 1);
}
