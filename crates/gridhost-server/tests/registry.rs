mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use common::{native, NoopListener, NullSink, Plugin, RecordingWindows, WindowEvent, WindowLog};
use gridhost_server::capture::{CaptureError, CaptureStrategy, Frame, FrameEncoder};
use gridhost_server::presence::PresenceIndicator;
use gridhost_server::window::{Point, Position};
use gridhost_server::{ClientId, SessionRegistry, UiThread};
use pretty_assertions::assert_eq;

fn registry() -> (SessionRegistry, WindowLog, Arc<PresenceIndicator>) {
    let (factory, log) = RecordingWindows::new();
    let ui = UiThread::spawn(factory).unwrap();
    let presence = Arc::new(PresenceIndicator::new());
    (
        SessionRegistry::new(ui, Arc::clone(&presence)),
        log,
        presence,
    )
}

#[test]
fn closed_session_has_no_processor() {
    let (registry, log, presence) = registry();
    let id = ClientId(1);
    registry.open_session(Plugin::new("Synth"), id, native(), 0, 0);
    assert_eq!(
        registry.active_processor(id).map(|p| p.name().to_string()),
        Some("Synth".to_string())
    );
    registry.close_session(id, true);
    assert!(registry.active_processor(id).is_none());
    registry.settle();
    assert_eq!(log.live_editors(id), 0);
    assert!(!presence.is_visible());
}

#[test]
fn reopening_replaces_the_window_once() {
    let (registry, log, _) = registry();
    let id = ClientId(7);
    registry.open_session(Plugin::new("First"), id, native(), 0, 0);
    registry.open_session(Plugin::new("Second"), id, native(), 5, 5);
    registry.settle();

    assert_eq!(
        log.for_client(id),
        vec![
            WindowEvent::Created(id, Position::new(0, 0)),
            WindowEvent::Closed(id),
            WindowEvent::Created(id, Position::new(5, 5)),
        ]
    );
    assert_eq!(log.live_editors(id), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(
        registry.active_processor(id).map(|p| p.name().to_string()),
        Some("Second".to_string())
    );
}

#[test]
fn operations_for_one_client_keep_their_order() {
    let (registry, log, _) = registry();
    let registry = Arc::new(registry);
    let ids = [ClientId(1), ClientId(2)];

    let workers: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for round in 0..20 {
                    registry.open_session(Plugin::new("Synth"), id, native(), 0, 0);
                    registry.move_to(id, round, 1);
                    registry.move_to(id, round, 2);
                    registry.close_session(id, true);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    registry.settle();

    for id in ids {
        let events = log.for_client(id);
        assert_eq!(events.len(), 20 * 4);
        for (round, chunk) in events.chunks(4).enumerate() {
            let round = round as i32;
            assert_eq!(
                chunk,
                &[
                    WindowEvent::Created(id, Position::new(0, 0)),
                    WindowEvent::Moved(id, Position::new(round, 1)),
                    WindowEvent::Moved(id, Position::new(round, 2)),
                    WindowEvent::Closed(id),
                ]
            );
        }
        assert_eq!(log.live_editors(id), 0);
    }
}

#[test]
fn last_move_wins_before_close() {
    let (registry, log, _) = registry();
    let id = ClientId(3);
    registry.open_session(Plugin::new("Synth"), id, native(), 0, 0);
    registry.move_to(id, 10, 20);
    registry.move_to(id, 30, 40);
    assert_eq!(registry.position(id), Some(Position::new(30, 40)));
    registry.close_session(id, true);
    registry.settle();

    let events = log.for_client(id);
    let before_close = events[events.len() - 2];
    assert_eq!(before_close, WindowEvent::Moved(id, Position::new(30, 40)));
}

#[test]
fn relay_and_geometry_on_missing_session_are_noops() {
    let (registry, log, _) = registry();
    let id = ClientId(99);
    registry.bring_to_front(id);
    registry.move_to(id, 4, 4);
    registry.update_capture_area(id, 3);
    registry.attach_input_listener(id, Arc::new(NoopListener));
    registry.reset_session(id);
    registry.restart_session(id);
    registry.close_session(id, true);
    registry.settle();

    assert!(log.events().is_empty());
    assert_eq!(
        registry.relay_local_point_to_global(id, Point::new(2.0, 3.0)),
        Point::new(2.0, 3.0)
    );
}

#[test]
fn geometry_calls_reach_the_window() {
    let (registry, log, _) = registry();
    let id = ClientId(5);
    registry.open_session(Plugin::new("Synth"), id, native(), 100, 50);
    registry.bring_to_front(id);
    registry.update_capture_area(id, 8);
    registry.settle();

    assert_eq!(
        log.for_client(id),
        vec![
            WindowEvent::Created(id, Position::new(100, 50)),
            WindowEvent::Front(id),
            WindowEvent::Inset(id, 8),
        ]
    );
    assert_eq!(
        registry.relay_local_point_to_global(id, Point::new(1.5, 2.5)),
        Point::new(101.5, 52.5)
    );
}

#[test]
fn reset_rebuilds_window_and_keeps_listeners() {
    let (registry, log, _) = registry();
    let id = ClientId(8);
    registry.open_session(Plugin::new("Synth"), id, native(), 0, 0);
    registry.attach_input_listener(id, Arc::new(NoopListener));
    registry.reset_session(id);
    registry.settle();

    assert_eq!(
        log.for_client(id),
        vec![
            WindowEvent::Created(id, Position::new(0, 0)),
            WindowEvent::Listener(id),
            WindowEvent::Closed(id),
            WindowEvent::Created(id, Position::new(0, 0)),
            WindowEvent::Listener(id),
        ]
    );
    assert!(registry.active_processor(id).is_some());
}

#[test]
fn failed_editor_is_forgotten() {
    let (registry, log, presence) = registry();
    let id = ClientId(11);
    registry.open_session(Plugin::without_editor("Headless"), id, native(), 0, 0);
    registry.settle();
    assert!(registry.active_processor(id).is_none());
    assert!(log.events().is_empty());
    assert!(!presence.is_visible());
}

#[test]
fn close_all_recomputes_presence_once() {
    let changes = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&changes);
    let presence = Arc::new(PresenceIndicator::with_sink(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    let (factory, log) = RecordingWindows::new();
    let registry = SessionRegistry::new(UiThread::spawn(factory).unwrap(), Arc::clone(&presence));

    for id in 1..=3 {
        registry.open_session(Plugin::new("Synth"), ClientId(id), native(), 0, 0);
    }
    registry.settle();
    assert!(presence.is_visible());
    let before = presence.recomputations();

    assert_eq!(registry.close_all(), 3);
    registry.settle();

    assert_eq!(presence.recomputations(), before + 1);
    assert!(!presence.is_visible());
    assert_eq!(changes.load(Ordering::SeqCst), 2);
    for id in 1..=3 {
        assert_eq!(log.count(WindowEvent::Closed(ClientId(id))), 1);
    }
    assert!(registry.is_empty());
}

struct UnavailableCodec;

impl FrameEncoder for UnavailableCodec {
    fn start(&mut self) -> Result<(), CaptureError> {
        Err(CaptureError::Start("codec unavailable".into()))
    }

    fn encode(&mut self, _frame: &Frame) -> Result<Vec<u8>, CaptureError> {
        Ok(Vec::new())
    }
}

#[test]
fn failed_reopen_still_closes_the_previous_session() {
    let (registry, log, presence) = registry();
    let id = ClientId(12);
    registry.open_session(Plugin::new("First"), id, native(), 0, 0);
    registry.settle();
    assert!(presence.is_visible());

    let broken = CaptureStrategy::encoded(UnavailableCodec, Arc::new(NullSink));
    registry.open_session(Plugin::new("Second"), id, broken, 5, 5);
    registry.settle();

    assert!(registry.active_processor(id).is_none());
    assert_eq!(
        log.for_client(id),
        vec![
            WindowEvent::Created(id, Position::new(0, 0)),
            WindowEvent::Closed(id),
        ]
    );
    assert!(!presence.is_visible());
}
