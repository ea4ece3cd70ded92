//! Connection state machine scenarios

use std::sync::Arc;

use ppe_accel::{
    AccelConnection, AccelMode, AccelOutcome, AccelStateMachine, AdmissionController,
    ConnectionId, DecelRequest, FailReason,
};

fn machine() -> AccelStateMachine {
    AccelStateMachine::new(Arc::new(AdmissionController::default()), 3, None)
}

#[test]
#[should_panic(expected = "accel mode unexpected")]
fn test_resolve_on_decel_connection_panics() {
    let sm = machine();
    let conn = AccelConnection::new(ConnectionId(9));
    sm.resolve_pending(&conn, AccelOutcome::TransientFail);
}

#[test]
fn test_decel_pending_returned_once() {
    let sm = machine();
    let conn = Arc::new(AccelConnection::new(ConnectionId(1)));

    assert!(sm.request_accel(&conn));
    assert_eq!(sm.request_decel(&conn), DecelRequest::Deferred);
    assert!(sm.resolve_pending(&conn, AccelOutcome::Succeeded));

    assert_eq!(sm.request_decel(&conn), DecelRequest::Started);
    sm.resolve_decel(&conn);

    // Flag was cleared by the first resolution.
    assert!(sm.request_accel(&conn));
    assert!(!sm.resolve_pending(&conn, AccelOutcome::TransientFail));
}

#[test]
fn test_decel_pending_on_failed_attempt() {
    let sm = machine();
    let conn = Arc::new(AccelConnection::new(ConnectionId(1)));

    assert!(sm.request_accel(&conn));
    assert_eq!(sm.request_decel(&conn), DecelRequest::Deferred);
    assert!(sm.resolve_pending(&conn, AccelOutcome::PermanentFail(FailReason::NoAction)));
    assert_eq!(conn.mode(), AccelMode::Fail(FailReason::NoAction));
    assert_eq!(sm.admission().snapshot().accelerated, 0);
}

#[test]
fn test_counters_follow_every_outcome() {
    let sm = machine();
    let conns: Vec<_> = (0..3)
        .map(|i| Arc::new(AccelConnection::new(ConnectionId(i))))
        .collect();

    for conn in &conns {
        assert!(sm.request_accel(conn));
    }
    assert_eq!(sm.admission().snapshot().pending, 3);

    sm.resolve_pending(&conns[0], AccelOutcome::Succeeded);
    sm.resolve_pending(&conns[1], AccelOutcome::TransientFail);
    sm.resolve_pending(&conns[2], AccelOutcome::PermanentFail(FailReason::Defunct));

    let snap = sm.admission().snapshot();
    assert_eq!((snap.pending, snap.accelerated), (0, 1));
    assert_eq!(snap.admitted_total, 3);

    assert_eq!(sm.request_decel(&conns[0]), DecelRequest::Started);
    sm.resolve_decel(&conns[0]);
    assert_eq!(sm.admission().snapshot().accelerated, 0);
}
