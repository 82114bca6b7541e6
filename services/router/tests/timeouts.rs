mod harness;

use std::io::Write;
use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{Fixture, Seen};
use sqlmux_router::{CloseReason, Membership};

#[test]
fn idle_client_gets_exactly_one_hangup() {
    let mut fx = Fixture::with_timeouts(0, Some(Duration::from_secs(5)), None);
    let (client, session) = fx.client();
    fx.settle();

    fx.clock.advance(Duration::from_secs(6));
    fx.settle();

    assert_eq!(fx.recorder.count(Seen::Hangup, client), 1);
    assert_eq!(fx.recorder.hangup_reasons(), vec![CloseReason::Timeout]);
    assert!(fx.worker.session(session).is_none());
    assert_eq!(fx.membership(client), None);

    fx.clock.advance(Duration::from_secs(10));
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Hangup, client), 1);
}

#[test]
fn hung_up_client_is_not_timed_out_again() {
    let mut fx = Fixture::with_timeouts(0, Some(Duration::from_secs(5)), None);
    fx.recorder.close_on_hangup.store(false, Ordering::SeqCst);
    let (client, _session) = fx.client();
    fx.settle();

    fx.clock.advance(Duration::from_secs(6));
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Hangup, client), 1);
    assert!(fx.worker.connection(client).unwrap().hanged_up());

    fx.clock.advance(Duration::from_secs(60));
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Hangup, client), 1);
    assert_eq!(fx.membership(client), Some(Membership::Live));
}

#[test]
fn active_client_is_not_timed_out() {
    let mut fx = Fixture::with_timeouts(0, Some(Duration::from_secs(5)), None);
    let (client, _session) = fx.client();
    fx.settle();

    for _ in 0..4 {
        fx.clock.advance(Duration::from_secs(3));
        fx.peer(client).write_all(b"ping").unwrap();
        fx.settle();
    }

    assert_eq!(fx.recorder.count(Seen::Hangup, client), 0);
    assert!(fx.recorder.count(Seen::Read, client) >= 4);
    assert_eq!(fx.membership(client), Some(Membership::Live));
}

#[test]
fn idle_check_runs_once_per_second() {
    let mut fx = Fixture::with_timeouts(0, Some(Duration::from_secs(5)), None);
    let (client, _session) = fx.client();
    fx.settle();

    // 5.5 s idle, but the last check was at 0 s and the next one is due at
    // 1 s, so this is caught right away.
    fx.clock.advance(Duration::from_millis(5500));
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Hangup, client), 1);
}

#[test]
fn stalled_write_times_out() {
    let mut fx = Fixture::with_timeouts(0, None, Some(Duration::from_secs(2)));
    let (client, _session) = fx.client();
    fx.settle();

    // The peer never reads, so most of this stays queued.
    let payload = vec![0u8; 8 * 1024 * 1024];
    fx.worker.write(client, &payload).unwrap();
    assert!(fx.worker.connection(client).unwrap().writeq_len() > 0);

    fx.clock.advance(Duration::from_secs(1));
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Hangup, client), 0);

    fx.clock.advance(Duration::from_secs(2));
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Hangup, client), 1);
    assert_eq!(fx.recorder.hangup_reasons(), vec![CloseReason::Timeout]);
}

#[test]
fn no_timeouts_configured() {
    let mut fx = Fixture::new(0);
    let (client, _session) = fx.client();
    fx.settle();

    fx.clock.advance(Duration::from_secs(24 * 3600));
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Hangup, client), 0);
}
