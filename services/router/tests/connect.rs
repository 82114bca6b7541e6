mod harness;

use std::io::Read;
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use harness::{Fixture, SaturatedListener, Seen};
use sqlmux_router::proxy::PassthroughFactory;
use sqlmux_router::{CloseReason, ManualClock, Server, Service, Worker, WorkerId};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

fn stalled_server(saturated: &SaturatedListener) -> Arc<Server> {
    Arc::new(Server::new("stalled", saturated.addr).with_connect_timeout(CONNECT_TIMEOUT))
}

#[test]
fn saturated_backend_does_not_stall_the_loop() {
    let saturated = SaturatedListener::bind();
    let server = stalled_server(&saturated);
    let mut fx = Fixture::new(0);
    let (_, session) = fx.client();

    let started = Instant::now();
    let id = fx.worker.connect_backend(&server, session).unwrap();
    fx.settle();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(fx.worker.connection(id).unwrap().is_connecting());
    assert_eq!(fx.recorder.count(Seen::Error, id), 0);

    // Still inside the timeout.
    fx.clock.advance(CONNECT_TIMEOUT / 2);
    fx.settle();
    assert!(fx.worker.connection(id).unwrap().is_connecting());

    fx.clock.advance(CONNECT_TIMEOUT * 2);
    fx.settle();
    assert_eq!(fx.recorder.count(Seen::Error, id), 1);
    assert_eq!(fx.membership(id), None);
    assert_eq!(server.stats().n_current(), 0);
    assert_eq!(
        fx.worker.session(session).unwrap().close_reason(),
        CloseReason::Timeout
    );
    fx.assert_membership_partition();
}

#[test]
fn client_routed_to_saturated_backend_is_closed_on_timeout() {
    let saturated = SaturatedListener::bind();
    let server = stalled_server(&saturated);
    let service = Arc::new(Service::new(
        "svc",
        vec![Arc::clone(&server)],
        Arc::new(PassthroughFactory),
    ));
    let clock = Arc::new(ManualClock::new());
    let mut worker = Worker::standalone(WorkerId::new(0), clock.clone()).unwrap();

    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let started = Instant::now();
    worker
        .adopt_client(Box::new(ours), "client".to_string(), &service)
        .unwrap();
    for _ in 0..3 {
        worker.run_once(Some(Duration::ZERO));
    }
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(worker.live_count(), 2);

    clock.advance(CONNECT_TIMEOUT * 3);
    for _ in 0..3 {
        worker.run_once(Some(Duration::ZERO));
    }
    assert_eq!(worker.connection_count(), 0);

    theirs.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(theirs.read(&mut buf).unwrap(), 0);
}

#[test]
fn writes_before_connect_completes_are_delivered() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = Arc::new(Server::new("live", listener.local_addr().unwrap()));
    let mut fx = Fixture::new(0);
    let (_, session) = fx.client();

    let id = fx.worker.connect_backend(&server, session).unwrap();
    fx.worker.write(id, b"hello").unwrap();

    for _ in 0..100 {
        if !fx.worker.connection(id).unwrap().is_connecting() {
            break;
        }
        fx.worker.run_once(Some(Duration::from_millis(10)));
    }
    fx.settle();
    let conn = fx.worker.connection(id).unwrap();
    assert!(!conn.is_connecting());
    assert_eq!(conn.writeq_len(), 0);

    let (mut accepted, _) = listener.accept().unwrap();
    accepted.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 5];
    accepted.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn refused_connect_closes_backend_without_pooling_it() {
    let dead = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let server = Arc::new(Server::new("dead", dead_addr).with_pool(4, Duration::from_secs(3600)));
    let mut fx = Fixture::new(0);
    let (_, session) = fx.client();
    fx.worker
        .session_mut(session)
        .unwrap()
        .set_pool_eligible(true);

    // Loopback may refuse synchronously.
    let Ok(id) = fx.worker.connect_backend(&server, session) else {
        return;
    };
    for _ in 0..100 {
        if fx.membership(id).is_none() {
            break;
        }
        fx.worker.run_once(Some(Duration::from_millis(10)));
    }

    assert_eq!(fx.recorder.count(Seen::Error, id), 1);
    assert_eq!(fx.membership(id), None);
    assert_eq!(fx.worker.pool_len(&server), 0);
    assert_eq!(server.pool_stats().n_persistent(), 0);
    assert_eq!(
        fx.worker.session(session).unwrap().close_reason(),
        CloseReason::HandleError
    );
}
