mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::StatusCode;
use sluice::{Deadline, Phase, Pipeline, Request, Response, Server};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use common::{init_tracing, tcp_get};

async fn start(pipeline: Pipeline) -> (Server, std::net::SocketAddr) {
    init_tracing();
    let server = sluice::listen(pipeline, Some("127.0.0.1:0")).await.unwrap();
    let addr = server.local_addr().as_tcp().unwrap();
    (server, addr)
}

fn slow(delay: Duration) -> Pipeline {
    Pipeline::new(move |_req: Request| async move {
        tokio::time::sleep(delay).await;
        "slow"
    })
}

#[tokio::test]
async fn serves_then_stops_promptly_when_idle() {
    let (server, addr) = start(Pipeline::new(|_req: Request| async { "pong" })).await;

    let res = tcp_get(addr, "/ping").await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, "pong");

    let started = Instant::now();
    server.stop(Duration::from_secs(5)).await;
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert_eq!(server.phase(), Phase::Stopped);

    // The endpoint is released.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn in_flight_request_completes_during_graceful_drain() {
    let (server, addr) = start(slow(Duration::from_millis(300))).await;

    let client = tokio::spawn(tcp_get(addr, "/"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.stop(Duration::from_secs(5)).await;

    let res = client.await.unwrap().unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body, "slow");
}

#[tokio::test]
async fn drain_timeout_escalates_to_forceful_close() {
    let (server, addr) = start(slow(Duration::from_secs(30))).await;

    let client = tokio::spawn(tcp_get(addr, "/"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    server.stop(Duration::from_millis(200)).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    // The connection was torn down without a response.
    let res = tokio::time::timeout(Duration::from_secs(1), client).await.unwrap().unwrap();
    assert!(res.is_err(), "{res:?}");
}

#[tokio::test]
async fn expired_deadline_skips_graceful_window() {
    let (server, addr) = start(slow(Duration::from_secs(30))).await;

    let client = tokio::spawn(tcp_get(addr, "/"));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    server.stop(Deadline::expired_now()).await;
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());

    let res = tokio::time::timeout(Duration::from_secs(1), client).await.unwrap().unwrap();
    assert!(res.is_err(), "{res:?}");
}

#[tokio::test]
async fn handlers_register_their_own_shutdown_work() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let registered = Arc::new(AtomicBool::new(false));

    let pipeline = {
        let registered = Arc::clone(&registered);
        Pipeline::new(move |req: Request| {
            let tx = tx.clone();
            let registered = Arc::clone(&registered);
            async move {
                assert!(req.server().is_some());
                // First request only, as a streaming handler would.
                if !registered.swap(true, Ordering::SeqCst) {
                    req.on_shutdown(move |deadline: Deadline| async move {
                        let _ = tx.send(deadline.is_expired());
                    });
                }
                StatusCode::ACCEPTED
            }
        })
    };
    let (server, addr) = start(pipeline).await;

    for _ in 0..3 {
        assert_eq!(tcp_get(addr, "/stream").await.unwrap().status, 202);
    }
    assert!(rx.try_recv().is_err(), "participant ran before shutdown");

    server.stop(Duration::from_secs(5)).await;

    assert_eq!(rx.recv().await, Some(false));
    // Every sender is gone once the pipeline is dropped.
    let rest = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(rest, None, "participant ran more than once");
}

#[tokio::test]
async fn background_tasks_observe_shutdown_start() {
    let (server, _addr) = start(Pipeline::new(|_req: Request| async { "ok" })).await;

    let woke = Arc::new(AtomicBool::new(false));
    let worker = {
        let woke = Arc::clone(&woke);
        let started = server.shutdown_started();
        tokio::spawn(async move {
            started.await;
            woke.store(true, Ordering::SeqCst);
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!worker.is_finished());
    assert!(!woke.load(Ordering::SeqCst));

    server.stop(Duration::from_secs(1)).await;
    tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    assert!(woke.load(Ordering::SeqCst));
}

#[tokio::test]
async fn concurrent_stops_from_many_tasks() {
    let (server, addr) = start(Pipeline::new(|_req: Request| async { Response::text("ok") })).await;
    assert_eq!(tcp_get(addr, "/").await.unwrap().body, "ok");

    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = Arc::clone(&calls);
        server.on_shutdown(move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    let stops: Vec<_> = (0..8)
        .map(|_| {
            let server = server.clone();
            tokio::spawn(async move { server.stop(Duration::from_secs(5)).await })
        })
        .collect();
    for stop in stops {
        stop.await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(server.phase(), Phase::Stopped);
}

#[tokio::test]
async fn bind_conflict_is_reported() {
    let (server, addr) = start(Pipeline::new(|_req: Request| async { "ok" })).await;

    let taken = addr.to_string();
    let err = sluice::listen(Pipeline::new(|_req: Request| async { "ok" }), Some(taken.as_str()))
        .await
        .unwrap_err();
    assert!(matches!(err, sluice::Error::Bind { .. }), "{err}");

    server.stop(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_stop_returns_while_a_handler_blocks() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let pipeline = Pipeline::new(move |_req: Request| {
        let entered = entered_tx.clone();
        async move {
            let _ = entered.send(());
            // Never yields, so the abort is only seen once this returns.
            std::thread::sleep(Duration::from_millis(2500));
            "late"
        }
    });
    let (server, addr) = start(pipeline).await;

    let _client = tokio::spawn(tcp_get(addr, "/blocking"));
    entered_rx.recv().await.unwrap();

    let started = Instant::now();
    server.stop(Deadline::expired_now()).await;

    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    assert_eq!(server.phase(), Phase::Stopped);
}
