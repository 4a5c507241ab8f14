use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ripple_io::{Connector, EventLoop};

/// Connecting to a port nothing listens on retries with backoff until
/// stopped; stop wins against the in-flight retry, so no attempt lands
/// after it.
#[test]
fn refused_connect_backs_off_until_stopped() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let connected = Arc::new(AtomicBool::new(false));

    let connector = Connector::new(&event_loop, "127.0.0.1:1".parse().unwrap());
    let flag = connected.clone();
    connector.set_new_connection_callback(move |_socket| {
        flag.store(true, Ordering::SeqCst);
    });
    connector.start();

    // first attempt at ~0 ms, second at ~500 ms; stop falls inside the
    // second backoff window (~1500 ms would be the third attempt)
    let stopper = connector.clone();
    event_loop.run_after(Duration::from_millis(700), move || stopper.stop());

    let quitter = event_loop.clone();
    event_loop.run_after(Duration::from_millis(1300), move || quitter.quit());

    event_loop.run();
    assert!(!connected.load(Ordering::SeqCst));
}

#[test]
fn stop_before_any_attempt_connects_nothing() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let connected = Arc::new(AtomicBool::new(false));

    let connector = Connector::new(&event_loop, "127.0.0.1:1".parse().unwrap());
    let flag = connected.clone();
    connector.set_new_connection_callback(move |_socket| {
        flag.store(true, Ordering::SeqCst);
    });

    connector.stop();
    connector.start();
    connector.stop();

    let quitter = event_loop.clone();
    event_loop.run_after(Duration::from_millis(300), move || quitter.quit());

    event_loop.run();
    assert!(!connected.load(Ordering::SeqCst));
}
