use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ripple_io::EventLoop;

#[test]
fn timers_fire_in_expiration_then_creation_order() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    // A and B tie on expiration; creation order breaks the tie
    let record = order.clone();
    event_loop.run_after(Duration::from_millis(100), move || {
        record.lock().unwrap().push("A")
    });
    let record = order.clone();
    event_loop.run_after(Duration::from_millis(100), move || {
        record.lock().unwrap().push("B")
    });
    let record = order.clone();
    event_loop.run_after(Duration::from_millis(50), move || {
        record.lock().unwrap().push("C")
    });

    let quitter = event_loop.clone();
    event_loop.run_after(Duration::from_millis(300), move || quitter.quit());

    event_loop.run();
    assert_eq!(*order.lock().unwrap(), vec!["C", "A", "B"]);
}

#[test]
fn cancel_before_expiry_suppresses_the_timer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let fired = Arc::new(AtomicBool::new(false));

    let flag = fired.clone();
    let id = event_loop.run_after(Duration::from_millis(200), move || {
        flag.store(true, Ordering::SeqCst)
    });

    let canceller = event_loop.clone();
    event_loop.run_after(Duration::from_millis(50), move || canceller.cancel(id));

    let quitter = event_loop.clone();
    event_loop.run_after(Duration::from_millis(400), move || quitter.quit());

    event_loop.run();
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn repeating_timer_cancelled_from_its_own_callback_stops() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));
    let id_slot = Arc::new(Mutex::new(None));

    let count = ticks.clone();
    let slot = id_slot.clone();
    let owner = event_loop.clone();
    let id = event_loop.run_every(Duration::from_millis(40), move || {
        let seen = count.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == 2 {
            let id = slot.lock().unwrap().expect("id published");
            owner.cancel(id);
        }
    });
    *id_slot.lock().unwrap() = Some(id);

    let quitter = event_loop.clone();
    event_loop.run_after(Duration::from_millis(400), move || quitter.quit());

    event_loop.run();
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

#[test]
fn run_every_respects_minimum_spacing() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));

    let count = ticks.clone();
    event_loop.run_every(Duration::from_millis(50), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });

    let quitter = event_loop.clone();
    event_loop.run_after(Duration::from_millis(420), move || quitter.quit());

    event_loop.run();

    // 50 ms spacing over ~420 ms: strictly fewer than 9 ticks, at least a
    // handful even on a loaded machine
    let seen = ticks.load(Ordering::SeqCst);
    assert!(seen >= 3, "saw {} ticks", seen);
    assert!(seen <= 8, "saw {} ticks", seen);
}
