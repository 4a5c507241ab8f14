use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ripple_io::{EventLoop, TcpServer};

const MARK: usize = 64 * 1024;
const PAYLOAD: usize = 8 * 1024 * 1024;

/// Sending far more than the kernel will take queues the remainder, which
/// crosses the mark exactly once on the way up; once the peer drains
/// everything the write-complete callback fires exactly once.
#[test]
fn high_water_mark_fires_once_then_write_complete_once() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let any_port = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(&event_loop, &any_port, "flood", false).unwrap();

    let hwm_fires = Arc::new(AtomicUsize::new(0));
    let hwm_size = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));

    let fires = hwm_fires.clone();
    let size_seen = hwm_size.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            let fires = fires.clone();
            let size_seen = size_seen.clone();
            conn.set_high_water_mark_callback(
                Arc::new(move |_conn, size| {
                    fires.fetch_add(1, Ordering::SeqCst);
                    size_seen.store(size, Ordering::SeqCst);
                }),
                MARK,
            );
            conn.send(&vec![b'f'; PAYLOAD]);
        }
    });

    let completes = write_completes.clone();
    server.set_write_complete_callback(move |conn| {
        completes.fetch_add(1, Ordering::SeqCst);
        conn.shutdown();
    });

    server.start();
    let listen_addr = server.listen_addr().unwrap();

    let remote = event_loop.clone();
    let drain = std::thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(listen_addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut total = 0usize;
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(_) => break,
            }
        }
        remote.quit();
        total
    });

    event_loop.run();
    let drained = drain.join().unwrap();

    assert_eq!(drained, PAYLOAD);
    assert_eq!(hwm_fires.load(Ordering::SeqCst), 1);
    assert!(hwm_size.load(Ordering::SeqCst) >= MARK);
    assert_eq!(write_completes.load(Ordering::SeqCst), 1);
}
