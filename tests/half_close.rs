use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ripple_io::{EventLoop, TcpServer};

/// A peer that shuts down its write side delivers its last bytes, then the
/// zero-length read moves the connection to disconnected; no error path
/// fires and the socket is fully closed once the connection is destroyed.
#[test]
fn half_close_runs_the_clean_disconnect_path() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let any_port = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(&event_loop, &any_port, "half-close", false).unwrap();

    let messages = Arc::new(Mutex::new(Vec::new()));
    let recorded = messages.clone();
    server.set_message_callback(move |_conn, buf, _receive_time| {
        recorded.lock().unwrap().push(buf.retrieve_all_as_string());
    });

    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    server.set_connection_callback(move |conn| {
        recorded
            .lock()
            .unwrap()
            .push(if conn.connected() { "up" } else { "down" });
    });

    server.start();
    let listen_addr = server.listen_addr().unwrap();

    let remote = event_loop.clone();
    let peer = std::thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(listen_addr).unwrap();
        stream.write_all(b"ping").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        // EOF arrives when the server destroys the connection
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut rest = Vec::new();
        let eof = stream.read_to_end(&mut rest);
        remote.quit();
        (eof.is_ok(), rest)
    });

    event_loop.run();
    let (saw_eof, rest) = peer.join().unwrap();

    assert!(saw_eof);
    assert!(rest.is_empty());
    assert_eq!(*messages.lock().unwrap(), vec!["ping".to_string()]);
    assert_eq!(*events.lock().unwrap(), vec!["up", "down"]);
}
