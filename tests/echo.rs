use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use ripple_io::{EventLoop, TcpClient, TcpServer};

#[test]
fn echo_round_trip_through_worker_pool() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let any_port = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(&event_loop, &any_port, "echo", false).unwrap();
    server.set_thread_num(2);

    let (received_tx, received) = mpsc::channel::<(String, usize)>();
    let received_tx = Mutex::new(received_tx);
    server.set_message_callback(move |conn, buf, _receive_time| {
        let len = buf.readable_bytes();
        let msg = buf.retrieve_all_as_string();
        received_tx.lock().unwrap().send((msg.clone(), len)).unwrap();
        conn.send(msg.as_bytes());
    });

    let (disconnect_tx, disconnected) = mpsc::channel::<()>();
    let disconnect_tx = Mutex::new(disconnect_tx);
    let base = event_loop.clone();
    server.set_connection_callback(move |conn| {
        if !conn.connected() {
            disconnect_tx.lock().unwrap().send(()).unwrap();
            base.quit();
        }
    });

    server.start();
    let listen_addr = server.listen_addr().unwrap();

    let client = TcpClient::new(&event_loop, listen_addr, "echo-client");
    client.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(b"hello\n");
        }
    });

    let (reply_tx, reply) = mpsc::channel::<String>();
    let reply_tx = Mutex::new(reply_tx);
    client.set_message_callback(move |conn, buf, _receive_time| {
        reply_tx
            .lock()
            .unwrap()
            .send(buf.retrieve_all_as_string())
            .unwrap();
        conn.force_close();
    });
    client.connect();

    let watchdog = event_loop.clone();
    event_loop.run_after(Duration::from_secs(10), move || watchdog.quit());

    event_loop.run();

    let (msg, len) = received.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(msg, "hello\n");
    assert_eq!(len, 6);
    assert_eq!(reply.recv_timeout(Duration::from_secs(1)).unwrap(), "hello\n");
    disconnected.recv_timeout(Duration::from_secs(1)).unwrap();
}

#[test]
fn client_reconnects_after_a_natural_disconnect() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let any_port = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(&event_loop, &any_port, "again", false).unwrap();
    server.start();
    let listen_addr = server.listen_addr().unwrap();

    let client = TcpClient::new(&event_loop, listen_addr, "again-client");
    let connects = Arc::new(AtomicUsize::new(0));

    let count = connects.clone();
    let base = event_loop.clone();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            if count.fetch_add(1, Ordering::SeqCst) == 0 {
                conn.shutdown();
            } else {
                base.quit();
            }
        }
    });
    client.connect();

    // a second connect() is valid once the first connection has gone away;
    // retry stays disabled, so the connector must have been stopped and
    // re-armed rather than left latched on its first success
    let again = client.clone();
    event_loop.run_after(Duration::from_millis(400), move || again.connect());

    let watchdog = event_loop.clone();
    event_loop.run_after(Duration::from_secs(10), move || watchdog.quit());

    event_loop.run();
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}

#[test]
fn send_from_a_foreign_thread_reaches_the_peer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let event_loop = EventLoop::new().unwrap();
    let any_port = "127.0.0.1:0".parse().unwrap();
    let server = TcpServer::new(&event_loop, &any_port, "push", false).unwrap();
    server.set_thread_num(1);

    let (conn_tx, conn_rx) = mpsc::channel::<ripple_io::TcpConnectionRef>();
    let conn_tx = Mutex::new(conn_tx);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            conn_tx.lock().unwrap().send(conn.clone()).unwrap();
        }
    });
    server.start();
    let listen_addr = server.listen_addr().unwrap();

    // a plain thread, owning no loop, pushes one byte through the worker
    // connection
    let pusher = std::thread::spawn(move || {
        let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        conn.send(b"X");
    });

    let bytes_seen = Arc::new(AtomicUsize::new(0));
    let seen = bytes_seen.clone();
    let remote = event_loop.clone();
    let reader = std::thread::spawn(move || {
        use std::io::Read;
        let mut stream = std::net::TcpStream::connect(listen_addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).unwrap();
        assert_eq!(&byte, b"X");
        seen.store(1, Ordering::SeqCst);
        remote.quit();
    });

    event_loop.run();
    pusher.join().unwrap();
    reader.join().unwrap();
    assert_eq!(bytes_seen.load(Ordering::SeqCst), 1);
}
