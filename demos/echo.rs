//! Echo server: `cargo run --example echo [port]`, then `nc 127.0.0.1 2007`.

use std::net::SocketAddr;

use ripple_io::{EventLoop, TcpServer};

fn main() {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(2007);
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();

    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, &addr, "echo", false).unwrap();

    server.set_connection_callback(|conn| {
        println!(
            "{} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "UP" } else { "DOWN" }
        );
    });

    server.set_message_callback(|conn, buf, receive_time| {
        let msg = buf.retrieve_all_as_bytes();
        println!(
            "{}: echoing {} bytes received at {}",
            conn.name(),
            msg.len(),
            receive_time
        );
        conn.send(&msg);
    });

    server.set_thread_num(4);
    server.start();

    println!("echo server listening on {}", server.ip_port());
    event_loop.run();
}
