use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;

/// Spawns a thread whose whole life is one [`EventLoop::run`].
///
/// [`start_loop`](EventLoopThread::start_loop) blocks until the loop exists
/// and hands back a shared handle to it. Dropping the `EventLoopThread`
/// quits the remote loop and joins the thread.
pub struct EventLoopThread {
    event_loop: Weak<EventLoop>,
    thread: Option<JoinHandle<()>>,
    name: String,
    init: Option<ThreadInitCallback>,
}

impl EventLoopThread {
    pub fn new(init: Option<ThreadInitCallback>, name: &str) -> EventLoopThread {
        EventLoopThread {
            event_loop: Weak::new(),
            thread: None,
            name: name.to_string(),
            init,
        }
    }

    /// Spawns the thread and blocks until its loop is published.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        assert!(self.thread.is_none());

        let shared = Arc::new((Mutex::new(None::<Arc<EventLoop>>), Condvar::new()));
        let published = shared.clone();
        let init = self.init.take();
        let name = self.name.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(e) => {
                        log::error!("EventLoopThread [{}]: EventLoop::new: {}", name, e);
                        panic!("EventLoopThread [{}] failed to create its loop", name);
                    }
                };

                if let Some(init) = init {
                    init(&event_loop);
                }

                {
                    let (slot, ready) = &*published;
                    *slot.lock().unwrap() = Some(event_loop.clone());
                    ready.notify_one();
                }

                event_loop.run();
            })
            .expect("spawn event loop thread");

        self.thread = Some(handle);

        let (slot, ready) = &*shared;
        let mut guard = slot.lock().unwrap();
        while guard.is_none() {
            guard = ready.wait(guard).unwrap();
        }

        let event_loop = guard.as_ref().cloned().expect("loop published");
        self.event_loop = Arc::downgrade(&event_loop);
        event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            // run() clears the quit flag on entry; a quit routed through
            // the task queue cannot land before the loop starts
            let quitter = event_loop.clone();
            event_loop.queue_in_loop(move || quitter.quit());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn start_loop_publishes_a_running_loop() {
        let mut worker = EventLoopThread::new(None, "test-worker");
        let event_loop = worker.start_loop();
        assert!(!event_loop.is_in_loop_thread());

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));

        std::thread::sleep(Duration::from_millis(100));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn init_callback_runs_in_the_worker_thread() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let init: ThreadInitCallback = Arc::new(move |event_loop: &Arc<EventLoop>| {
            assert!(event_loop.is_in_loop_thread());
            flag.store(true, Ordering::SeqCst);
        });

        let mut worker = EventLoopThread::new(Some(init), "test-init");
        let _event_loop = worker.start_loop();
        assert!(ran.load(Ordering::SeqCst));
    }
}
