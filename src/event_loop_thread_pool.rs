use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThread;

/// A fixed pool of worker loops fed round-robin.
///
/// With zero workers every pick returns the base loop, so single-threaded
/// servers need no special casing.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    workers: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Must be called before [`start`](EventLoopThreadPool::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started.load(Ordering::SeqCst));
        self.num_threads.store(num_threads, Ordering::SeqCst);
    }

    pub fn start(&self, init: Option<ThreadInitCallback>) {
        assert!(!self.started.swap(true, Ordering::SeqCst));
        self.base_loop.assert_in_loop_thread();

        let num_threads = self.num_threads.load(Ordering::SeqCst);
        let mut workers = self.workers.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();

        for i in 0..num_threads {
            let name = format!("{}{}", self.name, i);
            let mut worker = EventLoopThread::new(init.clone(), &name);
            loops.push(worker.start_loop());
            workers.push(worker);
        }

        if num_threads == 0 {
            if let Some(init) = init {
                init(&self.base_loop);
            }
        }
    }

    /// The next worker loop, round-robin; the base loop when the pool is
    /// empty.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::SeqCst));

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
        loops[index].clone()
    }

    /// Pins work by key: the same `hash` always lands on the same loop.
    pub fn get_loop_for_hash(&self, hash: usize) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started.load(Ordering::SeqCst));

        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }

        loops[hash % loops.len()].clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_pool_hands_out_the_base_loop() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.clone(), "pool");
        pool.start(None);

        for _ in 0..3 {
            assert!(Arc::ptr_eq(&pool.get_next_loop(), &base));
        }
    }

    #[test]
    fn round_robin_cycles_through_workers() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.clone(), "pool");
        pool.set_thread_num(3);
        pool.start(None);

        let first = pool.get_next_loop();
        let second = pool.get_next_loop();
        let third = pool.get_next_loop();
        let fourth = pool.get_next_loop();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&second, &third));
        assert!(Arc::ptr_eq(&first, &fourth));
        for picked in [&first, &second, &third] {
            assert!(!Arc::ptr_eq(picked, &base));
        }
    }

    #[test]
    fn hash_pick_is_stable() {
        let base = EventLoop::new().unwrap();
        let pool = EventLoopThreadPool::new(base.clone(), "pool");
        pool.set_thread_num(2);
        pool.start(None);

        let a = pool.get_loop_for_hash(7);
        let b = pool.get_loop_for_hash(7);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
