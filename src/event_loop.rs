use std::any::Any;
use std::cell::RefCell;
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::eventfd::EventFd;
use crate::sys::timerfd::TimerFd;
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;
use crate::timestamp::Timestamp;

/// A function enqueued cross-thread to run on a target loop after the next
/// poll return.
pub type Task = Box<dyn FnOnce() + Send>;

const POLL_TIMEOUT: Duration = Duration::from_secs(10);

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

static IGNORE_SIGPIPE: Once = Once::new();

/// A per-thread reactor.
///
/// The loop owns its poller, its timer queue (rooted in a timerfd), an
/// eventfd wakeup, and a pending-task queue. It is bound to the thread
/// that constructed it: [`run`](EventLoop::run) and every mutator except
/// [`queue_in_loop`](EventLoop::queue_in_loop) /
/// [`run_in_loop`](EventLoop::run_in_loop) must be called from that thread,
/// and at most one loop may exist per thread.
pub struct EventLoop {
    self_weak: Weak<EventLoop>,
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_tasks: AtomicBool,
    iteration: AtomicU64,
    poller: Mutex<Poller>,
    timer_queue: TimerQueue,
    wakeup_fd: EventFd,
    wakeup_channel: Arc<Channel>,
    timer_channel: Arc<Channel>,
    pending_tasks: ConcurrentQueue<Task>,
    poll_return_time: AtomicI64,
    context: Mutex<Option<Box<dyn Any + Send>>>,
}

impl EventLoop {
    /// Creates the loop for the calling thread.
    ///
    /// Panics if the thread already has one. The first loop in a process
    /// also ignores `SIGPIPE`, so writes to reset connections surface as
    /// `EPIPE` instead of killing the process.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });

        if EventLoop::current().is_some() {
            log::error!(
                "another EventLoop already exists in thread {:?}",
                thread::current().id()
            );
            panic!("EventLoop::new: one loop per thread");
        }

        let poller = Poller::new()?;
        let wakeup_fd = EventFd::new()?;
        let timer_fd = TimerFd::new()?;
        let wakeup_raw = wakeup_fd.as_raw_fd();
        let timer_raw = timer_fd.as_raw_fd();

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| EventLoop {
            self_weak: weak.clone(),
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poller: Mutex::new(poller),
            timer_queue: TimerQueue::new(weak.clone(), timer_fd),
            wakeup_fd,
            wakeup_channel: Channel::new(weak.clone(), wakeup_raw),
            timer_channel: Channel::new(weak.clone(), timer_raw),
            pending_tasks: ConcurrentQueue::unbounded(),
            poll_return_time: AtomicI64::new(0),
            context: Mutex::new(None),
        });

        LOOP_IN_THIS_THREAD.with(|slot| *slot.borrow_mut() = Arc::downgrade(&event_loop));
        log::debug!("EventLoop created in thread {:?}", event_loop.thread_id);

        {
            let weak = Arc::downgrade(&event_loop);
            event_loop.wakeup_channel.set_read_callback(move |_| {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.handle_wakeup_read();
                }
            });
            event_loop.wakeup_channel.enable_reading();
        }

        {
            let weak = Arc::downgrade(&event_loop);
            event_loop.timer_channel.set_read_callback(move |_| {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.timer_queue.handle_read();
                }
            });
            event_loop.timer_channel.enable_reading();
        }

        Ok(event_loop)
    }

    /// The loop constructed by the calling thread, if any.
    pub fn current() -> Option<Arc<EventLoop>> {
        LOOP_IN_THIS_THREAD.with(|slot| slot.borrow().upgrade())
    }

    /// Runs the reactor until [`quit`](EventLoop::quit).
    ///
    /// Each iteration polls for readiness (10 s cap), dispatches ready
    /// channels in poller order, then drains the pending-task queue.
    pub fn run(&self) {
        assert!(!self.looping.load(Ordering::SeqCst));
        self.assert_in_loop_thread();

        self.looping.store(true, Ordering::SeqCst);
        self.quit.store(false, Ordering::SeqCst);
        log::trace!("EventLoop start looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();

        while !self.quit.load(Ordering::SeqCst) {
            active.clear();
            let receive_time = {
                let mut poller = self.poller.lock().unwrap();
                poller.poll(Some(POLL_TIMEOUT), &mut active)
            };
            self.poll_return_time
                .store(receive_time.micros_since_epoch(), Ordering::SeqCst);
            self.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.store(true, Ordering::SeqCst);
            for channel in &active {
                channel.handle_event(receive_time);
            }
            self.event_handling.store(false, Ordering::SeqCst);

            self.do_pending_tasks();
        }

        log::trace!("EventLoop stop looping");
        self.looping.store(false, Ordering::SeqCst);
    }

    /// Asks the loop to exit at its next iteration boundary. Safe from any
    /// thread.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` immediately when called on the owning thread, otherwise
    /// enqueues it.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueues `task` to run on the owning thread after the next poll
    /// return. Tasks enqueued on the same loop run in FIFO order.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.pending_tasks.push(Box::new(task)).is_err() {
            log::error!("EventLoop::queue_in_loop: pending queue closed");
            return;
        }

        // a task enqueued during the drain would otherwise wait out a full
        // poll timeout
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.pending_tasks.len()
    }

    /// Runs `cb` at `when`.
    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timer_queue.add_timer(Box::new(cb), when, Duration::ZERO)
    }

    /// Runs `cb` once, `delay` from now.
    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, cb)
    }

    /// Runs `cb` repeatedly, `interval` apart. The interval is a minimum
    /// spacing: a late tick reschedules relative to when it actually ran.
    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.timer_queue
            .add_timer(Box::new(cb), Instant::now() + interval, interval)
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.timer_queue.cancel(timer_id);
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            log::error!(
                "EventLoop was created in thread {:?}, current thread is {:?}",
                self.thread_id,
                thread::current().id()
            );
            panic!("EventLoop accessed from the wrong thread");
        }
    }

    /// Timestamp taken right after the most recent poll return.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.poll_return_time.load(Ordering::SeqCst))
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub fn set_context(&self, context: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().unwrap().take()
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_owner(channel);
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_owner(channel);
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_owner(channel);
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().has_channel(channel)
    }

    pub(crate) fn timer_queue(&self) -> &TimerQueue {
        &self.timer_queue
    }

    fn assert_owner(&self, channel: &Channel) {
        if let (Some(owner), Some(me)) = (channel.owner_loop(), self.self_weak.upgrade()) {
            assert!(
                Arc::ptr_eq(&owner, &me),
                "channel fd = {} belongs to a different loop",
                channel.fd()
            );
        }
    }

    fn wakeup(&self) {
        if let Err(e) = self.wakeup_fd.write(1) {
            if e.kind() != io::ErrorKind::WouldBlock {
                log::error!("EventLoop::wakeup: {}", e);
            }
        }
    }

    fn handle_wakeup_read(&self) {
        match self.wakeup_fd.read() {
            Ok(_) => (),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => log::error!("EventLoop::handle_wakeup_read: {}", e),
        }
    }

    /// Snapshot-drain: tasks enqueued while draining run on the next
    /// iteration.
    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::SeqCst);

        let pending = self.pending_tasks.len();
        for _ in 0..pending {
            match self.pending_tasks.pop() {
                Ok(task) => task(),
                Err(_) => break,
            }
        }

        self.calling_pending_tasks.store(false, Ordering::SeqCst);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        log::debug!("EventLoop of thread {:?} destructs", self.thread_id);
        if thread::current().id() == self.thread_id {
            LOOP_IN_THIS_THREAD.with(|slot| *slot.borrow_mut() = Weak::new());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_in_loop_is_inline_on_owner_thread() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        event_loop.run_in_loop(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn queued_tasks_run_fifo() {
        let event_loop = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let remote = event_loop.clone();
        let record = order.clone();
        let handle = thread::spawn(move || {
            for i in 0..5 {
                let record = record.clone();
                remote.queue_in_loop(move || record.lock().unwrap().push(i));
            }
            let quitter = remote.clone();
            remote.queue_in_loop(move || quitter.quit());
        });

        event_loop.run();
        handle.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn quit_from_another_thread_interrupts_poll() {
        let event_loop = EventLoop::new().unwrap();
        let remote = event_loop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.quit();
        });

        let start = Instant::now();
        event_loop.run();
        handle.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn second_loop_in_same_thread_is_fatal() {
        let handle = thread::spawn(|| {
            let _keep = EventLoop::new().unwrap();
            let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(EventLoop::new));
            assert!(second.is_err());
        });
        handle.join().unwrap();
    }

    #[test]
    fn current_tracks_the_thread_local_loop() {
        let event_loop = EventLoop::new().unwrap();
        let current = EventLoop::current().unwrap();
        assert!(Arc::ptr_eq(&event_loop, &current));

        thread::spawn(|| assert!(EventLoop::current().is_none()))
            .join()
            .unwrap();
    }
}
