//! Dedicated background worker fed by a concurrent queue.
//!
//! Cache levels whose maintenance is too slow for the rendering thread (disk
//! I/O, large CPU-side copies) own exactly one `Worker`. The protocol is:
//! push a task or a wake-up, the worker thread wakes, processes it and loops.
//! Shutdown flips an atomic flag, pushes a poison pill and joins the thread.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

/// What a worker's handler is invoked with.
#[derive(Debug)]
pub enum WorkerEvent<T> {
    /// A task pushed with [`Worker::submit`]
    Task(T),

    /// A coalesced wake-up pushed with [`Worker::wake`]
    Wake,
}

enum Message<T> {
    Event(WorkerEvent<T>),
    Shutdown,
}

/// Returned by [`Worker::submit`] after the worker has been shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerShutDown;

impl fmt::Display for WorkerShutDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("worker has been shut down")
    }
}

impl std::error::Error for WorkerShutDown {}

/// A single named background thread processing events in FIFO order.
///
/// # Example
///
/// ```
/// use ooc_scheduler::{Worker, WorkerEvent};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let seen = Arc::new(AtomicUsize::new(0));
/// let seen_clone = seen.clone();
/// let mut worker = Worker::spawn("doc-worker", move |event: WorkerEvent<usize>| {
///     if let WorkerEvent::Task(n) = event {
///         seen_clone.fetch_add(n, Ordering::SeqCst);
///     }
/// })
/// .unwrap();
///
/// worker.submit(2).unwrap();
/// worker.submit(3).unwrap();
/// worker.shutdown_after_pending();
/// assert_eq!(seen.load(Ordering::SeqCst), 5);
/// ```
pub struct Worker<T: Send + 'static> {
    name: String,
    sender: Sender<Message<T>>,
    wake_pending: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawn the worker thread.
    ///
    /// `handler` runs on the worker thread for every task and wake-up until
    /// the worker is shut down.
    pub fn spawn<F>(name: impl Into<String>, handler: F) -> io::Result<Self>
    where
        F: FnMut(WorkerEvent<T>) + Send + 'static,
    {
        let name = name.into();
        let (sender, receiver) = unbounded();
        let wake_pending = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let wake_pending = wake_pending.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || Self::run(receiver, handler, wake_pending, shutdown))?
        };

        log::debug!("started worker thread {name}");

        Ok(Self {
            name,
            sender,
            wake_pending,
            shutdown,
            thread: Some(thread),
        })
    }

    fn run<F>(
        receiver: Receiver<Message<T>>,
        mut handler: F,
        wake_pending: Arc<AtomicBool>,
        shutdown: Arc<AtomicBool>,
    ) where
        F: FnMut(WorkerEvent<T>),
    {
        for message in receiver.iter() {
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            match message {
                Message::Event(WorkerEvent::Wake) => {
                    // Clear before handling so a wake-up sent meanwhile is not lost
                    wake_pending.store(false, Ordering::Release);
                    handler(WorkerEvent::Wake);
                }
                Message::Event(event) => handler(event),
                Message::Shutdown => break,
            }
        }
    }

    /// Thread name of this worker
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker still accepts events
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire) && self.thread.is_some()
    }

    /// Number of queued events not yet picked up by the thread
    pub fn pending(&self) -> usize {
        self.sender.len()
    }

    /// Queue a task.
    pub fn submit(&self, task: T) -> Result<(), WorkerShutDown> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(WorkerShutDown);
        }
        self.sender
            .send(Message::Event(WorkerEvent::Task(task)))
            .map_err(|_| WorkerShutDown)
    }

    /// Signal that there may be work to do.
    ///
    /// Wake-ups coalesce: while one is queued and not yet handled, further
    /// calls are no-ops.
    pub fn wake(&self) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        if !self.wake_pending.swap(true, Ordering::AcqRel)
            && self.sender.send(Message::Event(WorkerEvent::Wake)).is_err()
        {
            self.wake_pending.store(false, Ordering::Release);
        }
    }

    /// Stop the worker, discarding queued events, and wait for the thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.sender.send(Message::Shutdown);
        self.join();
    }

    /// Stop the worker after every event queued so far has been handled.
    pub fn shutdown_after_pending(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        self.join();
        self.shutdown.store(true, Ordering::Release);
    }

    fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        // The last owner can be dropped from inside the handler
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            log::error!("worker thread {} panicked", self.name);
        } else {
            log::debug!("stopped worker thread {}", self.name);
        }
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Send + 'static> fmt::Debug for Worker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}
