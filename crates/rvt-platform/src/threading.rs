//! Threading Primitives
//!
//! Named threads and the render thread command queue.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};

use crate::{PlatformError, PlatformResult};

thread_local! {
    static IS_RENDER_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Returns true when called from a thread started by [`RenderThread::spawn`]
pub fn is_in_render_thread() -> bool {
    IS_RENDER_THREAD.with(|flag| flag.get())
}

/// Thread wrapper with a debug name
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl Thread {
    /// Spawn a new thread with the given name and function
    pub fn spawn<F>(name: impl Into<String>, f: F) -> PlatformResult<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new().name(name.clone()).spawn(f)?;

        Ok(Self {
            handle: Some(handle),
            name,
        })
    }

    /// Get the thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the thread, waiting for it to complete
    pub fn join(mut self) -> thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

/// Command executed on the render thread against its context
type Command<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

enum Message<C> {
    Run(Command<C>),
    Exit,
}

/// Cloneable handle for enqueueing commands onto a render thread.
///
/// Commands run in FIFO order, one at a time, on the render thread that
/// owns the context `C`. Nothing else ever touches the context, so commands
/// need no locking to mutate it.
pub struct RenderCommandQueue<C: 'static> {
    sender: Sender<Message<C>>,
    pending: Arc<AtomicUsize>,
}

impl<C: 'static> Clone for RenderCommandQueue<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<C: 'static> RenderCommandQueue<C> {
    /// Enqueue a command without waiting for it to run
    pub fn enqueue<F>(&self, command: F) -> PlatformResult<()>
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.sender
            .send(Message::Run(Box::new(command)))
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                PlatformError::RenderThreadStopped
            })
    }

    /// Enqueue a command and block until it has run, returning its result.
    ///
    /// Every command enqueued before this one has also run when it returns.
    /// Panics when called from the render thread itself, which would deadlock.
    pub fn enqueue_and_wait<F, R>(&self, command: F) -> PlatformResult<R>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        assert!(
            !is_in_render_thread(),
            "blocking render command issued from the render thread"
        );

        let (reply, result) = bounded(1);
        self.enqueue(move |context| {
            let _ = reply.send(command(context));
        })?;
        // The reply sender is dropped without sending if the command panicked
        result.recv().map_err(|_| PlatformError::CommandPanicked)
    }

    /// Block until every command enqueued so far has run
    pub fn flush(&self) -> PlatformResult<()> {
        self.enqueue_and_wait(|_| ())
    }

    /// Number of commands enqueued but not yet finished
    pub fn pending_commands(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Dedicated thread owning a render context and draining its command queue
pub struct RenderThread<C: 'static> {
    queue: RenderCommandQueue<C>,
    thread: Option<Thread>,
}

impl<C: 'static> RenderThread<C> {
    /// Spawn the render thread. `make_context` runs on the new thread, so the
    /// context is created, used and dropped there.
    pub fn spawn<F>(name: impl Into<String>, make_context: F) -> PlatformResult<Self>
    where
        F: FnOnce() -> C + Send + 'static,
    {
        let (sender, receiver): (Sender<Message<C>>, Receiver<Message<C>>) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        let thread_pending = pending.clone();

        let thread = Thread::spawn(name, move || {
            IS_RENDER_THREAD.with(|flag| flag.set(true));
            let mut context = make_context();

            while let Ok(message) = receiver.recv() {
                match message {
                    Message::Run(command) => {
                        command(&mut context);
                        thread_pending.fetch_sub(1, Ordering::AcqRel);
                    }
                    Message::Exit => break,
                }
            }

            log::debug!("Render thread exiting");
        })?;

        Ok(Self {
            queue: RenderCommandQueue { sender, pending },
            thread: Some(thread),
        })
    }

    /// Get a handle for enqueueing commands
    pub fn queue(&self) -> RenderCommandQueue<C> {
        self.queue.clone()
    }

    /// Get the thread name
    pub fn name(&self) -> &str {
        self.thread.as_ref().map_or("", |t| t.name())
    }

    /// Run all pending commands, then stop the thread and drop its context
    pub fn shutdown(mut self) -> PlatformResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> PlatformResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        // Exit is queued behind everything already enqueued
        let _ = self.queue.sender.send(Message::Exit);
        thread.join().map_err(|_| PlatformError::CommandPanicked)
    }
}

impl<C: 'static> Drop for RenderThread<C> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("Render thread shutdown failed: {}", err);
        }
    }
}
