// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Hands output buffers returned by the consumer back to the decoder core.
//!
//! Returns are queued from any thread. A dedicated thread pushes them to the core whenever
//! [`Hardware::can_recycle`] allows it, then forwards the index to the protocol thread so the
//! DPB can reuse the buffer. The core readiness is polled, so the thread also wakes up every
//! `interval` while returns are pending. When the recycler stops, the returns still pending are
//! handed to the core as long as it takes them, and dropped after that.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;
use nix::errno::Errno;
use nix::sys::epoll::Epoll;
use nix::sys::epoll::EpollCreateFlags;
use nix::sys::epoll::EpollEvent;
use nix::sys::epoll::EpollFlags;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;
use thiserror::Error;

use crate::backend::Hardware;

#[derive(Debug, Error)]
pub enum RecyclerError {
    #[error("failed to create EventFd for buffer returns: {0}")]
    EventFd(Errno),
    #[error("failed to create Epoll: {0}")]
    Epoll(Errno),
    #[error("failed to add poll FDs to Epoll: {0}")]
    EpollAdd(Errno),
    #[error("failed to spawn the recycler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Default)]
struct RecycleState {
    pending: VecDeque<usize>,
    closed: bool,
}

/// Buffers returned by the consumer and not yet handed to the core.
pub struct RecycleQueue {
    state: Mutex<RecycleState>,
    wake: EventFd,
}

impl RecycleQueue {
    fn new() -> Result<Self, RecyclerError> {
        Ok(Self {
            state: Default::default(),
            wake: EventFd::from_flags(EfdFlags::EFD_SEMAPHORE).map_err(RecyclerError::EventFd)?,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        if let Err(e) = self.wake.write(1) {
            error!("Failed to wake the recycler: {}", e);
        }
    }

    /// Queues buffer `index`. Returns `false` if the queue was closed.
    pub fn push(&self, index: usize) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.pending.push_back(index);
        }

        self.wake();
        true
    }

    /// Refuses further returns and makes the recycler thread exit.
    fn close(&self) {
        self.lock().closed = true;
        self.wake();
    }

    /// Refuses further returns and drops the pending ones, for a session whose core will not
    /// take buffers anymore.
    pub fn cancel(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.pending.clear();
        }

        self.wake();
    }

    pub fn num_pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Takes the next buffer to recycle, if any and if `ready`. `None` once closed.
    fn next(&self, ready: impl FnOnce() -> bool) -> Option<Option<usize>> {
        let mut state = self.lock();

        if state.closed {
            None
        } else if state.pending.is_empty() || !ready() {
            Some(None)
        } else {
            Some(state.pending.pop_front())
        }
    }

    /// Takes the next pending buffer regardless of the queue being closed, if `ready`.
    fn take_if(&self, ready: impl FnOnce() -> bool) -> Option<usize> {
        let mut state = self.lock();

        if state.pending.is_empty() || !ready() {
            None
        } else {
            state.pending.pop_front()
        }
    }

    /// Drops the pending returns. Returns how many there were.
    fn discard(&self) -> usize {
        let mut state = self.lock();
        let count = state.pending.len();
        state.pending.clear();
        count
    }
}

pub struct Recycler {
    queue: Arc<RecycleQueue>,
    thread: Option<JoinHandle<()>>,
}

impl Recycler {
    /// Starts the recycler thread. Recycled indices are sent to `returned`.
    pub fn start<H: Hardware + 'static>(
        hw: Arc<H>,
        returned: mpsc::Sender<usize>,
        interval: Duration,
    ) -> Result<Self, RecyclerError> {
        let queue = Arc::new(RecycleQueue::new()?);

        let epoll = Epoll::new(EpollCreateFlags::empty()).map_err(RecyclerError::Epoll)?;
        epoll
            .add(queue.wake.as_fd(), EpollEvent::new(EpollFlags::EPOLLIN, 1))
            .map_err(RecyclerError::EpollAdd)?;

        let timeout_ms = u16::try_from(interval.as_millis()).unwrap_or(u16::MAX);

        let thread_queue = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name("amvdec-recycler".into())
            .spawn(move || recycle_loop(&*hw, &thread_queue, &epoll, timeout_ms, &returned))?;

        Ok(Self {
            queue,
            thread: Some(thread),
        })
    }

    pub fn queue(&self) -> &Arc<RecycleQueue> {
        &self.queue
    }

    /// Closes the queue and waits for the thread to hand over what the core takes, then exit.
    pub fn stop(&mut self) {
        self.queue.close();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Recycler thread panicked");
            }
        }
    }
}

impl Drop for Recycler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn recycle_loop<H: Hardware + ?Sized>(
    hw: &H,
    queue: &RecycleQueue,
    epoll: &Epoll,
    timeout_ms: u16,
    returned: &mpsc::Sender<usize>,
) {
    debug!("Recycler started");

    loop {
        match queue.next(|| hw.can_recycle()) {
            None => break,
            Some(Some(index)) => {
                debug!("Recycling buffer {}", index);
                hw.recycle(index);
                // The protocol thread is gone when the session stops.
                let _ = returned.send(index);
                continue;
            }
            Some(None) => (),
        }

        let mut events = [EpollEvent::empty()];
        match epoll.wait(&mut events, timeout_ms) {
            Ok(0) => (),
            Ok(_) => {
                if let Err(e) = queue.wake.read() {
                    error!("Failed to read the recycler EventFd: {}", e);
                    break;
                }
            }
            Err(Errno::EINTR) => (),
            Err(e) => {
                error!("Recycler poll failed: {}", e);
                break;
            }
        }
    }

    while let Some(index) = queue.take_if(|| hw.can_recycle()) {
        debug!("Recycling buffer {} before stopping", index);
        hw.recycle(index);
        let _ = returned.send(index);
    }

    let dropped = queue.discard();
    if dropped > 0 {
        warn!("Dropping {} returned buffers the core did not take", dropped);
    }

    debug!("Recycler stopped");
}
