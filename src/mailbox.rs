//! Bounded typed mailboxes between control tasks.
//!
//! Messages are produced by:
//! - ADC conversion callbacks (interrupt context — must never block)
//! - sibling tasks (ordinary context — may block briefly)
//! - the host comms layer (ordinary context)
//!
//! Each task owns exactly one [`Mailbox`] and drains it one message at a
//! time from its own loop, so task state needs no internal locking.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ ADC callback │────▶│              │     │              │
//! │ Sibling task │────▶│   Mailbox    │────▶│  Owning task │
//! │ Comms layer  │────▶│  (bounded)   │     │  (consumer)  │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```
//!
//! Interrupt-context producers use [`Sender::send_from_isr`], which is
//! strictly non-blocking: a full queue or a contended lock drops the
//! message and returns `false`. Dropping a conversion reading is safe —
//! the next sample arrives one period later.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use heapless::Deque;

/// Maximum number of pending messages per task.
/// Sized for one conversion burst plus a full command backlog.
const QUEUE_DEPTH: usize = 16;

struct Shared<M> {
    queue: Mutex<Deque<M, QUEUE_DEPTH>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Receiving half, owned by exactly one task.
pub struct Mailbox<M> {
    shared: Arc<Shared<M>>,
}

/// Cloneable producing half.
pub struct Sender<M> {
    shared: Arc<Shared<M>>,
}

impl<M> Clone for Sender<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// A poisoned mutex only means another thread panicked mid-push; the
// queue itself is still structurally valid, so recover the guard.
fn lock_queue<M>(shared: &Shared<M>) -> MutexGuard<'_, Deque<M, QUEUE_DEPTH>> {
    match shared.queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl<M> Mailbox<M> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Deque::new()),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    /// Create another producing handle.
    pub fn sender(&self) -> Sender<M> {
        Sender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Block up to `timeout` for the next message.
    ///
    /// `None` on timeout — the owning task uses this to fall back into
    /// its fixed-period control loop when traffic is quiet.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<M> {
        let deadline = Instant::now() + timeout;
        let mut queue = lock_queue(&self.shared);
        loop {
            if let Some(msg) = queue.pop_front() {
                self.shared.not_full.notify_one();
                return Some(msg);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            queue = match self.shared.not_empty.wait_timeout(queue, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Drain without blocking. `None` when empty.
    pub fn try_recv(&self) -> Option<M> {
        let mut queue = lock_queue(&self.shared);
        let msg = queue.pop_front()?;
        self.shared.not_full.notify_one();
        Some(msg)
    }

    /// Number of pending messages.
    pub fn len(&self) -> usize {
        lock_queue(&self.shared).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Sender<M> {
    /// Block up to `timeout` while the mailbox is full.
    /// Returns `false` if the message could not be delivered in time.
    pub fn send(&self, msg: M, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = lock_queue(&self.shared);
        let mut msg = msg;
        loop {
            match queue.push_back(msg) {
                Ok(()) => {
                    self.shared.not_empty.notify_one();
                    return true;
                }
                Err(rejected) => msg = rejected,
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            queue = match self.shared.not_full.wait_timeout(queue, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Push without ever blocking. Returns `false` and drops the
    /// message when the queue is full or the lock is contended.
    pub fn try_send(&self, msg: M) -> bool {
        let Ok(mut queue) = self.shared.queue.try_lock() else {
            return false;
        };
        if queue.push_back(msg).is_err() {
            return false;
        }
        self.shared.not_empty.notify_one();
        true
    }

    /// [`try_send`](Self::try_send) under its interrupt-context name.
    /// ADC conversion callbacks must never block on a mailbox.
    pub fn send_from_isr(&self, msg: M) -> bool {
        self.try_send(msg)
    }
}
