use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

/// The gate was closed while (or before) waiting; the connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateClosed;

/// FIFO counting gate. Used twice per connection: once for send credits granted
/// by the peer, once for the cap on unacknowledged in-flight sends.
#[derive(Clone, Debug)]
pub struct CreditGate {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug)]
struct Inner {
    available: usize,
    max_credits: usize,
    closed: bool,
    next_waiter_id: u64,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    needed: usize,
    waker: Waker,
}

impl Inner {
    fn ready_head_waker(&self) -> Option<Waker> {
        let head = self.waiters.front()?;
        if self.available >= head.needed {
            Some(head.waker.clone())
        } else {
            None
        }
    }

    fn remove_waiter(&mut self, id: u64) {
        if let Some(front) = self.waiters.front() {
            if front.id == id {
                self.waiters.pop_front();
                return;
            }
        }
        // Cancellation of a non-head waiter.
        if let Some(pos) = self.waiters.iter().position(|w| w.id == id) {
            self.waiters.remove(pos);
        }
    }

    fn enqueue(&mut self, needed: usize, waker: Waker) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id = self.next_waiter_id.wrapping_add(1);
        self.waiters.push_back(Waiter { id, needed, waker });
        id
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CreditGate {
    /// A gate holding `initial` credits that never exceeds `max_credits`.
    pub fn new(initial: usize, max_credits: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                available: initial.min(max_credits),
                max_credits,
                closed: false,
                next_waiter_id: 0,
                waiters: VecDeque::with_capacity(32),
            })),
        }
    }

    /// Wait for one credit. Resolves with [`GateClosed`] once the gate is closed.
    pub fn acquire(&self) -> Acquire {
        Acquire {
            inner: Arc::clone(&self.inner),
            needed: 1,
            waiter_id: None,
            done: false,
        }
    }

    /// Take one credit without waiting. Fails if others are already queued.
    pub fn try_acquire(&self) -> Option<Credit> {
        let mut inner = lock(&self.inner);
        if inner.closed || !inner.waiters.is_empty() || inner.available == 0 {
            return None;
        }
        inner.available -= 1;
        Some(Credit {
            inner: Arc::clone(&self.inner),
            size: 1,
        })
    }

    #[inline]
    pub fn available(&self) -> usize {
        lock(&self.inner).available
    }

    /// Return `count` credits, capped at the gate maximum, and wake the head waiter.
    pub fn release(&self, count: usize) {
        if count == 0 {
            return;
        }

        let waker = {
            let mut inner = lock(&self.inner);
            inner.available = inner.available.saturating_add(count).min(inner.max_credits);
            inner.ready_head_waker()
        };

        if let Some(w) = waker {
            w.wake();
        }
    }

    /// Fail every current and future waiter.
    pub fn close(&self) {
        let wakers: Vec<Waker> = {
            let mut inner = lock(&self.inner);
            inner.closed = true;
            inner.waiters.drain(..).map(|w| w.waker).collect()
        };
        for w in wakers {
            w.wake();
        }
    }
}

pub struct Acquire {
    inner: Arc<Mutex<Inner>>,
    needed: usize,
    waiter_id: Option<u64>,
    done: bool,
}

impl Future for Acquire {
    type Output = Result<Credit, GateClosed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.done {
            return Poll::Ready(Err(GateClosed));
        }

        let mut wake_next: Option<Waker> = None;
        let gate = Arc::clone(&self.inner);
        let outcome = {
            let mut inner = lock(&gate);

            if inner.closed {
                if let Some(id) = self.waiter_id {
                    inner.remove_waiter(id);
                }
                Some(Err(GateClosed))
            } else {
                let is_head = match self.waiter_id {
                    Some(id) => inner.waiters.front().map(|w| w.id == id).unwrap_or(false),
                    None => inner.waiters.is_empty(),
                };

                if is_head && inner.available >= self.needed {
                    inner.available -= self.needed;
                    if self.waiter_id.is_some() {
                        inner.waiters.pop_front();
                    }
                    wake_next = inner.ready_head_waker();
                    Some(Ok(()))
                } else {
                    let queued = self
                        .waiter_id
                        .and_then(|id| inner.waiters.iter().position(|w| w.id == id));
                    match queued {
                        Some(pos) => inner.waiters[pos].waker = cx.waker().clone(),
                        None => {
                            let id = inner.enqueue(self.needed, cx.waker().clone());
                            self.waiter_id = Some(id);
                        }
                    }
                    None
                }
            }
        };

        if let Some(w) = wake_next {
            w.wake();
        }

        match outcome {
            None => Poll::Pending,
            Some(result) => {
                self.done = true;
                self.waiter_id = None;
                Poll::Ready(result.map(|()| Credit {
                    inner: gate,
                    size: self.needed,
                }))
            }
        }
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(id) = self.waiter_id {
            let waker = {
                let mut inner = lock(&self.inner);
                inner.remove_waiter(id);
                inner.ready_head_waker()
            };
            if let Some(w) = waker {
                w.wake();
            }
        }
    }
}

/// A credit taken from a [`CreditGate`]. Dropping it rolls the credit back;
/// [`Credit::consume`] keeps it spent.
#[must_use]
pub struct Credit {
    inner: Arc<Mutex<Inner>>,
    size: usize,
}

impl Credit {
    /// The work this credit guarded was posted; it comes back only via an explicit release.
    pub fn consume(mut self) {
        self.size = 0;
    }
}

impl Drop for Credit {
    fn drop(&mut self) {
        if self.size == 0 {
            return;
        }
        let waker = {
            let mut inner = lock(&self.inner);
            inner.available = inner.available.saturating_add(self.size).min(inner.max_credits);
            inner.ready_head_waker()
        };
        if let Some(w) = waker {
            w.wake();
        }
    }
}
