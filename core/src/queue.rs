//! Bounded drop-oldest queue feeding a single consumer
//!
//! Market data is only useful while fresh. When a consumer falls behind, the oldest
//! buffered message is discarded so the newest ones survive.

use crate::errors::ConnectionError;
use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

/// Result of [`BoundedQueue::push`]
#[derive(Debug, PartialEq, Eq)]
pub enum Push<T> {
    Stored,
    /// Stored after evicting the oldest item, which is handed back
    Evicted(T),
    /// The queue is closed, the item was not stored
    Rejected(T),
}

#[derive(Debug)]
enum Terminal {
    Closed,
    Failed(ConnectionError),
}

#[derive(Debug)]
struct State<T> {
    items: VecDeque<T>,
    waiter: Option<Waker>,
    terminal: Option<Terminal>,
}

/// FIFO with a hard capacity and at most one pending consumer.
///
/// After [`close`](Self::close) or [`fail`](Self::fail), buffered items are still
/// drained before the consumer sees the end of the queue (or the failure, once).
#[derive(Debug)]
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                waiter: None,
                terminal: None,
            }),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: T) -> Push<T> {
        let (outcome, waiter) = {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return Push::Rejected(item);
            }
            let evicted = if state.items.len() >= self.capacity {
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            let outcome = match evicted {
                Some(old) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Push::Evicted(old)
                }
                None => Push::Stored,
            };
            (outcome, state.waiter.take())
        };

        if let Some(waker) = waiter {
            waker.wake();
        }
        outcome
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// `Ready(None)` once the queue is closed and drained.
    pub fn poll_pop(&self, cx: &mut Context<'_>) -> Poll<Option<Result<T, ConnectionError>>> {
        let mut state = self.lock();
        if let Some(item) = state.items.pop_front() {
            return Poll::Ready(Some(Ok(item)));
        }
        match state.terminal.take() {
            Some(Terminal::Failed(error)) => {
                state.terminal = Some(Terminal::Closed);
                Poll::Ready(Some(Err(error)))
            }
            Some(Terminal::Closed) => {
                state.terminal = Some(Terminal::Closed);
                Poll::Ready(None)
            }
            None => {
                match &state.waiter {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    _ => state.waiter = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }

    pub async fn pop(&self) -> Option<Result<T, ConnectionError>> {
        poll_fn(|cx| self.poll_pop(cx)).await
    }

    /// End the queue normally.
    pub fn close(&self) {
        self.terminate(Terminal::Closed);
    }

    /// End the queue with an error delivered to the consumer after the backlog.
    pub fn fail(&self, error: ConnectionError) {
        self.terminate(Terminal::Failed(error));
    }

    fn terminate(&self, terminal: Terminal) {
        let waiter = {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal);
            state.waiter.take()
        };
        if let Some(waker) = waiter {
            waker.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().terminal.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items evicted so far because the consumer was too slow
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
