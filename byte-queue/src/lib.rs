#![no_std]

//! Bounded byte FIFO between async tasks.
//!
//! A [SymmetricQueue] blocks writers while it is full and readers while it is empty. Parked
//! callers wait in one of two FIFO wait-lists, so callers in the same direction are served
//! in the order they arrived. Every completed `put` wakes at most one reader and every
//! completed `get` wakes at most one writer. [SymmetricQueue::reset] drops the buffered
//! bytes and releases every parked caller with [QueueError::Reset].

#[cfg(test)]
extern crate std;

mod fmt;

use core::cell::RefCell;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueError {
    #[error("Timed out")]
    Timeout,
    #[error("Queue was reset")]
    Reset,
    #[error("Wait-list is full")]
    WaitListFull,
}

/// How long an operation may park
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Timeout {
    /// Never park
    Immediate,
    /// Park until the operation completes or the queue is reset
    Infinite,
    /// Park for at most this long, measured from the start of the call
    After(Duration),
}

impl Timeout {
    fn deadline(self) -> Deadline {
        match self {
            Timeout::Immediate => Deadline::Now,
            Timeout::Infinite => Deadline::Never,
            Timeout::After(duration) => match Instant::now().checked_add(duration) {
                Some(at) => Deadline::At(at),
                None => Deadline::Never,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Now,
    Never,
    At(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Put(u8),
    Get,
}

#[derive(Debug)]
struct Parked {
    id: u32,
    waker: Waker,
}

/// FIFO of parked callers
#[derive(Debug)]
struct WaitList<const W: usize> {
    parked: Vec<Parked, W>,
}

impl<const W: usize> WaitList<W> {
    const fn new() -> Self {
        Self { parked: Vec::new() }
    }

    fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    fn is_first(&self, id: u32) -> bool {
        self.parked.first().is_some_and(|p| p.id == id)
    }

    fn park(&mut self, id: u32, waker: &Waker) -> Result<(), QueueError> {
        self.parked
            .push(Parked {
                id,
                waker: waker.clone(),
            })
            .map_err(|_| QueueError::WaitListFull)
    }

    fn refresh(&mut self, id: u32, waker: &Waker) {
        if let Some(p) = self.parked.iter_mut().find(|p| p.id == id) {
            if !p.waker.will_wake(waker) {
                p.waker = waker.clone();
            }
        }
    }

    fn remove(&mut self, id: u32) {
        if let Some(index) = self.parked.iter().position(|p| p.id == id) {
            self.parked.remove(index);
        }
    }

    fn wake_first(&self) {
        if let Some(p) = self.parked.first() {
            p.waker.wake_by_ref();
        }
    }

    fn wake_all(&mut self) {
        while let Some(p) = self.parked.pop() {
            p.waker.wake();
        }
    }
}

/// Registration of a parked caller. The epoch changes on every reset.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    id: u32,
    epoch: u32,
}

struct State<const N: usize, const W: usize> {
    buffer: [u8; N],
    read: usize,
    write: usize,
    filled: usize,
    readers: WaitList<W>,
    writers: WaitList<W>,
    next_id: u32,
    epoch: u32,
}

impl<const N: usize, const W: usize> State<N, W> {
    const fn new() -> Self {
        Self {
            buffer: [0; N],
            read: 0,
            write: 0,
            filled: 0,
            readers: WaitList::new(),
            writers: WaitList::new(),
            next_id: 0,
            epoch: 0,
        }
    }

    fn list(&mut self, op: Op) -> &mut WaitList<W> {
        match op {
            Op::Put(_) => &mut self.writers,
            Op::Get => &mut self.readers,
        }
    }

    fn can(&self, op: Op) -> bool {
        match op {
            Op::Put(_) => self.filled < N,
            Op::Get => self.filled > 0,
        }
    }

    /// Move one byte and wake the first caller parked on the other side.
    /// Returns the byte read, or the byte written.
    fn apply(&mut self, op: Op) -> u8 {
        let byte = match op {
            Op::Put(byte) => {
                self.buffer[self.write] = byte;
                self.write += 1;
                if self.write == N {
                    self.write = 0;
                }
                self.filled += 1;
                self.readers.wake_first();
                byte
            }
            Op::Get => {
                let byte = self.buffer[self.read];
                self.read += 1;
                if self.read == N {
                    self.read = 0;
                }
                self.filled -= 1;
                self.writers.wake_first();
                byte
            }
        };
        byte
    }

    /// Complete `op` now if nobody is queued ahead of the caller
    fn attempt(&mut self, op: Op) -> Option<u8> {
        if self.list(op).is_empty() && self.can(op) {
            Some(self.apply(op))
        } else {
            None
        }
    }

    fn poll_op(
        &mut self,
        op: Op,
        ticket: &mut Option<Ticket>,
        waker: &Waker,
    ) -> Poll<Result<u8, QueueError>> {
        match *ticket {
            None => {
                if let Some(byte) = self.attempt(op) {
                    return Poll::Ready(Ok(byte));
                }
                let id = self.next_id;
                self.next_id = self.next_id.wrapping_add(1);
                if let Err(e) = self.list(op).park(id, waker) {
                    warn!("Queue wait-list full");
                    return Poll::Ready(Err(e));
                }
                trace!("Parked caller {}", id);
                *ticket = Some(Ticket {
                    id,
                    epoch: self.epoch,
                });
                Poll::Pending
            }
            Some(t) if t.epoch != self.epoch => {
                *ticket = None;
                Poll::Ready(Err(QueueError::Reset))
            }
            Some(t) => {
                if self.list(op).is_first(t.id) && self.can(op) {
                    self.list(op).remove(t.id);
                    *ticket = None;
                    trace!("Resumed caller {}", t.id);
                    let byte = self.apply(op);
                    // hand the turn to the next parked caller if there is still room for it
                    if self.can(op) {
                        self.list(op).wake_first();
                    }
                    Poll::Ready(Ok(byte))
                } else {
                    self.list(op).refresh(t.id, waker);
                    Poll::Pending
                }
            }
        }
    }

    /// A parked caller gave up, let the next one in line try
    fn abandon(&mut self, op: Op, ticket: Ticket) {
        if ticket.epoch != self.epoch {
            return;
        }
        let list = self.list(op);
        list.remove(ticket.id);
        list.wake_first();
    }

    fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
        self.filled = 0;
        self.epoch = self.epoch.wrapping_add(1);
        self.readers.wake_all();
        self.writers.wake_all();
    }
}

/// A bounded byte queue of `N` bytes with room for `W` parked callers per direction
pub struct SymmetricQueue<M: RawMutex, const N: usize, const W: usize = 4> {
    inner: Mutex<M, RefCell<State<N, W>>>,
}

impl<M: RawMutex, const N: usize, const W: usize> Default for SymmetricQueue<M, N, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const N: usize, const W: usize> SymmetricQueue<M, N, W> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(State::new())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State<N, W>) -> R) -> R {
        self.inner.lock(|state| f(&mut state.borrow_mut()))
    }

    async fn access(&self, op: Op, deadline: Deadline) -> Result<u8, QueueError> {
        match deadline {
            Deadline::Now => self
                .with(|state| state.attempt(op))
                .ok_or(QueueError::Timeout),
            Deadline::Never => Waiter::new(self, op).await,
            Deadline::At(at) => match select(Waiter::new(self, op), Timer::at(at)).await {
                Either::First(result) => result,
                Either::Second(()) => {
                    trace!("Queue operation timed out");
                    Err(QueueError::Timeout)
                }
            },
        }
    }

    /// Append one byte, parking while the queue is full
    pub async fn put(&self, byte: u8, timeout: Timeout) -> Result<(), QueueError> {
        self.access(Op::Put(byte), timeout.deadline())
            .await
            .map(|_| ())
    }

    /// Remove one byte, parking while the queue is empty
    pub async fn get(&self, timeout: Timeout) -> Result<u8, QueueError> {
        self.access(Op::Get, timeout.deadline()).await
    }

    /// Write all of `bytes`, parking as often as needed before the deadline.
    ///
    /// Returns the number of bytes written, short on timeout or reset.
    pub async fn write(&self, bytes: &[u8], timeout: Timeout) -> usize {
        let deadline = timeout.deadline();
        for (count, &byte) in bytes.iter().enumerate() {
            if self.access(Op::Put(byte), deadline).await.is_err() {
                return count;
            }
        }
        bytes.len()
    }

    /// Fill `bytes`, parking as often as needed before the deadline.
    ///
    /// Returns the number of bytes read, short on timeout or reset.
    pub async fn read(&self, bytes: &mut [u8], timeout: Timeout) -> usize {
        let deadline = timeout.deadline();
        for (count, slot) in bytes.iter_mut().enumerate() {
            match self.access(Op::Get, deadline).await {
                Ok(byte) => *slot = byte,
                Err(_) => return count,
            }
        }
        bytes.len()
    }

    /// [SymmetricQueue::put] with [Timeout::Immediate]
    pub fn try_put(&self, byte: u8) -> Result<(), QueueError> {
        self.with(|state| state.attempt(Op::Put(byte)))
            .map(|_| ())
            .ok_or(QueueError::Timeout)
    }

    /// [SymmetricQueue::get] with [Timeout::Immediate]
    pub fn try_get(&self) -> Result<u8, QueueError> {
        self.with(|state| state.attempt(Op::Get))
            .ok_or(QueueError::Timeout)
    }

    /// Drop all buffered bytes and release every parked caller with [QueueError::Reset]
    pub fn reset(&self) {
        debug!("Queue reset");
        self.with(|state| state.reset());
    }

    pub fn len(&self) -> usize {
        self.with(|state| state.filled)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

/// A caller that may park on one of the wait-lists.
/// Dropping it before completion removes it from the list.
struct Waiter<'a, M: RawMutex, const N: usize, const W: usize> {
    queue: &'a SymmetricQueue<M, N, W>,
    op: Op,
    ticket: Option<Ticket>,
}

impl<'a, M: RawMutex, const N: usize, const W: usize> Waiter<'a, M, N, W> {
    fn new(queue: &'a SymmetricQueue<M, N, W>, op: Op) -> Self {
        Self {
            queue,
            op,
            ticket: None,
        }
    }
}

impl<M: RawMutex, const N: usize, const W: usize> Future for Waiter<'_, M, N, W> {
    type Output = Result<u8, QueueError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let op = this.op;
        let ticket = &mut this.ticket;
        this.queue
            .with(|state| state.poll_op(op, ticket, cx.waker()))
    }
}

impl<M: RawMutex, const N: usize, const W: usize> Drop for Waiter<'_, M, N, W> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            let op = self.op;
            self.queue.with(|state| state.abandon(op, ticket));
        }
    }
}
