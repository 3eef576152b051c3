//! Ticketed FIFO semaphore

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What to do when an acquire attempt times out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Give up after the first timeout
    #[default]
    None,
    /// Wait for up to this many additional timeout windows
    Bounded(u32),
    /// Never give up; the timeout only paces wakeups
    Infinite,
}

impl RetryPolicy {
    fn allows(&self, retries_done: u32) -> bool {
        match self {
            RetryPolicy::None => false,
            RetryPolicy::Bounded(n) => retries_done < *n,
            RetryPolicy::Infinite => true,
        }
    }
}

#[derive(Debug)]
struct TicketState {
    next_ticket: u64,
    queue: VecDeque<u64>,
    available: usize,
}

/// Counting semaphore that grants units strictly in ticket order
///
/// Every acquirer takes a ticket and joins the back of the queue. Only the head
/// ticket may take units, so a large request is never overtaken by later small
/// ones.
#[derive(Debug)]
pub struct FifoSemaphore {
    state: Mutex<TicketState>,
    cond: Condvar,
    units: usize,
}

impl FifoSemaphore {
    /// Create a semaphore holding `units` capacity units
    pub fn new(units: usize) -> Self {
        Self {
            state: Mutex::new(TicketState {
                next_ticket: 1,
                queue: VecDeque::new(),
                available: units,
            }),
            cond: Condvar::new(),
            units,
        }
    }

    /// Create a semaphore used as a FIFO mutex
    pub fn mutex() -> Self {
        Self::new(1)
    }

    /// Acquire `amount` units, waiting at most one `timeout` window
    pub fn acquire_timeout(&self, amount: usize, timeout: Duration) -> Result<FifoPermit<'_>> {
        self.acquire(amount, Some(timeout), RetryPolicy::None)
    }

    /// Acquire `amount` units
    ///
    /// `timeout` of `None` waits forever. When a window expires the retry policy
    /// decides whether to keep the ticket queued or abandon it with
    /// [`Error::Timeout`]. An abandoned ticket leaves the queue immediately.
    pub fn acquire(
        &self,
        amount: usize,
        timeout: Option<Duration>,
        retry: RetryPolicy,
    ) -> Result<FifoPermit<'_>> {
        if amount > self.units {
            return Err(Error::InvalidState(format!(
                "requested {amount} units from a semaphore of {}",
                self.units
            )));
        }

        let started = Instant::now();
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        let mut deadline = timeout.map(|t| Instant::now() + t);
        let mut retries = 0u32;

        loop {
            if state.queue.front() == Some(&ticket) && state.available >= amount {
                state.queue.pop_front();
                state.available -= amount;
                // The next head may be able to proceed with what is left
                self.cond.notify_all();
                return Ok(FifoPermit {
                    semaphore: self,
                    amount,
                    ticket,
                    released: false,
                });
            }

            match deadline {
                None => self.cond.wait(&mut state),
                Some(at) => {
                    if self.cond.wait_until(&mut state, at).timed_out()
                        && !(state.queue.front() == Some(&ticket) && state.available >= amount)
                    {
                        if retry.allows(retries) {
                            retries += 1;
                            deadline = timeout.map(|t| Instant::now() + t);
                            continue;
                        }
                        state.queue.retain(|t| *t != ticket);
                        self.cond.notify_all();
                        tracing::debug!(ticket, retries, "fifo acquire abandoned");
                        return Err(Error::Timeout(started.elapsed()));
                    }
                }
            }
        }
    }

    /// Return `amount` units and wake all waiters
    pub fn release(&self, amount: usize) {
        let mut state = self.state.lock();
        state.available = (state.available + amount).min(self.units);
        drop(state);
        self.cond.notify_all();
    }

    /// Units currently free
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Tickets currently queued
    pub fn waiting(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Units held from a [`FifoSemaphore`], returned on drop
#[derive(Debug)]
pub struct FifoPermit<'a> {
    semaphore: &'a FifoSemaphore,
    amount: usize,
    ticket: u64,
    released: bool,
}

impl FifoPermit<'_> {
    /// Ticket this permit was granted under
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    pub fn amount(&self) -> usize {
        self.amount
    }

    /// Release explicitly
    pub fn release(mut self) {
        self.semaphore.release(self.amount);
        self.released = true;
    }
}

impl Drop for FifoPermit<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.semaphore.release(self.amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_grants_in_ticket_order() {
        const K: usize = 16;
        let sem = Arc::new(FifoSemaphore::mutex());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the only unit so every contender queues up behind us
        let gate = sem.acquire(1, None, RetryPolicy::None).unwrap();
        assert_eq!(gate.ticket(), 1);

        let handles: Vec<_> = (0..K)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    let permit = sem.acquire(1, None, RetryPolicy::None).unwrap();
                    order.lock().push(permit.ticket());
                })
            })
            .collect();

        while sem.waiting() < K {
            thread::yield_now();
        }
        drop(gate);
        for h in handles {
            h.join().unwrap();
        }

        let granted = order.lock().clone();
        let expected: Vec<u64> = (2..2 + K as u64).collect();
        assert_eq!(granted, expected);
    }

    #[test]
    fn test_timeout_abandons_ticket() {
        let sem = FifoSemaphore::mutex();
        let held = sem.acquire_timeout(1, Duration::from_millis(10)).unwrap();

        let err = sem.acquire_timeout(1, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(sem.waiting(), 0);

        drop(held);
        assert!(sem.acquire_timeout(1, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_bounded_retry_waits_multiple_windows() {
        let sem = Arc::new(FifoSemaphore::mutex());
        let held = sem.acquire(1, None, RetryPolicy::None).unwrap();

        let sem2 = Arc::clone(&sem);
        let waiter = thread::spawn(move || {
            sem2.acquire(1, Some(Duration::from_millis(20)), RetryPolicy::Bounded(50))
                .map(|p| p.ticket())
        });

        thread::sleep(Duration::from_millis(60));
        held.release();
        assert_eq!(waiter.join().unwrap().unwrap(), 2);
    }

    #[test]
    fn test_head_blocks_smaller_followers() {
        let sem = Arc::new(FifoSemaphore::new(2));
        let one = sem.acquire(1, None, RetryPolicy::None).unwrap();

        // Ticket 2 wants both units and must go before ticket 3
        let sem2 = Arc::clone(&sem);
        let big = thread::spawn(move || {
            let p = sem2.acquire(2, None, RetryPolicy::None).unwrap();
            p.ticket()
        });
        while sem.waiting() < 1 {
            thread::yield_now();
        }

        // One unit is free, but ticket 3 is not at the head
        let err = sem.acquire_timeout(1, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        drop(one);
        assert_eq!(big.join().unwrap(), 2);
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn test_rejects_oversized_request() {
        let sem = FifoSemaphore::new(2);
        assert!(sem.acquire(3, None, RetryPolicy::None).is_err());
    }
}
