//! Synchronization primitives
//!
//! Arena access is ordered by a ticketed FIFO semaphore so that many writers and
//! one reader are granted the critical section strictly in arrival order.

mod fifo;

pub use fifo::{FifoPermit, FifoSemaphore, RetryPolicy};
