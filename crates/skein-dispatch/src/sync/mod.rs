//! Fiber parking primitives
//!
//! Both primitives park the calling fiber on a condition variable bound to
//! the same mutex that guards their state, so a signal can never slip
//! between the check and the wait.

mod event;
mod semaphore;

pub use event::Event;
pub use semaphore::Semaphore;
