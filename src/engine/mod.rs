//! Queue engine: enqueue, claim polling, lease reaping, and the listener
//! that ties them together.

mod chain;
pub mod enqueue;
pub mod listener;
pub mod poller;
pub mod reaper;
pub mod wrapped;

pub use enqueue::{Enqueuer, SendOutcome};
pub use listener::Listener;
pub use poller::PollOutcome;
pub use reaper::ReapOutcome;
pub use wrapped::{RemoveOutcome, WrappedMessage};
