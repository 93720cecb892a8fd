//! Events delivered by a listener to its consumer.
//!
//! Claimed records arrive as `Data`; failures that happen inside the timer
//! chains, where there is no caller to return them to, arrive as `Error`.

use tokio::sync::mpsc;

use crate::engine::WrappedMessage;
use crate::error::Error;

/// One item on a listener's event stream.
#[derive(Debug)]
pub enum ListenerEvent {
    /// A record claimed for this listener. The handler owns it until it
    /// calls `requeue` or `remove`, or the lease expires.
    Data(WrappedMessage),
    /// A claim or reap failure.
    Error(Error),
}

impl ListenerEvent {
    pub fn is_data(&self) -> bool {
        matches!(self, ListenerEvent::Data(_))
    }
}

pub type EventSender = mpsc::UnboundedSender<ListenerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ListenerEvent>;

pub(crate) fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
