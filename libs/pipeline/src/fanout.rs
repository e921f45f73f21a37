use relay_core::{MessageEnvelope, UserId};
use tokio::sync::mpsc;

/// Event handed from the consumer workers to the session hosts. The pipeline
/// never touches transport state; whoever owns the sessions drains this
/// queue and emits.
#[derive(Debug, Clone)]
pub enum FanoutEvent {
    NewMessage {
        envelope: MessageEnvelope,
        /// Conversation members minus the sender at ingress time.
        recipients: Vec<UserId>,
    },
}

pub type FanoutQueue = mpsc::Receiver<FanoutEvent>;

/// Bounded handoff channel between consumers and session hosts.
pub fn fanout_channel(capacity: usize) -> (mpsc::Sender<FanoutEvent>, FanoutQueue) {
    mpsc::channel(capacity.max(1))
}
