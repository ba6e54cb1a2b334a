// Envelope travelling through the pipeline stages.
use crate::KernelError;
use mira_common::{AckData, Message, Xid};
use std::fmt;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A freshly published message awaiting identity and routing.
    Message,
    /// Nothing to store; the writer only counts it.
    Ignore,
    /// Consumer acknowledgements.
    Ack,
    /// Committed transaction branch: enqueues to route, dequeues to apply.
    DtxCommit,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Message => "message",
            EventKind::Ignore => "ignore",
            EventKind::Ack => "ack",
            EventKind::DtxCommit => "dtx_commit",
        };
        f.write_str(name)
    }
}

pub type Completion = oneshot::Sender<crate::Result<()>>;

pub struct InboundEvent {
    kind: EventKind,
    messages: Vec<Message>,
    acks: Vec<AckData>,
    xid: Option<Xid>,
    // Resolved by the writer once the event is applied, or dropped unresolved
    // if the pipeline stops first.
    completion: Option<Completion>,
}

impl InboundEvent {
    pub fn message(message: Message) -> Self {
        Self {
            kind: EventKind::Message,
            messages: vec![message],
            acks: Vec::new(),
            xid: None,
            completion: None,
        }
    }

    pub fn ack(acks: Vec<AckData>) -> Self {
        Self {
            kind: EventKind::Ack,
            messages: Vec::new(),
            acks,
            xid: None,
            completion: None,
        }
    }

    pub fn dtx_commit(
        xid: Xid,
        enqueues: Vec<Message>,
        dequeues: Vec<AckData>,
        completion: Completion,
    ) -> Self {
        Self {
            kind: EventKind::DtxCommit,
            messages: enqueues,
            acks: dequeues,
            xid: Some(xid),
            completion: Some(completion),
        }
    }

    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut Vec<Message> {
        &mut self.messages
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    /// Swap in the routed copies produced by the pre-processor.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub fn acks(&self) -> &[AckData] {
        &self.acks
    }

    pub fn xid(&self) -> Option<&Xid> {
        self.xid.as_ref()
    }

    /// Turn the event into a no-op; nothing it carried reaches the store.
    pub fn mark_ignored(&mut self) {
        self.kind = EventKind::Ignore;
        self.messages.clear();
        self.acks.clear();
    }

    /// Resolve the completion, if any. Later calls are no-ops.
    pub fn complete(&mut self, result: crate::Result<()>) {
        if let Some(completion) = self.completion.take() {
            // The submitter may have stopped waiting.
            let _ = completion.send(result);
        }
    }

    pub(crate) fn fail(&mut self, err: KernelError) {
        self.complete(Err(err));
    }
}

impl fmt::Debug for InboundEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundEvent")
            .field("kind", &self.kind)
            .field("messages", &self.messages.len())
            .field("acks", &self.acks.len())
            .field("xid", &self.xid)
            .field("awaiting_completion", &self.completion.is_some())
            .finish()
    }
}
