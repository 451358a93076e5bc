use sessionkeeper::messaging::{Mailbox, MessageChannel};
use sessionkeeper::types::SessionKey;

/// A [`MessageChannel`] that delivers straight into the local mailbox. Stands in for a cross-node
/// persistently-queued transport: payloads sent to a closed session wait in the mailbox until the
/// key's session next activates.
#[derive(Clone)]
pub(crate) struct LoopbackChannel {
    mailbox: Mailbox,
}

impl LoopbackChannel {
    pub(crate) fn new(mailbox: Mailbox) -> LoopbackChannel {
        LoopbackChannel { mailbox }
    }
}

impl MessageChannel for LoopbackChannel {
    fn send_message(&self, key: &SessionKey, payload: Vec<u8>) -> bool {
        self.mailbox.enqueue(*key, payload);
        true
    }
}
