//! Append-only message buffer scoped to one reasoning invocation.
//!
//! Concurrent appends are serialized by the lock; snapshots are
//! immutable copies handed to provider inputs.

use parking_lot::Mutex;

use chorus_domain::message::ChatMessage;

#[derive(Default)]
pub struct SessionBuffer {
    msgs: Mutex<Vec<ChatMessage>>,
}

impl SessionBuffer {
    pub fn new(initial: Vec<ChatMessage>) -> Self {
        Self {
            msgs: Mutex::new(initial),
        }
    }

    pub fn append(&self, msg: ChatMessage) {
        self.msgs.lock().push(msg);
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.msgs.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.msgs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.lock().is_empty()
    }
}
