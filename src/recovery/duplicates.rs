use std::collections::HashSet;

/// Tracks the message IDs a client context has already seen.
#[derive(Clone, Debug, Default)]
pub struct DuplicateCatcher {
    seen: HashSet<u64>,
}

impl DuplicateCatcher {
    /// Create a new instance seeded with the given message IDs.
    pub fn new(seen: impl IntoIterator<Item = u64>) -> Self {
        Self { seen: seen.into_iter().collect() }
    }

    /// Check if the given message ID has been seen before, recording it if not.
    pub fn is_duplicate(&mut self, message_id: u64) -> bool {
        !self.seen.insert(message_id)
    }

    /// Forget the given message ID, so that its redelivery is handled again.
    pub fn forget(&mut self, message_id: u64) {
        self.seen.remove(&message_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
