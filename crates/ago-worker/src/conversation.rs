use ago_core::{ConversationEntry, Role};
use std::collections::VecDeque;

/// Bounded conversation log for one instance. Single writer (the worker
/// owns it); older entries beyond the ring size are dropped silently.
pub struct ConversationLog {
    entries: VecDeque<ConversationEntry>,
    max_entries: usize,
}

impl ConversationLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn push(&mut self, role: Role, content: impl Into<String>) {
        self.entries.push_back(ConversationEntry::new(role, content));
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// The last `n` entries, oldest first, for prompt assembly.
    pub fn window(&self, n: usize) -> Vec<ConversationEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// The last `tail` entries, or everything when `tail` is `None`.
    pub fn tail(&self, tail: Option<usize>) -> Vec<ConversationEntry> {
        match tail {
            Some(n) => self.window(n),
            None => self.entries.iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest_silently() {
        let mut log = ConversationLog::new(3);
        for i in 0..5 {
            log.push(Role::User, format!("m{i}"));
        }
        assert_eq!(log.len(), 3);
        let all = log.tail(None);
        assert_eq!(all[0].content, "m2");
        assert_eq!(all[2].content, "m4");
    }

    #[test]
    fn test_window_is_most_recent_oldest_first() {
        let mut log = ConversationLog::new(10);
        for i in 0..6 {
            log.push(Role::Assistant, format!("m{i}"));
        }
        let window = log.window(2);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "m4");
        assert_eq!(window[1].content, "m5");
    }

    #[test]
    fn test_window_larger_than_log() {
        let mut log = ConversationLog::new(10);
        log.push(Role::User, "only");
        assert_eq!(log.window(20).len(), 1);
    }

    #[test]
    fn test_tail_some_limits() {
        let mut log = ConversationLog::new(10);
        for i in 0..4 {
            log.push(Role::Agent, format!("m{i}"));
        }
        assert_eq!(log.tail(Some(2)).len(), 2);
        assert_eq!(log.tail(None).len(), 4);
    }
}
