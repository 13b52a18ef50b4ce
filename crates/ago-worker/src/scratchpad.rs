/// Append-only intra-turn reasoning context. When the pad outgrows
/// `max_chars` the head is dropped (keep-tail), so the most recent
/// thoughts and observations always survive re-presentation to the
/// reasoner. A fresh pad is created per turn, which is what clears it on
/// turn completion.
pub struct Scratchpad {
    buf: String,
    max_chars: usize,
}

impl Scratchpad {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buf: String::new(),
            max_chars: max_chars.max(64),
        }
    }

    pub fn append(&mut self, line: &str) {
        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        self.buf.push_str(line);
        if self.buf.len() > self.max_chars {
            let mut cut = self.buf.len() - self.max_chars;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    pub fn view(&self) -> &str {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_joins_with_newlines() {
        let mut pad = Scratchpad::new(1000);
        pad.append("THOUGHT: first");
        pad.append("OBSERVATION: second");
        assert_eq!(pad.view(), "THOUGHT: first\nOBSERVATION: second");
    }

    #[test]
    fn test_truncation_keeps_tail() {
        let mut pad = Scratchpad::new(64);
        pad.append(&"a".repeat(60));
        pad.append("TAIL MARKER");
        assert!(pad.view().len() <= 64);
        assert!(pad.view().ends_with("TAIL MARKER"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let mut pad = Scratchpad::new(64);
        pad.append(&"é".repeat(100));
        assert!(pad.view().len() <= 64 + 2);
        assert!(pad.view().chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_new_pad_is_empty() {
        assert!(Scratchpad::new(100).is_empty());
    }
}
