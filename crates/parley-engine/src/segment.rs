/// Characters that close a speech unit.
pub const UNIT_TERMINATORS: [char; 8] = [',', '，', '.', '。', '?', '？', '!', '！'];

fn is_terminator(c: char) -> bool {
    UNIT_TERMINATORS.contains(&c)
}

/// Splits streamed text into phrase-sized units at punctuation.
///
/// A unit ends at the first terminator. Units without any alphanumeric
/// character (e.g. `"..."` or `" ,"`) are discarded rather than emitted.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    fragment: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a delta, returning every unit it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        let mut units = Vec::new();
        for c in delta.chars() {
            self.fragment.push(c);
            if is_terminator(c) {
                let unit = std::mem::take(&mut self.fragment);
                if unit.chars().any(char::is_alphanumeric) {
                    units.push(unit);
                }
            }
        }
        units
    }

    /// Take the incomplete remainder, leaving the segmenter empty.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.fragment)
    }

    pub fn pending(&self) -> &str {
        &self.fragment
    }

    pub fn reset(&mut self) {
        self.fragment.clear();
    }
}
