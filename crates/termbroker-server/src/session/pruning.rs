//! Detection of output sequences after which earlier scrollback is dead.

/// Clear-scrollback, reset, clear-screen and alternate-screen switches.
pub const PRUNING_SEQUENCES: &[&str] = &[
    "\x1b[3J",
    "\x1bc",
    "\x1b[2J",
    "\x1b[H\x1b[J",
    "\x1b[H\x1b[2J",
    "\x1b[?1049h",
    "\x1b[?1049l",
    "\x1b[?47h",
    "\x1b[?47l",
];

/// A pruning sequence located in a chunk of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruningMatch {
    pub sequence: &'static str,
    /// Byte index just past the sequence.
    pub end: usize,
}

/// The pruning sequence that ends last in `text`. When two candidates end at
/// the same index the longer one wins.
pub fn find_last_pruning_sequence(text: &str) -> Option<PruningMatch> {
    let mut best: Option<PruningMatch> = None;
    for &sequence in PRUNING_SEQUENCES {
        if let Some(idx) = text.rfind(sequence) {
            let end = idx + sequence.len();
            let better = match best {
                None => true,
                Some(b) => end > b.end || (end == b.end && sequence.len() > b.sequence.len()),
            };
            if better {
                best = Some(PruningMatch { sequence, end });
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_last_occurrence() {
        let text = "a\x1b[2Jb\x1b[?1049hc";
        let m = find_last_pruning_sequence(text).unwrap();
        assert_eq!(m.sequence, "\x1b[?1049h");
        assert_eq!(&text[m.end..], "c");
    }

    #[test]
    fn prefers_longer_sequence_at_same_end() {
        let m = find_last_pruning_sequence("x\x1b[H\x1b[2J").unwrap();
        assert_eq!(m.sequence, "\x1b[H\x1b[2J");
    }

    #[test]
    fn plain_text_has_none() {
        assert_eq!(find_last_pruning_sequence("hello \x1b[31mred"), None);
    }
}
