//! Incremental Segmenter
//!
//! Partitions a streamed reply into prose and fenced-code segments while the
//! reply is still arriving.
//!
//! # Why the whole buffer
//!
//! A fence token can straddle two chunks (`"```p"` + `"y\n"`), so scanning
//! chunk by chunk would misclassify it. [`Segmenter::update`] therefore takes
//! the full accumulated buffer on every call and re-scans only the suffix
//! that has not been finalized yet.
//!
//! # Grammar
//!
//! - fence-open: three backticks, an optional tag of `[A-Za-z0-9_+#.-]`,
//!   an optional `\r`, then `\n`
//! - fence-close: the first three backticks inside a code segment; a single
//!   `\n` directly after them belongs to the closer
//!
//! A segment is finalized only once no future input can change it. Everything
//! after the last finalized segment is reported as a provisional tail.

use serde::{Deserialize, Serialize};

const FENCE: &str = "```";

/// Language reported for code segments without a tag
pub const DEFAULT_LANGUAGE: &str = "plaintext";

/// Kind of a segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Ordinary reply text
    Prose,
    /// Fenced code block
    Code,
}

/// A classified span of reply text
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Prose or code
    pub kind: SegmentKind,
    /// Fence tag for code (`"plaintext"` when absent), `None` for prose
    pub language: Option<String>,
    /// Text between the delimiters
    pub content: String,
    /// `false` while more input may still extend or close this segment
    pub closed: bool,
    /// Raw opening delimiter (empty for prose)
    pub opener: String,
    /// Raw closing delimiter (empty for prose and unterminated code)
    pub closer: String,
}

impl Segment {
    fn prose(content: &str, closed: bool) -> Self {
        Self {
            kind: SegmentKind::Prose,
            language: None,
            content: content.to_string(),
            closed,
            opener: String::new(),
            closer: String::new(),
        }
    }

    fn code(opener: &str, tag: &str, content: &str, closer: &str, closed: bool) -> Self {
        let language = if tag.is_empty() { DEFAULT_LANGUAGE } else { tag };
        Self {
            kind: SegmentKind::Code,
            language: Some(language.to_string()),
            content: content.to_string(),
            closed,
            opener: opener.to_string(),
            closer: closer.to_string(),
        }
    }

    /// The exact raw text this segment was cut from
    #[must_use]
    pub fn raw(&self) -> String {
        let mut raw =
            String::with_capacity(self.opener.len() + self.content.len() + self.closer.len());
        raw.push_str(&self.opener);
        raw.push_str(&self.content);
        raw.push_str(&self.closer);
        raw
    }
}

/// Result of one incremental pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentUpdate {
    /// Segments that became final during this call, in order
    pub finalized: Vec<Segment>,
    /// Provisional tail, replaced wholesale on the next call
    pub pending: Option<Segment>,
}

/// Stateful incremental segmenter for one reply
#[derive(Clone, Debug, Default)]
pub struct Segmenter {
    /// Byte offset up to which the buffer is covered by finalized segments
    offset: usize,
    /// Byte offset before which the unresolved prose holds no fence candidate
    searched: usize,
    /// Number of segments finalized so far
    finalized: usize,
}

impl Segmenter {
    /// Create a segmenter for a new reply
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of segments finalized so far
    #[must_use]
    pub fn finalized_count(&self) -> usize {
        self.finalized
    }

    /// Re-scan the unresolved suffix of `buffer`
    ///
    /// `buffer` must be the full reply received so far; every call must pass
    /// an extension of the previous buffer.
    pub fn update(&mut self, buffer: &str) -> SegmentUpdate {
        let scan = scan(self.unresolved(buffer), self.search_from(), false);
        self.advance(&scan);
        SegmentUpdate {
            finalized: scan.finalized,
            pending: scan.pending,
        }
    }

    /// Force-close everything that remains at end of stream
    ///
    /// An unterminated fence is closed at end of text; an incomplete fence
    /// candidate is treated as prose.
    pub fn finish(&mut self, buffer: &str) -> Vec<Segment> {
        let scan = scan(self.unresolved(buffer), self.search_from(), true);
        self.advance(&scan);
        scan.finalized
    }

    fn unresolved<'a>(&self, buffer: &'a str) -> &'a str {
        debug_assert!(
            buffer.len() >= self.offset,
            "segmenter buffer shrank between calls"
        );
        buffer.get(self.offset..).unwrap_or_default()
    }

    fn search_from(&self) -> usize {
        self.searched.saturating_sub(self.offset)
    }

    fn advance(&mut self, scan: &Scan) {
        self.searched = self.offset + scan.searched;
        self.offset += scan.consumed;
        self.finalized += scan.finalized.len();
    }
}

/// Segment a complete text in one pass
#[must_use]
pub fn segment(text: &str) -> Vec<Segment> {
    Segmenter::new().finish(text)
}

struct Scan {
    finalized: Vec<Segment>,
    pending: Option<Segment>,
    consumed: usize,
    /// Where the next fence search may start (never before `consumed`)
    searched: usize,
}

enum FenceSearch<'a> {
    /// Complete opener at `start`; code body begins at `body`
    Found {
        start: usize,
        tag: &'a str,
        body: usize,
    },
    /// Candidate opener at `start` runs into the end of the buffer
    Undecided { start: usize },
    NotFound,
}

fn is_tag_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'+' | b'#' | b'.' | b'-')
}

fn find_fence_open(text: &str, from: usize, at_end: bool) -> FenceSearch<'_> {
    let bytes = text.as_bytes();
    let mut search = from;

    while let Some(rel) = text[search..].find(FENCE) {
        let start = search + rel;
        let tag_start = start + FENCE.len();
        let mut i = tag_start;
        while i < bytes.len() && is_tag_byte(bytes[i]) {
            i += 1;
        }
        let tag_end = i;
        if i < bytes.len() && bytes[i] == b'\r' {
            i += 1;
        }

        if i >= bytes.len() {
            // Tag chars (and maybe `\r`) run to the end: more input decides
            return if at_end {
                FenceSearch::NotFound
            } else {
                FenceSearch::Undecided { start }
            };
        }

        if bytes[i] == b'\n' {
            return FenceSearch::Found {
                start,
                tag: &text[tag_start..tag_end],
                body: i + 1,
            };
        }

        search = start + 1;
    }

    FenceSearch::NotFound
}

/// Drop up to two trailing backticks that may be the start of a fence
fn provisional(text: &str) -> &str {
    let trimmed = text.trim_end_matches('`');
    if text.len() - trimmed.len() <= 2 {
        trimmed
    } else {
        text
    }
}

/// Scan `text`, which holds no fence candidate before `search_from`
fn scan(text: &str, search_from: usize, at_end: bool) -> Scan {
    let mut finalized = Vec::new();
    let mut pos = 0;
    let mut from = search_from.min(text.len());

    loop {
        match find_fence_open(text, from, at_end) {
            FenceSearch::Found { start, tag, body } => {
                if start > pos {
                    finalized.push(Segment::prose(&text[pos..start], true));
                }

                let opener = &text[start..body];
                match text[body..].find(FENCE).map(|rel| body + rel) {
                    Some(close) => {
                        let mut close_end = close + FENCE.len();
                        if close_end == text.len() && !at_end {
                            // Closed, but whether a newline follows is unknown
                            let pending =
                                Segment::code(opener, tag, &text[body..close], FENCE, true);
                            return Scan {
                                finalized,
                                pending: Some(pending),
                                consumed: start,
                                searched: start,
                            };
                        }
                        if text[close_end..].starts_with('\n') {
                            close_end += 1;
                        }
                        finalized.push(Segment::code(
                            opener,
                            tag,
                            &text[body..close],
                            &text[close..close_end],
                            true,
                        ));
                        pos = close_end;
                        from = close_end;
                    }
                    None if at_end => {
                        finalized.push(Segment::code(opener, tag, &text[body..], "", true));
                        return Scan {
                            finalized,
                            pending: None,
                            consumed: text.len(),
                            searched: text.len(),
                        };
                    }
                    None => {
                        let pending =
                            Segment::code(opener, tag, provisional(&text[body..]), "", false);
                        return Scan {
                            finalized,
                            pending: Some(pending),
                            consumed: start,
                            searched: start,
                        };
                    }
                }
            }
            FenceSearch::Undecided { start } => {
                let pending = (start > pos).then(|| Segment::prose(&text[pos..start], false));
                return Scan {
                    finalized,
                    pending,
                    consumed: pos,
                    searched: start,
                };
            }
            FenceSearch::NotFound => {
                if at_end {
                    if pos < text.len() {
                        finalized.push(Segment::prose(&text[pos..], true));
                    }
                    return Scan {
                        finalized,
                        pending: None,
                        consumed: text.len(),
                        searched: text.len(),
                    };
                }

                // Only trailing backticks can still grow into a fence
                let tail = provisional(&text[pos..]);
                let pending = (!tail.is_empty()).then(|| Segment::prose(tail, false));
                return Scan {
                    finalized,
                    pending,
                    consumed: pos,
                    searched: pos + tail.len(),
                };
            }
        }
    }
}
