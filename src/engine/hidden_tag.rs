//! Hidden-tag filtering.
//!
//! A user-configured tag pair (e.g. `<think>...</think>`) wraps model
//! reasoning that must not be shown. Two forms:
//!
//! - [`split_hidden`]: the authoritative batch filter applied to final
//!   text at reconciliation. Runs to a fixpoint, so filtering its own
//!   output is a no-op.
//! - [`HiddenTagStream`]: an incremental outside-tag/inside-tag state
//!   machine fed one delta at a time for the live view. It holds back a
//!   potential partial tag at the chunk boundary instead of re-scanning
//!   the accumulated text on every delta.

/// Split `text` into (visible, hidden) for the configured tag name.
///
/// Complete `<tag>...</tag>` spans are removed from the visible text and
/// collected into the hidden text; a trailing unterminated `<tag>`
/// truncates the visible text at its start offset. An empty tag disables
/// filtering.
pub fn split_hidden(tag: &str, text: &str) -> (String, String) {
    if tag.is_empty() {
        return (text.to_owned(), String::new());
    }
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let mut visible = text.to_owned();
    let mut hidden = String::new();
    // Removing a span can juxtapose characters that spell a new open tag;
    // iterate to a fixpoint so the filter is idempotent on its output.
    loop {
        let (next, extracted, changed) = strip_pass(&visible, &open, &close);
        hidden.push_str(&extracted);
        if !changed {
            break;
        }
        visible = next;
    }
    (visible, hidden)
}

/// The visible half of [`split_hidden`].
pub fn strip_hidden(tag: &str, text: &str) -> String {
    split_hidden(tag, text).0
}

/// One left-to-right pass removing every tag span.
fn strip_pass(text: &str, open: &str, close: &str) -> (String, String, bool) {
    let mut visible = String::with_capacity(text.len());
    let mut hidden = String::new();
    let mut rest = text;
    let mut changed = false;

    while let Some(start) = rest.find(open) {
        changed = true;
        visible.push_str(&rest[..start]);
        let after_open = &rest[start + open.len()..];
        match after_open.find(close) {
            Some(end) => {
                hidden.push_str(&after_open[..end]);
                rest = &after_open[end + close.len()..];
            }
            None => {
                // Unterminated: everything from the open tag is hidden.
                hidden.push_str(after_open);
                rest = "";
                break;
            }
        }
    }
    visible.push_str(rest);
    (visible, hidden, changed)
}

/// Incremental hidden-tag filter for the live stream view.
#[derive(Debug)]
pub struct HiddenTagStream {
    open: String,
    close: String,
    enabled: bool,
    inside: bool,
    /// Unresolved tail: a possible partial tag at the chunk boundary.
    carry: String,
    visible: String,
    hidden: String,
}

impl HiddenTagStream {
    /// `None` (or an empty name) disables filtering.
    pub fn new(tag: Option<&str>) -> Self {
        let tag = tag.unwrap_or("");
        Self {
            open: format!("<{tag}>"),
            close: format!("</{tag}>"),
            enabled: !tag.is_empty(),
            inside: false,
            carry: String::new(),
            visible: String::new(),
            hidden: String::new(),
        }
    }

    /// Feed one delta.
    pub fn push(&mut self, delta: &str) {
        if !self.enabled {
            self.visible.push_str(delta);
            return;
        }
        self.carry.push_str(delta);

        loop {
            if self.inside {
                match self.carry.find(&self.close) {
                    Some(end) => {
                        self.hidden.push_str(&self.carry[..end]);
                        self.carry.drain(..end + self.close.len());
                        self.inside = false;
                    }
                    None => {
                        // Keep only a possible partial close tag; the rest
                        // is definitively hidden.
                        let keep = partial_match_len(&self.carry, &self.close);
                        let cut = self.carry.len() - keep;
                        self.hidden.push_str(&self.carry[..cut]);
                        self.carry.drain(..cut);
                        return;
                    }
                }
            } else {
                match self.carry.find(&self.open) {
                    Some(start) => {
                        self.visible.push_str(&self.carry[..start]);
                        self.carry.drain(..start + self.open.len());
                        self.inside = true;
                    }
                    None => {
                        let keep = partial_match_len(&self.carry, &self.open);
                        let cut = self.carry.len() - keep;
                        self.visible.push_str(&self.carry[..cut]);
                        self.carry.drain(..cut);
                        return;
                    }
                }
            }
        }
    }

    /// Text safe to show so far. A withheld partial tag at the boundary
    /// is not included until it resolves.
    pub fn visible(&self) -> &str {
        &self.visible
    }

    /// Hidden (reasoning) text collected so far.
    pub fn hidden(&self) -> &str {
        &self.hidden
    }

    /// Whether the cursor is currently inside a tag span.
    pub fn inside_tag(&self) -> bool {
        self.inside
    }
}

/// Byte length of the longest suffix of `haystack` that is a proper
/// prefix of `needle`. `find` already ruled out a full occurrence.
fn partial_match_len(haystack: &str, needle: &str) -> usize {
    let boundaries: Vec<usize> = needle
        .char_indices()
        .map(|(i, _)| i)
        .skip(1)
        .chain(std::iter::once(needle.len()))
        .collect();
    for &len in boundaries.iter().rev() {
        if len >= needle.len() {
            continue; // full needle handled by find
        }
        if len <= haystack.len() && haystack.ends_with(&needle[..len]) {
            return len;
        }
    }
    0
}
