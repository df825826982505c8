//! Output accumulator with tail-only prompt search.
//!
//! Prompt patterns are only ever searched for in the last `search_depth`
//! bytes. Diagnostic commands can print megabytes, and scanning all of it
//! after every read would make a session quadratic in its output size.

use regex::bytes::{Match, Regex};

/// Accumulates device output and searches its tail for patterns.
#[derive(Debug)]
pub struct PatternBuffer {
    buffer: Vec<u8>,
    search_depth: usize,
}

impl PatternBuffer {
    pub fn new(search_depth: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            search_depth,
        }
    }

    /// Append data, stripping ANSI escape sequences and carriage returns.
    pub fn extend(&mut self, data: &[u8]) {
        let cleaned = strip_ansi_escapes::strip(data);
        self.buffer
            .extend(cleaned.into_iter().filter(|&b| b != b'\r' && b != 0));
    }

    /// Search the last `search_depth` bytes.
    ///
    /// Offsets in the returned match are relative to the start of the tail.
    pub fn search_tail(&self, pattern: &Regex) -> Option<Match<'_>> {
        pattern.find(self.tail())
    }

    pub fn tail_contains(&self, pattern: &Regex) -> bool {
        self.search_tail(pattern).is_some()
    }

    /// Remove the first match of `pattern` found in the tail, e.g. a pager
    /// banner, and report whether anything was removed.
    pub fn remove_from_tail(&mut self, pattern: &Regex) -> bool {
        let start = self.tail_start();
        let range = match pattern.find(&self.buffer[start..]) {
            Some(m) => (start + m.start())..(start + m.end()),
            None => return false,
        };
        self.buffer.drain(range);
        true
    }

    /// Take the contents and reset.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.buffer)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn tail_start(&self) -> usize {
        self.buffer.len().saturating_sub(self.search_depth)
    }

    fn tail(&self) -> &[u8] {
        &self.buffer[self.tail_start()..]
    }
}

impl Default for PatternBuffer {
    fn default() -> Self {
        Self::new(1000)
    }
}
