use std::ops::Range;

/// Byte range inside a configuration or description source text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Span carrying no location (errors not tied to a source line).
    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn is_dummy(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    /// Span covering `len` bytes at `offset`.
    pub fn at(offset: usize, len: usize) -> Self {
        Self {
            start: offset as u32,
            end: (offset + len) as u32,
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}
