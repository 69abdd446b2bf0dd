//! Fatal error taxonomy for the pipeline, the wire format and the runtime.
//!
//! Recoverable conditions (a run too short to loop, stores spread over
//! several blocks, a loop candidate failing verification) never surface
//! here: the responsible pass logs them and keeps the original records.

/// Result type for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that abort compilation or execution of a layer
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Total moved elements changed across a pass
    #[error("{pass}: element count mismatch ({before} before, {after} after)")]
    ElementCountMismatch {
        pass: &'static str,
        before: u64,
        after: u64,
    },

    /// Unrolling all loop transfers does not give back the input length
    #[error("{pass}: unrolled record count {unrolled} differs from input count {input}")]
    UnrolledLengthMismatch {
        pass: &'static str,
        input: usize,
        unrolled: usize,
    },

    /// A block marker announces more records than follow it
    #[error("malformed block at segment {index}: announces {stated} records, {available} transfer records follow")]
    MalformedBlock {
        index: usize,
        stated: u32,
        available: u32,
    },

    /// A loop header is not followed by its base transfer
    #[error("loop transfer at record {index} is not followed by a base transfer")]
    LoopWithoutBase { index: usize },

    /// Unrecognized segment type byte
    #[error("unknown segment kind 0x{kind:02x} at record {index}")]
    UnknownSegmentKind { index: usize, kind: u8 },

    #[error("unknown transfer direction {0}")]
    UnknownDirection(u8),

    #[error("unknown compute opcode {0}")]
    UnknownOpcode(u8),

    #[error("unknown activation {0}")]
    UnknownActivation(u8),

    #[error("unknown layer type {0}")]
    UnknownLayerType(u8),

    /// Input ends in the middle of a record or header
    #[error("truncated input: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("bad magic word 0x{found:08x} (expected 0x{expected:08x})")]
    BadMagic { found: u32, expected: u32 },

    /// An offset in the blob header points outside the blob
    #[error("{what} offset 0x{offset:x} outside blob of {size} bytes")]
    OffsetOutOfRange {
        what: &'static str,
        offset: usize,
        size: usize,
    },

    #[error("execution list entry {entry} names layer {layer}, blob has {count} layers")]
    ExecListOutOfRange {
        entry: usize,
        layer: u32,
        count: u32,
    },

    /// Mask bits beyond the configured cluster or unit count
    #[error("segment {index}: {what} mask 0b{mask:b} exceeds {limit} configured {what}s")]
    MaskOutOfRange {
        index: usize,
        what: &'static str,
        mask: u32,
        limit: u32,
    },

    #[error("segment {index}: padding wider than the transfer ({detail})")]
    PaddingExceedsTransfer { index: usize, detail: String },

    #[error("segment {index}: 2D transfer carries {skipped} discarded trailing elements")]
    DiscardOn2d { index: usize, skipped: u8 },

    /// A field does not fit its wire representation
    #[error("{field} value {value} does not fit the wire format")]
    FieldOverflow { field: &'static str, value: i64 },

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("invalid network description: {0}")]
    Description(#[from] serde_json::Error),
}
