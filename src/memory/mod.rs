//! Conversation memory for oracle calls.

pub mod compressor;

pub use compressor::{
    CompressionOutcome, CompressorConfig, ContextCompressor, ConversationMemory, Turn,
    PREVIOUS_CONTEXT_HEADER,
};
