use thiserror::Error;

/// Errors surfaced while lowering a decoded program to SPIR-V.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The record stream asks for something the lowering has no mapping
    /// for, e.g. a fetch constant used as an arithmetic operand or a
    /// register access in a program declaring an empty register file.
    #[error("record {record}: unsupported {what}")]
    Unsupported { record: usize, what: String },

    /// The module builder refused an instruction. The translator keeps
    /// the builder cursor on an open basic block whenever it emits, so
    /// this indicates broken block bookkeeping rather than bad input.
    #[error("SPIR-V module construction failed: {0}")]
    Module(#[from] rspirv::dr::Error),
}
