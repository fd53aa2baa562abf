//! Decoded Xenos (Xbox 360 GPU) shader microcode: instruction records,
//! operand/result descriptors, vertex data formats and fetch constants.
//!
//! This crate is the data model shared between a microcode disassembler
//! (which produces these records) and the SPIR-V translation engine
//! (which consumes them). It performs no IR work itself.

pub mod fetch_constant;
pub mod format;
pub mod instruction;
pub mod program;
pub mod types;

pub use fetch_constant::{FetchConstantType, VertexFetchConstant};
pub use format::{Endian, FormatFamily, PackedComponent, SignedRepeatingFractionMode, VertexFormat};
pub use instruction::{
    AluInstruction, AluVectorOp, ExecCondition, ExecInstruction, Instruction, JumpInstruction,
    LoopEndInstruction, LoopStartInstruction, TextureFetchInstruction, VertexFetchAttributes,
    VertexFetchInstruction,
};
pub use program::{ProgramError, ShaderProgram, ShaderStage};
pub use types::{
    Comp, Operand, OperandSource, ResultComponent, ResultInfo, ResultTarget, StorageAddressing,
    Swizzle, WriteMask,
};

/// Bool constants available to `cexec`-style conditions (8 hardware words).
pub const BOOL_CONSTANT_COUNT: u32 = 256;
/// Loop constants available to `loop`/`endloop` (32 packed words).
pub const LOOP_CONSTANT_COUNT: u32 = 32;
/// Vertex fetch constant slots (each a pair of 32-bit words).
pub const VERTEX_FETCH_CONSTANT_COUNT: u32 = 96;
/// Texture fetch constant slots (each six 32-bit words).
pub const TEXTURE_FETCH_CONSTANT_COUNT: u32 = 32;
/// Float constant bank size per shader stage.
pub const FLOAT_CONSTANT_COUNT: u32 = 256;
/// General-purpose register file size.
pub const REGISTER_COUNT: u32 = 128;
