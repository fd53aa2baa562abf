//! Decoded instruction records, as produced by an external disassembler.
//!
//! Records are immutable once built. A shader is a flat sequence of them in
//! program order; the control-flow words (`exec`, loops, jumps) carry the
//! structure the hardware sequencer would have driven.

use crate::format::{SignedRepeatingFractionMode, VertexFormat};
use crate::types::{Operand, ResultInfo};

/// Condition guarding an exec block or jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecCondition {
    Unconditional,
    /// Test of one bit of the packed 256-bit bool constant field.
    Bool { index: u32, value: bool },
    /// Test of the running predicate register.
    Predicate { value: bool },
}

impl ExecCondition {
    pub fn is_conditional(self) -> bool {
        self != Self::Unconditional
    }
}

/// One `exec`/`exece` control-flow word.
///
/// The same record is delivered twice: once before the instructions it
/// guards (`Instruction::ExecBegin`) and once after them (`ExecEnd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecInstruction {
    pub condition: ExecCondition,
    /// Number of ALU/fetch records inside the block.
    pub instruction_count: u32,
    /// `exece`: the shader ends once this block completes.
    pub ends_shader: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopStartInstruction {
    pub loop_constant_index: u32,
    /// `rep`-style loop keeping the enclosing loop index instead of
    /// initializing a new one.
    pub is_repeat: bool,
    /// Label reached (through the dispatch loop) when the trip count is zero.
    pub skip_address: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopEndInstruction {
    pub loop_constant_index: u32,
    pub is_predicated_break: bool,
    /// Predicate value that breaks the loop when `is_predicated_break`.
    pub predicate_condition: bool,
    /// Label of the first instruction of the loop body.
    pub body_address: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpInstruction {
    pub target_address: u32,
    pub condition: ExecCondition,
}

/// Format attributes of a vertex fetch, straight from the instruction words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexFetchAttributes {
    pub data_format: VertexFormat,
    /// Signed offset in words from the start of the fetched element.
    pub offset: i32,
    /// Element stride in words; zero addresses relative to the buffer base
    /// only, without consuming the index operand.
    pub stride: u32,
    /// The decoded value is scaled by `2^exp_adjust`.
    pub exp_adjust: i32,
    /// Round the index to nearest (half away from zero) instead of flooring.
    pub is_index_rounded: bool,
    pub is_signed: bool,
    /// Keep converted integers as they are, skipping normalization.
    pub is_integer: bool,
    pub signed_rf_mode: SignedRepeatingFractionMode,
}

impl VertexFetchAttributes {
    pub fn new(data_format: VertexFormat) -> Self {
        Self {
            data_format,
            offset: 0,
            stride: 0,
            exp_adjust: 0,
            is_index_rounded: false,
            is_signed: false,
            is_integer: false,
            signed_rf_mode: SignedRepeatingFractionMode::ZeroClampMinusOne,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexFetchInstruction {
    /// Source of the vertex index (X lane after swizzling).
    pub operand: Operand,
    /// Vertex fetch constant slot, 0..96.
    pub fetch_constant_index: u32,
    pub attributes: VertexFetchAttributes,
    pub is_predicated: bool,
    pub predicate_condition: bool,
    pub result: ResultInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFetchInstruction {
    pub operand: Operand,
    /// Texture fetch constant slot, 0..32.
    pub fetch_constant_index: u32,
    pub is_predicated: bool,
    pub predicate_condition: bool,
    pub result: ResultInfo,
}

/// Vector ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluVectorOp {
    Add,
    Mul,
    Max,
    Min,
    Seq,
    Sgt,
    Sge,
    Sne,
    Frc,
    Trunc,
    Floor,
    Mad,
    CndEq,
    CndGe,
    CndGt,
    Dp4,
    Dp3,
    Dp2Add,
    SetpEqPush,
    SetpNePush,
    SetpGtPush,
    SetpGePush,
    KillEq,
    KillGt,
    KillGe,
    KillNe,
    MaxA,
}

impl AluVectorOp {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Add),
            1 => Some(Self::Mul),
            2 => Some(Self::Max),
            3 => Some(Self::Min),
            4 => Some(Self::Seq),
            5 => Some(Self::Sgt),
            6 => Some(Self::Sge),
            7 => Some(Self::Sne),
            8 => Some(Self::Frc),
            9 => Some(Self::Trunc),
            10 => Some(Self::Floor),
            11 => Some(Self::Mad),
            12 => Some(Self::CndEq),
            13 => Some(Self::CndGe),
            14 => Some(Self::CndGt),
            15 => Some(Self::Dp4),
            16 => Some(Self::Dp3),
            17 => Some(Self::Dp2Add),
            20 => Some(Self::SetpEqPush),
            21 => Some(Self::SetpNePush),
            22 => Some(Self::SetpGtPush),
            23 => Some(Self::SetpGePush),
            24 => Some(Self::KillEq),
            25 => Some(Self::KillGt),
            26 => Some(Self::KillGe),
            27 => Some(Self::KillNe),
            29 => Some(Self::MaxA),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        #[deny(unreachable_patterns)]
        match self {
            Self::Add => 0,
            Self::Mul => 1,
            Self::Max => 2,
            Self::Min => 3,
            Self::Seq => 4,
            Self::Sgt => 5,
            Self::Sge => 6,
            Self::Sne => 7,
            Self::Frc => 8,
            Self::Trunc => 9,
            Self::Floor => 10,
            Self::Mad => 11,
            Self::CndEq => 12,
            Self::CndGe => 13,
            Self::CndGt => 14,
            Self::Dp4 => 15,
            Self::Dp3 => 16,
            Self::Dp2Add => 17,
            Self::SetpEqPush => 20,
            Self::SetpNePush => 21,
            Self::SetpGtPush => 22,
            Self::SetpGePush => 23,
            Self::KillEq => 24,
            Self::KillGt => 25,
            Self::KillGe => 26,
            Self::KillNe => 27,
            Self::MaxA => 29,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Mul => "mul",
            Self::Max => "max",
            Self::Min => "min",
            Self::Seq => "seq",
            Self::Sgt => "sgt",
            Self::Sge => "sge",
            Self::Sne => "sne",
            Self::Frc => "frc",
            Self::Trunc => "trunc",
            Self::Floor => "floor",
            Self::Mad => "mad",
            Self::CndEq => "cndeq",
            Self::CndGe => "cndge",
            Self::CndGt => "cndgt",
            Self::Dp4 => "dp4",
            Self::Dp3 => "dp3",
            Self::Dp2Add => "dp2add",
            Self::SetpEqPush => "setp_eq_push",
            Self::SetpNePush => "setp_ne_push",
            Self::SetpGtPush => "setp_gt_push",
            Self::SetpGePush => "setp_ge_push",
            Self::KillEq => "kill_eq",
            Self::KillGt => "kill_gt",
            Self::KillGe => "kill_ge",
            Self::KillNe => "kill_ne",
            Self::MaxA => "maxa",
        }
    }

    pub fn operand_count(self) -> u32 {
        match self {
            Self::Frc | Self::Trunc | Self::Floor => 1,
            Self::Mad | Self::CndEq | Self::CndGe | Self::CndGt | Self::Dp2Add => 3,
            _ => 2,
        }
    }

    /// Whether the operation does something besides producing its result
    /// (predicate or address register store, fragment discard). These must
    /// run even under an all-zero write mask.
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Self::SetpEqPush
                | Self::SetpNePush
                | Self::SetpGtPush
                | Self::SetpGePush
                | Self::KillEq
                | Self::KillGt
                | Self::KillGe
                | Self::KillNe
                | Self::MaxA
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AluInstruction {
    pub vector_op: AluVectorOp,
    /// `vector_op.operand_count()` entries.
    pub operands: Vec<Operand>,
    pub is_predicated: bool,
    pub predicate_condition: bool,
    pub result: ResultInfo,
}

impl AluInstruction {
    pub fn new(vector_op: AluVectorOp, operands: Vec<Operand>, result: ResultInfo) -> Self {
        Self {
            vector_op,
            operands,
            is_predicated: false,
            predicate_condition: false,
            result,
        }
    }
}

/// One record of the decoded instruction stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Jump/skip target. Address 0 is the implicit entry point and is
    /// never a label.
    Label { address: u32 },
    ExecBegin(ExecInstruction),
    ExecEnd(ExecInstruction),
    LoopStart(LoopStartInstruction),
    LoopEnd(LoopEndInstruction),
    Jump(JumpInstruction),
    Alu(AluInstruction),
    VertexFetch(VertexFetchInstruction),
    TextureFetch(TextureFetchInstruction),
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn alu_op_roundtrip() {
        for raw in 0..32 {
            let Some(op) = AluVectorOp::from_raw(raw) else {
                // cube, max4 and dst are not carried.
                assert!(matches!(raw, 18 | 19 | 28 | 30 | 31), "raw {raw}");
                continue;
            };
            assert_eq!(op.raw(), raw);
            assert!(op.operand_count() >= 1 && op.operand_count() <= 3);
        }
    }

    #[test]
    fn side_effect_ops_are_the_non_pure_ones() {
        assert!(AluVectorOp::MaxA.has_side_effects());
        assert!(AluVectorOp::SetpGePush.has_side_effects());
        assert!(AluVectorOp::KillNe.has_side_effects());
        assert!(!AluVectorOp::Mad.has_side_effects());
        assert!(!AluVectorOp::Dp4.has_side_effects());
    }

    #[test]
    fn exec_condition_identity() {
        let a = ExecCondition::Bool {
            index: 9,
            value: true,
        };
        assert_eq!(
            a,
            ExecCondition::Bool {
                index: 9,
                value: true
            }
        );
        assert_ne!(
            a,
            ExecCondition::Bool {
                index: 9,
                value: false
            }
        );
        assert_ne!(a, ExecCondition::Predicate { value: true });
        assert!(!ExecCondition::Unconditional.is_conditional());
        assert!(a.is_conditional());
    }
}
