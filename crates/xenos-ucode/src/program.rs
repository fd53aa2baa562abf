//! The shader program container and stream validation.

use thiserror::Error;

use crate::instruction::{ExecCondition, ExecInstruction, Instruction};
use crate::types::{Operand, OperandSource, ResultInfo, ResultTarget, StorageAddressing};
use crate::{
    BOOL_CONSTANT_COUNT, FLOAT_CONSTANT_COUNT, LOOP_CONSTANT_COUNT, REGISTER_COUNT,
    TEXTURE_FETCH_CONSTANT_COUNT, VERTEX_FETCH_CONSTANT_COUNT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Pixel => "pixel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("register count {0} exceeds the hardware limit of 128")]
    RegisterCount(u32),
    #[error("float constant count {0} exceeds the bank size of 256")]
    FloatConstantCount(u32),
    #[error("invalid record at index {index}: {message}")]
    Record { index: usize, message: String },
}

/// A decoded shader: header fields plus the flat record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderProgram {
    pub stage: ShaderStage,
    /// General-purpose registers the shader may address, from the header.
    pub register_count: u32,
    /// Float constant bank entries the shader may address.
    pub float_constant_count: u32,
    pub instructions: Vec<Instruction>,
}

impl ShaderProgram {
    pub fn new(stage: ShaderStage, instructions: Vec<Instruction>) -> Self {
        Self {
            stage,
            register_count: 16,
            float_constant_count: 0,
            instructions,
        }
    }

    /// Jump/skip target addresses, in order of appearance.
    pub fn label_addresses(&self) -> Vec<u32> {
        self.instructions
            .iter()
            .filter_map(|instruction| match instruction {
                Instruction::Label { address } => Some(*address),
                _ => None,
            })
            .collect()
    }

    pub fn has_labels(&self) -> bool {
        self.instructions
            .iter()
            .any(|instruction| matches!(instruction, Instruction::Label { .. }))
    }

    pub fn uses_vertex_fetch(&self) -> bool {
        self.instructions
            .iter()
            .any(|instruction| matches!(instruction, Instruction::VertexFetch(_)))
    }

    pub fn uses_texture_fetch(&self) -> bool {
        self.instructions
            .iter()
            .any(|instruction| matches!(instruction, Instruction::TextureFetch(_)))
    }

    /// Checks header bounds, exec pairing, operand shapes and branch targets.
    /// Record order must already be program order; this never reorders.
    pub fn validate(&self) -> Result<(), ProgramError> {
        if self.register_count > REGISTER_COUNT {
            return Err(ProgramError::RegisterCount(self.register_count));
        }
        if self.float_constant_count > FLOAT_CONSTANT_COUNT {
            return Err(ProgramError::FloatConstantCount(self.float_constant_count));
        }

        let labels = self.label_addresses();

        // Open exec block, if any: the begin record and how many ALU/fetch
        // records were seen inside so far.
        let mut open_exec: Option<(ExecInstruction, u32)> = None;

        for (index, instruction) in self.instructions.iter().enumerate() {
            let control_flow = !matches!(
                instruction,
                Instruction::Alu(_) | Instruction::VertexFetch(_) | Instruction::TextureFetch(_)
            );
            if control_flow {
                if let Some((exec, count)) = open_exec {
                    let Instruction::ExecEnd(end) = instruction else {
                        return Err(record_error(
                            index,
                            "control-flow record inside an open exec block",
                        ));
                    };
                    if *end != exec {
                        return Err(record_error(index, "exec end does not match its begin"));
                    }
                    if count != exec.instruction_count {
                        return Err(record_error(
                            index,
                            format!(
                                "exec block holds {count} records, header says {}",
                                exec.instruction_count
                            ),
                        ));
                    }
                    open_exec = None;
                    continue;
                }
            } else {
                let Some((_, count)) = open_exec.as_mut() else {
                    return Err(record_error(index, "instruction outside an exec block"));
                };
                *count += 1;
            }

            match instruction {
                Instruction::Label { address } => {
                    if *address == 0 {
                        return Err(record_error(index, "label at the entry address"));
                    }
                    if labels.iter().filter(|a| *a == address).count() > 1 {
                        return Err(record_error(index, format!("duplicate label {address}")));
                    }
                }
                Instruction::ExecBegin(exec) => {
                    self.check_condition(index, exec.condition)?;
                    open_exec = Some((*exec, 0));
                }
                Instruction::ExecEnd(_) => {
                    return Err(record_error(index, "exec end without an open exec block"));
                }
                Instruction::LoopStart(loop_start) => {
                    if loop_start.loop_constant_index >= LOOP_CONSTANT_COUNT {
                        return Err(record_error(
                            index,
                            format!("loop constant {} out of range", loop_start.loop_constant_index),
                        ));
                    }
                    self.check_target(index, loop_start.skip_address, &labels)?;
                }
                Instruction::LoopEnd(loop_end) => {
                    if loop_end.loop_constant_index >= LOOP_CONSTANT_COUNT {
                        return Err(record_error(
                            index,
                            format!("loop constant {} out of range", loop_end.loop_constant_index),
                        ));
                    }
                    self.check_target(index, loop_end.body_address, &labels)?;
                }
                Instruction::Jump(jump) => {
                    self.check_condition(index, jump.condition)?;
                    self.check_target(index, jump.target_address, &labels)?;
                }
                Instruction::Alu(alu) => {
                    if alu.operands.len() != alu.vector_op.operand_count() as usize {
                        return Err(record_error(
                            index,
                            format!(
                                "{} takes {} operands, record carries {}",
                                alu.vector_op.name(),
                                alu.vector_op.operand_count(),
                                alu.operands.len()
                            ),
                        ));
                    }
                    for operand in &alu.operands {
                        self.check_operand(index, operand)?;
                    }
                    self.check_result(index, &alu.result)?;
                }
                Instruction::VertexFetch(fetch) => {
                    if fetch.fetch_constant_index >= VERTEX_FETCH_CONSTANT_COUNT {
                        return Err(record_error(
                            index,
                            format!("vertex fetch constant {} out of range", fetch.fetch_constant_index),
                        ));
                    }
                    self.check_operand(index, &fetch.operand)?;
                    self.check_result(index, &fetch.result)?;
                }
                Instruction::TextureFetch(fetch) => {
                    if fetch.fetch_constant_index >= TEXTURE_FETCH_CONSTANT_COUNT {
                        return Err(record_error(
                            index,
                            format!("texture fetch constant {} out of range", fetch.fetch_constant_index),
                        ));
                    }
                    self.check_operand(index, &fetch.operand)?;
                    self.check_result(index, &fetch.result)?;
                }
            }
        }

        if open_exec.is_some() {
            return Err(record_error(
                self.instructions.len(),
                "exec block still open at the end of the stream",
            ));
        }
        Ok(())
    }

    fn check_condition(&self, index: usize, condition: ExecCondition) -> Result<(), ProgramError> {
        if let ExecCondition::Bool { index: bool_index, .. } = condition {
            if bool_index >= BOOL_CONSTANT_COUNT {
                return Err(record_error(
                    index,
                    format!("bool constant {bool_index} out of range"),
                ));
            }
        }
        Ok(())
    }

    fn check_target(&self, index: usize, address: u32, labels: &[u32]) -> Result<(), ProgramError> {
        // Address 0 is the implicit entry, always reachable.
        if address != 0 && !labels.contains(&address) {
            return Err(record_error(index, format!("no label at address {address}")));
        }
        Ok(())
    }

    fn check_operand(&self, index: usize, operand: &Operand) -> Result<(), ProgramError> {
        let bound = match operand.source {
            OperandSource::Register => self.register_count,
            OperandSource::FloatConstant => self.float_constant_count,
            OperandSource::VertexFetchConstant | OperandSource::TextureFetchConstant => {
                return Err(record_error(
                    index,
                    format!("{} used as a data operand", operand.source.name()),
                ));
            }
        };
        // Relative addressing is resolved at run time; only static indices
        // can be checked here.
        if operand.addressing == StorageAddressing::Static && operand.index >= bound {
            return Err(record_error(
                index,
                format!("{} index {} out of range", operand.source.name(), operand.index),
            ));
        }
        Ok(())
    }

    fn check_result(&self, index: usize, result: &ResultInfo) -> Result<(), ProgramError> {
        let bound = match result.target {
            ResultTarget::Register => self.register_count,
            ResultTarget::Interpolator => 16,
            ResultTarget::Color => 4,
            _ => return Ok(()),
        };
        if result.addressing == StorageAddressing::Static && result.index >= bound {
            return Err(record_error(
                index,
                format!("result index {} out of range", result.index),
            ));
        }
        Ok(())
    }
}

fn record_error(index: usize, message: impl Into<String>) -> ProgramError {
    ProgramError::Record {
        index,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{
        AluInstruction, AluVectorOp, ExecCondition, JumpInstruction, VertexFetchAttributes,
        VertexFetchInstruction,
    };
    use crate::types::{Operand, ResultInfo};
    use crate::VertexFormat;
    use pretty_assertions::assert_eq;

    fn exec(instruction_count: u32) -> ExecInstruction {
        ExecInstruction {
            condition: ExecCondition::Unconditional,
            instruction_count,
            ends_shader: false,
        }
    }

    fn mov(source: u32, dest: u32) -> Instruction {
        Instruction::Alu(AluInstruction::new(
            AluVectorOp::Max,
            vec![Operand::register(source), Operand::register(source)],
            ResultInfo::register(dest),
        ))
    }

    #[test]
    fn accepts_a_simple_stream() {
        let program = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![
                Instruction::ExecBegin(exec(2)),
                mov(0, 1),
                mov(1, 2),
                Instruction::ExecEnd(exec(2)),
            ],
        );
        assert_eq!(program.validate(), Ok(()));
        assert!(!program.has_labels());
        assert!(!program.uses_vertex_fetch());
    }

    #[test]
    fn rejects_instructions_outside_exec() {
        let program = ShaderProgram::new(ShaderStage::Vertex, vec![mov(0, 1)]);
        assert!(matches!(
            program.validate(),
            Err(ProgramError::Record { index: 0, .. })
        ));
    }

    #[test]
    fn rejects_mismatched_exec_count() {
        let program = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![
                Instruction::ExecBegin(exec(2)),
                mov(0, 1),
                Instruction::ExecEnd(exec(2)),
            ],
        );
        assert!(matches!(
            program.validate(),
            Err(ProgramError::Record { index: 2, .. })
        ));
    }

    #[test]
    fn rejects_unterminated_exec() {
        let program = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![Instruction::ExecBegin(exec(0))],
        );
        assert!(program.validate().is_err());
    }

    #[test]
    fn rejects_jump_to_missing_label() {
        let program = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![Instruction::Jump(JumpInstruction {
                target_address: 7,
                condition: ExecCondition::Unconditional,
            })],
        );
        assert!(program.validate().is_err());

        let with_label = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![
                Instruction::Jump(JumpInstruction {
                    target_address: 7,
                    condition: ExecCondition::Unconditional,
                }),
                Instruction::Label { address: 7 },
            ],
        );
        assert_eq!(with_label.validate(), Ok(()));
        assert_eq!(with_label.label_addresses(), vec![7]);
    }

    #[test]
    fn rejects_wrong_operand_arity() {
        let program = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![
                Instruction::ExecBegin(exec(1)),
                Instruction::Alu(AluInstruction::new(
                    AluVectorOp::Mad,
                    vec![Operand::register(0), Operand::register(1)],
                    ResultInfo::register(2),
                )),
                Instruction::ExecEnd(exec(1)),
            ],
        );
        assert!(matches!(
            program.validate(),
            Err(ProgramError::Record { index: 1, .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_float_constant() {
        let mut program = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![
                Instruction::ExecBegin(exec(1)),
                Instruction::Alu(AluInstruction::new(
                    AluVectorOp::Max,
                    vec![Operand::float_constant(4), Operand::float_constant(4)],
                    ResultInfo::register(0),
                )),
                Instruction::ExecEnd(exec(1)),
            ],
        );
        program.float_constant_count = 4;
        assert!(program.validate().is_err());
        program.float_constant_count = 5;
        assert_eq!(program.validate(), Ok(()));
    }

    #[test]
    fn finds_vertex_fetch_usage() {
        let fetch = Instruction::VertexFetch(VertexFetchInstruction {
            operand: Operand::register(0),
            fetch_constant_index: 95,
            attributes: VertexFetchAttributes::new(VertexFormat::Float32x4),
            is_predicated: false,
            predicate_condition: false,
            result: ResultInfo::register(1),
        });
        let program = ShaderProgram::new(
            ShaderStage::Vertex,
            vec![
                Instruction::ExecBegin(exec(1)),
                fetch,
                Instruction::ExecEnd(exec(1)),
            ],
        );
        assert_eq!(program.validate(), Ok(()));
        assert!(program.uses_vertex_fetch());
        assert!(!program.uses_texture_fetch());
    }
}
