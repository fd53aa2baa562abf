//! Record-stream driver: module skeleton, the outer dispatch loop and
//! the flow-control records.
//!
//! The whole program body lives inside a single SPIR-V loop. When the
//! program declares labels, the loop body opens with a switch over a
//! program-counter phi and every jump becomes "set the next program
//! counter, branch to the loop continue" - control transfers stay
//! reducible no matter how the guest branched. Without labels the loop
//! only exists so the final exec can break out of it.

use rspirv::binary::Assemble;
use rspirv::dr::Operand;
use rspirv::spirv::{
    BuiltIn, Capability, Decoration, ExecutionMode, ExecutionModel, LoopControl, SelectionControl,
    StorageClass, Word,
};
use tracing::debug;
use xenos_ucode::{
    ExecCondition, ExecInstruction, Instruction, JumpInstruction, LoopEndInstruction,
    LoopStartInstruction, ShaderProgram, ShaderStage,
};

use crate::builder::ModuleBuilder;
use crate::error::TranslateError;
use crate::{DescriptorSet, Features, VertexMode};

/// Vertex output block member indices (`gl_PerVertex` layout).
pub(crate) const PER_VERTEX_POSITION: u32 = 0;
pub(crate) const PER_VERTEX_POINT_SIZE: u32 = 1;

/// Identity of the condition guarding an open exec-level conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecConditionalSource {
    BoolConstant(u32),
    Predicate,
}

/// An exec-level conditional whose merge block is still pending.
struct ExecConditional {
    merge_block: Word,
    source: ExecConditionalSource,
    value: bool,
}

/// Translates `program` for a device with `features`, running a
/// vertex-stage program as a plain vertex shader.
pub fn translate(program: &ShaderProgram, features: Features) -> Result<Vec<u32>, TranslateError> {
    Translator::new(program, features, VertexMode::Vertex).translate()
}

/// Single-use lowering of one [`ShaderProgram`] to a SPIR-V module.
pub struct Translator<'a> {
    pub(crate) program: &'a ShaderProgram,
    pub(crate) features: Features,
    vertex_mode: VertexMode,
    pub(crate) mb: ModuleBuilder,

    /// Index of the record being lowered, for diagnostics.
    pub(crate) record_index: usize,
    has_labels: bool,

    // Module-scope resources. The fetch constants and the shared
    // memory buffer are declared on first use by the fetch lowering.
    pub(crate) uniform_float_constants: Option<Word>,
    pub(crate) uniform_bool_loop_constants: Word,
    pub(crate) uniform_fetch_constants: Option<Word>,
    pub(crate) buffer_shared_memory: Option<Word>,

    input_vertex_index: Option<Word>,
    input_primitive_id: Option<Word>,
    pub(crate) output_per_vertex: Option<Word>,

    // Function-local state, filled by `start_translation`.
    pub(crate) var_predicate: Word,
    pub(crate) var_loop_count: Word,
    pub(crate) var_address_absolute: Word,
    pub(crate) var_address_relative: Word,
    pub(crate) var_registers: Option<Word>,
    pub(crate) var_point_size_edge_flag_kill_vertex: Option<Word>,

    function_main: Word,
    main_loop_header: Word,
    main_loop_continue: Word,
    main_loop_merge: Word,
    /// Block index of the switch header, so the switch can be inserted
    /// once every case is known.
    main_switch_header_block: Option<usize>,
    main_switch_merge: Option<Word>,
    /// Forward-declared result id of the next-iteration program
    /// counter, referenced by the header phi before it is defined.
    main_loop_pc_next: Word,
    main_loop_pc_current: Word,
    /// Switch cases as (label address, first block of the case).
    main_switch_cases: Vec<(u32, Word)>,
    /// (program counter value, predecessor block) pairs feeding the
    /// next-iteration phi in the loop continue block.
    main_next_pc_phi_operands: Vec<(Word, Word)>,

    cf_exec_conditional: Option<ExecConditional>,
    /// Set when the current exec wrote the predicate register, which
    /// forbids merging later predicated execs into its conditional.
    pub(crate) cf_exec_predicate_written: bool,
    cf_instruction_predicate_merge: Option<Word>,
    cf_instruction_predicate_condition: bool,

    /// Reusable id lists, taken with `mem::take` while filling.
    /// `scratch_ids` belongs to the instruction handler driving the
    /// record; helpers that build a list of their own while it is
    /// checked out use `scratch_ids_inner`, never both for one list.
    pub(crate) scratch_ids: Vec<Word>,
    pub(crate) scratch_ids_inner: Vec<Word>,
}

impl<'a> Translator<'a> {
    pub fn new(program: &'a ShaderProgram, features: Features, vertex_mode: VertexMode) -> Self {
        let is_tessellation =
            program.stage == ShaderStage::Vertex && vertex_mode == VertexMode::TessellationEvaluation;
        let capability = if is_tessellation {
            Capability::Tessellation
        } else {
            Capability::Shader
        };
        let mb = ModuleBuilder::new(
            capability,
            features.version_major(),
            features.version_minor(),
        );
        Self {
            program,
            features,
            vertex_mode,
            mb,
            record_index: 0,
            has_labels: program.has_labels(),
            uniform_float_constants: None,
            uniform_bool_loop_constants: 0,
            uniform_fetch_constants: None,
            buffer_shared_memory: None,
            input_vertex_index: None,
            input_primitive_id: None,
            output_per_vertex: None,
            var_predicate: 0,
            var_loop_count: 0,
            var_address_absolute: 0,
            var_address_relative: 0,
            var_registers: None,
            var_point_size_edge_flag_kill_vertex: None,
            function_main: 0,
            main_loop_header: 0,
            main_loop_continue: 0,
            main_loop_merge: 0,
            main_switch_header_block: None,
            main_switch_merge: None,
            main_loop_pc_next: 0,
            main_loop_pc_current: 0,
            main_switch_cases: Vec::new(),
            main_next_pc_phi_operands: Vec::new(),
            cf_exec_conditional: None,
            cf_exec_predicate_written: false,
            cf_instruction_predicate_merge: None,
            cf_instruction_predicate_condition: false,
            scratch_ids: Vec::new(),
            scratch_ids_inner: Vec::new(),
        }
    }

    /// Runs the single forward pass over the record stream and
    /// assembles the module.
    pub fn translate(mut self) -> Result<Vec<u32>, TranslateError> {
        self.start_translation()?;
        for index in 0..self.program.instructions.len() {
            self.record_index = index;
            match &self.program.instructions[index] {
                Instruction::Label { address } => self.process_label(*address)?,
                Instruction::ExecBegin(exec) => self.process_exec_begin(exec)?,
                Instruction::ExecEnd(exec) => self.process_exec_end(exec)?,
                Instruction::LoopStart(loop_start) => self.process_loop_start(loop_start)?,
                Instruction::LoopEnd(loop_end) => self.process_loop_end(loop_end)?,
                Instruction::Jump(jump) => self.process_jump(jump)?,
                Instruction::Alu(alu) => self.process_alu(alu)?,
                Instruction::VertexFetch(fetch) => self.process_vertex_fetch(fetch)?,
                Instruction::TextureFetch(fetch) => self.process_texture_fetch(fetch),
            }
        }
        self.complete_translation()
    }

    pub(crate) fn is_vertex_stage(&self) -> bool {
        self.program.stage == ShaderStage::Vertex
    }

    fn is_tessellation(&self) -> bool {
        self.is_vertex_stage() && self.vertex_mode == VertexMode::TessellationEvaluation
    }

    pub(crate) fn unsupported(&self, what: impl Into<String>) -> TranslateError {
        TranslateError::Unsupported {
            record: self.record_index,
            what: what.into(),
        }
    }

    fn start_translation(&mut self) -> Result<(), TranslateError> {
        if self.features.float_controls {
            self.mb.builder.capability(Capability::DenormFlushToZero);
            self.mb
                .builder
                .capability(Capability::SignedZeroInfNanPreserve);
            if self.features.spirv_version < Features::SPIRV_1_4 {
                self.mb.builder.extension("SPV_KHR_float_controls");
            }
        }

        self.declare_constant_uniforms();
        if self.is_vertex_stage() {
            self.declare_vertex_io();
        }

        // Main function; every function-local variable sits in its
        // entry block, ahead of the loop preheader branch.
        self.function_main = self.mb.begin_function()?;
        let preheader = self.mb.begin_block(None)?;

        let ptr_bool = self.mb.ptr_type(StorageClass::Function, self.mb.type_bool);
        self.var_predicate = self.mb.builder.variable(
            ptr_bool,
            None,
            StorageClass::Function,
            Some(self.mb.const_bool_false),
        );
        self.mb.builder.name(self.var_predicate, "xenos_predicate");
        let ptr_uint4 = self
            .mb
            .ptr_type(StorageClass::Function, self.mb.type_uint_vectors[3]);
        self.var_loop_count = self.mb.builder.variable(
            ptr_uint4,
            None,
            StorageClass::Function,
            Some(self.mb.const_uint4_0),
        );
        self.mb.builder.name(self.var_loop_count, "xenos_loop_count");
        let ptr_int = self.mb.ptr_type(StorageClass::Function, self.mb.type_int);
        self.var_address_absolute = self.mb.builder.variable(
            ptr_int,
            None,
            StorageClass::Function,
            Some(self.mb.const_int_0),
        );
        self.mb
            .builder
            .name(self.var_address_absolute, "xenos_address_absolute");
        let ptr_int4 = self.mb.ptr_type(StorageClass::Function, self.mb.type_int4);
        self.var_address_relative = self.mb.builder.variable(
            ptr_int4,
            None,
            StorageClass::Function,
            Some(self.mb.const_int4_0),
        );
        self.mb
            .builder
            .name(self.var_address_relative, "xenos_address_relative");

        let register_count = self.program.register_count;
        if register_count > 0 {
            let type_registers = self
                .mb
                .array_type(self.mb.type_float_vectors[3], register_count);
            let registers_zero = self.mb.builder.constant_composite(
                type_registers,
                vec![self.mb.const_float_vectors_0[3]; register_count as usize],
            );
            let ptr_registers = self.mb.ptr_type(StorageClass::Function, type_registers);
            let var = self.mb.builder.variable(
                ptr_registers,
                None,
                StorageClass::Function,
                Some(registers_zero),
            );
            self.mb.builder.name(var, "xenos_registers");
            self.var_registers = Some(var);
        }

        if self.is_vertex_stage() {
            // Point size 1, edge flag and kill-vertex 0 until written.
            let ones_zero = self.mb.builder.constant_composite(
                self.mb.type_float_vectors[2],
                [
                    self.mb.const_float_1,
                    self.mb.const_float_0,
                    self.mb.const_float_0,
                ],
            );
            let ptr_float3 = self
                .mb
                .ptr_type(StorageClass::Function, self.mb.type_float_vectors[2]);
            let var = self.mb.builder.variable(
                ptr_float3,
                None,
                StorageClass::Function,
                Some(ones_zero),
            );
            self.mb
                .builder
                .name(var, "xenos_point_size_edge_flag_kill_vertex");
            self.var_point_size_edge_flag_kill_vertex = Some(var);
        }

        // Open the main loop. The continue and merge blocks are only
        // begun in `complete_translation`; blocks must appear after
        // the blocks dominating them.
        self.main_loop_header = self.mb.builder.id();
        self.main_loop_continue = self.mb.builder.id();
        self.main_loop_merge = self.mb.builder.id();
        self.mb.builder.branch(self.main_loop_header)?;

        self.mb.begin_block(Some(self.main_loop_header))?;
        if self.has_labels {
            // First iteration enters with pc 0, later ones with the
            // counter chosen in the continue block.
            self.main_loop_pc_next = self.mb.builder.id();
            self.main_loop_pc_current = self.mb.builder.phi(
                self.mb.type_int,
                None,
                [
                    (self.mb.const_int_0, preheader),
                    (self.main_loop_pc_next, self.main_loop_continue),
                ],
            )?;
        }
        self.mb.builder.loop_merge(
            self.main_loop_merge,
            self.main_loop_continue,
            LoopControl::DONT_UNROLL,
            [],
        )?;
        let body = self.mb.builder.id();
        self.mb.builder.branch(body)?;
        self.mb.begin_block(Some(body))?;

        if self.has_labels {
            // Program counter dispatch. The switch itself is inserted
            // in `complete_translation` once all cases are known; until
            // then the header block stays open with only the selection
            // merge in it.
            let switch_merge = self.mb.builder.id();
            self.mb
                .builder
                .selection_merge(switch_merge, SelectionControl::DONT_FLATTEN)?;
            self.main_switch_header_block = self.mb.builder.selected_block();
            self.main_switch_merge = Some(switch_merge);
            self.mb.builder.select_block(None)?;
            let case_0 = self.mb.builder.id();
            self.main_switch_cases.push((0, case_0));
            self.mb.begin_block(Some(case_0))?;
        }
        Ok(())
    }

    fn complete_translation(mut self) -> Result<Vec<u32>, TranslateError> {
        // Close flow control within the last switch case.
        self.close_exec_conditionals()?;
        // If the final exec was not an exece, break out of the switch
        // (or the loop when there is no switch).
        if self.mb.builder.selected_block().is_some() {
            let target = self.main_switch_merge.unwrap_or(self.main_loop_merge);
            self.mb.builder.branch(target)?;
        }

        if let Some(switch_merge) = self.main_switch_merge {
            // Insert the deferred program counter switch.
            let header_block = self.main_switch_header_block;
            self.mb.builder.select_block(header_block)?;
            let targets: Vec<(Operand, Word)> = self
                .main_switch_cases
                .iter()
                .map(|&(address, block)| (Operand::LiteralBit32(address), block))
                .collect();
            self.mb
                .builder
                .switch(self.main_loop_pc_current, switch_merge, targets)?;
            // Falling through the switch (or breaking from exece)
            // leaves the loop.
            self.mb.begin_block(Some(switch_merge))?;
            self.mb.builder.branch(self.main_loop_merge)?;
        }

        // Loop continuation: pick the next program counter, -1 when
        // the iteration did not end in a jump so no case matches and
        // the dispatch falls through to the final break.
        self.mb.begin_block(Some(self.main_loop_continue))?;
        if self.has_labels {
            if self.main_next_pc_phi_operands.is_empty() {
                let fallthrough = self.mb.const_i32(-1);
                self.mb
                    .builder
                    .copy_object(self.mb.type_int, Some(self.main_loop_pc_next), fallthrough)?;
            } else {
                let pairs = std::mem::take(&mut self.main_next_pc_phi_operands);
                self.mb
                    .builder
                    .phi(self.mb.type_int, Some(self.main_loop_pc_next), pairs)?;
            }
        }
        self.mb.builder.branch(self.main_loop_header)?;

        self.mb.begin_block(Some(self.main_loop_merge))?;
        if self.is_vertex_stage() {
            self.complete_vertex_shader_in_main()?;
        }
        self.mb.builder.ret()?;
        self.mb.builder.end_function()?;

        let execution_model = if self.program.stage == ShaderStage::Pixel {
            self.mb
                .builder
                .execution_mode(self.function_main, ExecutionMode::OriginUpperLeft, []);
            ExecutionModel::Fragment
        } else if self.is_tessellation() {
            ExecutionModel::TessellationEvaluation
        } else {
            ExecutionModel::Vertex
        };
        if self.features.float_controls {
            self.mb
                .builder
                .execution_mode(self.function_main, ExecutionMode::DenormFlushToZero, [32]);
            self.mb.builder.execution_mode(
                self.function_main,
                ExecutionMode::SignedZeroInfNanPreserve,
                [32],
            );
        }
        let all_globals = self.features.spirv_version >= Features::SPIRV_1_4;
        let interface = self.mb.interface_variables(all_globals);
        self.mb
            .builder
            .entry_point(execution_model, self.function_main, "main", interface);

        let words = self.mb.builder.module().assemble();
        debug!(
            stage = self.program.stage.name(),
            records = self.program.instructions.len(),
            words = words.len(),
            "translated shader program"
        );
        Ok(words)
    }

    /// Float constants (when the program addresses any) and the always
    /// present bool/loop constants, as std140 uniform blocks.
    fn declare_constant_uniforms(&mut self) {
        let float_constant_count = self.program.float_constant_count;
        if float_constant_count > 0 {
            let member = self
                .mb
                .strided_array_type(self.mb.type_float_vectors[3], float_constant_count, 16);
            let type_float_constants = self.mb.builder.type_struct([member]);
            self.mb
                .builder
                .name(type_float_constants, "XenosFloatConstants");
            self.mb
                .builder
                .member_name(type_float_constants, 0, "float_constants");
            self.mb.builder.member_decorate(
                type_float_constants,
                0,
                Decoration::Offset,
                [Operand::LiteralBit32(0)],
            );
            self.mb
                .builder
                .decorate(type_float_constants, Decoration::Block, []);
            let var = self.mb.global_variable(
                StorageClass::Uniform,
                type_float_constants,
                "xenos_float_constants",
            );
            let set = if self.program.stage == ShaderStage::Pixel {
                DescriptorSet::FloatConstantsPixel
            } else {
                DescriptorSet::FloatConstantsVertex
            };
            self.mb.builder.decorate(
                var,
                Decoration::DescriptorSet,
                [Operand::LiteralBit32(set.index())],
            );
            self.mb
                .builder
                .decorate(var, Decoration::Binding, [Operand::LiteralBit32(0)]);
            self.uniform_float_constants = Some(var);
        }

        // 256 bool constant bits and 32 loop constants, as uvec4 arrays
        // so std140 does not pad scalars out to 16 bytes.
        let uint4 = self.mb.type_uint_vectors[3];
        let member_bool = self.mb.strided_array_type(uint4, 2, 16);
        let member_loop = self.mb.strided_array_type(uint4, 8, 16);
        let type_bool_loop = self.mb.builder.type_struct([member_bool, member_loop]);
        self.mb.builder.name(type_bool_loop, "XenosBoolLoopConstants");
        self.mb.builder.member_name(type_bool_loop, 0, "bool_constants");
        self.mb.builder.member_decorate(
            type_bool_loop,
            0,
            Decoration::Offset,
            [Operand::LiteralBit32(0)],
        );
        self.mb.builder.member_name(type_bool_loop, 1, "loop_constants");
        self.mb.builder.member_decorate(
            type_bool_loop,
            1,
            Decoration::Offset,
            [Operand::LiteralBit32(32)],
        );
        self.mb.builder.decorate(type_bool_loop, Decoration::Block, []);
        let var = self.mb.global_variable(
            StorageClass::Uniform,
            type_bool_loop,
            "xenos_bool_loop_constants",
        );
        self.mb.builder.decorate(
            var,
            Decoration::DescriptorSet,
            [Operand::LiteralBit32(DescriptorSet::BoolLoopConstants.index())],
        );
        self.mb
            .builder
            .decorate(var, Decoration::Binding, [Operand::LiteralBit32(0)]);
        self.uniform_bool_loop_constants = var;
    }

    /// Vertex-stage inputs and the `gl_PerVertex` output block. The
    /// clip/cull members exist even without the capabilities, nothing
    /// may be stored to them then.
    fn declare_vertex_io(&mut self) {
        if self.is_tessellation() {
            let var =
                self.mb
                    .global_variable(StorageClass::Input, self.mb.type_int, "gl_PrimitiveID");
            self.mb.builder.decorate(
                var,
                Decoration::BuiltIn,
                [Operand::BuiltIn(BuiltIn::PrimitiveId)],
            );
            self.input_primitive_id = Some(var);
        } else {
            let var =
                self.mb
                    .global_variable(StorageClass::Input, self.mb.type_int, "gl_VertexIndex");
            self.mb.builder.decorate(
                var,
                Decoration::BuiltIn,
                [Operand::BuiltIn(BuiltIn::VertexIndex)],
            );
            self.input_vertex_index = Some(var);
        }

        if self.features.clip_distance {
            self.mb.builder.capability(Capability::ClipDistance);
        }
        if self.features.cull_distance {
            self.mb.builder.capability(Capability::CullDistance);
        }
        let clip_count = if self.features.clip_distance { 6 } else { 1 };
        let type_clip = self.mb.array_type(self.mb.type_float, clip_count);
        let type_cull = self.mb.array_type(self.mb.type_float, 1);
        let type_per_vertex = self.mb.builder.type_struct([
            self.mb.type_float_vectors[3],
            self.mb.type_float,
            type_clip,
            type_cull,
        ]);
        self.mb.builder.name(type_per_vertex, "gl_PerVertex");
        self.mb.builder.member_decorate(
            type_per_vertex,
            PER_VERTEX_POSITION,
            Decoration::Invariant,
            [],
        );
        self.mb.builder.member_decorate(
            type_per_vertex,
            PER_VERTEX_POSITION,
            Decoration::BuiltIn,
            [Operand::BuiltIn(BuiltIn::Position)],
        );
        self.mb.builder.member_decorate(
            type_per_vertex,
            PER_VERTEX_POINT_SIZE,
            Decoration::BuiltIn,
            [Operand::BuiltIn(BuiltIn::PointSize)],
        );
        self.mb
            .builder
            .member_decorate(type_per_vertex, 2, Decoration::Invariant, []);
        self.mb.builder.member_decorate(
            type_per_vertex,
            2,
            Decoration::BuiltIn,
            [Operand::BuiltIn(BuiltIn::ClipDistance)],
        );
        self.mb
            .builder
            .member_decorate(type_per_vertex, 3, Decoration::Invariant, []);
        self.mb.builder.member_decorate(
            type_per_vertex,
            3,
            Decoration::BuiltIn,
            [Operand::BuiltIn(BuiltIn::CullDistance)],
        );
        self.mb.builder.decorate(type_per_vertex, Decoration::Block, []);
        let var = self
            .mb
            .global_variable(StorageClass::Output, type_per_vertex, "xenos_per_vertex_out");
        self.output_per_vertex = Some(var);
    }

    /// Copies the point size accumulated in the function-local export
    /// variable into the output block.
    fn complete_vertex_shader_in_main(&mut self) -> Result<(), TranslateError> {
        let (Some(point_size_var), Some(per_vertex)) = (
            self.var_point_size_edge_flag_kill_vertex,
            self.output_per_vertex,
        ) else {
            return Ok(());
        };
        let loaded =
            self.mb
                .builder
                .load(self.mb.type_float_vectors[2], None, point_size_var, None, [])?;
        let point_size = self
            .mb
            .builder
            .composite_extract(self.mb.type_float, None, loaded, [0])?;
        let member_index = self.mb.const_i32(PER_VERTEX_POINT_SIZE as i32);
        let ptr_float = self.mb.ptr_type(StorageClass::Output, self.mb.type_float);
        let target = self
            .mb
            .builder
            .access_chain(ptr_float, None, per_vertex, [member_index])?;
        self.mb.builder.store(target, point_size, None, [])?;
        Ok(())
    }

    /// Address 0 is the implicit entry case; any other label closes the
    /// running case and falls through into a fresh one.
    fn process_label(&mut self, address: u32) -> Result<(), TranslateError> {
        if address == 0 {
            return Ok(());
        }
        debug_assert!(self.has_labels);
        self.close_exec_conditionals()?;
        let new_case = self.mb.builder.id();
        self.main_switch_cases.push((address, new_case));
        // The previous block may already be terminated by an exece.
        if self.mb.builder.selected_block().is_some() {
            self.mb.builder.branch(new_case)?;
        }
        self.mb.begin_block(Some(new_case))?;
        Ok(())
    }

    fn process_exec_begin(&mut self, exec: &ExecInstruction) -> Result<(), TranslateError> {
        self.update_exec_conditionals(exec.condition)
    }

    fn process_exec_end(&mut self, exec: &ExecInstruction) -> Result<(), TranslateError> {
        if exec.ends_shader {
            // Break out of the dispatch switch (or the loop without
            // one); the exec conditional stays open for merging in
            // case a later exec shares its condition.
            self.close_instruction_predication()?;
            if self.mb.builder.selected_block().is_some() {
                let target = self.main_switch_merge.unwrap_or(self.main_loop_merge);
                self.mb.builder.branch(target)?;
            }
        }
        self.update_exec_conditionals(exec.condition)
    }

    fn process_loop_start(&mut self, instr: &LoopStartInstruction) -> Result<(), TranslateError> {
        // Loop records sit outside execs, actually close the last one.
        self.close_exec_conditionals()?;
        self.mb.ensure_build_point()?;

        // Iteration count in bits 0:7 of the loop constant, initial aL
        // in bits 8:15.
        let loop_constant = self.load_loop_constant(instr.loop_constant_index)?;
        let const_int_8 = self.mb.const_i32(8);

        // Push the count: move XYZ to YZW, set X to the new count.
        let stack_old =
            self.mb
                .builder
                .load(self.mb.type_uint_vectors[3], None, self.var_loop_count, None, [])?;
        let count_new = self.mb.builder.bit_field_u_extract(
            self.mb.type_uint,
            None,
            loop_constant,
            self.mb.const_int_0,
            const_int_8,
        )?;
        let mut stack_parts = vec![count_new];
        for lane in 0..3 {
            stack_parts.push(self.mb.builder.composite_extract(
                self.mb.type_uint,
                None,
                stack_old,
                [lane],
            )?);
        }
        let stack_new =
            self.mb
                .builder
                .composite_construct(self.mb.type_uint_vectors[3], None, stack_parts)?;
        self.mb.builder.store(self.var_loop_count, stack_new, None, [])?;

        // Push aL, keeping the previous top when repeating.
        let relative_old =
            self.mb
                .builder
                .load(self.mb.type_int4, None, self.var_address_relative, None, [])?;
        let mut relative_parts = Vec::with_capacity(4);
        for lane in 0..3 {
            relative_parts.push(self.mb.builder.composite_extract(
                self.mb.type_int,
                None,
                relative_old,
                [lane],
            )?);
        }
        let relative_top = if instr.is_repeat {
            relative_parts[0]
        } else {
            let initial = self.mb.builder.bit_field_u_extract(
                self.mb.type_uint,
                None,
                loop_constant,
                const_int_8,
                const_int_8,
            )?;
            self.mb.builder.bitcast(self.mb.type_int, None, initial)?
        };
        relative_parts.insert(0, relative_top);
        let relative_new =
            self.mb
                .builder
                .composite_construct(self.mb.type_int4, None, relative_parts)?;
        self.mb
            .builder
            .store(self.var_address_relative, relative_new, None, [])?;

        // The exit condition is tested at the loop end, so a zero trip
        // count must jump over the body to the skip label now.
        let count_zero =
            self.mb
                .builder
                .i_equal(self.mb.type_bool, None, count_new, self.mb.const_uint_0)?;
        let skip_block = self.mb.builder.id();
        let body_block = self.mb.builder.id();
        self.mb
            .builder
            .selection_merge(body_block, SelectionControl::NONE)?;
        // Entering the body is the likely path.
        self.mb
            .builder
            .branch_conditional(count_zero, skip_block, body_block, [1, 2])?;
        self.mb.begin_block(Some(skip_block))?;
        let skip_pc = self.mb.const_i32(instr.skip_address as i32);
        self.main_next_pc_phi_operands.push((skip_pc, skip_block));
        self.mb.builder.branch(self.main_loop_continue)?;
        self.mb.begin_block(Some(body_block))?;
        Ok(())
    }

    fn process_loop_end(&mut self, instr: &LoopEndInstruction) -> Result<(), TranslateError> {
        self.close_exec_conditionals()?;
        self.mb.ensure_build_point()?;

        // Decrement the iteration count; stored on the continue path.
        let stack_old =
            self.mb
                .builder
                .load(self.mb.type_uint_vectors[3], None, self.var_loop_count, None, [])?;
        let count_top =
            self.mb
                .builder
                .composite_extract(self.mb.type_uint, None, stack_old, [0])?;
        let const_uint_1 = self.mb.const_u32(1);
        let count = self
            .mb
            .builder
            .i_sub(self.mb.type_uint, None, count_top, const_uint_1)?;
        let relative_old =
            self.mb
                .builder
                .load(self.mb.type_int4, None, self.var_address_relative, None, [])?;

        // A predicated break tests (count == 0 || [!]p0). Built from
        // logical or/and so no OpLogicalNot is needed:
        // - continue if (count != 0)
        // - continue if (count != 0 && p0), when breaking on !p0
        // - break if (count == 0 || p0), when breaking on p0
        let break_is_true = instr.is_predicated_break && instr.predicate_condition;
        let mut condition = if break_is_true {
            self.mb
                .builder
                .i_equal(self.mb.type_bool, None, count, self.mb.const_uint_0)?
        } else {
            self.mb
                .builder
                .i_not_equal(self.mb.type_bool, None, count, self.mb.const_uint_0)?
        };
        if instr.is_predicated_break {
            let predicate =
                self.mb
                    .builder
                    .load(self.mb.type_bool, None, self.var_predicate, None, [])?;
            condition = if instr.predicate_condition {
                self.mb
                    .builder
                    .logical_or(self.mb.type_bool, None, condition, predicate)?
            } else {
                self.mb
                    .builder
                    .logical_and(self.mb.type_bool, None, condition, predicate)?
            };
        }

        let continue_block = self.mb.builder.id();
        let break_block = self.mb.builder.id();
        self.mb
            .builder
            .selection_merge(break_block, SelectionControl::NONE)?;
        // Continuing is the likely path.
        if break_is_true {
            self.mb
                .builder
                .branch_conditional(condition, break_block, continue_block, [1, 2])?;
        } else {
            self.mb
                .builder
                .branch_conditional(condition, continue_block, break_block, [2, 1])?;
        }

        // Continue: store the decremented count, advance aL by the
        // signed step in bits 16:23 of the loop constant, jump back to
        // the loop body label.
        self.mb.begin_block(Some(continue_block))?;
        let stack_kept = self.mb.builder.composite_insert(
            self.mb.type_uint_vectors[3],
            None,
            count,
            stack_old,
            [0],
        )?;
        self.mb.builder.store(self.var_loop_count, stack_kept, None, [])?;
        let loop_constant = self.load_loop_constant(instr.loop_constant_index)?;
        let relative_top =
            self.mb
                .builder
                .composite_extract(self.mb.type_int, None, relative_old, [0])?;
        let loop_constant_int = self
            .mb
            .builder
            .bitcast(self.mb.type_int, None, loop_constant)?;
        let const_int_16 = self.mb.const_i32(16);
        let const_int_8 = self.mb.const_i32(8);
        let step = self.mb.builder.bit_field_s_extract(
            self.mb.type_int,
            None,
            loop_constant_int,
            const_int_16,
            const_int_8,
        )?;
        let relative_stepped = self
            .mb
            .builder
            .i_add(self.mb.type_int, None, relative_top, step)?;
        let relative_kept = self.mb.builder.composite_insert(
            self.mb.type_int4,
            None,
            relative_stepped,
            relative_old,
            [0],
        )?;
        self.mb
            .builder
            .store(self.var_address_relative, relative_kept, None, [])?;
        let body_pc = self.mb.const_i32(instr.body_address as i32);
        self.main_next_pc_phi_operands.push((body_pc, continue_block));
        self.mb.builder.branch(self.main_loop_continue)?;

        // Break: pop both stacks, move YZW to XYZ and zero W, then
        // fall through to the next record.
        self.mb.begin_block(Some(break_block))?;
        let mut count_parts = Vec::with_capacity(4);
        for lane in 1..4 {
            count_parts.push(self.mb.builder.composite_extract(
                self.mb.type_uint,
                None,
                stack_old,
                [lane],
            )?);
        }
        count_parts.push(self.mb.const_uint_0);
        let count_popped =
            self.mb
                .builder
                .composite_construct(self.mb.type_uint_vectors[3], None, count_parts)?;
        self.mb.builder.store(self.var_loop_count, count_popped, None, [])?;
        let mut relative_parts = Vec::with_capacity(4);
        for lane in 1..4 {
            relative_parts.push(self.mb.builder.composite_extract(
                self.mb.type_int,
                None,
                relative_old,
                [lane],
            )?);
        }
        relative_parts.push(self.mb.const_int_0);
        let relative_popped =
            self.mb
                .builder
                .composite_construct(self.mb.type_int4, None, relative_parts)?;
        self.mb
            .builder
            .store(self.var_address_relative, relative_popped, None, [])?;
        Ok(())
    }

    /// A jump is an exec-level if: it merges with an open exec
    /// conditional of the same condition, then transfers control by
    /// setting the next program counter.
    fn process_jump(&mut self, instr: &JumpInstruction) -> Result<(), TranslateError> {
        self.update_exec_conditionals(instr.condition)?;
        // The jump itself is on the control flow level, its predicate
        // check cannot stay open across the transfer.
        self.close_instruction_predication()?;
        if self.mb.builder.selected_block().is_none() {
            // Unreachable, e.g. directly after an exece.
            return Ok(());
        }
        let target_pc = self.mb.const_i32(instr.target_address as i32);
        self.main_next_pc_phi_operands
            .push((target_pc, self.mb.current_block));
        self.mb.builder.branch(self.main_loop_continue)?;
        Ok(())
    }

    /// Loads one 32-bit loop constant (member 1 of the bool/loop
    /// uniform, packed four to a uvec4).
    fn load_loop_constant(&mut self, index: u32) -> Result<Word, TranslateError> {
        let member = self.mb.const_i32(1);
        let vector = self.mb.const_i32((index >> 2) as i32);
        let scalar = self.mb.const_i32((index & 3) as i32);
        let ptr_uint = self.mb.ptr_type(StorageClass::Uniform, self.mb.type_uint);
        let pointer = self.mb.builder.access_chain(
            ptr_uint,
            None,
            self.uniform_bool_loop_constants,
            [member, vector, scalar],
        )?;
        Ok(self.mb.builder.load(self.mb.type_uint, None, pointer, None, [])?)
    }

    /// Opens, reuses or closes the exec-level conditional so that the
    /// build point matches `condition`. Consecutive execs guarded by
    /// the same bool constant or predicate share one conditional.
    fn update_exec_conditionals(&mut self, condition: ExecCondition) -> Result<(), TranslateError> {
        let reusable = match (condition, &self.cf_exec_conditional) {
            (ExecCondition::Bool { index, value }, Some(open)) => {
                open.source == ExecConditionalSource::BoolConstant(index) && open.value == value
            }
            (ExecCondition::Predicate { value }, Some(open)) => {
                // A setp inside the previous exec means the predicate
                // may no longer match the value the conditional tested.
                !self.cf_exec_predicate_written
                    && open.source == ExecConditionalSource::Predicate
                    && open.value == value
            }
            (ExecCondition::Unconditional, None) => true,
            _ => false,
        };
        if reusable {
            return Ok(());
        }

        self.close_exec_conditionals()?;

        let (condition_id, source, value) = match condition {
            ExecCondition::Unconditional => return Ok(()),
            ExecCondition::Bool { index, value } => {
                self.mb.ensure_build_point()?;
                let member = self.mb.const_int_0;
                let vector = self.mb.const_i32((index >> 7) as i32);
                let scalar = self.mb.const_i32(((index >> 5) & 3) as i32);
                let ptr_uint = self.mb.ptr_type(StorageClass::Uniform, self.mb.type_uint);
                let pointer = self.mb.builder.access_chain(
                    ptr_uint,
                    None,
                    self.uniform_bool_loop_constants,
                    [member, vector, scalar],
                )?;
                let word = self
                    .mb
                    .builder
                    .load(self.mb.type_uint, None, pointer, None, [])?;
                let bit = self.mb.const_u32(1 << (index & 31));
                let masked = self
                    .mb
                    .builder
                    .bitwise_and(self.mb.type_uint, None, word, bit)?;
                let condition_id = self.mb.builder.i_not_equal(
                    self.mb.type_bool,
                    None,
                    masked,
                    self.mb.const_uint_0,
                )?;
                (condition_id, ExecConditionalSource::BoolConstant(index), value)
            }
            ExecCondition::Predicate { value } => {
                self.mb.ensure_build_point()?;
                let condition_id =
                    self.mb
                        .builder
                        .load(self.mb.type_bool, None, self.var_predicate, None, [])?;
                (condition_id, ExecConditionalSource::Predicate, value)
            }
        };

        let inner = self.mb.builder.id();
        let merge = self.mb.builder.id();
        self.mb.builder.selection_merge(merge, SelectionControl::NONE)?;
        let (true_block, false_block) = if value { (inner, merge) } else { (merge, inner) };
        self.mb
            .builder
            .branch_conditional(condition_id, true_block, false_block, [])?;
        self.mb.begin_block(Some(inner))?;
        self.cf_exec_conditional = Some(ExecConditional {
            merge_block: merge,
            source,
            value,
        });
        Ok(())
    }

    /// Opens or reuses the instruction-level predicate check. Reuses
    /// the surrounding exec conditional when it already tests the
    /// predicate for the same value and nothing rewrote the predicate
    /// since it opened.
    pub(crate) fn update_instruction_predication(
        &mut self,
        predicated: bool,
        condition: bool,
    ) -> Result<(), TranslateError> {
        if !predicated {
            return self.close_instruction_predication();
        }

        if self.cf_instruction_predicate_merge.is_some() {
            if self.cf_instruction_predicate_condition == condition {
                return Ok(());
            }
            self.close_instruction_predication()?;
        }

        if !self.cf_exec_predicate_written {
            if let Some(open) = &self.cf_exec_conditional {
                if open.source == ExecConditionalSource::Predicate && open.value == condition {
                    return Ok(());
                }
            }
        }

        self.cf_instruction_predicate_condition = condition;
        self.mb.ensure_build_point()?;
        let predicate = self
            .mb
            .builder
            .load(self.mb.type_bool, None, self.var_predicate, None, [])?;
        let inner = self.mb.builder.id();
        let merge = self.mb.builder.id();
        self.mb.builder.selection_merge(merge, SelectionControl::NONE)?;
        let (true_block, false_block) = if condition { (inner, merge) } else { (merge, inner) };
        self.mb
            .builder
            .branch_conditional(predicate, true_block, false_block, [])?;
        self.mb.begin_block(Some(inner))?;
        self.cf_instruction_predicate_merge = Some(merge);
        Ok(())
    }

    pub(crate) fn close_instruction_predication(&mut self) -> Result<(), TranslateError> {
        let Some(merge) = self.cf_instruction_predicate_merge.take() else {
            return Ok(());
        };
        if self.mb.builder.selected_block().is_some() {
            self.mb.builder.branch(merge)?;
        }
        self.mb.begin_block(Some(merge))?;
        Ok(())
    }

    fn close_exec_conditionals(&mut self) -> Result<(), TranslateError> {
        self.close_instruction_predication()?;
        if let Some(open) = self.cf_exec_conditional.take() {
            if self.mb.builder.selected_block().is_some() {
                self.mb.builder.branch(open.merge_block)?;
            }
            self.mb.begin_block(Some(open.merge_block))?;
        }
        // Nothing relies on the predicate staying unchanged now.
        self.cf_exec_predicate_written = false;
        Ok(())
    }
}
