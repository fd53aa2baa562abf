//! Vector ALU lowering.
//!
//! Guest float semantics drive the shapes here: multiplies carry the
//! hardware's +0-times-anything rule, max/min are explicit
//! compare-and-select so NaN ordering matches the console, and dot
//! products sum left to right instead of using an IR dot.

use rspirv::dr::{self, Builder};
use rspirv::spirv::{SelectionControl, Word};
use tracing::debug;
use xenos_ucode::{AluInstruction, AluVectorOp, Operand};

use crate::builder::glsl;
use crate::error::TranslateError;
use crate::translator::Translator;

/// IR comparison backing an operation's zero test or lane select.
/// FMax/FMin (undefined on NaN) and NMax/NMin (drop the NaN) are never
/// equivalent to these.
#[derive(Debug, Clone, Copy)]
enum Comparison {
    Eq,
    Gt,
    Ge,
    Lt,
    /// Unordered, so NaN compares not-equal.
    NeUnord,
}

impl Comparison {
    fn emit(
        self,
        builder: &mut Builder,
        result_type: Word,
        a: Word,
        b: Word,
    ) -> Result<Word, dr::Error> {
        match self {
            Self::Eq => builder.f_ord_equal(result_type, None, a, b),
            Self::Gt => builder.f_ord_greater_than(result_type, None, a, b),
            Self::Ge => builder.f_ord_greater_than_equal(result_type, None, a, b),
            Self::Lt => builder.f_ord_less_than(result_type, None, a, b),
            Self::NeUnord => builder.f_unord_not_equal(result_type, None, a, b),
        }
    }
}

impl Translator<'_> {
    pub(crate) fn process_alu(&mut self, instr: &AluInstruction) -> Result<(), TranslateError> {
        self.update_instruction_predication(instr.is_predicated, instr.predicate_condition)?;
        if instr.operands.len() != instr.vector_op.operand_count() as usize {
            return Err(self.unsupported(format!(
                "{} with {} operands",
                instr.vector_op.name(),
                instr.operands.len()
            )));
        }
        let value = self.lower_vector_alu(instr)?;
        self.store_result(&instr.result, value)?;
        if matches!(
            instr.vector_op,
            AluVectorOp::SetpEqPush
                | AluVectorOp::SetpNePush
                | AluVectorOp::SetpGtPush
                | AluVectorOp::SetpGePush
        ) {
            // The conditionals guarding this point tested the old
            // predicate value; nothing after the store may reuse them.
            self.cf_exec_predicate_written = true;
            self.close_instruction_predication()?;
        }
        Ok(())
    }

    fn lower_vector_alu(
        &mut self,
        instr: &AluInstruction,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        let used = instr.result.used_result_components();
        if used == 0 && !instr.vector_op.has_side_effects() {
            return Ok(None);
        }
        self.mb.ensure_build_point()?;

        match instr.vector_op {
            AluVectorOp::Add => {
                let count = used.count_ones();
                let ty = self.mb.type_float_vectors[(count - 1) as usize];
                let a = self.load_alu_operand(&instr.operands[0], used)?;
                let b = self.load_alu_operand(&instr.operands[1], used)?;
                Ok(Some((self.mb.f_add(ty, a, b)?, count)))
            }
            AluVectorOp::Mul => Ok(Some((
                self.multiply_with_zero_rule(&instr.operands[0], &instr.operands[1], used)?,
                used.count_ones(),
            ))),
            AluVectorOp::Mad => {
                let count = used.count_ones();
                let ty = self.mb.type_float_vectors[(count - 1) as usize];
                let product =
                    self.multiply_with_zero_rule(&instr.operands[0], &instr.operands[1], used)?;
                // Plain addition: selecting the addend on a zero product
                // would turn +0 + -0 into -0.
                let addend = self.load_alu_operand(&instr.operands[2], used)?;
                Ok(Some((self.mb.f_add(ty, product, addend)?, count)))
            }
            AluVectorOp::Max => self.lower_max_min(instr, used, Comparison::Ge, false),
            AluVectorOp::Min => self.lower_max_min(instr, used, Comparison::Lt, false),
            AluVectorOp::MaxA => self.lower_max_min(instr, used, Comparison::Ge, true),
            AluVectorOp::Seq => self.lower_compare_set(instr, used, Comparison::Eq),
            AluVectorOp::Sgt => self.lower_compare_set(instr, used, Comparison::Gt),
            AluVectorOp::Sge => self.lower_compare_set(instr, used, Comparison::Ge),
            AluVectorOp::Sne => self.lower_compare_set(instr, used, Comparison::NeUnord),
            AluVectorOp::Frc => self.lower_unary_ext(instr, used, glsl::FRACT),
            AluVectorOp::Trunc => self.lower_unary_ext(instr, used, glsl::TRUNC),
            AluVectorOp::Floor => self.lower_unary_ext(instr, used, glsl::FLOOR),
            AluVectorOp::CndEq => self.lower_conditional(instr, used, Comparison::Eq),
            AluVectorOp::CndGe => self.lower_conditional(instr, used, Comparison::Ge),
            AluVectorOp::CndGt => self.lower_conditional(instr, used, Comparison::Gt),
            AluVectorOp::Dp4 => self.lower_dot_product(instr, 0b1111),
            AluVectorOp::Dp3 => self.lower_dot_product(instr, 0b0111),
            AluVectorOp::Dp2Add => self.lower_dot_product(instr, 0b0011),
            AluVectorOp::SetpEqPush => self.lower_setp_push(instr, used, Comparison::Eq),
            AluVectorOp::SetpNePush => self.lower_setp_push(instr, used, Comparison::NeUnord),
            AluVectorOp::SetpGtPush => self.lower_setp_push(instr, used, Comparison::Gt),
            AluVectorOp::SetpGePush => self.lower_setp_push(instr, used, Comparison::Ge),
            AluVectorOp::KillEq => self.lower_kill(instr, Comparison::Eq),
            AluVectorOp::KillGt => self.lower_kill(instr, Comparison::Gt),
            AluVectorOp::KillGe => self.lower_kill(instr, Comparison::Ge),
            AluVectorOp::KillNe => self.lower_kill(instr, Comparison::NeUnord),
        }
    }

    fn load_alu_operand(&mut self, operand: &Operand, mask: u8) -> Result<Word, TranslateError> {
        let storage = self.load_operand_storage(operand)?;
        self.operand_components(storage, operand, mask)
    }

    /// Per-lane `min(|a|, |b|) == 0 ? +0 : a * b` over the `mask`
    /// lanes. Lanes where both operands provably read the same data
    /// keep the plain product: `a * a` cannot pair a zero with a
    /// non-zero factor.
    fn multiply_with_zero_rule(
        &mut self,
        op_a: &Operand,
        op_b: &Operand,
        mask: u8,
    ) -> Result<Word, TranslateError> {
        let count = mask.count_ones();
        let ty = self.mb.type_float_vectors[(count - 1) as usize];
        let storage_a = self.load_operand_storage(op_a)?;
        let a = self.operand_components(storage_a, op_a, mask)?;
        let storage_b = self.load_operand_storage(op_b)?;
        let b = self.operand_components(storage_b, op_b, mask)?;
        let product = self.mb.f_mul(ty, a, b)?;
        let identical = op_a.identical_components(op_b) & mask;
        if identical == mask {
            return Ok(product);
        }

        let abs_a = self.absolute_for_zero_test(a, count, op_a)?;
        let abs_b = self.absolute_for_zero_test(b, count, op_b)?;
        // NMin: one NaN factor must not defeat the zero test on the
        // other.
        let smaller = self.mb.ext_glsl(ty, glsl::N_MIN, &[abs_a, abs_b])?;
        let bool_ty = self.mb.type_bool_vectors[(count - 1) as usize];
        let zeros = self.mb.const_float_vectors_0[(count - 1) as usize];
        let factor_is_zero = self
            .mb
            .builder
            .f_ord_equal(bool_ty, None, smaller, zeros)?;
        let guarded = self
            .mb
            .builder
            .select(ty, None, factor_is_zero, zeros, product)?;
        if identical == 0 {
            return Ok(guarded);
        }
        self.merge_identical_lanes(ty, guarded, product, mask, identical, count)
    }

    /// `|value|` for the zero test, skipped when the operand modifiers
    /// already guarantee a non-negative value.
    fn absolute_for_zero_test(
        &mut self,
        value: Word,
        count: u32,
        operand: &Operand,
    ) -> Result<Word, TranslateError> {
        if operand.absolute && !operand.negate {
            return Ok(value);
        }
        let ty = self.mb.type_float_vectors[(count - 1) as usize];
        Ok(self.mb.ext_glsl(ty, glsl::F_ABS, &[value])?)
    }

    /// Replaces the lanes set in `identical` with `replacement`;
    /// `value` and `replacement` are both condensed over `mask`.
    fn merge_identical_lanes(
        &mut self,
        ty: Word,
        value: Word,
        replacement: Word,
        mask: u8,
        identical: u8,
        count: u32,
    ) -> Result<Word, TranslateError> {
        // A scalar would have hit the all-or-nothing paths already.
        debug_assert!(count > 1);
        let mut selectors = Vec::with_capacity(count as usize);
        let mut position = 0u32;
        for lane in 0..4 {
            if mask & (1 << lane) == 0 {
                continue;
            }
            selectors.push(if identical & (1 << lane) != 0 {
                count + position
            } else {
                position
            });
            position += 1;
        }
        Ok(self
            .mb
            .builder
            .vector_shuffle(ty, None, value, replacement, selectors)?)
    }

    fn lower_max_min(
        &mut self,
        instr: &AluInstruction,
        used: u8,
        comparison: Comparison,
        update_address_register: bool,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        if update_address_register {
            self.store_address_register(&instr.operands[0])?;
        }
        if used == 0 {
            return Ok(None);
        }
        let count = used.count_ones();
        let ty = self.mb.type_float_vectors[(count - 1) as usize];
        let op_a = &instr.operands[0];
        let op_b = &instr.operands[1];
        let storage_a = self.load_operand_storage(op_a)?;
        let a = self.operand_components(storage_a, op_a, used)?;
        let identical = op_a.identical_components(op_b) & used;
        if identical == used {
            // The canonical move: max r, x, x.
            return Ok(Some((a, count)));
        }
        let storage_b = self.load_operand_storage(op_b)?;
        let b = self.operand_components(storage_b, op_b, used)?;
        let bool_ty = self.mb.type_bool_vectors[(count - 1) as usize];
        let keep_a = comparison.emit(&mut self.mb.builder, bool_ty, a, b)?;
        let selected = self.mb.builder.select(ty, None, keep_a, a, b)?;
        if identical == 0 {
            return Ok(Some((selected, count)));
        }
        let merged = self.merge_identical_lanes(ty, selected, a, used, identical, count)?;
        Ok(Some((merged, count)))
    }

    /// `maxa` address register side effect, before the max itself:
    /// a0 = int(clamp(floor(src0.w + 0.5), -256, 255)). The W lane is
    /// read regardless of the write mask.
    fn store_address_register(&mut self, operand: &Operand) -> Result<(), TranslateError> {
        let storage = self.load_operand_storage(operand)?;
        let w = self.operand_components(storage, operand, 0b1000)?;
        let half = self.mb.const_f32(0.5);
        let biased = self.mb.f_add(self.mb.type_float, w, half)?;
        let floored = self.mb.ext_glsl(self.mb.type_float, glsl::FLOOR, &[biased])?;
        let low = self.mb.const_f32(-256.0);
        let high = self.mb.const_f32(255.0);
        // NClamp sends a NaN W to the lower bound.
        let clamped = self
            .mb
            .ext_glsl(self.mb.type_float, glsl::N_CLAMP, &[floored, low, high])?;
        let address = self
            .mb
            .builder
            .convert_f_to_s(self.mb.type_int, None, clamped)?;
        self.mb
            .builder
            .store(self.var_address_absolute, address, None, [])?;
        Ok(())
    }

    fn lower_compare_set(
        &mut self,
        instr: &AluInstruction,
        used: u8,
        comparison: Comparison,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        let count = used.count_ones();
        let ty = self.mb.type_float_vectors[(count - 1) as usize];
        let bool_ty = self.mb.type_bool_vectors[(count - 1) as usize];
        let a = self.load_alu_operand(&instr.operands[0], used)?;
        let b = self.load_alu_operand(&instr.operands[1], used)?;
        let passes = comparison.emit(&mut self.mb.builder, bool_ty, a, b)?;
        let ones = self.mb.const_float_vectors_1[(count - 1) as usize];
        let zeros = self.mb.const_float_vectors_0[(count - 1) as usize];
        let value = self.mb.builder.select(ty, None, passes, ones, zeros)?;
        Ok(Some((value, count)))
    }

    fn lower_unary_ext(
        &mut self,
        instr: &AluInstruction,
        used: u8,
        ext_op: u32,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        let count = used.count_ones();
        let ty = self.mb.type_float_vectors[(count - 1) as usize];
        let a = self.load_alu_operand(&instr.operands[0], used)?;
        Ok(Some((self.mb.ext_glsl(ty, ext_op, &[a])?, count)))
    }

    /// Per-lane select between the second and third operands on the
    /// first operand's test against zero.
    fn lower_conditional(
        &mut self,
        instr: &AluInstruction,
        used: u8,
        comparison: Comparison,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        let count = used.count_ones();
        let ty = self.mb.type_float_vectors[(count - 1) as usize];
        let bool_ty = self.mb.type_bool_vectors[(count - 1) as usize];
        let condition_value = self.load_alu_operand(&instr.operands[0], used)?;
        let b = self.load_alu_operand(&instr.operands[1], used)?;
        let c = self.load_alu_operand(&instr.operands[2], used)?;
        let zeros = self.mb.const_float_vectors_0[(count - 1) as usize];
        let passes = comparison.emit(&mut self.mb.builder, bool_ty, condition_value, zeros)?;
        Ok(Some((self.mb.builder.select(ty, None, passes, b, c)?, count)))
    }

    /// Zero-rule per-lane products, then an explicit left-to-right
    /// addition chain; the summation order is part of the guest
    /// contract. `dp2add` appends the third operand's X lane.
    fn lower_dot_product(
        &mut self,
        instr: &AluInstruction,
        lane_mask: u8,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        let product =
            self.multiply_with_zero_rule(&instr.operands[0], &instr.operands[1], lane_mask)?;
        let mut sum = self
            .mb
            .builder
            .composite_extract(self.mb.type_float, None, product, [0])?;
        for lane in 1..lane_mask.count_ones() {
            let term = self
                .mb
                .builder
                .composite_extract(self.mb.type_float, None, product, [lane])?;
            sum = self.mb.f_add(self.mb.type_float, sum, term)?;
        }
        if instr.vector_op == AluVectorOp::Dp2Add {
            let addend = self.load_alu_operand(&instr.operands[2], 0b0001)?;
            sum = self.mb.f_add(self.mb.type_float, sum, addend)?;
        }
        Ok(Some((sum, 1)))
    }

    /// predicate = (src0.w == 0 && test(src1.w));
    /// result = ((src0.x == 0 && test(src1.x)) ? -1 : src0.x) + 1.
    fn lower_setp_push(
        &mut self,
        instr: &AluInstruction,
        used: u8,
        comparison: Comparison,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        let op_a = &instr.operands[0];
        let op_b = &instr.operands[1];
        let storage_a = self.load_operand_storage(op_a)?;
        let storage_b = self.load_operand_storage(op_b)?;
        let zero = self.mb.const_float_0;

        let a_w = self.operand_components(storage_a, op_a, 0b1000)?;
        let b_w = self.operand_components(storage_b, op_b, 0b1000)?;
        let a_w_is_zero = self
            .mb
            .builder
            .f_ord_equal(self.mb.type_bool, None, a_w, zero)?;
        let b_w_passes = comparison.emit(&mut self.mb.builder, self.mb.type_bool, b_w, zero)?;
        let predicate = self
            .mb
            .builder
            .logical_and(self.mb.type_bool, None, a_w_is_zero, b_w_passes)?;
        self.mb.builder.store(self.var_predicate, predicate, None, [])?;

        if used == 0 {
            return Ok(None);
        }
        let a_x = self.operand_components(storage_a, op_a, 0b0001)?;
        let b_x = self.operand_components(storage_b, op_b, 0b0001)?;
        let a_x_is_zero = self
            .mb
            .builder
            .f_ord_equal(self.mb.type_bool, None, a_x, zero)?;
        let b_x_passes = comparison.emit(&mut self.mb.builder, self.mb.type_bool, b_x, zero)?;
        let take_minus_one = self
            .mb
            .builder
            .logical_and(self.mb.type_bool, None, a_x_is_zero, b_x_passes)?;
        let minus_one = self.mb.const_f32(-1.0);
        let selected = self
            .mb
            .builder
            .select(self.mb.type_float, None, take_minus_one, minus_one, a_x)?;
        let value = self.mb.f_add(self.mb.type_float, selected, self.mb.const_float_1)?;
        Ok(Some((value, 1)))
    }

    /// Full 4-lane comparison, discard when any lane passes, zero
    /// vector result. Vertex-stage programs get the result only; there
    /// is nothing to discard there.
    fn lower_kill(
        &mut self,
        instr: &AluInstruction,
        comparison: Comparison,
    ) -> Result<Option<(Word, u32)>, TranslateError> {
        let zeros = self.mb.const_float_vectors_0[3];
        if self.is_vertex_stage() {
            debug!(
                record = self.record_index,
                op = instr.vector_op.name(),
                "kill in a vertex-stage program discards nothing"
            );
            return Ok(Some((zeros, 4)));
        }
        let a = self.load_alu_operand(&instr.operands[0], 0b1111)?;
        let b = self.load_alu_operand(&instr.operands[1], 0b1111)?;
        let bool4 = self.mb.type_bool_vectors[3];
        let lanes_pass = comparison.emit(&mut self.mb.builder, bool4, a, b)?;
        let any_passes = self.mb.builder.any(self.mb.type_bool, None, lanes_pass)?;
        let kill_block = self.mb.builder.id();
        let merge = self.mb.builder.id();
        self.mb
            .builder
            .selection_merge(merge, SelectionControl::NONE)?;
        self.mb
            .builder
            .branch_conditional(any_passes, kill_block, merge, [])?;
        self.mb.begin_block(Some(kill_block))?;
        self.mb.builder.kill()?;
        self.mb.begin_block(Some(merge))?;
        Ok(Some((zeros, 4)))
    }
}
