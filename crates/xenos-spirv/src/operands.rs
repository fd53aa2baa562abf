//! Operand loading and result storing shared by the instruction
//! handlers.
//!
//! Operands always resolve against a 4-lane backing vector (a register
//! or a float constant), narrowed by a component mask with the operand
//! swizzle applied, then sign-modified. Results go the other way: the
//! computed value is scattered over the destination write mask, with
//! lanes that name the hardwired constants 0/1 filled from those.

use rspirv::spirv::{StorageClass, Word};
use tracing::debug;
use xenos_ucode::{Operand, OperandSource, ResultInfo, ResultTarget, StorageAddressing};

use crate::builder::glsl;
use crate::error::TranslateError;
use crate::translator::{Translator, PER_VERTEX_POSITION};

impl Translator<'_> {
    /// Index into register or constant storage, possibly offset by the
    /// `a0` address register or the innermost loop iterator `aL.x`.
    pub(crate) fn storage_addressing_index(
        &mut self,
        addressing: StorageAddressing,
        index: u32,
    ) -> Result<Word, TranslateError> {
        self.mb.ensure_build_point()?;
        let base_pointer = match addressing {
            StorageAddressing::Static => return Ok(self.mb.const_i32(index as i32)),
            StorageAddressing::AddressAbsolute => self.var_address_absolute,
            StorageAddressing::AddressRelative => {
                let ptr_int = self.mb.ptr_type(StorageClass::Function, self.mb.type_int);
                self.mb.builder.access_chain(
                    ptr_int,
                    None,
                    self.var_address_relative,
                    [self.mb.const_int_0],
                )?
            }
        };
        let loaded = self
            .mb
            .builder
            .load(self.mb.type_int, None, base_pointer, None, [])?;
        if index == 0 {
            return Ok(loaded);
        }
        let offset = self.mb.const_i32(index as i32);
        Ok(self
            .mb
            .builder
            .i_add(self.mb.type_int, None, loaded, offset)?)
    }

    /// Loads the whole 4-lane vector backing `operand`, without
    /// swizzling or sign modifiers.
    pub(crate) fn load_operand_storage(
        &mut self,
        operand: &Operand,
    ) -> Result<Word, TranslateError> {
        let index = self.storage_addressing_index(operand.addressing, operand.index)?;
        let float4 = self.mb.type_float_vectors[3];
        let pointer = match operand.source {
            OperandSource::Register => {
                let Some(registers) = self.var_registers else {
                    return Err(
                        self.unsupported("register operand in a program with no registers")
                    );
                };
                let ptr = self.mb.ptr_type(StorageClass::Function, float4);
                self.mb.builder.access_chain(ptr, None, registers, [index])?
            }
            OperandSource::FloatConstant => {
                let Some(uniform) = self.uniform_float_constants else {
                    return Err(self.unsupported(
                        "float-constant operand in a program with no float constants",
                    ));
                };
                let ptr = self.mb.ptr_type(StorageClass::Uniform, float4);
                // The first and only structure member, then the element.
                self.mb
                    .builder
                    .access_chain(ptr, None, uniform, [self.mb.const_int_0, index])?
            }
            OperandSource::VertexFetchConstant | OperandSource::TextureFetchConstant => {
                return Err(self.unsupported(format!(
                    "{} as an arithmetic operand",
                    operand.source.name()
                )));
            }
        };
        Ok(self.mb.builder.load(float4, None, pointer, None, [])?)
    }

    /// Applies the absolute-value and negation modifiers to a value of
    /// `component_count` lanes.
    pub(crate) fn apply_operand_modifiers(
        &mut self,
        mut value: Word,
        component_count: u32,
        operand: &Operand,
    ) -> Result<Word, TranslateError> {
        let ty = self.mb.type_float_vectors[(component_count - 1) as usize];
        if operand.absolute {
            self.mb.ensure_build_point()?;
            value = self.mb.ext_glsl(ty, glsl::F_ABS, &[value])?;
        }
        if operand.negate {
            self.mb.ensure_build_point()?;
            value = self.mb.f_negate(ty, value)?;
        }
        Ok(value)
    }

    /// Selects the `mask` components of a loaded operand vector through
    /// the operand swizzle, without sign modifiers. One selected lane
    /// yields a scalar, several a condensed vector in ascending mask
    /// order.
    pub(crate) fn operand_components_unmodified(
        &mut self,
        storage: Word,
        operand: &Operand,
        mask: u8,
    ) -> Result<Word, TranslateError> {
        debug_assert!(mask != 0 && mask <= 0b1111);
        if mask == 0b1111 && operand.swizzle.is_identity() {
            return Ok(storage);
        }
        self.mb.ensure_build_point()?;
        let component_count = mask.count_ones();
        if component_count == 1 {
            let lane = mask.trailing_zeros();
            let source = operand.swizzle.get(lane).index();
            return Ok(self.mb.builder.composite_extract(
                self.mb.type_float,
                None,
                storage,
                [source],
            )?);
        }
        let mut sources = Vec::with_capacity(component_count as usize);
        for lane in 0..4 {
            if mask & (1 << lane) != 0 {
                sources.push(operand.swizzle.get(lane).index());
            }
        }
        let ty = self.mb.type_float_vectors[(component_count - 1) as usize];
        Ok(self
            .mb
            .builder
            .vector_shuffle(ty, None, storage, storage, sources)?)
    }

    /// Swizzled and sign-modified `mask` components of an operand.
    pub(crate) fn operand_components(
        &mut self,
        storage: Word,
        operand: &Operand,
        mask: u8,
    ) -> Result<Word, TranslateError> {
        let value = self.operand_components_unmodified(storage, operand, mask)?;
        self.apply_operand_modifiers(value, mask.count_ones(), operand)
    }

    /// Stores a computed value to the result destination. `value`
    /// carries the id and its component count: the used result
    /// components in condensed form, or a scalar to replicate. `None`
    /// means the handler had nothing useful to store; masked lanes are
    /// then filled from the constant selections (0 for value lanes).
    pub(crate) fn store_result(
        &mut self,
        result: &ResultInfo,
        value: Option<(Word, u32)>,
    ) -> Result<(), TranslateError> {
        let used_write_mask = u32::from(result.used_write_mask());
        if used_write_mask == 0 {
            return Ok(());
        }
        self.mb.ensure_build_point()?;

        let target_pointer = match result.target {
            ResultTarget::None => None,
            ResultTarget::Register => {
                let Some(registers) = self.var_registers else {
                    return Err(
                        self.unsupported("register result in a program with no registers")
                    );
                };
                let index = self.storage_addressing_index(result.addressing, result.index)?;
                let float4 = self.mb.type_float_vectors[3];
                let ptr = self.mb.ptr_type(StorageClass::Function, float4);
                Some(self.mb.builder.access_chain(ptr, None, registers, [index])?)
            }
            ResultTarget::Position => match self.output_per_vertex {
                Some(per_vertex) => {
                    let member = self.mb.const_i32(PER_VERTEX_POSITION as i32);
                    let float4 = self.mb.type_float_vectors[3];
                    let ptr = self.mb.ptr_type(StorageClass::Output, float4);
                    Some(
                        self.mb
                            .builder
                            .access_chain(ptr, None, per_vertex, [member])?,
                    )
                }
                None => None,
            },
            ResultTarget::PointSizeEdgeFlagKillVertex => self.var_point_size_edge_flag_kill_vertex,
            ResultTarget::Interpolator | ResultTarget::Color | ResultTarget::Depth => None,
        };
        let Some(target_pointer) = target_pointer else {
            debug!(
                record = self.record_index,
                target = ?result.target,
                "result store target not lowered, skipping"
            );
            return Ok(());
        };

        let (constant_lanes, constant_ones) = result.used_constant_components();
        let mut constant_components = u32::from(constant_lanes);
        let constant_values = u32::from(constant_ones);
        if value.is_none() {
            // Nothing was computed but the mask must still be honored:
            // value-selecting lanes become zeros, lanes naming the
            // constant 1 keep it.
            constant_components = used_write_mask;
        }
        let non_constant_components = used_write_mask & !constant_components;

        let (mut value_id, value_component_count) = value.unwrap_or((0, 0));
        debug_assert!(non_constant_components == 0 || value_component_count >= 1);

        if result.saturate && non_constant_components != 0 {
            // NClamp, so a NaN result saturates to 0 like on the guest.
            let ty = self.mb.type_float_vectors[(value_component_count - 1) as usize];
            let zeros = self.mb.const_float_vectors_0[(value_component_count - 1) as usize];
            let ones = self.mb.const_float_vectors_1[(value_component_count - 1) as usize];
            value_id = self.mb.ext_glsl(ty, glsl::N_CLAMP, &[value_id, zeros, ones])?;
        }

        // Decompress the condensed value: map each used source lane to
        // its position in the value vector (scalars replicate).
        let mut unswizzled = [0u32; 4];
        if value_component_count > 1 {
            let used_result_components = result.used_result_components();
            let mut value_component = 0u32;
            for component in 0..4u32 {
                if used_result_components & (1 << component) != 0 {
                    unswizzled[component as usize] =
                        value_component.min(value_component_count - 1);
                    value_component += 1;
                }
            }
        }
        // Then map each written destination lane to a value component
        // through the per-lane selection.
        let mut swizzled = [0u32; 4];
        for lane in 0..4u32 {
            if non_constant_components & (1 << lane) == 0 {
                continue;
            }
            if let Some(source) = result.components[lane as usize].lane() {
                swizzled[lane as usize] = unswizzled[source as usize];
            }
        }

        let target_component_count = result.target.used_component_count();
        let target_mask = (1u32 << target_component_count) - 1;
        debug_assert_eq!(used_write_mask & !target_mask, 0);
        let target_type = self.mb.type_float_vectors[(target_component_count - 1) as usize];

        let value_to_store = if target_mask == used_write_mask {
            // Full overwrite, no need to read the previous value.
            if constant_components == 0 {
                if target_component_count > 1 {
                    if value_component_count > 1 {
                        let identity = value_component_count == target_component_count
                            && (0..target_component_count).all(|i| swizzled[i as usize] == i);
                        if identity {
                            value_id
                        } else {
                            let selectors = swizzled[..target_component_count as usize].to_vec();
                            self.mb.builder.vector_shuffle(
                                target_type,
                                None,
                                value_id,
                                value_id,
                                selectors,
                            )?
                        }
                    } else {
                        // Smear the scalar over every destination lane.
                        self.mb.builder.composite_construct(
                            target_type,
                            None,
                            vec![value_id; target_component_count as usize],
                        )?
                    }
                } else if value_component_count > 1 {
                    self.mb.builder.composite_extract(
                        self.mb.type_float,
                        None,
                        value_id,
                        [swizzled[0]],
                    )?
                } else {
                    value_id
                }
            } else if non_constant_components == 0 {
                if target_component_count > 1 {
                    let mut parts = Vec::with_capacity(target_component_count as usize);
                    for lane in 0..target_component_count {
                        parts.push(if constant_values & (1 << lane) != 0 {
                            self.mb.const_float_1
                        } else {
                            self.mb.const_float_0
                        });
                    }
                    self.mb.builder.constant_composite(target_type, parts)
                } else if constant_values & 0b0001 != 0 {
                    self.mb.const_float_1
                } else {
                    self.mb.const_float_0
                }
            } else {
                // Mixed constant and value lanes; scalar targets never
                // get here, the cases above cover them fully.
                debug_assert!(target_component_count > 1);
                if value_component_count > 1 {
                    // Shuffle over the value and vec2(0, 1).
                    let mut selectors = Vec::with_capacity(target_component_count as usize);
                    for lane in 0..target_component_count {
                        selectors.push(if constant_components & (1 << lane) != 0 {
                            value_component_count + ((constant_values >> lane) & 1)
                        } else {
                            swizzled[lane as usize]
                        });
                    }
                    self.mb.builder.vector_shuffle(
                        target_type,
                        None,
                        value_id,
                        self.mb.const_float2_0_1,
                        selectors,
                    )?
                } else {
                    let mut parts = Vec::with_capacity(target_component_count as usize);
                    for lane in 0..target_component_count {
                        parts.push(if constant_components & (1 << lane) != 0 {
                            if constant_values & (1 << lane) != 0 {
                                self.mb.const_float_1
                            } else {
                                self.mb.const_float_0
                            }
                        } else {
                            value_id
                        });
                    }
                    self.mb
                        .builder
                        .composite_construct(target_type, None, parts)?
                }
            }
        } else {
            // Partial overwrite: read-modify-write. Constants go in
            // first so the value components depend on one shuffle less.
            debug_assert!(target_component_count > 1);
            let mut current = self
                .mb
                .builder
                .load(target_type, None, target_pointer, None, [])?;
            if constant_components != 0 {
                let mut selectors = Vec::with_capacity(target_component_count as usize);
                for lane in 0..target_component_count {
                    selectors.push(if constant_components & (1 << lane) != 0 {
                        target_component_count + ((constant_values >> lane) & 1)
                    } else {
                        lane
                    });
                }
                current = self.mb.builder.vector_shuffle(
                    target_type,
                    None,
                    current,
                    self.mb.const_float2_0_1,
                    selectors,
                )?;
            }
            if non_constant_components != 0 {
                if value_component_count > 1 {
                    let mut selectors = Vec::with_capacity(target_component_count as usize);
                    for lane in 0..target_component_count {
                        selectors.push(if non_constant_components & (1 << lane) != 0 {
                            target_component_count + swizzled[lane as usize]
                        } else {
                            lane
                        });
                    }
                    current = self.mb.builder.vector_shuffle(
                        target_type,
                        None,
                        current,
                        value_id,
                        selectors,
                    )?;
                } else {
                    for lane in 0..target_component_count {
                        if non_constant_components & (1 << lane) != 0 {
                            current = self.mb.builder.composite_insert(
                                target_type,
                                None,
                                value_id,
                                current,
                                [lane],
                            )?;
                        }
                    }
                }
            }
            current
        };
        self.mb.builder.store(target_pointer, value_to_store, None, [])?;
        Ok(())
    }
}
