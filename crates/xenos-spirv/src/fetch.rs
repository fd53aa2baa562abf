//! Vertex fetch lowering: shared memory loads, endian handling and the
//! three decode families of the Xenos vertex formats.
//!
//! The fetch constant table and the shared memory buffer are only
//! declared once a fetch actually reaches them, so programs without
//! fetches stay free of the bindings.

use rspirv::dr::Operand;
use rspirv::spirv::{Decoration, StorageClass, Word};
use tracing::warn;
use xenos_ucode::{
    FormatFamily, PackedComponent, SignedRepeatingFractionMode, TextureFetchInstruction,
    VertexFetchInstruction,
};

use crate::builder::glsl;
use crate::error::TranslateError;
use crate::translator::Translator;
use crate::{DescriptorSet, Features};

impl Translator<'_> {
    pub(crate) fn process_vertex_fetch(
        &mut self,
        instr: &VertexFetchInstruction,
    ) -> Result<(), TranslateError> {
        self.update_instruction_predication(instr.is_predicated, instr.predicate_condition)?;

        let used_result_components = instr.result.used_result_components();
        let needed_words = instr
            .attributes
            .data_format
            .needed_words(used_result_components);
        if needed_words == 0 {
            // Only constant 0/1 writes, or a swizzle of components the
            // format does not even have (those become zeros). The
            // decode below assumes at least one word is wanted.
            return self.store_result(&instr.result, None);
        }

        self.mb.ensure_build_point()?;

        // Base address in dwords from bits 2:31 of fetch constant word 0.
        let fetch_constant_word_0_index = instr.fetch_constant_index * 2;
        let word_0 = self.load_fetch_constant_word(fetch_constant_word_0_index)?;
        let const_uint_2 = self.mb.const_u32(2);
        let address_bits =
            self.mb
                .builder
                .shift_right_logical(self.mb.type_uint, None, word_0, const_uint_2)?;
        let mut address = self
            .mb
            .builder
            .bitcast(self.mb.type_int, None, address_bits)?;

        if instr.attributes.stride != 0 {
            // Index operand to integer: floor, or floor(x + 0.5) when
            // rounding is requested. Not round-half-even - both 1.5 and
            // 2.5 address element 2... element 3, rounding away is what
            // the addressing needs.
            let storage = self.load_operand_storage(&instr.operand)?;
            let mut index = self.operand_components(storage, &instr.operand, 0b0001)?;
            if instr.attributes.is_index_rounded {
                let half = self.mb.const_f32(0.5);
                index = self.mb.f_add(self.mb.type_float, index, half)?;
            }
            index = self.mb.ext_glsl(self.mb.type_float, glsl::FLOOR, &[index])?;
            let mut index = self
                .mb
                .builder
                .convert_f_to_s(self.mb.type_int, None, index)?;
            if instr.attributes.stride > 1 {
                let stride = self.mb.const_i32(instr.attributes.stride as i32);
                index = self.mb.builder.i_mul(self.mb.type_int, None, index, stride)?;
            }
            address = self.mb.builder.i_add(self.mb.type_int, None, address, index)?;
        }

        // Load the needed words. Aggregated in the outer scratch list
        // because the shared memory helper may use the inner one.
        let mut word_ids = std::mem::take(&mut self.scratch_ids);
        word_ids.clear();
        let mut word_composite_indices = [0u32; 4];
        for word_index in 0..4u32 {
            if needed_words & (1 << word_index) == 0 {
                continue;
            }
            let mut word_address = address;
            let word_offset = instr.attributes.offset + word_index as i32;
            if word_offset != 0 {
                let offset = self.mb.const_i32(word_offset);
                word_address =
                    self.mb
                        .builder
                        .i_add(self.mb.type_int, None, word_address, offset)?;
            }
            word_composite_indices[word_index as usize] = word_ids.len() as u32;
            // Out-of-bounds addresses are an upstream problem; the
            // guest never validated them either.
            let loaded = self.load_shared_memory_word(word_address)?;
            word_ids.push(loaded);
        }
        let word_count = word_ids.len() as u32;
        let mut words = if word_count > 1 {
            self.mb.builder.composite_construct(
                self.mb.type_uint_vectors[(word_count - 1) as usize],
                None,
                word_ids.iter().copied(),
            )?
        } else {
            word_ids[0]
        };
        self.scratch_ids = word_ids;

        // Endian swap per bits 0:1 of fetch constant word 1.
        let word_1 = self.load_fetch_constant_word(fetch_constant_word_0_index + 1)?;
        let endian_mask = self.mb.const_u32(0b11);
        let endian_code = self
            .mb
            .builder
            .bitwise_and(self.mb.type_uint, None, word_1, endian_mask)?;
        words = self.endian_swap_words(words, word_count, endian_code)?;

        let used_format_components = used_result_components
            & (((1u32 << instr.attributes.data_format.component_count()) - 1) as u8);
        // Nonzero needed_words guarantees at least one format lane.
        debug_assert_ne!(used_format_components, 0);
        let used_format_component_count = used_format_components.count_ones();
        let result_type = self.mb.type_float_vectors[(used_format_component_count - 1) as usize];

        let mut result = match instr.attributes.data_format.family() {
            FormatFamily::PackedInteger => {
                let layout = instr.attributes.data_format.packed_components().ok_or_else(
                    || self.unsupported(format!("format {}", instr.attributes.data_format.name())),
                )?;
                self.decode_packed_words(
                    instr,
                    layout,
                    words,
                    word_count,
                    &word_composite_indices,
                    used_format_components,
                )?
            }
            FormatFamily::HalfFloat => self.decode_half_float_words(
                words,
                word_count,
                &word_composite_indices,
                used_format_components,
            )?,
            FormatFamily::Integer32 => {
                debug_assert_eq!(used_format_components, needed_words);
                let converted = if instr.attributes.is_signed {
                    let int_type = if word_count > 1 {
                        self.mb.builder.type_vector(self.mb.type_int, word_count)
                    } else {
                        self.mb.type_int
                    };
                    let as_int = self.mb.builder.bitcast(int_type, None, words)?;
                    self.mb.builder.convert_s_to_f(result_type, None, as_int)?
                } else {
                    self.mb.builder.convert_u_to_f(result_type, None, words)?
                };
                if instr.attributes.is_integer {
                    converted
                } else if instr.attributes.is_signed {
                    match instr.attributes.signed_rf_mode {
                        SignedRepeatingFractionMode::ZeroClampMinusOne => {
                            // No clamp to -1 needed: 1/(2^31 - 1) already
                            // rounds to 1/2^31 as float32.
                            self.scale_decoded(converted, used_format_component_count, {
                                1.0 / 2147483647.0
                            })?
                        }
                        SignedRepeatingFractionMode::NoZero => {
                            let scaled = self.scale_decoded(
                                converted,
                                used_format_component_count,
                                1.0 / 2147483647.5,
                            )?;
                            let bias = self.mb.smear_const_f32(
                                0.5 / 2147483647.5,
                                used_format_component_count,
                            );
                            self.mb.f_add(result_type, scaled, bias)?
                        }
                    }
                } else {
                    self.scale_decoded(converted, used_format_component_count, {
                        1.0 / 4294967295.0
                    })?
                }
            }
            FormatFamily::Float32 => {
                debug_assert_eq!(used_format_components, needed_words);
                self.mb.builder.bitcast(
                    self.mb.type_float_vectors[(word_count - 1) as usize],
                    None,
                    words,
                )?
            }
        };

        if instr.attributes.exp_adjust != 0 {
            let scale = self
                .mb
                .const_f32((instr.attributes.exp_adjust as f32).exp2());
            result = if used_format_component_count > 1 {
                let scaled =
                    self.mb
                        .builder
                        .vector_times_scalar(result_type, None, result, scale)?;
                self.mb.decorate_no_contraction(scaled);
                scaled
            } else {
                self.mb.f_mul(result_type, result, scale)?
            };
        }

        // Requested lanes the format does not provide become zeros,
        // appended as one sub-vector.
        let used_missing_components = used_result_components & !used_format_components;
        if used_missing_components != 0 {
            let final_count = u32::from(used_result_components).count_ones();
            let zeros = self.mb.const_float_vectors_0
                [(u32::from(used_missing_components).count_ones() - 1) as usize];
            result = self.mb.builder.composite_construct(
                self.mb.type_float_vectors[(final_count - 1) as usize],
                None,
                [result, zeros],
            )?;
        }

        let component_count = u32::from(used_result_components).count_ones();
        self.store_result(&instr.result, Some((result, component_count)))
    }

    /// Texture fetch lowering is not carried at this point; the result
    /// register keeps its previous (zero-initialized) value.
    pub(crate) fn process_texture_fetch(&mut self, instr: &TextureFetchInstruction) {
        warn!(
            record = self.record_index,
            fetch_constant = instr.fetch_constant_index,
            "texture fetch not lowered, result register keeps its previous value"
        );
    }

    /// Sub-32-bit integer lanes: bitfield-extract each used lane from
    /// its owning word, convert to float, normalize per lane width.
    fn decode_packed_words(
        &mut self,
        instr: &VertexFetchInstruction,
        layout: &'static [PackedComponent],
        words: Word,
        word_count: u32,
        word_composite_indices: &[u32; 4],
        used_format_components: u8,
    ) -> Result<Word, TranslateError> {
        let is_signed = instr.attributes.is_signed;
        let used_count = u32::from(used_format_components).count_ones();
        let result_type = self.mb.type_float_vectors[(used_count - 1) as usize];
        let lane_type = if is_signed {
            self.mb.type_int
        } else {
            self.mb.type_uint
        };
        // The sign-extending extract wants a signed base.
        let words = if is_signed {
            let int_type = if word_count > 1 {
                self.mb.builder.type_vector(self.mb.type_int, word_count)
            } else {
                self.mb.type_int
            };
            self.mb.builder.bitcast(int_type, None, words)?
        } else {
            words
        };

        let mut extracted = std::mem::take(&mut self.scratch_ids_inner);
        extracted.clear();
        let mut extracted_widths = [0u32; 4];
        let mut extraction_word_index = None;
        let mut extraction_word = words;
        for lane in 0..4u32 {
            if used_format_components & (1 << lane) == 0 {
                continue;
            }
            let component = layout[lane as usize];
            if word_count > 1 {
                let composite_index = word_composite_indices[component.word as usize];
                if extraction_word_index != Some(composite_index) {
                    extraction_word_index = Some(composite_index);
                    extraction_word = self.mb.builder.composite_extract(
                        lane_type,
                        None,
                        words,
                        [composite_index],
                    )?;
                }
            }
            // A signed 1-bit lane would need scale 1/0; no Xenos vertex
            // format has one.
            debug_assert!(component.width >= 2);
            extracted_widths[extracted.len()] = component.width;
            let offset = self.mb.const_i32(component.offset as i32);
            let width = self.mb.const_i32(component.width as i32);
            let value = if is_signed {
                self.mb.builder.bit_field_s_extract(
                    lane_type,
                    None,
                    extraction_word,
                    offset,
                    width,
                )?
            } else {
                self.mb.builder.bit_field_u_extract(
                    lane_type,
                    None,
                    extraction_word,
                    offset,
                    width,
                )?
            };
            extracted.push(value);
        }
        debug_assert_eq!(extracted.len() as u32, used_count);

        let combined = if used_count > 1 {
            let vector_type = self.mb.builder.type_vector(lane_type, used_count);
            self.mb
                .builder
                .composite_construct(vector_type, None, extracted.iter().copied())?
        } else {
            extracted[0]
        };
        self.scratch_ids_inner = extracted;

        let mut result = if is_signed {
            self.mb.builder.convert_s_to_f(result_type, None, combined)?
        } else {
            self.mb.builder.convert_u_to_f(result_type, None, combined)?
        };
        if instr.attributes.is_integer {
            return Ok(result);
        }

        // Normalization scale per distinct lane width.
        let mut scales = [0f32; 4];
        let mut scales_same = true;
        for i in 0..used_count as usize {
            let width = extracted_widths[i];
            scales_same &= width == extracted_widths[0];
            let scale_inv = if is_signed {
                let mut inv = ((1u32 << (width - 1)) - 1) as f32;
                if instr.attributes.signed_rf_mode == SignedRepeatingFractionMode::NoZero {
                    inv += 0.5;
                }
                inv
            } else {
                ((1u32 << width) - 1) as f32
            };
            scales[i] = 1.0 / scale_inv;
        }
        result = if used_count > 1 && scales_same {
            let scale = self.mb.const_f32(scales[0]);
            let scaled = self
                .mb
                .builder
                .vector_times_scalar(result_type, None, result, scale)?;
            self.mb.decorate_no_contraction(scaled);
            scaled
        } else {
            let scale = self.packed_scale_constant(&scales[..used_count as usize], 1.0)?;
            self.mb.f_mul(result_type, result, scale)?
        };

        if is_signed {
            match instr.attributes.signed_rf_mode {
                SignedRepeatingFractionMode::ZeroClampMinusOne => {
                    // Both -(2^(n-1)) and -(2^(n-1) - 1) mean -1. FMax is
                    // fine, the value cannot be NaN here.
                    let minus_one = self.mb.smear_const_f32(-1.0, used_count);
                    result = self
                        .mb
                        .ext_glsl(result_type, glsl::F_MAX, &[result, minus_one])?;
                }
                SignedRepeatingFractionMode::NoZero => {
                    let bias = self.packed_scale_constant(&scales[..used_count as usize], 0.5)?;
                    result = self.mb.f_add(result_type, result, bias)?;
                }
            }
        }
        Ok(result)
    }

    /// Per-lane scale constants times `factor`, as a composite constant
    /// (or the scalar constant for one lane).
    fn packed_scale_constant(
        &mut self,
        scales: &[f32],
        factor: f32,
    ) -> Result<Word, TranslateError> {
        if scales.len() == 1 {
            return Ok(self.mb.const_f32(factor * scales[0]));
        }
        let mut parts = Vec::with_capacity(scales.len());
        for &scale in scales {
            parts.push(self.mb.const_f32(factor * scale));
        }
        Ok(self.mb.builder.constant_composite(
            self.mb.type_float_vectors[scales.len() - 1],
            parts,
        ))
    }

    /// IEEE half lanes, two per word. The hardware's extended-range
    /// 16-bit floats are intentionally not reproduced.
    fn decode_half_float_words(
        &mut self,
        words: Word,
        word_count: u32,
        word_composite_indices: &[u32; 4],
        used_format_components: u8,
    ) -> Result<Word, TranslateError> {
        let mut parts = std::mem::take(&mut self.scratch_ids_inner);
        parts.clear();
        let mut part_count = 0u32;
        for word_index in 0..2u32 {
            let word_needed = (used_format_components >> (word_index * 2)) & 0b11;
            if word_needed == 0 {
                continue;
            }
            let word = if word_count > 1 {
                self.mb.builder.composite_extract(
                    self.mb.type_uint,
                    None,
                    words,
                    [word_composite_indices[word_index as usize]],
                )?
            } else {
                words
            };
            let mut value = self.mb.ext_glsl(
                self.mb.type_float_vectors[1],
                glsl::UNPACK_HALF2X16,
                &[word],
            )?;
            if word_needed != 0b11 {
                let half_lane = if word_needed & 0b01 != 0 { 0 } else { 1 };
                value = self.mb.builder.composite_extract(
                    self.mb.type_float,
                    None,
                    value,
                    [half_lane],
                )?;
                part_count += 1;
            } else {
                part_count += 2;
            }
            parts.push(value);
        }
        debug_assert_eq!(part_count, u32::from(used_format_components).count_ones());
        // Sub-vectors concatenate directly, no scalar-by-scalar rebuild.
        let result = if parts.len() == 1 {
            parts[0]
        } else {
            self.mb.builder.composite_construct(
                self.mb.type_float_vectors[(part_count - 1) as usize],
                None,
                parts.iter().copied(),
            )?
        };
        self.scratch_ids_inner = parts;
        Ok(result)
    }

    /// Multiplies a decoded value by one scalar normalization factor.
    fn scale_decoded(
        &mut self,
        value: Word,
        component_count: u32,
        scale: f32,
    ) -> Result<Word, TranslateError> {
        let ty = self.mb.type_float_vectors[(component_count - 1) as usize];
        let scale = self.mb.const_f32(scale);
        if component_count > 1 {
            let scaled = self
                .mb
                .builder
                .vector_times_scalar(ty, None, value, scale)?;
            self.mb.decorate_no_contraction(scaled);
            Ok(scaled)
        } else {
            Ok(self.mb.f_mul(ty, value, scale)?)
        }
    }

    /// Applies the fetch constant's endian mode to `word_count` loaded
    /// words. Both swap steps are computed unconditionally and folded
    /// in with selects: 8-in-16 applies the byte swap, 16-in-32 the
    /// half-word swap, 8-in-32 applies both.
    fn endian_swap_words(
        &mut self,
        words: Word,
        word_count: u32,
        endian_code: Word,
    ) -> Result<Word, TranslateError> {
        let ty = self.mb.type_uint_vectors[(word_count - 1) as usize];

        // Byte swap within half-words, for modes 1 (8-in-16) and 2
        // (8-in-32).
        let const_1 = self.mb.const_u32(1);
        let const_2 = self.mb.const_u32(2);
        let is_mode_1 = self
            .mb
            .builder
            .i_equal(self.mb.type_bool, None, endian_code, const_1)?;
        let is_mode_2 = self
            .mb
            .builder
            .i_equal(self.mb.type_bool, None, endian_code, const_2)?;
        let swap_8_in_16 =
            self.mb
                .builder
                .logical_or(self.mb.type_bool, None, is_mode_1, is_mode_2)?;
        let byte_mask = self.mb.smear_const_u32(0x00FF_00FF, word_count);
        let shift_8 = self.mb.smear_const_u32(8, word_count);
        let low = self.mb.builder.bitwise_and(ty, None, words, byte_mask)?;
        let low_shifted = self.mb.builder.shift_left_logical(ty, None, low, shift_8)?;
        let high = self
            .mb
            .builder
            .shift_right_logical(ty, None, words, shift_8)?;
        let high_masked = self.mb.builder.bitwise_and(ty, None, high, byte_mask)?;
        let byte_swapped = self
            .mb
            .builder
            .bitwise_or(ty, None, low_shifted, high_masked)?;
        let condition = if word_count > 1 {
            self.mb.smear_bool(swap_8_in_16, word_count)?
        } else {
            swap_8_in_16
        };
        let words = self
            .mb
            .builder
            .select(ty, None, condition, byte_swapped, words)?;

        // Half-word swap within words, for modes 2 (8-in-32) and 3
        // (16-in-32).
        let swap_16_in_32 =
            self.mb
                .builder
                .u_greater_than_equal(self.mb.type_bool, None, endian_code, const_2)?;
        let shift_16 = self.mb.smear_const_u32(16, word_count);
        let low_half =
            self.mb
                .builder
                .shift_left_logical(ty, None, words, shift_16)?;
        let high_half = self
            .mb
            .builder
            .shift_right_logical(ty, None, words, shift_16)?;
        let half_swapped = self.mb.builder.bitwise_or(ty, None, low_half, high_half)?;
        let condition = if word_count > 1 {
            self.mb.smear_bool(swap_16_in_32, word_count)?
        } else {
            swap_16_in_32
        };
        Ok(self
            .mb
            .builder
            .select(ty, None, condition, half_swapped, words)?)
    }

    /// Loads one 32-bit word of the fetch constant table, declaring the
    /// table on first use.
    fn load_fetch_constant_word(&mut self, word_index: u32) -> Result<Word, TranslateError> {
        let uniform = self.fetch_constants_uniform();
        let member = self.mb.const_int_0;
        let vector = self.mb.const_i32((word_index >> 2) as i32);
        let lane = self.mb.const_i32((word_index & 3) as i32);
        let ptr_uint = self.mb.ptr_type(StorageClass::Uniform, self.mb.type_uint);
        let pointer = self
            .mb
            .builder
            .access_chain(ptr_uint, None, uniform, [member, vector, lane])?;
        Ok(self
            .mb
            .builder
            .load(self.mb.type_uint, None, pointer, None, [])?)
    }

    /// Loads one 32-bit word from the shared memory buffer, declaring
    /// the buffer on first use. `address` is a signed dword index.
    fn load_shared_memory_word(&mut self, address: Word) -> Result<Word, TranslateError> {
        let buffer = self.shared_memory_buffer();
        let class = self.shared_memory_storage_class();
        let ptr_uint = self.mb.ptr_type(class, self.mb.type_uint);
        // Index lists are built in the inner scratch buffer so an outer
        // aggregation in `scratch_ids` stays intact across this call.
        let mut indices = std::mem::take(&mut self.scratch_ids_inner);
        indices.clear();
        indices.push(self.mb.const_int_0);
        indices.push(address);
        let pointer = self
            .mb
            .builder
            .access_chain(ptr_uint, None, buffer, indices.iter().copied())?;
        self.scratch_ids_inner = indices;
        Ok(self
            .mb
            .builder
            .load(self.mb.type_uint, None, pointer, None, [])?)
    }

    fn fetch_constants_uniform(&mut self) -> Word {
        if let Some(var) = self.uniform_fetch_constants {
            return var;
        }
        // 96 vertex fetch constants, two words each, packed as uvec4s.
        let uint4 = self.mb.type_uint_vectors[3];
        let member = self.mb.strided_array_type(uint4, 48, 16);
        let ty = self.mb.builder.type_struct([member]);
        self.mb.builder.name(ty, "XenosFetchConstants");
        self.mb.builder.member_name(ty, 0, "fetch_constants");
        self.mb
            .builder
            .member_decorate(ty, 0, Decoration::Offset, [Operand::LiteralBit32(0)]);
        self.mb.builder.decorate(ty, Decoration::Block, []);
        let var = self
            .mb
            .global_variable(StorageClass::Uniform, ty, "xenos_fetch_constants");
        self.mb.builder.decorate(
            var,
            Decoration::DescriptorSet,
            [Operand::LiteralBit32(DescriptorSet::FetchConstants.index())],
        );
        self.mb
            .builder
            .decorate(var, Decoration::Binding, [Operand::LiteralBit32(0)]);
        self.uniform_fetch_constants = Some(var);
        var
    }

    fn shared_memory_storage_class(&self) -> StorageClass {
        if self.features.spirv_version >= Features::SPIRV_1_3 {
            StorageClass::StorageBuffer
        } else {
            StorageClass::Uniform
        }
    }

    fn shared_memory_buffer(&mut self) -> Word {
        if let Some(var) = self.buffer_shared_memory {
            return var;
        }
        let array = self.mb.builder.type_runtime_array(self.mb.type_uint);
        self.mb
            .builder
            .decorate(array, Decoration::ArrayStride, [Operand::LiteralBit32(4)]);
        let ty = self.mb.builder.type_struct([array]);
        self.mb.builder.name(ty, "XenosSharedMemory");
        self.mb.builder.member_name(ty, 0, "shared_memory");
        self.mb
            .builder
            .member_decorate(ty, 0, Decoration::Offset, [Operand::LiteralBit32(0)]);
        self.mb
            .builder
            .member_decorate(ty, 0, Decoration::NonWritable, []);
        // StorageBuffer class from SPIR-V 1.3 on; BufferBlock in the
        // Uniform class before that.
        let class = self.shared_memory_storage_class();
        let block = if class == StorageClass::StorageBuffer {
            Decoration::Block
        } else {
            Decoration::BufferBlock
        };
        self.mb.builder.decorate(ty, block, []);
        let var = self.mb.global_variable(class, ty, "xenos_shared_memory");
        self.mb.builder.decorate(var, Decoration::Restrict, []);
        self.mb.builder.decorate(
            var,
            Decoration::DescriptorSet,
            [Operand::LiteralBit32(DescriptorSet::SharedMemoryAndEdram.index())],
        );
        self.mb
            .builder
            .decorate(var, Decoration::Binding, [Operand::LiteralBit32(0)]);
        self.buffer_shared_memory = Some(var);
        var
    }
}
