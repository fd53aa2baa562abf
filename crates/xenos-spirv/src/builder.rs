//! Thin facade over the `rspirv` module builder.
//!
//! Caches the scalar/vector types and the handful of constants the
//! lowering reaches for on almost every record, tracks module-scope
//! variables for the entry-point interface, and keeps the label id of
//! the basic block currently being filled (`rspirv` only exposes the
//! block index).

use hashbrown::HashMap;
use rspirv::dr::{self, Builder, Operand};
use rspirv::spirv::{
    AddressingModel, Capability, Decoration, FunctionControl, MemoryModel, StorageClass, Word,
};

/// GLSL.std.450 extended instruction opcodes used by the lowering.
pub(crate) mod glsl {
    pub const TRUNC: u32 = 3;
    pub const F_ABS: u32 = 4;
    pub const FLOOR: u32 = 8;
    pub const FRACT: u32 = 10;
    pub const F_MAX: u32 = 40;
    pub const UNPACK_HALF2X16: u32 = 62;
    pub const N_MIN: u32 = 79;
    pub const N_CLAMP: u32 = 81;
}

pub(crate) struct ModuleBuilder {
    pub(crate) builder: Builder,
    /// Imported GLSL.std.450 instruction set.
    pub(crate) ext_glsl: Word,

    pub(crate) type_void: Word,
    pub(crate) type_bool: Word,
    /// Scalar bool and bvec2..bvec4, indexed by component count - 1.
    pub(crate) type_bool_vectors: [Word; 4],
    pub(crate) type_int: Word,
    pub(crate) type_int4: Word,
    pub(crate) type_uint: Word,
    /// Scalar uint and uvec2..uvec4, indexed by component count - 1.
    pub(crate) type_uint_vectors: [Word; 4],
    pub(crate) type_float: Word,
    /// Scalar float and vec2..vec4, indexed by component count - 1.
    pub(crate) type_float_vectors: [Word; 4],

    pub(crate) const_bool_false: Word,
    pub(crate) const_int_0: Word,
    pub(crate) const_int4_0: Word,
    pub(crate) const_uint_0: Word,
    pub(crate) const_uint4_0: Word,
    pub(crate) const_float_0: Word,
    pub(crate) const_float_1: Word,
    /// All-zero float constants, scalar through vec4.
    pub(crate) const_float_vectors_0: [Word; 4],
    /// All-one float constants, scalar through vec4.
    pub(crate) const_float_vectors_1: [Word; 4],
    /// `vec2(0.0, 1.0)`, shuffled into results whose destination lanes
    /// name the hardwired 0/1 write components.
    pub(crate) const_float2_0_1: Word,

    /// Label id of the block the builder cursor is in. Only meaningful
    /// while `builder.selected_block()` is `Some`.
    pub(crate) current_block: Word,

    /// Every module-scope variable with its storage class, in creation
    /// order, for the entry-point interface list.
    globals: Vec<(Word, StorageClass)>,

    int_consts: HashMap<i32, Word>,
    uint_consts: HashMap<u32, Word>,
    /// Keyed by bit pattern; the lowering never needs NaN payloads.
    float_consts: HashMap<u32, Word>,
    ptr_types: HashMap<(StorageClass, Word), Word>,
}

impl ModuleBuilder {
    pub(crate) fn new(capability: Capability, version_major: u8, version_minor: u8) -> Self {
        let mut builder = Builder::new();
        builder.set_version(version_major, version_minor);
        builder.capability(capability);
        let ext_glsl = builder.ext_inst_import("GLSL.std.450");
        builder.memory_model(AddressingModel::Logical, MemoryModel::GLSL450);

        let type_void = builder.type_void();
        let type_bool = builder.type_bool();
        let type_int = builder.type_int(32, 1);
        let type_int4 = builder.type_vector(type_int, 4);
        let type_uint = builder.type_int(32, 0);
        let type_float = builder.type_float(32);
        let mut type_bool_vectors = [type_bool; 4];
        let mut type_uint_vectors = [type_uint; 4];
        let mut type_float_vectors = [type_float; 4];
        for count in 2..=4u32 {
            let i = (count - 1) as usize;
            type_bool_vectors[i] = builder.type_vector(type_bool, count);
            type_uint_vectors[i] = builder.type_vector(type_uint, count);
            type_float_vectors[i] = builder.type_vector(type_float, count);
        }

        let const_bool_false = builder.constant_false(type_bool);
        let const_int_0 = builder.constant_bit32(type_int, 0);
        let const_int4_0 = builder.constant_composite(type_int4, [const_int_0; 4]);
        let const_uint_0 = builder.constant_bit32(type_uint, 0);
        let const_uint4_0 =
            builder.constant_composite(type_uint_vectors[3], [const_uint_0; 4]);
        let const_float_0 = builder.constant_bit32(type_float, 0f32.to_bits());
        let const_float_1 = builder.constant_bit32(type_float, 1f32.to_bits());
        let mut const_float_vectors_0 = [const_float_0; 4];
        let mut const_float_vectors_1 = [const_float_1; 4];
        for count in 2..=4usize {
            const_float_vectors_0[count - 1] = builder
                .constant_composite(type_float_vectors[count - 1], vec![const_float_0; count]);
            const_float_vectors_1[count - 1] = builder
                .constant_composite(type_float_vectors[count - 1], vec![const_float_1; count]);
        }
        let const_float2_0_1 =
            builder.constant_composite(type_float_vectors[1], [const_float_0, const_float_1]);

        let mut int_consts = HashMap::new();
        int_consts.insert(0, const_int_0);
        let mut uint_consts = HashMap::new();
        uint_consts.insert(0, const_uint_0);
        let mut float_consts = HashMap::new();
        float_consts.insert(0f32.to_bits(), const_float_0);
        float_consts.insert(1f32.to_bits(), const_float_1);

        Self {
            builder,
            ext_glsl,
            type_void,
            type_bool,
            type_bool_vectors,
            type_int,
            type_int4,
            type_uint,
            type_uint_vectors,
            type_float,
            type_float_vectors,
            const_bool_false,
            const_int_0,
            const_int4_0,
            const_uint_0,
            const_uint4_0,
            const_float_0,
            const_float_1,
            const_float_vectors_0,
            const_float_vectors_1,
            const_float2_0_1,
            current_block: 0,
            globals: Vec::new(),
            int_consts,
            uint_consts,
            float_consts,
            ptr_types: HashMap::new(),
        }
    }

    pub(crate) fn const_i32(&mut self, value: i32) -> Word {
        if let Some(&id) = self.int_consts.get(&value) {
            return id;
        }
        let id = self.builder.constant_bit32(self.type_int, value as u32);
        self.int_consts.insert(value, id);
        id
    }

    pub(crate) fn const_u32(&mut self, value: u32) -> Word {
        if let Some(&id) = self.uint_consts.get(&value) {
            return id;
        }
        let id = self.builder.constant_bit32(self.type_uint, value);
        self.uint_consts.insert(value, id);
        id
    }

    pub(crate) fn const_f32(&mut self, value: f32) -> Word {
        let bits = value.to_bits();
        if let Some(&id) = self.float_consts.get(&bits) {
            return id;
        }
        let id = self.builder.constant_bit32(self.type_float, bits);
        self.float_consts.insert(bits, id);
        id
    }

    /// `value` as a uint constant smeared over `count` lanes, or the
    /// scalar constant when `count` is 1.
    pub(crate) fn smear_const_u32(&mut self, value: u32, count: u32) -> Word {
        let scalar = self.const_u32(value);
        if count == 1 {
            return scalar;
        }
        self.builder.constant_composite(
            self.type_uint_vectors[(count - 1) as usize],
            vec![scalar; count as usize],
        )
    }

    /// `value` as a float constant smeared over `count` lanes, or the
    /// scalar constant when `count` is 1.
    pub(crate) fn smear_const_f32(&mut self, value: f32, count: u32) -> Word {
        let scalar = self.const_f32(value);
        if count == 1 {
            return scalar;
        }
        self.builder.constant_composite(
            self.type_float_vectors[(count - 1) as usize],
            vec![scalar; count as usize],
        )
    }

    /// Sized array type without layout decorations, for function-local
    /// storage.
    pub(crate) fn array_type(&mut self, element: Word, length: u32) -> Word {
        let length_id = self.const_u32(length);
        self.builder.type_array(element, length_id)
    }

    /// Sized array type carrying an explicit ArrayStride, for buffer
    /// members. Forces a fresh id: `rspirv` deduplicates types by
    /// operands alone, and a layout-decorated array must stay distinct
    /// from a function-storage array of the same shape.
    pub(crate) fn strided_array_type(&mut self, element: Word, length: u32, stride: u32) -> Word {
        let length_id = self.const_u32(length);
        let id = self.builder.id();
        let ty = self.builder.type_array_id(Some(id), element, length_id);
        self.builder
            .decorate(ty, Decoration::ArrayStride, [Operand::LiteralBit32(stride)]);
        ty
    }

    pub(crate) fn ptr_type(&mut self, storage_class: StorageClass, pointee: Word) -> Word {
        if let Some(&id) = self.ptr_types.get(&(storage_class, pointee)) {
            return id;
        }
        let id = self.builder.type_pointer(None, storage_class, pointee);
        self.ptr_types.insert((storage_class, pointee), id);
        id
    }

    /// Declares a named module-scope variable and records it for the
    /// entry-point interface.
    pub(crate) fn global_variable(
        &mut self,
        storage_class: StorageClass,
        pointee: Word,
        name: &str,
    ) -> Word {
        let ptr = self.ptr_type(storage_class, pointee);
        let var = self.builder.variable(ptr, None, storage_class, None);
        self.builder.name(var, name);
        self.globals.push((var, storage_class));
        var
    }

    /// Entry-point interface ids: from SPIR-V 1.4 on every module-scope
    /// variable, before that only the Input and Output ones.
    pub(crate) fn interface_variables(&self, all_globals: bool) -> Vec<Word> {
        self.globals
            .iter()
            .filter(|(_, class)| {
                all_globals || matches!(class, StorageClass::Input | StorageClass::Output)
            })
            .map(|&(id, _)| id)
            .collect()
    }

    /// Begins a basic block, records it as the current build point and
    /// returns its label id.
    pub(crate) fn begin_block(&mut self, label_id: Option<Word>) -> Result<Word, dr::Error> {
        let id = self.builder.begin_block(label_id)?;
        self.current_block = id;
        Ok(id)
    }

    /// Makes sure the cursor is inside an open block, starting a fresh
    /// unreachable one when the previous record sealed the block (e.g.
    /// an exec that ended the shader).
    pub(crate) fn ensure_build_point(&mut self) -> Result<(), dr::Error> {
        if self.builder.selected_block().is_none() {
            self.begin_block(None)?;
        }
        Ok(())
    }

    pub(crate) fn begin_function(&mut self) -> Result<Word, dr::Error> {
        let fn_type = self.builder.type_function(self.type_void, vec![]);
        let function = self.builder.begin_function(
            self.type_void,
            None,
            FunctionControl::NONE,
            fn_type,
        )?;
        Ok(function)
    }

    /// Calls into GLSL.std.450.
    pub(crate) fn ext_glsl(
        &mut self,
        result_type: Word,
        op: u32,
        args: &[Word],
    ) -> Result<Word, dr::Error> {
        let operands: Vec<Operand> = args.iter().map(|&arg| Operand::IdRef(arg)).collect();
        self.builder
            .ext_inst(result_type, None, self.ext_glsl, op, operands)
    }

    pub(crate) fn decorate_no_contraction(&mut self, id: Word) {
        self.builder.decorate(id, Decoration::NoContraction, []);
    }

    /// `OpFAdd` decorated NoContraction. Guest arithmetic must not be
    /// contracted into fused ops, the console GPU never fuses.
    pub(crate) fn f_add(&mut self, result_type: Word, a: Word, b: Word) -> Result<Word, dr::Error> {
        let id = self.builder.f_add(result_type, None, a, b)?;
        self.decorate_no_contraction(id);
        Ok(id)
    }

    /// `OpFMul` decorated NoContraction.
    pub(crate) fn f_mul(&mut self, result_type: Word, a: Word, b: Word) -> Result<Word, dr::Error> {
        let id = self.builder.f_mul(result_type, None, a, b)?;
        self.decorate_no_contraction(id);
        Ok(id)
    }

    /// `OpFNegate` decorated NoContraction.
    pub(crate) fn f_negate(&mut self, result_type: Word, value: Word) -> Result<Word, dr::Error> {
        let id = self.builder.f_negate(result_type, None, value)?;
        self.decorate_no_contraction(id);
        Ok(id)
    }

    /// Smears a scalar bool over `count` lanes for vector `OpSelect`.
    pub(crate) fn smear_bool(&mut self, value: Word, count: u32) -> Result<Word, dr::Error> {
        debug_assert!((2..=4).contains(&count));
        self.builder.composite_construct(
            self.type_bool_vectors[(count - 1) as usize],
            None,
            vec![value; count as usize],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rspirv::binary::Assemble;
    use rspirv::spirv::Capability;

    fn test_builder() -> ModuleBuilder {
        ModuleBuilder::new(Capability::Shader, 1, 0)
    }

    #[test]
    fn constant_caches_deduplicate() {
        let mut mb = test_builder();
        assert_eq!(mb.const_f32(0.0), mb.const_float_0);
        assert_eq!(mb.const_f32(1.0), mb.const_float_1);
        assert_eq!(mb.const_i32(0), mb.const_int_0);
        assert_eq!(mb.const_u32(0), mb.const_uint_0);
        let a = mb.const_f32(0.5);
        let b = mb.const_f32(0.5);
        assert_eq!(a, b);
        assert_ne!(a, mb.const_f32(0.25));
    }

    #[test]
    fn pointer_types_deduplicate() {
        let mut mb = test_builder();
        let float4 = mb.type_float_vectors[3];
        let a = mb.ptr_type(StorageClass::Function, float4);
        let b = mb.ptr_type(StorageClass::Function, float4);
        assert_eq!(a, b);
        assert_ne!(a, mb.ptr_type(StorageClass::Uniform, float4));
    }

    #[test]
    fn interface_filters_by_storage_class() {
        let mut mb = test_builder();
        let ty = mb.type_float_vectors[3];
        let input = mb.global_variable(StorageClass::Input, ty, "in");
        let uniform = mb.global_variable(StorageClass::Uniform, ty, "uni");
        let io_only = mb.interface_variables(false);
        assert_eq!(io_only, vec![input]);
        let all = mb.interface_variables(true);
        assert_eq!(all, vec![input, uniform]);
    }

    #[test]
    fn header_carries_requested_version() {
        let mb = ModuleBuilder::new(Capability::Shader, 1, 4);
        let words = mb.builder.module().assemble();
        // Word 1 of the header is the version, packed as 0x00MMmm00.
        assert_eq!(words[1], 0x0001_0400);
    }
}
