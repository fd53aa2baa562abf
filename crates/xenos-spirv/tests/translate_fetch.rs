//! Vertex fetch lowering: decode families, normalization scales,
//! index addressing, endian handling, zero padding.

use pretty_assertions::assert_eq;
use rspirv::binary::Disassemble;
use xenos_spirv::{translate, Features};
use xenos_ucode::{
    ExecCondition, ExecInstruction, Instruction, Operand, ResultInfo, ShaderProgram, ShaderStage,
    SignedRepeatingFractionMode, VertexFetchAttributes, VertexFetchInstruction, VertexFormat,
    WriteMask,
};

fn fetch(format: VertexFormat) -> VertexFetchInstruction {
    let mut attributes = VertexFetchAttributes::new(format);
    attributes.stride = 1;
    VertexFetchInstruction {
        operand: Operand::register(0),
        fetch_constant_index: 2,
        attributes,
        is_predicated: false,
        predicate_condition: false,
        result: ResultInfo::register(1),
    }
}

fn program_with(instr: VertexFetchInstruction) -> ShaderProgram {
    let block = ExecInstruction {
        condition: ExecCondition::Unconditional,
        instruction_count: 1,
        ends_shader: true,
    };
    ShaderProgram::new(
        ShaderStage::Vertex,
        vec![
            Instruction::ExecBegin(block),
            Instruction::VertexFetch(instr),
            Instruction::ExecEnd(block),
        ],
    )
}

fn translated(program: &ShaderProgram, features: Features) -> Vec<u32> {
    program.validate().expect("test program should validate");
    translate(program, features).expect("translation should succeed")
}

fn disassemble(words: &[u32]) -> String {
    rspirv::dr::load_words(words)
        .expect("emitted module should parse")
        .disassemble()
}

fn validate_with_naga(words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    let module = naga::front::spv::parse_u8_slice(&bytes, &naga::front::spv::Options::default())
        .expect("naga should parse the emitted module");
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .expect("naga should validate the emitted module");
}

/// Float constants round-trip through the disassembler as their raw
/// bit patterns.
fn float_bits(value: f32) -> String {
    value.to_bits().to_string()
}

#[test]
fn unsigned_8888_normalizes_by_255() {
    let words = translated(&program_with(fetch(VertexFormat::Int8x4)), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpBitFieldUExtract"), "{dis}");
    assert!(dis.contains("OpConvertUToF"), "{dis}");
    // Uniform lane widths take the scalar-scale fast path.
    assert!(dis.contains("OpVectorTimesScalar"), "{dis}");
    assert!(dis.contains(&float_bits(1.0 / 255.0)), "{dis}");
    // Dynamic endian handling: byte-mask swap folded in with selects.
    assert!(dis.contains("OpSelect"), "{dis}");
    assert!(dis.contains(&0x00FF_00FFu32.to_string()), "{dis}");
}

#[test]
fn float32_is_a_bitcast_without_normalization() {
    let mut instr = fetch(VertexFormat::Float32);
    instr.result = instr.result.with_mask(WriteMask(0b0001));
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpBitcast"), "{dis}");
    assert!(!dis.contains("OpConvertUToF"), "{dis}");
    assert!(!dis.contains("OpConvertSToF"), "{dis}");
    assert!(!dis.contains(&float_bits(1.0 / 4294967295.0)), "{dis}");
}

#[test]
fn signed_2_10_10_10_zero_clamp_scales_and_clamps() {
    let mut instr = fetch(VertexFormat::Int2_10_10_10);
    instr.attributes.is_signed = true;
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpBitFieldSExtract"), "{dis}");
    // 10-bit lanes scale by 1/(2^9 - 1), never 1/1023.
    assert!(dis.contains(&float_bits(1.0 / 511.0)), "{dis}");
    assert!(!dis.contains(&float_bits(1.0 / 1023.0)), "{dis}");
    // Both most negative codes clamp to -1.
    assert!(dis.contains(&float_bits(-1.0)), "{dis}");
    // Mixed lane widths rule out the scalar-scale fast path.
    assert!(!dis.contains("OpVectorTimesScalar"), "{dis}");
}

#[test]
fn signed_no_zero_mode_scales_and_biases() {
    let mut instr = fetch(VertexFormat::Int8x4);
    instr.attributes.is_signed = true;
    instr.attributes.signed_rf_mode = SignedRepeatingFractionMode::NoZero;
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains(&float_bits(1.0 / 127.5)), "{dis}");
    assert!(dis.contains(&float_bits(0.5 / 127.5)), "{dis}");
    // No clamp in this mode.
    assert!(!dis.contains(&float_bits(-1.0)), "{dis}");
}

#[test]
fn rounded_index_adds_half_before_flooring() {
    let mut instr = fetch(VertexFormat::Float32x4);
    instr.attributes.stride = 4;
    instr.attributes.is_index_rounded = true;
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains(&float_bits(0.5)), "{dis}");
    assert!(dis.contains("OpConvertFToS"), "{dis}");
    assert!(dis.contains("OpIMul"), "{dis}");
}

#[test]
fn empty_write_mask_touches_no_memory() {
    let mut instr = fetch(VertexFormat::Float32x4);
    instr.result = instr.result.with_mask(WriteMask::empty());
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(!dis.contains("\"xenos_shared_memory\""), "{dis}");
    assert!(!dis.contains("\"xenos_fetch_constants\""), "{dis}");
}

#[test]
fn lanes_past_the_format_are_zero_padded() {
    // One-lane format, four-lane destination.
    let words = translated(&program_with(fetch(VertexFormat::Float32)), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpCompositeConstruct"), "{dis}");
}

#[test]
fn split_format_loads_only_the_needed_word() {
    let mut instr = fetch(VertexFormat::Int16x4);
    instr.result = instr.result.with_mask(WriteMask(0b1000));
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    // Only the W lane is wanted, so only the second word is decoded.
    assert_eq!(dis.matches("OpBitFieldUExtract").count(), 1, "{dis}");
}

#[test]
fn half_floats_unpack_without_integer_conversion() {
    let words = translated(
        &program_with(fetch(VertexFormat::Float16x4)),
        Features::default(),
    );
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpExtInst"), "{dis}");
    assert!(!dis.contains("OpConvertUToF"), "{dis}");
    assert!(!dis.contains("OpBitFieldUExtract"), "{dis}");
}

#[test]
fn shared_memory_storage_class_follows_the_spirv_version() {
    let baseline = translated(&program_with(fetch(VertexFormat::Int8x4)), Features::default());
    let dis = disassemble(&baseline);
    assert!(dis.contains("BufferBlock"), "{dis}");
    assert!(!dis.contains("StorageBuffer"), "{dis}");

    let features = Features {
        spirv_version: Features::SPIRV_1_3,
        ..Features::default()
    };
    let modern = translated(&program_with(fetch(VertexFormat::Int8x4)), features);
    let dis = disassemble(&modern);
    assert!(dis.contains("StorageBuffer"), "{dis}");
    assert!(!dis.contains("BufferBlock"), "{dis}");
}

#[test]
fn exponent_adjust_multiplies_by_a_power_of_two() {
    let mut instr = fetch(VertexFormat::Float32x2);
    instr.attributes.exp_adjust = 3;
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains(&float_bits(8.0)), "{dis}");
    assert!(dis.contains("OpVectorTimesScalar"), "{dis}");
}

#[test]
fn predicated_fetch_is_guarded() {
    let mut instr = fetch(VertexFormat::Float32x4);
    instr.is_predicated = true;
    instr.predicate_condition = true;
    let words = translated(&program_with(instr), Features::default());
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert_eq!(dis.matches("OpBranchConditional").count(), 1, "{dis}");
}
