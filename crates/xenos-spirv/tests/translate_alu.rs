//! Vector ALU lowering: the guest multiply rule, NaN-exact max/min,
//! dot product summation, predicate setters, kills.

use pretty_assertions::assert_eq;
use rspirv::binary::Disassemble;
use xenos_spirv::{translate, Features, TranslateError};
use xenos_ucode::{
    AluInstruction, AluVectorOp, Comp, ExecCondition, ExecInstruction, Instruction, Operand,
    ResultInfo, ShaderProgram, ShaderStage, Swizzle, WriteMask,
};

fn alu(op: AluVectorOp, operands: Vec<Operand>, result: ResultInfo) -> Instruction {
    Instruction::Alu(AluInstruction::new(op, operands, result))
}

fn program_with(stage: ShaderStage, instruction: Instruction) -> ShaderProgram {
    let block = ExecInstruction {
        condition: ExecCondition::Unconditional,
        instruction_count: 1,
        ends_shader: true,
    };
    ShaderProgram::new(
        stage,
        vec![
            Instruction::ExecBegin(block),
            instruction,
            Instruction::ExecEnd(block),
        ],
    )
}

fn translated(program: &ShaderProgram) -> Vec<u32> {
    program.validate().expect("test program should validate");
    translate(program, Features::default()).expect("translation should succeed")
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

fn float_bits(value: f32) -> String {
    value.to_bits().to_string()
}

#[test]
fn multiply_guards_zero_times_anything() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Mul,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpFMul"), "{dis}");
    // A zero factor forces +0 through a select, never the raw product.
    assert!(dis.contains("OpFOrdEqual"), "{dis}");
    assert!(dis.contains("OpSelect"), "{dis}");
    assert!(dis.contains("NoContraction"), "{dis}");
}

#[test]
fn squaring_skips_the_zero_guard() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Mul,
            vec![Operand::register(0), Operand::register(0)],
            ResultInfo::register(1),
        ),
    );
    let dis = disassemble(&translated(&program));
    assert!(dis.contains("OpFMul"), "{dis}");
    assert!(!dis.contains("OpSelect"), "{dis}");
}

#[test]
fn max_of_identical_operands_is_a_move() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Max,
            vec![Operand::register(0), Operand::register(0)],
            ResultInfo::register(1),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(!dis.contains("OpSelect"), "{dis}");
    assert!(!dis.contains("OpFOrdGreaterThanEqual"), "{dis}");
}

#[test]
fn max_and_min_select_explicitly() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Max,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2),
        ),
    );
    let dis = disassemble(&translated(&program));
    assert!(dis.contains("OpFOrdGreaterThanEqual"), "{dis}");
    assert!(dis.contains("OpSelect"), "{dis}");

    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Min,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2),
        ),
    );
    let dis = disassemble(&translated(&program));
    assert!(dis.contains("OpFOrdLessThan"), "{dis}");
}

#[test]
fn mixed_identical_lanes_only_select_the_different_ones() {
    // y and w read the same lane on both operands, x and z differ.
    let swizzled = Operand::register(0).with_swizzle(Swizzle([
        Comp::Y,
        Comp::Y,
        Comp::X,
        Comp::W,
    ]));
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Max,
            vec![Operand::register(0), swizzled],
            ResultInfo::register(1),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpSelect"), "{dis}");
    // The identical lanes are shuffled back in over the select result.
    assert!(dis.contains("OpVectorShuffle"), "{dis}");
}

#[test]
fn sne_compares_unordered() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Sne,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2),
        ),
    );
    let dis = disassemble(&translated(&program));
    assert!(dis.contains("OpFUnordNotEqual"), "{dis}");
}

#[test]
fn dp4_sums_left_to_right() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Dp4,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(!dis.contains("OpDot"), "{dis}");
    assert!(dis.contains("OpCompositeExtract"), "{dis}");
    assert_eq!(dis.matches("OpFAdd").count(), 3, "{dis}");
}

#[test]
fn dp2add_appends_the_third_operand() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Dp2Add,
            vec![
                Operand::register(0),
                Operand::register(1),
                Operand::register(2),
            ],
            ResultInfo::register(3),
        ),
    );
    let dis = disassemble(&translated(&program));
    // One add for the two lanes, one for the addend.
    assert_eq!(dis.matches("OpFAdd").count(), 2, "{dis}");
}

#[test]
fn mad_adds_plainly_after_the_guarded_product() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Mad,
            vec![
                Operand::register(0),
                Operand::register(1),
                Operand::register(2),
            ],
            ResultInfo::register(3),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpSelect"), "{dis}");
    assert_eq!(dis.matches("OpFAdd").count(), 1, "{dis}");
}

#[test]
fn maxa_clamps_and_stores_the_address_register() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::MaxA,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpConvertFToS"), "{dis}");
    assert!(dis.contains(&float_bits(-256.0)), "{dis}");
    assert!(dis.contains(&float_bits(255.0)), "{dis}");
}

#[test]
fn setp_push_writes_predicate_and_biased_result() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::SetpGePush,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    // One conjunction for the predicate, one for the result select.
    assert_eq!(dis.matches("OpLogicalAnd").count(), 2, "{dis}");
    assert!(dis.contains(&float_bits(-1.0)), "{dis}");
}

#[test]
fn kill_discards_in_the_pixel_stage_only() {
    let kill = alu(
        AluVectorOp::KillGt,
        vec![Operand::register(0), Operand::register(1)],
        ResultInfo::register(2),
    );
    let pixel = program_with(ShaderStage::Pixel, kill.clone());
    let words = translated(&pixel);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpAny"), "{dis}");
    assert!(dis.contains("OpKill"), "{dis}");

    let vertex = program_with(ShaderStage::Vertex, kill);
    let dis = disassemble(&translated(&vertex));
    assert!(!dis.contains("OpKill"), "{dis}");
}

#[test]
fn conditional_selects_on_the_first_operand() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::CndGe,
            vec![
                Operand::register(0),
                Operand::register(1),
                Operand::register(2),
            ],
            ResultInfo::register(3),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("OpFOrdGreaterThanEqual"), "{dis}");
    assert!(dis.contains("OpSelect"), "{dis}");
}

#[test]
fn empty_write_mask_skips_pure_operations() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Max,
            vec![Operand::register(0), Operand::register(1)],
            ResultInfo::register(2).with_mask(WriteMask::empty()),
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(!dis.contains("OpFOrdGreaterThanEqual"), "{dis}");
}

#[test]
fn saturated_results_clamp_through_nan() {
    let mut result = ResultInfo::register(1);
    result.saturate = true;
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Add,
            vec![Operand::register(0), Operand::register(0)],
            result,
        ),
    );
    let words = translated(&program);
    validate_with_naga(&words);
    let dis = disassemble(&words);
    assert!(dis.contains("NClamp"), "{dis}");
}

#[test]
fn float_constant_operand_without_a_bank_is_rejected() {
    let program = program_with(
        ShaderStage::Vertex,
        alu(
            AluVectorOp::Add,
            vec![Operand::float_constant(0), Operand::register(0)],
            ResultInfo::register(1),
        ),
    );
    // Skips stream validation on purpose: the translator must reject
    // this on its own.
    assert!(matches!(
        translate(&program, Features::default()),
        Err(TranslateError::Unsupported { record: 1, .. })
    ));
}
