#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
#[cfg(not(target_arch = "wasm32"))]
use xenos_spirv::{translate, Features};
#[cfg(not(target_arch = "wasm32"))]
use xenos_ucode::{
    AluInstruction, AluVectorOp, ExecCondition, ExecInstruction, Instruction, JumpInstruction,
    LoopEndInstruction, LoopStartInstruction, Operand, ResultInfo, ShaderProgram, ShaderStage,
};

#[cfg(not(target_arch = "wasm32"))]
fn exec(condition: ExecCondition, instruction_count: u32, ends_shader: bool) -> ExecInstruction {
    ExecInstruction {
        condition,
        instruction_count,
        ends_shader,
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn mad(a: u32, b: u32, c: u32, dest: u32) -> Instruction {
    Instruction::Alu(AluInstruction::new(
        AluVectorOp::Mad,
        vec![
            Operand::register(a),
            Operand::float_constant(b),
            Operand::float_constant(c),
        ],
        ResultInfo::register(dest),
    ))
}

/// A straight run of fused multiply-adds, the shape most real vertex
/// shaders reduce to.
#[cfg(not(target_arch = "wasm32"))]
fn arithmetic_program(alu_count: u32) -> ShaderProgram {
    let mut instructions = Vec::new();
    let block = exec(ExecCondition::Unconditional, alu_count, true);
    instructions.push(Instruction::ExecBegin(block));
    for i in 0..alu_count {
        instructions.push(mad(i % 4, i % 8, (i + 1) % 8, (i % 4) + 4));
    }
    instructions.push(Instruction::ExecEnd(block));
    let mut program = ShaderProgram::new(ShaderStage::Vertex, instructions);
    program.float_constant_count = 8;
    program
}

/// A loop over a short body plus a predicate-guarded jump, to exercise
/// the pc switch and the nesting stacks.
#[cfg(not(target_arch = "wasm32"))]
fn control_flow_program() -> ShaderProgram {
    let body = exec(ExecCondition::Unconditional, 2, false);
    let tail = exec(ExecCondition::Unconditional, 1, true);
    let mut program = ShaderProgram::new(
        ShaderStage::Vertex,
        vec![
            Instruction::LoopStart(LoopStartInstruction {
                loop_constant_index: 3,
                is_repeat: false,
                skip_address: 9,
            }),
            Instruction::Label { address: 4 },
            Instruction::ExecBegin(body),
            mad(0, 0, 1, 1),
            mad(1, 2, 3, 2),
            Instruction::ExecEnd(body),
            Instruction::LoopEnd(LoopEndInstruction {
                loop_constant_index: 3,
                is_predicated_break: false,
                predicate_condition: false,
                body_address: 4,
            }),
            Instruction::Label { address: 9 },
            Instruction::Jump(JumpInstruction {
                condition: ExecCondition::Predicate { value: false },
                target_address: 11,
            }),
            Instruction::Label { address: 11 },
            Instruction::ExecBegin(tail),
            mad(2, 4, 5, 3),
            Instruction::ExecEnd(tail),
        ],
    );
    program.float_constant_count = 8;
    program
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("xenos_spirv_translate");

    for alu_count in [16u32, 128] {
        let program = arithmetic_program(alu_count);
        program.validate().expect("bench program should validate");
        group.bench_with_input(
            BenchmarkId::new("arithmetic", alu_count),
            &program,
            |b, program| {
                b.iter(|| {
                    let words = translate(black_box(program), Features::default())
                        .expect("bench program should translate");
                    black_box(words.len());
                })
            },
        );
    }

    let program = control_flow_program();
    program.validate().expect("bench program should validate");
    group.bench_with_input(
        BenchmarkId::new("control_flow", "loop_and_jump"),
        &program,
        |b, program| {
            b.iter(|| {
                let words = translate(black_box(program), Features::default())
                    .expect("bench program should translate");
                black_box(words.len());
            })
        },
    );

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group!(benches, bench_translate);
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
