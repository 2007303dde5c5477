//! End-to-end pipeline tests: build code, install it through the runtime,
//! and (on a matching host) call it.
//!
//! Byte-level assertions run on every host; execution is gated on the
//! target architecture actually being the host architecture.

use opforge_codegen::ir::{AbiType, Builder, InstOptions, Operand, RegClass, Signature};
use opforge_codegen::isa::x64::{self, regs as xr, AluOp, Assembler as X64Assembler};
use opforge_codegen::isa::{aarch64, IsaInfo};
use opforge_codegen::{
    regalloc, serialize, Arch, CallConv, CodeHolder, CodegenResult, Cond, Environment, Platform,
};
use opforge_jit::JitRuntime;

fn sysv_env() -> Environment {
    Environment::new(Arch::X64, Platform::Linux)
}

fn win64_env() -> Environment {
    Environment::new(Arch::X64, Platform::Windows)
}

fn a64_env() -> Environment {
    Environment::new(Arch::Aarch64, Platform::Linux)
}

/// `mov rax, rcx; ret` must produce exactly `48 89 C8 C3`.
#[test]
fn identity_function_bytes() -> CodegenResult<()> {
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    asm.mov_rr(xr::gpr(xr::RAX), xr::gpr(xr::RCX))?;
    asm.ret()?;
    let image = holder.finalize()?;
    assert_eq!(image.bytes(), &[0x48, 0x89, 0xC8, 0xC3]);
    Ok(())
}

/// The identity function returns its argument under the host convention.
#[test]
#[cfg(all(target_arch = "x86_64", unix))]
fn identity_function_executes() -> anyhow::Result<()> {
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    asm.mov_rr(xr::gpr(xr::RAX), xr::gpr(xr::RDI))?;
    asm.ret()?;
    let rt = JitRuntime::new();
    let handle = rt.add(holder)?;
    let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(handle.address()) };
    assert_eq!(f(0), 0);
    assert_eq!(f(42), 42);
    assert_eq!(f(u64::MAX), u64::MAX);
    Ok(())
}

/// `mov rax, rdi; add rax, rsi; ret`, byte-exact.
#[test]
fn add_function_bytes() -> CodegenResult<()> {
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    asm.mov_rr(xr::gpr(xr::RAX), xr::gpr(xr::RDI))?;
    asm.alu_rr(AluOp::Add, xr::gpr(xr::RAX), xr::gpr(xr::RSI))?;
    asm.ret()?;
    let image = holder.finalize()?;
    assert_eq!(
        image.bytes(),
        &[0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3]
    );
    Ok(())
}

#[test]
#[cfg(all(target_arch = "x86_64", unix))]
fn add_function_executes() -> anyhow::Result<()> {
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    asm.mov_rr(xr::gpr(xr::RAX), xr::gpr(xr::RDI))?;
    asm.alu_rr(AluOp::Add, xr::gpr(xr::RAX), xr::gpr(xr::RSI))?;
    asm.ret()?;
    let rt = JitRuntime::new();
    let handle = rt.add(holder)?;
    let f: extern "C" fn(u64, u64) -> u64 = unsafe { std::mem::transmute(handle.address()) };
    assert_eq!(f(5, 3), 8);
    assert_eq!(f(100, 200), 300);
    Ok(())
}

/// Build a branch diamond returning 1 for a zero argument, 0 otherwise.
fn build_branch_diamond(holder: &mut CodeHolder, arg: u8) -> CodegenResult<()> {
    let mut asm = X64Assembler::new(holder);
    let zero_case = asm.holder().new_label();
    let end = asm.holder().new_label();
    asm.alu_rr(AluOp::Xor, xr::gpr32(xr::RAX), xr::gpr32(xr::RAX))?;
    asm.test_rr(xr::gpr(arg), xr::gpr(arg))?;
    asm.jcc(Cond::Eq, zero_case, false)?;
    asm.mov_ri(xr::gpr32(xr::RAX), 0)?;
    asm.jmp_label(end, false)?;
    asm.holder().bind_label(zero_case)?;
    asm.mov_ri(xr::gpr32(xr::RAX), 1)?;
    asm.holder().bind_label(end)?;
    asm.ret()?;
    Ok(())
}

/// The forward `je` resolves to a positive rel32 that fits its field.
#[test]
fn forward_branch_fixup_resolves() -> CodegenResult<()> {
    let mut holder = CodeHolder::new(win64_env());
    build_branch_diamond(&mut holder, xr::RCX)?;
    let image = holder.finalize()?;
    // xor eax,eax (2) + test rcx,rcx (3) put the je at offset 5; its rel32
    // skips the `mov eax, 0; jmp end` pair (10 bytes).
    assert_eq!(image.bytes()[5], 0x0F);
    assert_eq!(image.bytes()[6], 0x84);
    let disp = i32::from_le_bytes(image.bytes()[7..11].try_into().unwrap());
    assert_eq!(disp, 10);
    assert!(disp > 0);
    Ok(())
}

#[test]
#[cfg(all(target_arch = "x86_64", unix))]
fn branch_diamond_executes() -> anyhow::Result<()> {
    let mut holder = CodeHolder::new(sysv_env());
    build_branch_diamond(&mut holder, xr::RDI)?;
    let rt = JitRuntime::new();
    let handle = rt.add(holder)?;
    let f: extern "C" fn(u64) -> u64 = unsafe { std::mem::transmute(handle.address()) };
    assert_eq!(f(0), 1);
    assert_eq!(f(1), 0);
    assert_eq!(f(u64::MAX), 0);
    Ok(())
}

/// Build a function with twenty simultaneously-live virtual registers
/// summed into one.
fn build_pressured_sum() -> CodegenResult<(Builder, opforge_codegen::isa::FrameLayout)> {
    let mut b = Builder::new();
    let sig = Signature {
        params: vec![],
        ret: Some(AbiType::I64),
        call_conv: CallConv::SystemV,
    };
    b.func_begin(sig, &[])?;
    let vregs: Vec<_> = (0..20).map(|_| b.new_vreg(RegClass::Gpr, 8)).collect();
    for (i, &v) in vregs.iter().enumerate() {
        b.inst(
            x64::InstId::Mov,
            [Operand::from(v), Operand::imm(i as i64 + 1)],
            InstOptions::default(),
        );
    }
    for &v in &vregs[1..] {
        b.inst(
            x64::InstId::Add,
            [Operand::from(vregs[0]), Operand::from(v)],
            InstOptions::default(),
        );
    }
    b.inst(
        x64::InstId::Mov,
        [
            Operand::from(xr::gpr(xr::RAX)),
            Operand::from(vregs[0]),
        ],
        InstOptions::default(),
    );
    b.inst(x64::InstId::Ret, [], InstOptions::default());
    b.func_end()?;
    let frames = regalloc::run(&mut b, &x64::X64)?;
    Ok((b, frames.into_iter().next().unwrap()))
}

/// Under that pressure the allocator must spill into 8-byte-aligned slots
/// and use (hence preserve) callee-saved registers.
#[test]
fn register_pressure_spills() -> CodegenResult<()> {
    let (b, frame) = build_pressured_sum()?;
    assert!(
        frame.spill_size >= 6 * 8,
        "expected at least six spill slots, got {} bytes",
        frame.spill_size
    );
    assert_eq!(frame.spill_size % 8, 0);
    assert!(!frame.preserved_gprs.is_empty());

    // After allocation no instruction node references a virtual register.
    for node in b.iter() {
        if let opforge_codegen::ir::NodeData::Inst(inst) = b.data(node) {
            for op in &inst.operands {
                assert!(
                    !matches!(op, Operand::Virt(_)),
                    "virtual operand survived allocation"
                );
                if let Operand::Mem(mem) = op {
                    assert!(!matches!(
                        mem.base,
                        Some(opforge_codegen::ir::RegOperand::Virt(_))
                    ));
                }
            }
        }
    }

    // Every preserved register really is callee-saved under SysV.
    for &enc in &frame.preserved_gprs {
        assert!(x64::X64.is_callee_saved(CallConv::SystemV, RegClass::Gpr, enc));
    }
    Ok(())
}

#[test]
#[cfg(all(target_arch = "x86_64", unix))]
fn register_pressure_executes() -> anyhow::Result<()> {
    let (b, _frame) = build_pressured_sum()?;
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    serialize::serialize(&b, &mut asm)?;
    let rt = JitRuntime::new();
    let handle = rt.add(holder)?;
    let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(handle.address()) };
    assert_eq!(f(), (1..=20).sum::<u64>());
    Ok(())
}

/// Build a counted AArch64 sum loop through the builder and serializer.
fn build_sum_loop() -> CodegenResult<CodeHolder> {
    use aarch64::regs::xreg;
    let mut b = Builder::new();
    let top = b.new_label();
    b.inst(
        aarch64::InstId::MovZ,
        [Operand::from(xreg(0)), Operand::imm(0)],
        InstOptions::default(),
    );
    b.inst(
        aarch64::InstId::MovZ,
        [Operand::from(xreg(1)), Operand::imm(10)],
        InstOptions::default(),
    );
    b.bind(top);
    b.inst(
        aarch64::InstId::Add,
        [
            Operand::from(xreg(0)),
            Operand::from(xreg(0)),
            Operand::from(xreg(1)),
        ],
        InstOptions::default(),
    );
    b.inst(
        aarch64::InstId::Subs,
        [
            Operand::from(xreg(1)),
            Operand::from(xreg(1)),
            Operand::imm(1),
        ],
        InstOptions::default(),
    );
    b.inst(
        aarch64::InstId::Bcond,
        [Operand::from(top)],
        InstOptions::with_cond(Cond::Ne),
    );
    b.inst(aarch64::InstId::Ret, [], InstOptions::default());

    let mut holder = CodeHolder::new(a64_env());
    let mut asm = aarch64::Assembler::new(&mut holder);
    serialize::serialize(&b, &mut asm)?;
    Ok(holder)
}

/// Every emitted word is 4 bytes and the backward `b.ne` is a rel19.
#[test]
fn aarch64_loop_bytes() -> CodegenResult<()> {
    let holder = build_sum_loop()?;
    let image = holder.finalize()?;
    assert_eq!(image.len() % 4, 0);
    let words: Vec<u32> = image
        .bytes()
        .chunks(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(
        words,
        vec![
            0xD280_0000, // movz x0, #0
            0xD280_0141, // movz x1, #10
            0x8B01_0000, // add x0, x0, x1
            0xF100_0421, // subs x1, x1, #1
            0x54FF_FFC1, // b.ne -2 instructions
            0xD65F_03C0, // ret
        ]
    );
    Ok(())
}

#[test]
#[cfg(target_arch = "aarch64")]
fn aarch64_loop_executes() -> anyhow::Result<()> {
    let holder = build_sum_loop()?;
    let rt = JitRuntime::new();
    let handle = rt.add(holder)?;
    let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(handle.address()) };
    assert_eq!(f(), 55);
    Ok(())
}

/// A callee that clobbers every volatile register and leans on the
/// callee-saved set, invoked from a generated caller that plants canaries
/// in the callee-saved registers and verifies them afterwards.
#[test]
#[cfg(all(target_arch = "x86_64", unix))]
fn callee_saved_preservation_across_calls() -> anyhow::Result<()> {
    use opforge_codegen::ir::PhysReg;

    // The target: allocate eight live vregs while every caller-saved GPR is
    // explicitly clobbered, forcing the allocator into rbx/r12..r15.
    let mut b = Builder::new();
    let sig = Signature {
        params: vec![],
        ret: Some(AbiType::I64),
        call_conv: CallConv::SystemV,
    };
    b.func_begin(sig, &[])?;
    for enc in [xr::RAX, xr::RCX, xr::RDX, xr::RSI, xr::RDI, xr::R8, xr::R9] {
        b.inst(
            x64::InstId::Mov,
            [
                Operand::from(PhysReg::gpr(enc, 8)),
                Operand::imm(0x5A5A_5A5A),
            ],
            InstOptions::default(),
        );
    }
    let vregs: Vec<_> = (0..8).map(|_| b.new_vreg(RegClass::Gpr, 8)).collect();
    for (i, &v) in vregs.iter().enumerate() {
        b.inst(
            x64::InstId::Mov,
            [Operand::from(v), Operand::imm(i as i64)],
            InstOptions::default(),
        );
    }
    for &v in &vregs[1..] {
        b.inst(
            x64::InstId::Add,
            [Operand::from(vregs[0]), Operand::from(v)],
            InstOptions::default(),
        );
    }
    b.inst(
        x64::InstId::Mov,
        [Operand::from(xr::gpr(xr::RAX)), Operand::from(vregs[0])],
        InstOptions::default(),
    );
    b.inst(x64::InstId::Ret, [], InstOptions::default());
    b.func_end()?;
    let frames = regalloc::run(&mut b, &x64::X64)?;
    assert!(
        !frames[0].preserved_gprs.is_empty(),
        "the target must clobber callee-saved registers for this test to bite"
    );

    let rt = JitRuntime::new();
    let mut target_holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut target_holder);
    serialize::serialize(&b, &mut asm)?;
    let target = rt.add(target_holder)?;

    // The caller: save the callee-saved set for Rust's sake, plant
    // canaries, call the target, then check every canary.
    const CANARIES: [(u8, u64); 5] = [
        (xr::RBX, 0x1111_2222_3333_4441),
        (xr::R12, 0x5555_6666_7777_8882),
        (xr::R13, 0x9999_AAAA_BBBB_CCC3),
        (xr::R14, 0xDDDD_EEEE_FFFF_0004),
        (xr::R15, 0x1234_5678_9ABC_DEF5),
    ];
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    for (enc, _) in CANARIES {
        asm.push_r(xr::gpr(enc))?;
    }
    for (enc, canary) in CANARIES {
        asm.movabs(xr::gpr(enc), canary)?;
    }
    asm.movabs(xr::gpr(xr::RAX), target.address() as u64)?;
    asm.call_r(xr::gpr(xr::RAX))?;
    let fail = asm.holder().new_label();
    let done = asm.holder().new_label();
    asm.mov_ri(xr::gpr32(xr::RAX), 1)?;
    for (enc, canary) in CANARIES {
        asm.movabs(xr::gpr(xr::R10), canary)?;
        asm.alu_rr(AluOp::Cmp, xr::gpr(enc), xr::gpr(xr::R10))?;
        asm.jcc(Cond::Ne, fail, false)?;
    }
    asm.jmp_label(done, false)?;
    asm.holder().bind_label(fail)?;
    asm.mov_ri(xr::gpr32(xr::RAX), 0)?;
    asm.holder().bind_label(done)?;
    for (enc, _) in CANARIES.iter().rev() {
        asm.pop_r(xr::gpr(*enc))?;
    }
    asm.ret()?;

    let caller = rt.add(holder)?;
    let f: extern "C" fn() -> u64 = unsafe { std::mem::transmute(caller.address()) };
    assert_eq!(f(), 1, "a callee-saved register was clobbered across the call");
    Ok(())
}

/// After protection the installed bytes read back exactly as finalized.
#[test]
fn protected_image_matches() -> anyhow::Result<()> {
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    asm.mov_ri(xr::gpr32(xr::RAX), 7)?;
    asm.ret()?;
    let expected = {
        let mut h2 = CodeHolder::new(sysv_env());
        let mut a2 = X64Assembler::new(&mut h2);
        a2.mov_ri(xr::gpr32(xr::RAX), 7)?;
        a2.ret()?;
        h2.finalize()?.bytes().to_vec()
    };
    let rt = JitRuntime::new();
    let handle = rt.add(holder)?;
    assert_eq!(handle.bytes(), expected.as_slice());
    Ok(())
}

/// The pipeline cache is key-idempotent: repeated adds under one key
/// return pointer-identical handles.
#[test]
fn pipeline_cache_is_key_idempotent() -> anyhow::Result<()> {
    let build = || -> CodegenResult<CodeHolder> {
        let mut holder = CodeHolder::new(sysv_env());
        let mut asm = X64Assembler::new(&mut holder);
        asm.mov_ri(xr::gpr32(xr::RAX), 7)?;
        asm.ret()?;
        Ok(holder)
    };
    let rt = JitRuntime::new();
    let h1 = rt.add_cached("sevens", build()?)?;
    let h2 = rt.add_cached("sevens", build()?)?;
    assert_eq!(h1.address(), h2.address());

    let h3 = rt.add_cached("other", build()?)?;
    assert_ne!(h1.address(), h3.address());

    assert!(rt.drop_cached("sevens"));
    assert!(!rt.drop_cached("sevens"));
    // Outstanding handles keep the mapping alive after eviction.
    assert_eq!(h1.bytes(), h2.bytes());
    Ok(())
}

/// A function handle can cross threads and be called concurrently.
#[test]
#[cfg(all(target_arch = "x86_64", unix))]
fn handles_are_callable_across_threads() -> anyhow::Result<()> {
    let mut holder = CodeHolder::new(sysv_env());
    let mut asm = X64Assembler::new(&mut holder);
    asm.mov_rr(xr::gpr(xr::RAX), xr::gpr(xr::RDI))?;
    asm.alu_rr(AluOp::Add, xr::gpr(xr::RAX), xr::gpr(xr::RSI))?;
    asm.ret()?;
    let rt = JitRuntime::new();
    let handle = rt.add(holder)?;

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                opforge_jit::icache::pipeline_flush_mt();
                let f: extern "C" fn(u64, u64) -> u64 =
                    unsafe { std::mem::transmute(handle.address()) };
                f(i, i)
            })
        })
        .collect();
    for (i, t) in threads.into_iter().enumerate() {
        assert_eq!(t.join().unwrap(), 2 * i as u64);
    }
    Ok(())
}
