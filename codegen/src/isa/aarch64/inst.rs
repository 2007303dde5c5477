//! AArch64 instruction ids and their static metadata.

use crate::features::CpuFeature;
use crate::ir::{InstInfo, OpUse};
use crate::isa::declare_inst_ids;

declare_inst_ids! {
    /// Dense AArch64 instruction ids. Addressing forms (scaled/unscaled/
    /// pre/post-index) that change instruction layout get their own ids; the
    /// rest of the shape is carried by the operands.
    InstId {
        // Moves and constants.
        MovZ,
        MovN,
        MovK,
        Mov,
        // Integer arithmetic.
        Add,
        Sub,
        Adds,
        Subs,
        Cmp,
        Cmn,
        And,
        Orr,
        Eor,
        Ands,
        Madd,
        Msub,
        Mul,
        Sdiv,
        Udiv,
        Lsl,
        Lsr,
        Asr,
        Ror,
        Csel,
        Csinc,
        Cset,
        // Loads and stores.
        Ldr,
        Str,
        Ldrb,
        Strb,
        Ldrh,
        Strh,
        Ldrsw,
        Ldur,
        Stur,
        Ldp,
        Stp,
        StpPre,
        LdpPost,
        StrPre,
        LdrPost,
        LdrLit,
        // Branches.
        B,
        Bl,
        Bcond,
        Cbz,
        Cbnz,
        Tbz,
        Tbnz,
        Br,
        Blr,
        Ret,
        // Misc.
        Nop,
        Brk,
        Udf,
        // Scalar floating point (NEON baseline).
        Fmov,
        Fadd,
        Fsub,
        Fmul,
        Fdiv,
        Fcmp,
        Scvtf,
        Ucvtf,
        Fcvtzs,
        Fcvtzu,
        // Vector integer.
        AddV,
        SubV,
        OrrV,
        Movi,
    }
}

const W_R: &[OpUse] = &[OpUse::Write, OpUse::Read];
const W_R_R: &[OpUse] = &[OpUse::Write, OpUse::Read, OpUse::Read];
const W_R_R_R: &[OpUse] = &[OpUse::Write, OpUse::Read, OpUse::Read, OpUse::Read];
const R_R: &[OpUse] = &[OpUse::Read, OpUse::Read];
const RW_R: &[OpUse] = &[OpUse::ReadWrite, OpUse::Read];
const R: &[OpUse] = &[OpUse::Read];
const W: &[OpUse] = &[OpUse::Write];
const W_W_R: &[OpUse] = &[OpUse::Write, OpUse::Write, OpUse::Read];
const R_R_R: &[OpUse] = &[OpUse::Read, OpUse::Read, OpUse::Read];
const NONE: &[OpUse] = &[];

impl InstId {
    /// Static use/def information for this opcode.
    pub fn info(self) -> InstInfo {
        use InstId::*;
        let (name, uses): (&'static str, &'static [OpUse]) = match self {
            MovZ => ("movz", W_R),
            MovN => ("movn", W_R),
            // movk inserts into the existing value.
            MovK => ("movk", RW_R),
            Mov => ("mov", W_R),
            Add => ("add", W_R_R),
            Sub => ("sub", W_R_R),
            Adds => ("adds", W_R_R),
            Subs => ("subs", W_R_R),
            Cmp => ("cmp", R_R),
            Cmn => ("cmn", R_R),
            And => ("and", W_R_R),
            Orr => ("orr", W_R_R),
            Eor => ("eor", W_R_R),
            Ands => ("ands", W_R_R),
            Madd => ("madd", W_R_R_R),
            Msub => ("msub", W_R_R_R),
            Mul => ("mul", W_R_R),
            Sdiv => ("sdiv", W_R_R),
            Udiv => ("udiv", W_R_R),
            Lsl => ("lsl", W_R_R),
            Lsr => ("lsr", W_R_R),
            Asr => ("asr", W_R_R),
            Ror => ("ror", W_R_R),
            Csel => ("csel", W_R_R),
            Csinc => ("csinc", W_R_R),
            Cset => ("cset", W),
            Ldr => ("ldr", W_R),
            Str => ("str", R_R),
            Ldrb => ("ldrb", W_R),
            Strb => ("strb", R_R),
            Ldrh => ("ldrh", W_R),
            Strh => ("strh", R_R),
            Ldrsw => ("ldrsw", W_R),
            Ldur => ("ldur", W_R),
            Stur => ("stur", R_R),
            Ldp => ("ldp", W_W_R),
            Stp => ("stp", R_R_R),
            StpPre => ("stp", R_R_R),
            LdpPost => ("ldp", W_W_R),
            StrPre => ("str", R_R),
            LdrPost => ("ldr", W_R),
            LdrLit => ("ldr", W_R),
            B => ("b", R),
            Bl => ("bl", R),
            Bcond => ("b.cond", R),
            Cbz => ("cbz", R_R),
            Cbnz => ("cbnz", R_R),
            Tbz => ("tbz", R_R_R),
            Tbnz => ("tbnz", R_R_R),
            Br => ("br", R),
            Blr => ("blr", R),
            Ret => ("ret", NONE),
            Nop => ("nop", NONE),
            Brk => ("brk", R),
            Udf => ("udf", NONE),
            Fmov => ("fmov", W_R),
            Fadd => ("fadd", W_R_R),
            Fsub => ("fsub", W_R_R),
            Fmul => ("fmul", W_R_R),
            Fdiv => ("fdiv", W_R_R),
            Fcmp => ("fcmp", R_R),
            Scvtf => ("scvtf", W_R),
            Ucvtf => ("ucvtf", W_R),
            Fcvtzs => ("fcvtzs", W_R),
            Fcvtzu => ("fcvtzu", W_R),
            AddV => ("add", W_R_R),
            SubV => ("sub", W_R_R),
            OrrV => ("orr", W_R_R),
            Movi => ("movi", W_R),
        };
        InstInfo {
            name,
            uses,
            implicit_gprs: &[],
            is_ret: self == Ret,
            is_call: matches!(self, Bl | Blr),
        }
    }

    /// The CPU extension this opcode is gated on, beyond the NEON baseline.
    pub fn feature(self) -> Option<CpuFeature> {
        None
    }
}
