//! Instruction model and register taxonomy for the ARM backend subset the
//! allocator inspects.

use std::collections::BTreeSet;
use std::fmt;

use smallvec::SmallVec;

/// A register id. Ids are dense: physical registers occupy low, fixed
/// ranges and virtual registers a disjoint high range.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(u32);

const GP_START: u32 = 0;
const DOUBLE_START: u32 = 16;
const QUAD_START: u32 = 48;
const VIRT_GP_START: u32 = 64;
const VIRT_DOUBLE_START: u32 = 1 << 31;
const VIRT_QUAD_START: u32 = 0xC000_0000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterKind {
    GeneralPurpose,
    DoubleVector,
    QuadVector,
    VirtualGeneralPurpose,
    VirtualDoubleVector,
    VirtualQuadVector,
}

impl Reg {
    pub const fn gp(num: u32) -> Reg {
        Reg(GP_START + num)
    }

    pub const fn virt(num: u32) -> Reg {
        Reg(VIRT_GP_START + num)
    }

    pub fn new(kind: RegisterKind, num: u32) -> Reg {
        match kind {
            RegisterKind::GeneralPurpose => Reg(GP_START + num),
            RegisterKind::DoubleVector => Reg(DOUBLE_START + num),
            RegisterKind::QuadVector => Reg(QUAD_START + num),
            RegisterKind::VirtualGeneralPurpose => Reg(VIRT_GP_START + num),
            RegisterKind::VirtualDoubleVector => Reg(VIRT_DOUBLE_START + num),
            RegisterKind::VirtualQuadVector => Reg(VIRT_QUAD_START + num),
        }
    }

    pub fn kind(self) -> RegisterKind {
        if self.0 < DOUBLE_START {
            RegisterKind::GeneralPurpose
        } else if self.0 < QUAD_START {
            RegisterKind::DoubleVector
        } else if self.0 < VIRT_GP_START {
            RegisterKind::QuadVector
        } else if self.0 < VIRT_DOUBLE_START {
            RegisterKind::VirtualGeneralPurpose
        } else if self.0 < VIRT_QUAD_START {
            RegisterKind::VirtualDoubleVector
        } else {
            RegisterKind::VirtualQuadVector
        }
    }

    /// The register number within its kind (`r4` and `d4` both yield 4).
    pub fn num(self) -> u32 {
        match self.kind() {
            RegisterKind::GeneralPurpose => self.0 - GP_START,
            RegisterKind::DoubleVector => self.0 - DOUBLE_START,
            RegisterKind::QuadVector => self.0 - QUAD_START,
            RegisterKind::VirtualGeneralPurpose => self.0 - VIRT_GP_START,
            RegisterKind::VirtualDoubleVector => self.0 - VIRT_DOUBLE_START,
            RegisterKind::VirtualQuadVector => self.0 - VIRT_QUAD_START,
        }
    }

    pub fn is_virtual(self) -> bool {
        self.0 >= VIRT_GP_START
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if *self == REG_SP {
            return write!(fmt, "sp");
        } else if *self == REG_LR {
            return write!(fmt, "lr");
        } else if *self == REG_PC {
            return write!(fmt, "pc");
        }
        match self.kind() {
            RegisterKind::GeneralPurpose => write!(fmt, "r{}", self.num()),
            RegisterKind::DoubleVector => write!(fmt, "d{}", self.num()),
            RegisterKind::QuadVector => write!(fmt, "q{}", self.num()),
            RegisterKind::VirtualGeneralPurpose => write!(fmt, "v{}", self.num()),
            RegisterKind::VirtualDoubleVector => write!(fmt, "vd{}", self.num()),
            RegisterKind::VirtualQuadVector => write!(fmt, "vq{}", self.num()),
        }
    }
}

pub const REG_FP: Reg = Reg::gp(11);
pub const REG_SCRATCH: Reg = Reg::gp(12);
pub const REG_SP: Reg = Reg::gp(13);
pub const REG_LR: Reg = Reg::gp(14);
pub const REG_PC: Reg = Reg::gp(15);

/// Callee-saved registers handed out by the graph-coloring assignment; the
/// color index of the coloring pass indexes directly into this array.
pub const GLOB_REGS: [Reg; 7] = [
    Reg::gp(4),
    Reg::gp(5),
    Reg::gp(6),
    Reg::gp(7),
    Reg::gp(8),
    Reg::gp(9),
    Reg::gp(10),
];

/// Caller-saved registers preferred for call-free transients.
pub const TEMP_REGS: [Reg; 4] = [Reg::gp(0), Reg::gp(1), Reg::gp(2), Reg::gp(3)];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionCode {
    Equal,
    NotEqual,
    CarrySet,
    CarryClear,
    UnsignedGe,
    UnsignedLe,
    UnsignedGt,
    UnsignedLt,
    MinusOrNegative,
    PositiveOrZero,
    Overflow,
    NoOverflow,
    Ge,
    Lt,
    Gt,
    Le,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Nop,
    B,
    Bl,
    Bx,
    Mov,
    MovT,
    Mvn,
    Add,
    Sub,
    Rsb,
    Mul,
    Mla,
    SDiv,
    Lsl,
    Lsr,
    Asr,
    And,
    Orr,
    Eor,
    Bic,
    Cmp,
    Cmn,
    LdR,
    LdM,
    StR,
    StM,
    Push,
    Pop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
    Rrx,
}

/// A register operand with an optional barrel-shifter application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterOperand {
    pub reg: Reg,
    pub shift: ShiftKind,
    pub shift_amount: u8,
}

impl RegisterOperand {
    pub fn plain(reg: Reg) -> RegisterOperand {
        RegisterOperand { reg, shift: ShiftKind::Lsl, shift_amount: 0 }
    }
}

/// The flexible second operand of data-processing instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand2 {
    Reg(RegisterOperand),
    Imm(i32),
}

impl Operand2 {
    pub fn reg(reg: Reg) -> Operand2 {
        Operand2::Reg(RegisterOperand::plain(reg))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressMode {
    Offset,
    PreIndex,
    PostIndex,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemOffset {
    Imm(i32),
    Reg(RegisterOperand),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryOperand {
    pub base: Reg,
    pub offset: MemOffset,
    pub mode: AddressMode,
    pub neg_index: bool,
}

impl MemoryOperand {
    pub fn offset(base: Reg, offset: i32) -> MemoryOperand {
        MemoryOperand {
            base,
            offset: MemOffset::Imm(offset),
            mode: AddressMode::Offset,
            neg_index: false,
        }
    }

    pub fn sp_offset(offset: i32) -> MemoryOperand {
        MemoryOperand::offset(REG_SP, offset)
    }
}

/// The memory argument of a load/store: either a direct address operand or a
/// literal-pool label resolved later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mem {
    Label(String),
    Offset(MemoryOperand),
}

/// Control pseudo-instructions threaded through the stream by earlier passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtrlOp {
    /// Adjusts the allocator's view of the dynamic SP offset, modelling
    /// transient stack allocations such as argument pushes.
    StackOffset(i32),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Inst {
    Pure {
        op: OpCode,
        cond: ConditionCode,
    },
    Arith2 {
        op: OpCode,
        r1: Reg,
        r2: Operand2,
        cond: ConditionCode,
    },
    Arith3 {
        op: OpCode,
        rd: Reg,
        r1: Reg,
        r2: Operand2,
        cond: ConditionCode,
    },
    Arith4 {
        op: OpCode,
        rd: Reg,
        r1: Reg,
        r2: Reg,
        r3: Reg,
        cond: ConditionCode,
    },
    Branch {
        op: OpCode,
        target: String,
        param_cnt: usize,
        cond: ConditionCode,
    },
    LoadStore {
        op: OpCode,
        rd: Reg,
        mem: Mem,
        cond: ConditionCode,
    },
    MultLoadStore {
        op: OpCode,
        rn: Reg,
        regs: SmallVec<[Reg; 8]>,
        cond: ConditionCode,
    },
    PushPop {
        op: OpCode,
        regs: BTreeSet<Reg>,
        cond: ConditionCode,
    },
    Label(String),
    Ctrl {
        op: CtrlOp,
        cond: ConditionCode,
    },
}

impl Inst {
    pub fn cond(&self) -> ConditionCode {
        match self {
            Inst::Pure { cond, .. }
            | Inst::Arith2 { cond, .. }
            | Inst::Arith3 { cond, .. }
            | Inst::Arith4 { cond, .. }
            | Inst::Branch { cond, .. }
            | Inst::LoadStore { cond, .. }
            | Inst::MultLoadStore { cond, .. }
            | Inst::PushPop { cond, .. }
            | Inst::Ctrl { cond, .. } => *cond,
            Inst::Label(_) => ConditionCode::Always,
        }
    }

    pub fn load(rd: Reg, mem: MemoryOperand, cond: ConditionCode) -> Inst {
        Inst::LoadStore { op: OpCode::LdR, rd, mem: Mem::Offset(mem), cond }
    }

    pub fn store(rd: Reg, mem: MemoryOperand, cond: ConditionCode) -> Inst {
        Inst::LoadStore { op: OpCode::StR, rd, mem: Mem::Offset(mem), cond }
    }
}

/// An assembly function as handed over by instruction lowering: the entry
/// `PUSH {FP, LR}` / frame-pointer save and the symmetric exit sequence are
/// already in place, with empty register lists to be finalized here.
#[derive(Clone, Debug)]
pub struct Function {
    pub name: String,
    pub param_count: usize,
    pub stack_size: u32,
    pub inst: Vec<Inst>,
}

/// A lowered translation unit.
#[derive(Clone, Debug, Default)]
pub struct ArmCode {
    pub functions: Vec<Function>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_kinds() {
        assert_eq!(Reg::gp(0).kind(), RegisterKind::GeneralPurpose);
        assert_eq!(Reg::gp(15).kind(), RegisterKind::GeneralPurpose);
        assert_eq!(Reg::new(RegisterKind::DoubleVector, 0).kind(), RegisterKind::DoubleVector);
        assert_eq!(Reg::new(RegisterKind::QuadVector, 15).kind(), RegisterKind::QuadVector);
        assert_eq!(Reg::virt(0).kind(), RegisterKind::VirtualGeneralPurpose);
        assert_eq!(
            Reg::new(RegisterKind::VirtualDoubleVector, 3).kind(),
            RegisterKind::VirtualDoubleVector
        );
    }

    #[test]
    fn virtuality_boundary() {
        assert!(!Reg::gp(15).is_virtual());
        assert!(!Reg::new(RegisterKind::QuadVector, 15).is_virtual());
        assert!(Reg::virt(0).is_virtual());
        assert!(Reg::virt(1 << 20).is_virtual());
    }

    #[test]
    fn register_numbers_round_trip() {
        for kind in [
            RegisterKind::GeneralPurpose,
            RegisterKind::DoubleVector,
            RegisterKind::QuadVector,
            RegisterKind::VirtualGeneralPurpose,
        ]
        .iter()
        {
            let r = Reg::new(*kind, 7);
            assert_eq!(r.kind(), *kind);
            assert_eq!(r.num(), 7);
        }
    }

    #[test]
    fn allocatable_sets_exclude_reserved_roles() {
        for r in GLOB_REGS.iter() {
            assert!(!TEMP_REGS.contains(r));
        }
        for r in GLOB_REGS.iter().chain(TEMP_REGS.iter()) {
            assert_ne!(*r, REG_SP);
            assert_ne!(*r, REG_LR);
            assert_ne!(*r, REG_PC);
            assert_ne!(*r, REG_FP);
            assert_ne!(*r, REG_SCRATCH);
        }
    }

    #[test]
    fn debug_names() {
        assert_eq!(format!("{:?}", Reg::gp(4)), "r4");
        assert_eq!(format!("{:?}", REG_SP), "sp");
        assert_eq!(format!("{:?}", REG_LR), "lr");
        assert_eq!(format!("{:?}", REG_PC), "pc");
        assert_eq!(format!("{:?}", Reg::virt(100)), "v100");
    }
}
