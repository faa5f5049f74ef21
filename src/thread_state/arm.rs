//! 32-bit ARM register file description.

/// General-purpose registers of a 32-bit ARM thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
    Cpsr,
}

pub(crate) const REG_COUNT: usize = 17;

/// Every register, in storage order.
pub(crate) const ALL: [Reg; REG_COUNT] = [
    Reg::R0,
    Reg::R1,
    Reg::R2,
    Reg::R3,
    Reg::R4,
    Reg::R5,
    Reg::R6,
    Reg::R7,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::Sp,
    Reg::Lr,
    Reg::Pc,
    Reg::Cpsr,
];

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Self::R0 => "r0",
            Self::R1 => "r1",
            Self::R2 => "r2",
            Self::R3 => "r3",
            Self::R4 => "r4",
            Self::R5 => "r5",
            Self::R6 => "r6",
            Self::R7 => "r7",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::Sp => "sp",
            Self::Lr => "lr",
            Self::Pc => "pc",
            Self::Cpsr => "cpsr",
        }
    }
}

/// GP registers defined as callee-preserved, per Apple's iOS ARM function
/// call guide, plus SP and the return-address/instruction registers.
pub(crate) const NONVOLATILE: &[Reg] = &[
    Reg::R4,
    Reg::R5,
    Reg::R6,
    Reg::R7,
    Reg::R8,
    Reg::R10,
    Reg::R11,
    Reg::Sp,
    Reg::Lr,
    Reg::Pc,
];

/// DWARF register mappings as defined in ARM's "DWARF for the ARM
/// Architecture", ARM IHI 0040B.
///
/// The CPSR and the VFP control registers are not allocated a number; the
/// standard considers them unnecessary for producing a backtrace.
pub(crate) const DWARF: &[(Reg, u64)] = &[
    (Reg::R0, 0),
    (Reg::R1, 1),
    (Reg::R2, 2),
    (Reg::R3, 3),
    (Reg::R4, 4),
    (Reg::R5, 5),
    (Reg::R6, 6),
    (Reg::R7, 7),
    (Reg::R8, 8),
    (Reg::R9, 9),
    (Reg::R10, 10),
    (Reg::R11, 11),
    (Reg::R12, 12),
    (Reg::Sp, 13),
    (Reg::Lr, 14),
    (Reg::Pc, 15),
];
