//! ARM64 (AArch64) register file description.

/// General-purpose registers of an ARM64 thread. `X29` is named `Fp` and
/// `X30` is named `Lr`, matching the platform register roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0,
    X1,
    X2,
    X3,
    X4,
    X5,
    X6,
    X7,
    X8,
    X9,
    X10,
    X11,
    X12,
    X13,
    X14,
    X15,
    X16,
    X17,
    X18,
    X19,
    X20,
    X21,
    X22,
    X23,
    X24,
    X25,
    X26,
    X27,
    X28,
    Fp,
    Lr,
    Sp,
    Pc,
    Cpsr,
}

pub(crate) const REG_COUNT: usize = 34;

/// Every register, in storage order.
pub(crate) const ALL: [Reg; REG_COUNT] = [
    Reg::X0,
    Reg::X1,
    Reg::X2,
    Reg::X3,
    Reg::X4,
    Reg::X5,
    Reg::X6,
    Reg::X7,
    Reg::X8,
    Reg::X9,
    Reg::X10,
    Reg::X11,
    Reg::X12,
    Reg::X13,
    Reg::X14,
    Reg::X15,
    Reg::X16,
    Reg::X17,
    Reg::X18,
    Reg::X19,
    Reg::X20,
    Reg::X21,
    Reg::X22,
    Reg::X23,
    Reg::X24,
    Reg::X25,
    Reg::X26,
    Reg::X27,
    Reg::X28,
    Reg::Fp,
    Reg::Lr,
    Reg::Sp,
    Reg::Pc,
    Reg::Cpsr,
];

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Self::X0 => "x0",
            Self::X1 => "x1",
            Self::X2 => "x2",
            Self::X3 => "x3",
            Self::X4 => "x4",
            Self::X5 => "x5",
            Self::X6 => "x6",
            Self::X7 => "x7",
            Self::X8 => "x8",
            Self::X9 => "x9",
            Self::X10 => "x10",
            Self::X11 => "x11",
            Self::X12 => "x12",
            Self::X13 => "x13",
            Self::X14 => "x14",
            Self::X15 => "x15",
            Self::X16 => "x16",
            Self::X17 => "x17",
            Self::X18 => "x18",
            Self::X19 => "x19",
            Self::X20 => "x20",
            Self::X21 => "x21",
            Self::X22 => "x22",
            Self::X23 => "x23",
            Self::X24 => "x24",
            Self::X25 => "x25",
            Self::X26 => "x26",
            Self::X27 => "x27",
            Self::X28 => "x28",
            Self::Fp => "fp",
            Self::Lr => "lr",
            Self::Sp => "sp",
            Self::Pc => "pc",
            Self::Cpsr => "cpsr",
        }
    }
}

/// Callee-preserved registers per the AAPCS64, plus SP and the
/// return-address/instruction registers.
pub(crate) const NONVOLATILE: &[Reg] = &[
    Reg::X19,
    Reg::X20,
    Reg::X21,
    Reg::X22,
    Reg::X23,
    Reg::X24,
    Reg::X25,
    Reg::X26,
    Reg::X27,
    Reg::X28,
    Reg::Fp,
    Reg::Sp,
    Reg::Lr,
    Reg::Pc,
];

/// DWARF register mappings per "DWARF for the ARM 64-bit Architecture",
/// ARM IHI 0057. The PC is not allocated a number.
pub(crate) const DWARF: &[(Reg, u64)] = &[
    (Reg::X0, 0),
    (Reg::X1, 1),
    (Reg::X2, 2),
    (Reg::X3, 3),
    (Reg::X4, 4),
    (Reg::X5, 5),
    (Reg::X6, 6),
    (Reg::X7, 7),
    (Reg::X8, 8),
    (Reg::X9, 9),
    (Reg::X10, 10),
    (Reg::X11, 11),
    (Reg::X12, 12),
    (Reg::X13, 13),
    (Reg::X14, 14),
    (Reg::X15, 15),
    (Reg::X16, 16),
    (Reg::X17, 17),
    (Reg::X18, 18),
    (Reg::X19, 19),
    (Reg::X20, 20),
    (Reg::X21, 21),
    (Reg::X22, 22),
    (Reg::X23, 23),
    (Reg::X24, 24),
    (Reg::X25, 25),
    (Reg::X26, 26),
    (Reg::X27, 27),
    (Reg::X28, 28),
    (Reg::Fp, 29),
    (Reg::Lr, 30),
    (Reg::Sp, 31),
];
