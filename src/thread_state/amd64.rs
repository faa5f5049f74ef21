//! x86-64 register file description.

/// General-purpose and control registers of an x86-64 thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Rflags,
    Cs,
    Fs,
    Gs,
}

pub(crate) const REG_COUNT: usize = 21;

/// Every register, in storage order.
pub(crate) const ALL: [Reg; REG_COUNT] = [
    Reg::Rax,
    Reg::Rbx,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rdi,
    Reg::Rsi,
    Reg::Rbp,
    Reg::Rsp,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rip,
    Reg::Rflags,
    Reg::Cs,
    Reg::Fs,
    Reg::Gs,
];

impl Reg {
    pub fn name(self) -> &'static str {
        match self {
            Self::Rax => "rax",
            Self::Rbx => "rbx",
            Self::Rcx => "rcx",
            Self::Rdx => "rdx",
            Self::Rdi => "rdi",
            Self::Rsi => "rsi",
            Self::Rbp => "rbp",
            Self::Rsp => "rsp",
            Self::R8 => "r8",
            Self::R9 => "r9",
            Self::R10 => "r10",
            Self::R11 => "r11",
            Self::R12 => "r12",
            Self::R13 => "r13",
            Self::R14 => "r14",
            Self::R15 => "r15",
            Self::Rip => "rip",
            Self::Rflags => "rflags",
            Self::Cs => "cs",
            Self::Fs => "fs",
            Self::Gs => "gs",
        }
    }
}

/// Callee-preserved registers per the SysV AMD64 ABI, plus the stack and
/// instruction pointers.
pub(crate) const NONVOLATILE: &[Reg] = &[
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
    Reg::Rbp,
    Reg::Rsp,
    Reg::Rip,
];

/// DWARF register mapping per the SysV AMD64 psABI. Register 16 is the
/// return-address pseudo column.
pub(crate) const DWARF: &[(Reg, u64)] = &[
    (Reg::Rax, 0),
    (Reg::Rdx, 1),
    (Reg::Rcx, 2),
    (Reg::Rbx, 3),
    (Reg::Rsi, 4),
    (Reg::Rdi, 5),
    (Reg::Rbp, 6),
    (Reg::Rsp, 7),
    (Reg::R8, 8),
    (Reg::R9, 9),
    (Reg::R10, 10),
    (Reg::R11, 11),
    (Reg::R12, 12),
    (Reg::R13, 13),
    (Reg::R14, 14),
    (Reg::R15, 15),
    (Reg::Rip, 16),
    (Reg::Rflags, 49),
];
