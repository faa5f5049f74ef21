//! Per-architecture thread register state.
//!
//! A [`ThreadState`] is a fixed register array plus a validity bitset, tagged
//! with the architecture it describes. Register identifiers are typed per
//! architecture; handing a state a register from a different architecture is
//! a programmer error and panics, while reading a register whose validity bit
//! is clear is an expected runtime condition and returns an error.

pub mod amd64;
pub mod arm;
pub mod arm64;
pub mod x86;

use crate::error::{Error, Result};

/// Instruction-set architectures understood by the unwinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    Amd64,
    Arm,
    Arm64,
}

impl Arch {
    /// Native word size in bytes.
    #[inline]
    pub fn word_size(self) -> u64 {
        match self {
            Self::X86 | Self::Arm => 4,
            Self::Amd64 | Self::Arm64 => 8,
        }
    }

    #[inline]
    pub fn is_64(self) -> bool {
        self.word_size() == 8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X86 => "i386",
            Self::Amd64 => "x86_64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }

    fn reg_count(self) -> usize {
        match self {
            Self::X86 => x86::REG_COUNT,
            Self::Amd64 => amd64::REG_COUNT,
            Self::Arm => arm::REG_COUNT,
            Self::Arm64 => arm64::REG_COUNT,
        }
    }
}

/// A register identifier, scoped to its architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    X86(x86::Reg),
    Amd64(amd64::Reg),
    Arm(arm::Reg),
    Arm64(arm64::Reg),
}

impl Reg {
    pub fn arch(self) -> Arch {
        match self {
            Self::X86(_) => Arch::X86,
            Self::Amd64(_) => Arch::Amd64,
            Self::Arm(_) => Arch::Arm,
            Self::Arm64(_) => Arch::Arm64,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::X86(r) => r as usize,
            Self::Amd64(r) => r as usize,
            Self::Arm(r) => r as usize,
            Self::Arm64(r) => r as usize,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X86(r) => r.name(),
            Self::Amd64(r) => r.name(),
            Self::Arm(r) => r.name(),
            Self::Arm64(r) => r.name(),
        }
    }
}

impl From<x86::Reg> for Reg {
    fn from(r: x86::Reg) -> Self {
        Self::X86(r)
    }
}

impl From<amd64::Reg> for Reg {
    fn from(r: amd64::Reg) -> Self {
        Self::Amd64(r)
    }
}

impl From<arm::Reg> for Reg {
    fn from(r: arm::Reg) -> Self {
        Self::Arm(r)
    }
}

impl From<arm64::Reg> for Reg {
    fn from(r: arm64::Reg) -> Self {
        Self::Arm64(r)
    }
}

/// Enough slots for the largest register file (ARM64).
const MAX_REGS: usize = 34;

/// A fixed register array with per-register validity tracking.
#[derive(Clone)]
pub struct ThreadState {
    arch: Arch,
    regs: [u64; MAX_REGS],
    valid_regs: u64,
}

impl ThreadState {
    /// Creates an empty state for `arch`; every validity bit starts clear.
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            regs: [0; MAX_REGS],
            valid_regs: 0,
        }
    }

    #[inline]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Number of registers in this architecture's file.
    pub fn reg_count(&self) -> usize {
        self.arch.reg_count()
    }

    fn index_of(&self, reg: impl Into<Reg>) -> usize {
        let reg = reg.into();
        assert!(
            reg.arch() == self.arch,
            "register {} does not belong to {}",
            reg.name(),
            self.arch.name()
        );
        reg.index()
    }

    /// Reads a register, failing if its validity bit is clear.
    pub fn get(&self, reg: impl Into<Reg>) -> Result<u64> {
        let index = self.index_of(reg);
        if self.valid_regs & (1 << index) == 0 {
            return Err(Error::NotFound);
        }
        Ok(self.regs[index])
    }

    /// Writes a register and marks it valid.
    pub fn set(&mut self, reg: impl Into<Reg>, value: u64) {
        let index = self.index_of(reg);
        self.regs[index] = value;
        self.valid_regs |= 1 << index;
    }

    /// Clears a register's validity bit.
    pub fn clear(&mut self, reg: impl Into<Reg>) {
        let index = self.index_of(reg);
        self.valid_regs &= !(1 << index);
    }

    pub fn has(&self, reg: impl Into<Reg>) -> bool {
        self.valid_regs & (1 << self.index_of(reg)) != 0
    }

    /// Clears every valid register that is not in the architecture's
    /// callee-preserved set. Idempotent.
    pub fn clear_volatiles(&mut self) {
        for index in 0..self.reg_count() {
            if self.valid_regs & (1 << index) == 0 {
                continue;
            }
            if !self.is_nonvolatile(index) {
                self.valid_regs &= !(1 << index);
            }
        }
    }

    fn is_nonvolatile(&self, index: usize) -> bool {
        match self.arch {
            Arch::X86 => x86::NONVOLATILE.iter().any(|&r| r as usize == index),
            Arch::Amd64 => amd64::NONVOLATILE.iter().any(|&r| r as usize == index),
            Arch::Arm => arm::NONVOLATILE.iter().any(|&r| r as usize == index),
            Arch::Arm64 => arm64::NONVOLATILE.iter().any(|&r| r as usize == index),
        }
    }

    fn dwarf_table(&self) -> DwarfTable {
        match self.arch {
            Arch::X86 => DwarfTable::X86(x86::DWARF),
            Arch::Amd64 => DwarfTable::Amd64(amd64::DWARF),
            Arch::Arm => DwarfTable::Arm(arm::DWARF),
            Arch::Arm64 => DwarfTable::Arm64(arm64::DWARF),
        }
    }

    /// Maps a native register to its DWARF number, or `None` if the
    /// architecture's DWARF table does not allocate one.
    pub fn dwarf_for_reg(&self, reg: impl Into<Reg>) -> Option<u64> {
        let reg = reg.into();
        // Arch mismatch is still a programmer error here
        let _ = self.index_of(reg);
        self.dwarf_table().dwarf_for(reg)
    }

    /// Maps a DWARF register number to the native register, or `None` for
    /// numbers the table does not cover.
    pub fn reg_for_dwarf(&self, dwarf: u64) -> Option<Reg> {
        self.dwarf_table().reg_for(dwarf)
    }

    /// The instruction-pointer register for this architecture.
    pub fn ip_reg(&self) -> Reg {
        match self.arch {
            Arch::X86 => x86::Reg::Eip.into(),
            Arch::Amd64 => amd64::Reg::Rip.into(),
            Arch::Arm => arm::Reg::Pc.into(),
            Arch::Arm64 => arm64::Reg::Pc.into(),
        }
    }

    /// The stack-pointer register for this architecture.
    pub fn sp_reg(&self) -> Reg {
        match self.arch {
            Arch::X86 => x86::Reg::Esp.into(),
            Arch::Amd64 => amd64::Reg::Rsp.into(),
            Arch::Arm => arm::Reg::Sp.into(),
            Arch::Arm64 => arm64::Reg::Sp.into(),
        }
    }

    /// The frame-pointer register. On 32-bit ARM Apple platforms r7 holds
    /// the frame chain.
    pub fn fp_reg(&self) -> Reg {
        match self.arch {
            Arch::X86 => x86::Reg::Ebp.into(),
            Arch::Amd64 => amd64::Reg::Rbp.into(),
            Arch::Arm => arm::Reg::R7.into(),
            Arch::Arm64 => arm64::Reg::Fp.into(),
        }
    }

    /// The link register, on architectures that keep the return address in a
    /// register rather than on the stack.
    pub fn ra_reg(&self) -> Option<Reg> {
        match self.arch {
            Arch::X86 | Arch::Amd64 => None,
            Arch::Arm => Some(arm::Reg::Lr.into()),
            Arch::Arm64 => Some(arm64::Reg::Lr.into()),
        }
    }

    pub fn ip(&self) -> Result<u64> {
        self.get(self.ip_reg())
    }

    pub fn sp(&self) -> Result<u64> {
        self.get(self.sp_reg())
    }

    pub fn fp(&self) -> Result<u64> {
        self.get(self.fp_reg())
    }

    pub fn set_ip(&mut self, value: u64) {
        self.set(self.ip_reg(), value);
    }

    pub fn set_sp(&mut self, value: u64) {
        self.set(self.sp_reg(), value);
    }

    pub fn set_fp(&mut self, value: u64) {
        self.set(self.fp_reg(), value);
    }

    /// Iterates `(register, value)` over every valid register, in storage
    /// order. Used by the report writer for the register dump.
    pub fn iter_valid(&self) -> impl Iterator<Item = (Reg, u64)> + '_ {
        (0..self.reg_count()).filter_map(move |index| {
            if self.valid_regs & (1 << index) == 0 {
                return None;
            }
            Some((self.reg_at(index), self.regs[index]))
        })
    }

    fn reg_at(&self, index: usize) -> Reg {
        match self.arch {
            Arch::X86 => Reg::X86(x86::ALL[index]),
            Arch::Amd64 => Reg::Amd64(amd64::ALL[index]),
            Arch::Arm => Reg::Arm(arm::ALL[index]),
            Arch::Arm64 => Reg::Arm64(arm64::ALL[index]),
        }
    }
}

enum DwarfTable {
    X86(&'static [(x86::Reg, u64)]),
    Amd64(&'static [(amd64::Reg, u64)]),
    Arm(&'static [(arm::Reg, u64)]),
    Arm64(&'static [(arm64::Reg, u64)]),
}

impl DwarfTable {
    fn dwarf_for(&self, reg: Reg) -> Option<u64> {
        match (self, reg) {
            (Self::X86(t), Reg::X86(r)) => t.iter().find(|(c, _)| *c == r).map(|(_, d)| *d),
            (Self::Amd64(t), Reg::Amd64(r)) => t.iter().find(|(c, _)| *c == r).map(|(_, d)| *d),
            (Self::Arm(t), Reg::Arm(r)) => t.iter().find(|(c, _)| *c == r).map(|(_, d)| *d),
            (Self::Arm64(t), Reg::Arm64(r)) => t.iter().find(|(c, _)| *c == r).map(|(_, d)| *d),
            _ => None,
        }
    }

    fn reg_for(&self, dwarf: u64) -> Option<Reg> {
        match self {
            Self::X86(t) => t.iter().find(|(_, d)| *d == dwarf).map(|(r, _)| Reg::X86(*r)),
            Self::Amd64(t) => t
                .iter()
                .find(|(_, d)| *d == dwarf)
                .map(|(r, _)| Reg::Amd64(*r)),
            Self::Arm(t) => t.iter().find(|(_, d)| *d == dwarf).map(|(r, _)| Reg::Arm(*r)),
            Self::Arm64(t) => t
                .iter()
                .find(|(_, d)| *d == dwarf)
                .map(|(r, _)| Reg::Arm64(*r)),
        }
    }
}
