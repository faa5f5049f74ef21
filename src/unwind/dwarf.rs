//! DWARF call-frame-information unwinding.
//!
//! Performs a linear scan of the image's `__eh_frame` (or `__debug_frame`)
//! CIE/FDE records, executes the call-frame instructions into a rule row for
//! the target address, and applies the row against the previous frame's
//! registers. LSDA and personality data are parsed past but never invoked;
//! the unwinder does not run cleanup handlers.

mod expression;

use scroll::Endian;

use crate::cursor::{Frame, FrameReader, Provenance, Step};
use crate::error::{Error, Result};
use crate::image::ImageList;
use crate::leb::{read_sleb128, read_uleb128};
use crate::macho::{SEG_DWARF, SEG_TEXT};
use crate::mem::{self, BufExt, TaskMemory};
use crate::thread_state::{Arch, ThreadState};
use crate::unwind::strip_ptr_auth;

pub const SECT_EH_FRAME: &str = "__eh_frame";
pub const SECT_DEBUG_FRAME: &str = "__debug_frame";

// DW_EH_PE pointer-encoding bits
const DW_EH_PE_OMIT: u8 = 0xff;
const DW_EH_PE_ABSPTR: u8 = 0x00;
const DW_EH_PE_ULEB128: u8 = 0x01;
const DW_EH_PE_UDATA2: u8 = 0x02;
const DW_EH_PE_UDATA4: u8 = 0x03;
const DW_EH_PE_UDATA8: u8 = 0x04;
const DW_EH_PE_SLEB128: u8 = 0x09;
const DW_EH_PE_SDATA2: u8 = 0x0a;
const DW_EH_PE_SDATA4: u8 = 0x0b;
const DW_EH_PE_SDATA8: u8 = 0x0c;
const DW_EH_PE_PCREL: u8 = 0x10;
const DW_EH_PE_INDIRECT: u8 = 0x80;

// Call-frame instruction opcodes (DWARF v4 §7.23)
const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_SET_LOC: u8 = 0x01;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_UNDEFINED: u8 = 0x07;
const DW_CFA_SAME_VALUE: u8 = 0x08;
const DW_CFA_REGISTER: u8 = 0x09;
const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
const DW_CFA_RESTORE_STATE: u8 = 0x0b;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
const DW_CFA_EXPRESSION: u8 = 0x10;
const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
const DW_CFA_DEF_CFA_SF: u8 = 0x12;
const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
const DW_CFA_VAL_OFFSET: u8 = 0x14;
const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
const DW_CFA_VAL_EXPRESSION: u8 = 0x16;
const DW_CFA_AARCH64_NEGATE_RA_STATE: u8 = 0x2d;

/// Highest DWARF column the rule table tracks; rules for higher-numbered
/// registers are ignored (none of the supported architectures allocate
/// general registers past this).
const MAX_DWARF_REGS: usize = 64;

/// Depth of the remember/restore-state stack.
const MAX_STATES: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq)]
enum RegRule {
    /// No rule; the register keeps whatever the inherit-minus-volatiles
    /// baseline gives it.
    Unset,
    Undefined,
    SameValue,
    /// Stored at CFA + offset.
    Offset(i64),
    /// The value is CFA + offset itself.
    ValOffset(i64),
    /// The value lives in another register (DWARF number).
    Register(u64),
    /// Stored at the address an expression computes.
    Expression { start: usize, len: usize },
    /// The value an expression computes.
    ValExpression { start: usize, len: usize },
}

#[derive(Clone, Copy)]
enum CfaRule {
    None,
    RegOffset(u64, i64),
    Expression { start: usize, len: usize },
}

#[derive(Clone, Copy)]
struct Row {
    cfa: CfaRule,
    ra_signed: bool,
    regs: [RegRule; MAX_DWARF_REGS],
}

impl Row {
    fn new() -> Self {
        Self {
            cfa: CfaRule::None,
            ra_signed: false,
            regs: [RegRule::Unset; MAX_DWARF_REGS],
        }
    }

    fn set_reg(&mut self, reg: u64, rule: RegRule) {
        match usize::try_from(reg) {
            Ok(index) if index < MAX_DWARF_REGS => self.regs[index] = rule,
            _ => log::debug!("ignoring CFI rule for out-of-range register {reg}"),
        }
    }
}

struct Cie {
    code_align: u64,
    data_align: i64,
    ra_reg: u64,
    fde_encoding: u8,
    has_aug_data: bool,
    initial_start: usize,
    initial_end: usize,
}

struct Fde {
    cie: Cie,
    func_start: u64,
    insn_start: usize,
    insn_end: usize,
}

/// Decodes a DW_EH_PE-encoded pointer at `*offset`. `field_addr_base` is
/// the task address of the section's first byte, from which pc-relative
/// values are resolved.
fn read_encoded(
    buf: &[u8],
    offset: &mut usize,
    encoding: u8,
    field_addr_base: u64,
    is_64: bool,
    endian: Endian,
) -> Result<u64> {
    if encoding == DW_EH_PE_OMIT {
        return Err(Error::NotFound);
    }
    if encoding & DW_EH_PE_INDIRECT != 0 {
        return Err(Error::Invalid);
    }

    let base = match encoding & 0x70 {
        0x00 => 0u64,
        DW_EH_PE_PCREL => field_addr_base.wrapping_add(*offset as u64),
        _ => return Err(Error::Invalid),
    };

    let value: i64 = match encoding & 0x0f {
        DW_EH_PE_ABSPTR => {
            if is_64 {
                let v = buf.get_u64(*offset, endian)?;
                *offset += 8;
                v as i64
            } else {
                let v = buf.get_u32(*offset, endian)?;
                *offset += 4;
                i64::from(v)
            }
        }
        DW_EH_PE_ULEB128 => read_uleb128(buf, offset)? as i64,
        DW_EH_PE_UDATA2 => {
            let v = buf.get_u16(*offset, endian)?;
            *offset += 2;
            i64::from(v)
        }
        DW_EH_PE_UDATA4 => {
            let v = buf.get_u32(*offset, endian)?;
            *offset += 4;
            i64::from(v)
        }
        DW_EH_PE_UDATA8 => {
            let v = buf.get_u64(*offset, endian)?;
            *offset += 8;
            v as i64
        }
        DW_EH_PE_SLEB128 => read_sleb128(buf, offset)?,
        DW_EH_PE_SDATA2 => {
            let v = buf.get_u16(*offset, endian)? as i16;
            *offset += 2;
            i64::from(v)
        }
        DW_EH_PE_SDATA4 => {
            let v = buf.get_u32(*offset, endian)? as i32;
            *offset += 4;
            i64::from(v)
        }
        DW_EH_PE_SDATA8 => {
            let v = buf.get_u64(*offset, endian)? as i64;
            *offset += 8;
            v
        }
        _ => return Err(Error::Invalid),
    };

    Ok(base.wrapping_add_signed(value))
}

fn parse_cie(
    buf: &[u8],
    record_off: usize,
    endian: Endian,
    is_64: bool,
    is_eh: bool,
    sect_addr: u64,
) -> Result<Cie> {
    let length = buf.get_u32(record_off, endian)? as usize;
    if length == 0 || length == 0xffff_ffff {
        return Err(Error::Invalid);
    }
    let content = record_off + 4;
    let end = content.checked_add(length).ok_or(Error::Invalid)?;
    if end > buf.len() {
        return Err(Error::Invalid);
    }

    let id = buf.get_u32(content, endian)?;
    let expected_id = if is_eh { 0 } else { 0xffff_ffff };
    if id != expected_id {
        return Err(Error::Invalid);
    }

    let version = buf.get_u8(content + 4)?;
    if !matches!(version, 1 | 3 | 4) {
        return Err(Error::Invalid);
    }

    let aug_start = content + 5;
    let aug_len = buf[aug_start..end]
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::Invalid)?;
    let augmentation = &buf[aug_start..aug_start + aug_len];
    let mut p = aug_start + aug_len + 1;

    if version == 4 {
        // address_size and segment_size; only flat native-size addressing
        // is supported
        let address_size = buf.get_u8(p)?;
        let segment_size = buf.get_u8(p + 1)?;
        if address_size as u64 != if is_64 { 8 } else { 4 } || segment_size != 0 {
            return Err(Error::Invalid);
        }
        p += 2;
    }

    let code_align = read_uleb128(buf, &mut p)?;
    let data_align = read_sleb128(buf, &mut p)?;
    let ra_reg = if version == 1 {
        let v = u64::from(buf.get_u8(p)?);
        p += 1;
        v
    } else {
        read_uleb128(buf, &mut p)?
    };

    let mut fde_encoding = DW_EH_PE_ABSPTR;
    let has_aug_data = augmentation.first() == Some(&b'z');
    if has_aug_data {
        let aug_data_len = read_uleb128(buf, &mut p)? as usize;
        let aug_data_end = p.checked_add(aug_data_len).ok_or(Error::Invalid)?;
        if aug_data_end > end {
            return Err(Error::Invalid);
        }

        for &ch in &augmentation[1..] {
            match ch {
                b'R' => {
                    fde_encoding = buf.get_u8(p)?;
                    p += 1;
                }
                b'L' => {
                    // LSDA pointer encoding; the handler data itself is
                    // never consumed
                    p += 1;
                }
                b'P' => {
                    let enc = buf.get_u8(p)?;
                    p += 1;
                    read_encoded(buf, &mut p, enc, sect_addr, is_64, endian)?;
                }
                b'S' => {} // signal frame marker
                _ => break, // unknown letters; the length field skips them
            }
        }
        p = aug_data_end;
    }

    Ok(Cie {
        code_align,
        data_align,
        ra_reg,
        fde_encoding,
        has_aug_data,
        initial_start: p,
        initial_end: end,
    })
}

/// Linear CIE/FDE scan for the record covering `target_ip`.
fn find_fde(
    buf: &[u8],
    endian: Endian,
    is_64: bool,
    is_eh: bool,
    sect_addr: u64,
    target_ip: u64,
) -> Result<Fde> {
    let mut off = 0usize;
    while off + 4 <= buf.len() {
        let length = buf.get_u32(off, endian)? as usize;
        if length == 0 {
            break;
        }
        // 64-bit DWARF records do not occur in Apple images
        if length == 0xffff_ffff {
            return Err(Error::Invalid);
        }
        let content = off + 4;
        let end = content.checked_add(length).ok_or(Error::Invalid)?;
        if end > buf.len() {
            return Err(Error::Invalid);
        }

        let id = buf.get_u32(content, endian)?;
        let is_cie = if is_eh { id == 0 } else { id == 0xffff_ffff };
        if is_cie {
            off = end;
            continue;
        }

        // In eh_frame the CIE pointer is a back-offset from this field; in
        // debug_frame it is an absolute section offset
        let cie_off = if is_eh {
            content.checked_sub(id as usize).ok_or(Error::Invalid)?
        } else {
            id as usize
        };
        let cie = parse_cie(buf, cie_off, endian, is_64, is_eh, sect_addr)?;

        let mut p = content + 4;
        let initial_location =
            read_encoded(buf, &mut p, cie.fde_encoding, sect_addr, is_64, endian)?;
        // The range shares the value format but is never base-relative
        let range = read_encoded(buf, &mut p, cie.fde_encoding & 0x0f, sect_addr, is_64, endian)?;

        let mut insn_start = p;
        if cie.has_aug_data {
            let aug_data_len = read_uleb128(buf, &mut insn_start)? as usize;
            insn_start = insn_start.checked_add(aug_data_len).ok_or(Error::Invalid)?;
        }
        if insn_start > end {
            return Err(Error::Invalid);
        }

        if target_ip >= initial_location && target_ip - initial_location < range {
            return Ok(Fde {
                cie,
                func_start: initial_location,
                insn_start,
                insn_end: end,
            });
        }

        off = end;
    }

    Err(Error::NotFound)
}

/// Executes call-frame instructions over `buf[start..end]`, mutating `row`
/// until the table row covers `target_ip`.
#[allow(clippy::too_many_arguments)]
fn run_instructions(
    buf: &[u8],
    start: usize,
    end: usize,
    row: &mut Row,
    initial: Option<&Row>,
    cie: &Cie,
    endian: Endian,
    is_64: bool,
    sect_addr: u64,
    start_loc: u64,
    target_ip: u64,
    arch: Arch,
) -> Result<()> {
    let mut saved: [Row; MAX_STATES] = [Row::new(); MAX_STATES];
    let mut saved_len = 0usize;
    let mut loc = start_loc;
    let mut p = start;

    while p < end {
        let op = buf.get_u8(p)?;
        p += 1;

        match op >> 6 {
            // DW_CFA_advance_loc
            1 => {
                loc = loc.wrapping_add(u64::from(op & 0x3f).wrapping_mul(cie.code_align));
                if loc > target_ip {
                    return Ok(());
                }
            }
            // DW_CFA_offset
            2 => {
                let offset = read_uleb128(buf, &mut p)?;
                row.set_reg(
                    u64::from(op & 0x3f),
                    RegRule::Offset((offset as i64).wrapping_mul(cie.data_align)),
                );
            }
            // DW_CFA_restore
            3 => {
                let initial = initial.ok_or(Error::Invalid)?;
                let reg = u64::from(op & 0x3f);
                if (reg as usize) < MAX_DWARF_REGS {
                    row.regs[reg as usize] = initial.regs[reg as usize];
                }
            }
            0 => match op {
                DW_CFA_NOP => {}
                DW_CFA_SET_LOC => {
                    loc = read_encoded(buf, &mut p, cie.fde_encoding, sect_addr, is_64, endian)?;
                    if loc > target_ip {
                        return Ok(());
                    }
                }
                DW_CFA_ADVANCE_LOC1 => {
                    let delta = u64::from(buf.get_u8(p)?);
                    p += 1;
                    loc = loc.wrapping_add(delta.wrapping_mul(cie.code_align));
                    if loc > target_ip {
                        return Ok(());
                    }
                }
                DW_CFA_ADVANCE_LOC2 => {
                    let delta = u64::from(buf.get_u16(p, endian)?);
                    p += 2;
                    loc = loc.wrapping_add(delta.wrapping_mul(cie.code_align));
                    if loc > target_ip {
                        return Ok(());
                    }
                }
                DW_CFA_ADVANCE_LOC4 => {
                    let delta = u64::from(buf.get_u32(p, endian)?);
                    p += 4;
                    loc = loc.wrapping_add(delta.wrapping_mul(cie.code_align));
                    if loc > target_ip {
                        return Ok(());
                    }
                }
                DW_CFA_OFFSET_EXTENDED => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let offset = read_uleb128(buf, &mut p)?;
                    row.set_reg(reg, RegRule::Offset((offset as i64).wrapping_mul(cie.data_align)));
                }
                DW_CFA_OFFSET_EXTENDED_SF => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let offset = read_sleb128(buf, &mut p)?;
                    row.set_reg(reg, RegRule::Offset(offset.wrapping_mul(cie.data_align)));
                }
                DW_CFA_RESTORE_EXTENDED => {
                    let initial = initial.ok_or(Error::Invalid)?;
                    let reg = read_uleb128(buf, &mut p)?;
                    if (reg as usize) < MAX_DWARF_REGS {
                        row.regs[reg as usize] = initial.regs[reg as usize];
                    }
                }
                DW_CFA_UNDEFINED => {
                    let reg = read_uleb128(buf, &mut p)?;
                    row.set_reg(reg, RegRule::Undefined);
                }
                DW_CFA_SAME_VALUE => {
                    let reg = read_uleb128(buf, &mut p)?;
                    row.set_reg(reg, RegRule::SameValue);
                }
                DW_CFA_REGISTER => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let source = read_uleb128(buf, &mut p)?;
                    row.set_reg(reg, RegRule::Register(source));
                }
                DW_CFA_REMEMBER_STATE => {
                    if saved_len == MAX_STATES {
                        return Err(Error::Internal);
                    }
                    saved[saved_len] = *row;
                    saved_len += 1;
                }
                DW_CFA_RESTORE_STATE => {
                    if saved_len == 0 {
                        return Err(Error::Invalid);
                    }
                    saved_len -= 1;
                    *row = saved[saved_len];
                }
                DW_CFA_DEF_CFA => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let offset = read_uleb128(buf, &mut p)?;
                    row.cfa = CfaRule::RegOffset(reg, offset as i64);
                }
                DW_CFA_DEF_CFA_SF => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let offset = read_sleb128(buf, &mut p)?;
                    row.cfa = CfaRule::RegOffset(reg, offset.wrapping_mul(cie.data_align));
                }
                DW_CFA_DEF_CFA_REGISTER => {
                    let reg = read_uleb128(buf, &mut p)?;
                    match row.cfa {
                        CfaRule::RegOffset(_, offset) => row.cfa = CfaRule::RegOffset(reg, offset),
                        _ => return Err(Error::Invalid),
                    }
                }
                DW_CFA_DEF_CFA_OFFSET => {
                    let offset = read_uleb128(buf, &mut p)?;
                    match row.cfa {
                        CfaRule::RegOffset(reg, _) => {
                            row.cfa = CfaRule::RegOffset(reg, offset as i64)
                        }
                        _ => return Err(Error::Invalid),
                    }
                }
                DW_CFA_DEF_CFA_OFFSET_SF => {
                    let offset = read_sleb128(buf, &mut p)?;
                    match row.cfa {
                        CfaRule::RegOffset(reg, _) => {
                            row.cfa = CfaRule::RegOffset(reg, offset.wrapping_mul(cie.data_align))
                        }
                        _ => return Err(Error::Invalid),
                    }
                }
                DW_CFA_DEF_CFA_EXPRESSION => {
                    let len = read_uleb128(buf, &mut p)? as usize;
                    if p + len > end {
                        return Err(Error::Invalid);
                    }
                    row.cfa = CfaRule::Expression { start: p, len };
                    p += len;
                }
                DW_CFA_EXPRESSION => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let len = read_uleb128(buf, &mut p)? as usize;
                    if p + len > end {
                        return Err(Error::Invalid);
                    }
                    row.set_reg(reg, RegRule::Expression { start: p, len });
                    p += len;
                }
                DW_CFA_VAL_EXPRESSION => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let len = read_uleb128(buf, &mut p)? as usize;
                    if p + len > end {
                        return Err(Error::Invalid);
                    }
                    row.set_reg(reg, RegRule::ValExpression { start: p, len });
                    p += len;
                }
                DW_CFA_VAL_OFFSET => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let offset = read_uleb128(buf, &mut p)?;
                    row.set_reg(
                        reg,
                        RegRule::ValOffset((offset as i64).wrapping_mul(cie.data_align)),
                    );
                }
                DW_CFA_VAL_OFFSET_SF => {
                    let reg = read_uleb128(buf, &mut p)?;
                    let offset = read_sleb128(buf, &mut p)?;
                    row.set_reg(reg, RegRule::ValOffset(offset.wrapping_mul(cie.data_align)));
                }
                DW_CFA_AARCH64_NEGATE_RA_STATE if arch == Arch::Arm64 => {
                    row.ra_signed = !row.ra_signed;
                }
                _ => {
                    log::debug!("unsupported call-frame opcode {op:#04x}");
                    return Err(Error::Invalid);
                }
            },
            _ => unreachable!(),
        }
    }

    Ok(())
}

/// Applies a finished rule row to the previous frame's registers.
///
/// `Ok(None)` means the row marked the walk finished (return address
/// undefined or unrecoverable).
fn apply_row(
    mem: &dyn TaskMemory,
    prev: &ThreadState,
    buf: &[u8],
    row: &Row,
    cie: &Cie,
) -> Result<Option<ThreadState>> {
    let is_64 = prev.arch().is_64();

    let cfa = match row.cfa {
        CfaRule::None => return Err(Error::Invalid),
        CfaRule::RegOffset(reg, offset) => {
            let native = prev.reg_for_dwarf(reg).ok_or(Error::Invalid)?;
            prev.get(native)?.wrapping_add_signed(offset)
        }
        CfaRule::Expression { start, len } => {
            expression::evaluate(&buf[start..start + len], mem, prev, None)?
        }
    };

    let mut next = prev.clone();
    next.clear_volatiles();
    next.set_sp(cfa);

    let mut ret_addr = None;
    for (index, rule) in row.regs.iter().enumerate() {
        let dwarf_reg = index as u64;
        let value = match *rule {
            RegRule::Unset => continue,
            RegRule::Undefined => {
                if dwarf_reg == cie.ra_reg {
                    // The outermost frame: no caller to return to
                    return Ok(None);
                }
                if let Some(native) = prev.reg_for_dwarf(dwarf_reg) {
                    next.clear(native);
                }
                continue;
            }
            RegRule::SameValue => match prev.reg_for_dwarf(dwarf_reg).map(|r| prev.get(r)) {
                Some(Ok(value)) => value,
                _ => continue,
            },
            RegRule::Offset(offset) => {
                mem::read_ptr(mem, cfa.wrapping_add_signed(offset), is_64, scroll::LE)?
            }
            RegRule::ValOffset(offset) => cfa.wrapping_add_signed(offset),
            RegRule::Register(source) => {
                let native = prev.reg_for_dwarf(source).ok_or(Error::Invalid)?;
                prev.get(native)?
            }
            RegRule::Expression { start, len } => {
                let addr = expression::evaluate(&buf[start..start + len], mem, prev, Some(cfa))?;
                mem::read_ptr(mem, addr, is_64, scroll::LE)?
            }
            RegRule::ValExpression { start, len } => {
                expression::evaluate(&buf[start..start + len], mem, prev, Some(cfa))?
            }
        };

        if dwarf_reg == cie.ra_reg {
            ret_addr = Some(value);
        }
        if let Some(native) = prev.reg_for_dwarf(dwarf_reg) {
            next.set(native, value);
        }
    }

    let ret_addr = match ret_addr {
        Some(addr) => addr,
        // No rule for the return-address column: a leaf frame still holds
        // its return address in the link register
        None => match prev.ra_reg().map(|reg| prev.get(reg)) {
            Some(Ok(lr)) => lr,
            _ => return Ok(None),
        },
    };
    let ret_addr = if row.ra_signed {
        strip_ptr_auth(ret_addr)
    } else {
        ret_addr
    };
    if ret_addr == 0 {
        return Ok(None);
    }

    next.set_ip(ret_addr);
    Ok(Some(next))
}

/// Unwinds using the image's DWARF call-frame information.
pub struct DwarfCfiReader;

impl DwarfCfiReader {
    fn unwind(
        &self,
        mem: &dyn TaskMemory,
        images: &ImageList,
        state: &ThreadState,
    ) -> Result<Option<ThreadState>> {
        let ip = state.ip()?;
        let image = images.containing(mem, ip).ok_or(Error::NotFound)?;
        let view = image.view(mem)?;

        let (section, is_eh) = match view.map_section(mem, SEG_TEXT, SECT_EH_FRAME) {
            Ok(section) => (section, true),
            Err(_) => (view.map_section(mem, SEG_DWARF, SECT_DEBUG_FRAME)?, false),
        };

        let buf = section.bytes();
        let endian = view.endian();
        let is_64 = state.arch().is_64();
        let sect_addr = section.task_address();

        let fde = find_fde(buf, endian, is_64, is_eh, sect_addr, ip)?;

        // The CIE's initial instructions establish the row every location
        // in the function starts from
        let mut initial = Row::new();
        run_instructions(
            buf,
            fde.cie.initial_start,
            fde.cie.initial_end,
            &mut initial,
            None,
            &fde.cie,
            endian,
            is_64,
            sect_addr,
            fde.func_start,
            u64::MAX,
            state.arch(),
        )?;

        let snapshot = initial;
        let mut row = initial;
        run_instructions(
            buf,
            fde.insn_start,
            fde.insn_end,
            &mut row,
            Some(&snapshot),
            &fde.cie,
            endian,
            is_64,
            sect_addr,
            fde.func_start,
            ip,
            state.arch(),
        )?;

        apply_row(mem, state, buf, &row, &fde.cie)
    }
}

impl FrameReader for DwarfCfiReader {
    fn read_frame(&self, mem: &dyn TaskMemory, images: &ImageList, prev: &Frame) -> Result<Step> {
        match self.unwind(mem, images, &prev.state) {
            Ok(Some(next)) => Ok(Step::Caller(Frame {
                state: next,
                provenance: Provenance::DwarfCfi,
            })),
            Ok(None) => Ok(Step::End),
            Err(err) => {
                if err != Error::NotFound {
                    log::debug!("CFI unwind failed: {err}");
                }
                Err(Error::Unknown)
            }
        }
    }

    fn name(&self) -> &'static str {
        "dwarf-cfi"
    }
}
