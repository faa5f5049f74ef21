//! Apple compact-unwind decoding.
//!
//! `__TEXT.__unwind_info` packs one 32-bit encoding per function behind a
//! two-level index: a first-level array of page descriptors keyed on
//! function start offsets, and per-page second-level tables in either a
//! regular (offset, encoding) form or a compressed form that folds a 24-bit
//! function offset and an 8-bit encoding-table index into one word.

use scroll::Endian;

use crate::cursor::{Frame, FrameReader, Provenance, Step};
use crate::error::{Error, Result};
use crate::image::ImageList;
use crate::macho::SEG_TEXT;
use crate::mem::{self, BufExt, TaskMemory};
use crate::thread_state::{Arch, Reg, ThreadState, amd64, arm64, x86};
use crate::unwind::strip_ptr_auth;

pub const SECT_UNWIND_INFO: &str = "__unwind_info";

const UNWIND_SECTION_VERSION: u32 = 1;
const UNWIND_SECOND_LEVEL_REGULAR: u32 = 2;
const UNWIND_SECOND_LEVEL_COMPRESSED: u32 = 3;

// Flag bits common to all architectures; masked off before mode dispatch.
const UNWIND_IS_NOT_FUNCTION_START: u32 = 0x8000_0000;
const UNWIND_HAS_LSDA: u32 = 0x4000_0000;
const UNWIND_PERSONALITY_MASK: u32 = 0x3000_0000;
const UNWIND_FLAGS_MASK: u32 =
    UNWIND_IS_NOT_FUNCTION_START | UNWIND_HAS_LSDA | UNWIND_PERSONALITY_MASK;

// x86 / x86-64 encodings (compact_unwind_encoding.h)
const X86_MODE_MASK: u32 = 0x0F00_0000;
const X86_MODE_BP_FRAME: u32 = 0x0100_0000;
const X86_MODE_STACK_IMMD: u32 = 0x0200_0000;
const X86_MODE_STACK_IND: u32 = 0x0300_0000;
const X86_MODE_DWARF: u32 = 0x0400_0000;
const X86_BP_FRAME_REGISTERS: u32 = 0x0000_7FFF;
const X86_BP_FRAME_OFFSET: u32 = 0x00FF_0000;
const X86_FRAMELESS_STACK_SIZE: u32 = 0x00FF_0000;
const X86_FRAMELESS_STACK_ADJUST: u32 = 0x0000_E000;
const X86_FRAMELESS_STACK_REG_COUNT: u32 = 0x0000_1C00;
const X86_FRAMELESS_STACK_REG_PERMUTATION: u32 = 0x0000_03FF;

// ARM64 encodings
const ARM64_MODE_MASK: u32 = 0x0F00_0000;
const ARM64_MODE_FRAMELESS: u32 = 0x0200_0000;
const ARM64_MODE_DWARF: u32 = 0x0300_0000;
const ARM64_MODE_FRAME: u32 = 0x0400_0000;
const ARM64_FRAMELESS_STACK_SIZE_MASK: u32 = 0x00FF_F000;
const ARM64_FRAME_X19_X20_PAIR: u32 = 0x0000_0001;
const ARM64_FRAME_X21_X22_PAIR: u32 = 0x0000_0002;
const ARM64_FRAME_X23_X24_PAIR: u32 = 0x0000_0004;
const ARM64_FRAME_X25_X26_PAIR: u32 = 0x0000_0008;
const ARM64_FRAME_X27_X28_PAIR: u32 = 0x0000_0010;

/// Unwinds using the image's `__unwind_info` section.
pub struct CompactUnwindReader;

impl FrameReader for CompactUnwindReader {
    fn read_frame(&self, mem: &dyn TaskMemory, images: &ImageList, prev: &Frame) -> Result<Step> {
        let state = &prev.state;
        let arch = state.arch();
        // 32-bit ARM binaries never carry compact unwind data
        if arch == Arch::Arm {
            return Err(Error::Unknown);
        }

        let ip = state.ip().map_err(|_| Error::Unknown)?;
        let image = images.containing(mem, ip).ok_or(Error::Unknown)?;
        let view = image.view(mem).map_err(|_| Error::Unknown)?;

        let info = match view.map_section(mem, SEG_TEXT, SECT_UNWIND_INFO) {
            Ok(info) => info,
            Err(_) => return Err(Error::Unknown),
        };

        let (func_start, encoding) =
            lookup_encoding(info.bytes(), view.endian(), view.base(), ip).ok_or(Error::Unknown)?;

        // LSDA presence, personality index, and the mid-function marker do
        // not affect frame recovery
        let encoding = encoding & !UNWIND_FLAGS_MASK;
        if encoding == 0 {
            return Err(Error::Unknown);
        }

        let next = match arch {
            Arch::X86 | Arch::Amd64 => apply_x86(mem, state, func_start, encoding)?,
            Arch::Arm64 => apply_arm64(mem, state, encoding)?,
            Arch::Arm => unreachable!(),
        };

        Ok(Step::Caller(Frame {
            state: next,
            provenance: Provenance::CompactUnwind,
        }))
    }

    fn name(&self) -> &'static str {
        "compact-unwind"
    }
}

/// Resolves `ip` to its function start address and 32-bit encoding through
/// the two-level index. `None` for out-of-range addresses.
fn lookup_encoding(info: &[u8], endian: Endian, image_base: u64, ip: u64) -> Option<(u64, u32)> {
    if info.get_u32(0, endian).ok()? != UNWIND_SECTION_VERSION {
        return None;
    }
    let common_off = info.get_u32(4, endian).ok()? as usize;
    let common_count = info.get_u32(8, endian).ok()? as usize;
    let index_off = info.get_u32(20, endian).ok()? as usize;
    let index_count = info.get_u32(24, endian).ok()? as usize;

    let target = u32::try_from(ip.checked_sub(image_base)?).ok()?;

    // First level: the last entry whose function offset is at or below the
    // target. An IP equal to the next entry's start belongs to the next
    // entry, which the at-or-below search gives us for free.
    let entry_at = |i: usize| -> Option<(u32, u32)> {
        let off = index_off + i * 12;
        Some((
            info.get_u32(off, endian).ok()?,
            info.get_u32(off + 4, endian).ok()?,
        ))
    };

    let mut lo = 0usize;
    let mut hi = index_count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if entry_at(mid)?.0 <= target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    if lo == 0 {
        return None;
    }
    let (first_func, page_off) = entry_at(lo - 1)?;
    // The final index entry is a sentinel marking the end of the covered
    // range; no second-level page hangs off of it
    if page_off == 0 {
        return None;
    }

    let page_off = page_off as usize;
    let kind = info.get_u32(page_off, endian).ok()?;
    let (func_off, raw_encoding) = match kind {
        UNWIND_SECOND_LEVEL_REGULAR => {
            let entries_off = page_off + info.get_u16(page_off + 4, endian).ok()? as usize;
            let count = info.get_u16(page_off + 6, endian).ok()? as usize;

            let entry_at = |i: usize| -> Option<(u32, u32)> {
                let off = entries_off + i * 8;
                Some((
                    info.get_u32(off, endian).ok()?,
                    info.get_u32(off + 4, endian).ok()?,
                ))
            };

            let mut lo = 0usize;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if entry_at(mid)?.0 <= target {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            if lo == 0 {
                return None;
            }
            entry_at(lo - 1)?
        }
        UNWIND_SECOND_LEVEL_COMPRESSED => {
            let entries_off = page_off + info.get_u16(page_off + 4, endian).ok()? as usize;
            let count = info.get_u16(page_off + 6, endian).ok()? as usize;
            let encodings_off = page_off + info.get_u16(page_off + 8, endian).ok()? as usize;
            let encodings_count = info.get_u16(page_off + 10, endian).ok()? as usize;

            // Compressed entries record offsets relative to the page's
            // first function
            let rel_target = target.checked_sub(first_func)?;

            let entry_at = |i: usize| -> Option<u32> {
                info.get_u32(entries_off + i * 4, endian).ok()
            };

            let mut lo = 0usize;
            let mut hi = count;
            while lo < hi {
                let mid = (lo + hi) / 2;
                if entry_at(mid)? & 0x00FF_FFFF <= rel_target {
                    lo = mid + 1;
                } else {
                    hi = mid;
                }
            }
            if lo == 0 {
                return None;
            }
            let entry = entry_at(lo - 1)?;
            let enc_index = (entry >> 24) as usize;

            let encoding = if enc_index < common_count {
                info.get_u32(common_off + enc_index * 4, endian).ok()?
            } else if enc_index - common_count < encodings_count {
                info.get_u32(encodings_off + (enc_index - common_count) * 4, endian)
                    .ok()?
            } else {
                return None;
            };

            (first_func + (entry & 0x00FF_FFFF), encoding)
        }
        _ => return None,
    };

    Some((image_base + u64::from(func_off), raw_encoding))
}

/// The 3-bit saved-register numbers used by both x86 personalities.
fn x86_encoded_reg(arch: Arch, regnum: u32) -> Result<Reg> {
    let reg = match (arch, regnum) {
        (Arch::X86, 1) => x86::Reg::Ebx.into(),
        (Arch::X86, 2) => x86::Reg::Ecx.into(),
        (Arch::X86, 3) => x86::Reg::Edx.into(),
        (Arch::X86, 4) => x86::Reg::Edi.into(),
        (Arch::X86, 5) => x86::Reg::Esi.into(),
        (Arch::X86, 6) => x86::Reg::Ebp.into(),
        (Arch::Amd64, 1) => amd64::Reg::Rbx.into(),
        (Arch::Amd64, 2) => amd64::Reg::R12.into(),
        (Arch::Amd64, 3) => amd64::Reg::R13.into(),
        (Arch::Amd64, 4) => amd64::Reg::R14.into(),
        (Arch::Amd64, 5) => amd64::Reg::R15.into(),
        (Arch::Amd64, 6) => amd64::Reg::Rbp.into(),
        _ => return Err(Error::Invalid),
    };
    Ok(reg)
}

fn apply_x86(
    mem: &dyn TaskMemory,
    state: &ThreadState,
    func_start: u64,
    encoding: u32,
) -> Result<ThreadState> {
    let arch = state.arch();
    let word = arch.word_size();
    let is_64 = arch.is_64();

    match encoding & X86_MODE_MASK {
        X86_MODE_BP_FRAME => {
            let fp = state.fp().map_err(|_| Error::Unknown)?;
            let saved_offset = u64::from((encoding & X86_BP_FRAME_OFFSET) >> 16);
            let mut locations = encoding & X86_BP_FRAME_REGISTERS;

            let mut next = state.clone();
            next.clear_volatiles();

            // The save area sits `saved_offset` words below the frame
            // pointer, lowest-numbered slot first
            let mut addr = fp.wrapping_sub(saved_offset * word);
            for _ in 0..5 {
                let regnum = locations & 0x7;
                if regnum != 0 {
                    let reg = x86_encoded_reg(arch, regnum).map_err(|_| Error::Unknown)?;
                    let value =
                        mem::read_ptr(mem, addr, is_64, scroll::LE).map_err(|_| Error::Unknown)?;
                    next.set(reg, value);
                }
                addr = addr.wrapping_add(word);
                locations >>= 3;
            }

            let saved_fp = mem::read_ptr(mem, fp, is_64, scroll::LE).map_err(|_| Error::Unknown)?;
            let ret_addr =
                mem::read_ptr(mem, fp + word, is_64, scroll::LE).map_err(|_| Error::Unknown)?;
            next.set_fp(saved_fp);
            next.set_ip(ret_addr);
            next.set_sp(fp + 2 * word);
            Ok(next)
        }
        mode @ (X86_MODE_STACK_IMMD | X86_MODE_STACK_IND) => {
            let sp = state.sp().map_err(|_| Error::Unknown)?;
            let size_field = u64::from((encoding & X86_FRAMELESS_STACK_SIZE) >> 16);
            let adjust = u64::from((encoding & X86_FRAMELESS_STACK_ADJUST) >> 13);
            let reg_count = (encoding & X86_FRAMELESS_STACK_REG_COUNT) >> 10;
            let permutation = encoding & X86_FRAMELESS_STACK_REG_PERMUTATION;

            let stack_size = if mode == X86_MODE_STACK_IMMD {
                size_field * word
            } else {
                // The real frame size lives in the immediate of the
                // `sub $imm, sp` instruction at this offset into the
                // function body
                let imm = mem::read_u32(mem, func_start + size_field, scroll::LE)
                    .map_err(|_| Error::Unknown)?;
                u64::from(imm) + adjust * word
            };

            let saved = decode_permutation(permutation, reg_count).map_err(|_| Error::Unknown)?;

            let mut next = state.clone();
            next.clear_volatiles();

            let mut addr = sp
                .wrapping_add(stack_size)
                .wrapping_sub(word)
                .wrapping_sub(word * u64::from(reg_count));
            for &regnum in saved.iter().take(reg_count as usize) {
                let reg = x86_encoded_reg(arch, regnum).map_err(|_| Error::Unknown)?;
                let value =
                    mem::read_ptr(mem, addr, is_64, scroll::LE).map_err(|_| Error::Unknown)?;
                next.set(reg, value);
                addr = addr.wrapping_add(word);
            }

            let ret_loc = sp.wrapping_add(stack_size).wrapping_sub(word);
            let ret_addr =
                mem::read_ptr(mem, ret_loc, is_64, scroll::LE).map_err(|_| Error::Unknown)?;
            next.set_ip(ret_addr);
            next.set_sp(sp.wrapping_add(stack_size));
            Ok(next)
        }
        // The function's layout could not be compactly encoded; defer to
        // the DWARF reader
        X86_MODE_DWARF => Err(Error::Unknown),
        _ => Err(Error::Unknown),
    }
}

/// Decodes the frameless permutation field: the registers are recorded as a
/// variable-base number ranking the ordered selection of `count` out of the
/// six encodable registers.
fn decode_permutation(permutation: u32, count: u32) -> Result<[u32; 6]> {
    let mut perm = permutation;
    let mut ranks = [0u32; 6];
    match count {
        0 => {}
        1 => ranks[0] = perm,
        2 => {
            ranks[0] = perm / 5;
            ranks[1] = perm % 5;
        }
        3 => {
            ranks[0] = perm / 20;
            perm %= 20;
            ranks[1] = perm / 4;
            ranks[2] = perm % 4;
        }
        4 => {
            ranks[0] = perm / 60;
            perm %= 60;
            ranks[1] = perm / 12;
            perm %= 12;
            ranks[2] = perm / 3;
            ranks[3] = perm % 3;
        }
        5 | 6 => {
            ranks[0] = perm / 120;
            perm %= 120;
            ranks[1] = perm / 24;
            perm %= 24;
            ranks[2] = perm / 6;
            perm %= 6;
            ranks[3] = perm / 2;
            ranks[4] = perm % 2;
            // With all six registers saved the last slot is forced
            ranks[5] = 0;
        }
        _ => return Err(Error::Invalid),
    }

    let mut registers = [0u32; 6];
    let mut used = [false; 7];
    for i in 0..count as usize {
        let mut rank = 0;
        for candidate in 1..7u32 {
            if used[candidate as usize] {
                continue;
            }
            if rank == ranks[i] {
                registers[i] = candidate;
                used[candidate as usize] = true;
                break;
            }
            rank += 1;
        }
        if registers[i] == 0 {
            return Err(Error::Invalid);
        }
    }
    Ok(registers)
}

const ARM64_PAIRS: &[(u32, arm64::Reg, arm64::Reg)] = &[
    (ARM64_FRAME_X19_X20_PAIR, arm64::Reg::X19, arm64::Reg::X20),
    (ARM64_FRAME_X21_X22_PAIR, arm64::Reg::X21, arm64::Reg::X22),
    (ARM64_FRAME_X23_X24_PAIR, arm64::Reg::X23, arm64::Reg::X24),
    (ARM64_FRAME_X25_X26_PAIR, arm64::Reg::X25, arm64::Reg::X26),
    (ARM64_FRAME_X27_X28_PAIR, arm64::Reg::X27, arm64::Reg::X28),
];

fn apply_arm64(mem: &dyn TaskMemory, state: &ThreadState, encoding: u32) -> Result<ThreadState> {
    match encoding & ARM64_MODE_MASK {
        ARM64_MODE_FRAME => {
            let fp = state.fp().map_err(|_| Error::Unknown)?;

            let mut next = state.clone();
            next.clear_volatiles();

            // Pairs are stored descending below the frame record, the
            // higher-numbered member of each pair first
            let mut loc = fp;
            for &(flag, lo, hi) in ARM64_PAIRS {
                if encoding & flag == 0 {
                    continue;
                }
                loc = loc.wrapping_sub(8);
                let value = mem::read_u64(mem, loc, scroll::LE).map_err(|_| Error::Unknown)?;
                next.set(hi, value);
                loc = loc.wrapping_sub(8);
                let value = mem::read_u64(mem, loc, scroll::LE).map_err(|_| Error::Unknown)?;
                next.set(lo, value);
            }

            let saved_fp = mem::read_u64(mem, fp, scroll::LE).map_err(|_| Error::Unknown)?;
            let ret_addr = mem::read_u64(mem, fp + 8, scroll::LE).map_err(|_| Error::Unknown)?;
            next.set_fp(saved_fp);
            next.set_ip(strip_ptr_auth(ret_addr));
            next.set_sp(fp + 16);
            Ok(next)
        }
        ARM64_MODE_FRAMELESS => {
            let sp = state.sp().map_err(|_| Error::Unknown)?;
            let stack_size = u64::from((encoding & ARM64_FRAMELESS_STACK_SIZE_MASK) >> 12) * 16;

            let mut next = state.clone();
            next.clear_volatiles();

            // Pairs sit at the top of the frame, highest-numbered member
            // at the highest address
            let mut loc = sp.wrapping_add(stack_size);
            for &(flag, lo, hi) in ARM64_PAIRS {
                if encoding & flag == 0 {
                    continue;
                }
                loc = loc.wrapping_sub(8);
                let value = mem::read_u64(mem, loc, scroll::LE).map_err(|_| Error::Unknown)?;
                next.set(hi, value);
                loc = loc.wrapping_sub(8);
                let value = mem::read_u64(mem, loc, scroll::LE).map_err(|_| Error::Unknown)?;
                next.set(lo, value);
            }

            // A frameless leaf never spilled its (possibly signed) return
            // address; it is still live in the link register
            let lr = state
                .get(arm64::Reg::Lr)
                .map_err(|_| Error::Unknown)?;
            next.set_ip(strip_ptr_auth(lr));
            next.set_sp(sp.wrapping_add(stack_size));
            Ok(next)
        }
        ARM64_MODE_DWARF => Err(Error::Unknown),
        _ => Err(Error::Unknown),
    }
}
