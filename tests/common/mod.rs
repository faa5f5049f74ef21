//! Shared scaffolding for the regression scenarios: a fake task-memory
//! source and builders for synthetic Mach-O images, playing the role the
//! hand-assembled test binaries do in a live harness.

use crash_unwind::error::{Error, Result};
use crash_unwind::mem::{MAX_READ, TaskMemory};

// usr/include/mach-o/loader.h
const MH_MAGIC: u32 = 0xfeedface;
const MH_MAGIC_64: u32 = 0xfeedfacf;
const LC_SEGMENT: u32 = 0x1;
const LC_SYMTAB: u32 = 0x2;
const LC_SEGMENT_64: u32 = 0x19;
const LC_FUNCTION_STARTS: u32 = 0x26;

pub const CPU_TYPE_X86: u32 = 7;
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;

/// Task memory backed by a set of disjoint in-process regions.
pub struct FakeTask {
    regions: Vec<(u64, Vec<u8>)>,
}

impl FakeTask {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    pub fn add_region(&mut self, base: u64, data: Vec<u8>) {
        self.regions.push((base, data));
    }
}

impl TaskMemory for FakeTask {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() > MAX_READ {
            return Err(Error::Invalid);
        }
        for (base, data) in &self.regions {
            let Some(start) = addr.checked_sub(*base) else {
                continue;
            };
            let start = start as usize;
            let Some(end) = start.checked_add(buf.len()) else {
                continue;
            };
            if end <= data.len() {
                buf.copy_from_slice(&data[start..end]);
                return Ok(());
            }
        }
        Err(Error::AccessDenied)
    }
}

pub fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return out;
        }
    }
}

fn name16(name: &str) -> [u8; 16] {
    let mut field = [0u8; 16];
    field[..name.len()].copy_from_slice(name.as_bytes());
    field
}

/// One section of a synthetic image. `addr` is both the linked and live
/// address (the builder produces unslid images).
pub struct SectionDef {
    pub seg: &'static str,
    pub sect: &'static str,
    pub addr: u64,
    pub data: Vec<u8>,
}

pub struct SymtabDef {
    pub linkedit_base: u64,
    /// `(name, unslid address)`; every symbol is marked as defined in
    /// section 1.
    pub symbols: Vec<(&'static str, u64)>,
    /// Function start offsets relative to the start of `__TEXT`, ascending.
    pub function_starts: Vec<u64>,
}

pub struct ImageDef {
    pub base: u64,
    pub is_64: bool,
    pub cputype: u32,
    pub text_vmsize: u64,
    pub sections: Vec<SectionDef>,
    pub symtab: Option<SymtabDef>,
}

impl ImageDef {
    pub fn new_64(base: u64, text_vmsize: u64) -> Self {
        Self {
            base,
            is_64: true,
            cputype: CPU_TYPE_X86_64,
            text_vmsize,
            sections: Vec::new(),
            symtab: None,
        }
    }

    pub fn new_32(base: u64, text_vmsize: u64) -> Self {
        Self {
            base,
            is_64: false,
            cputype: CPU_TYPE_X86,
            text_vmsize,
            sections: Vec::new(),
            symtab: None,
        }
    }
}

/// Emits the image into the fake task: the header block at `base`, one
/// region per section, and the linkedit blob when a symbol table is
/// requested.
pub fn build_image(task: &mut FakeTask, def: &ImageDef) {
    // Group sections by segment, preserving first-appearance order, with
    // __TEXT always present and first
    let mut seg_names: Vec<&'static str> = vec!["__TEXT"];
    for section in &def.sections {
        if !seg_names.contains(&section.seg) {
            seg_names.push(section.seg);
        }
    }

    let linkedit = def.symtab.as_ref().map(build_linkedit);

    let mut commands = Vec::new();
    let mut ncmds = 0u32;

    for seg_name in &seg_names {
        let sections: Vec<&SectionDef> = def
            .sections
            .iter()
            .filter(|s| s.seg == *seg_name)
            .collect();

        let (vmaddr, vmsize) = if *seg_name == "__TEXT" {
            (def.base, def.text_vmsize)
        } else {
            let lo = sections.iter().map(|s| s.addr).min().unwrap();
            let hi = sections
                .iter()
                .map(|s| s.addr + s.data.len() as u64)
                .max()
                .unwrap();
            (lo, hi - lo)
        };

        push_segment(&mut commands, def.is_64, seg_name, vmaddr, vmsize, &sections);
        ncmds += 1;
    }

    if let Some((blob, symoff, stroff, strsize, nsyms, fs_off, fs_size)) = &linkedit {
        let linkedit_base = def.symtab.as_ref().unwrap().linkedit_base;
        push_segment(
            &mut commands,
            def.is_64,
            "__LINKEDIT",
            linkedit_base,
            blob.len() as u64,
            &[],
        );
        ncmds += 1;

        push_u32(&mut commands, LC_SYMTAB);
        push_u32(&mut commands, 24);
        push_u32(&mut commands, *symoff);
        push_u32(&mut commands, *nsyms);
        push_u32(&mut commands, *stroff);
        push_u32(&mut commands, *strsize);
        ncmds += 1;

        if *fs_size > 0 {
            push_u32(&mut commands, LC_FUNCTION_STARTS);
            push_u32(&mut commands, 16);
            push_u32(&mut commands, *fs_off);
            push_u32(&mut commands, *fs_size);
            ncmds += 1;
        }

        task.add_region(linkedit_base, blob.clone());
    }

    let mut header = Vec::new();
    push_u32(&mut header, if def.is_64 { MH_MAGIC_64 } else { MH_MAGIC });
    push_u32(&mut header, def.cputype);
    push_u32(&mut header, 0); // cpusubtype
    push_u32(&mut header, 0x2); // MH_EXECUTE
    push_u32(&mut header, ncmds);
    push_u32(&mut header, commands.len() as u32);
    push_u32(&mut header, 0); // flags
    if def.is_64 {
        push_u32(&mut header, 0); // reserved
    }
    header.extend_from_slice(&commands);
    task.add_region(def.base, header);

    for section in &def.sections {
        task.add_region(section.addr, section.data.clone());
    }
}

/// Returns `(blob, symoff, stroff, strsize, nsyms, fs_off, fs_size)`.
fn build_linkedit(def: &SymtabDef) -> (Vec<u8>, u32, u32, u32, u32, u32, u32) {
    let mut strtab = vec![0u8];
    let mut nlists = Vec::new();

    for (name, value) in &def.symbols {
        let strx = strtab.len() as u32;
        strtab.push(b'_');
        strtab.extend_from_slice(name.as_bytes());
        strtab.push(0);

        push_u32(&mut nlists, strx);
        nlists.push(0x0e); // n_type: N_SECT
        nlists.push(1); // n_sect
        push_u16(&mut nlists, 0); // n_desc
        push_u64(&mut nlists, *value);
    }

    let mut starts = Vec::new();
    if !def.function_starts.is_empty() {
        let mut prev = 0u64;
        for offset in &def.function_starts {
            starts.extend_from_slice(&uleb(offset - prev));
            prev = *offset;
        }
        starts.push(0);
    }

    let symoff = 0u32;
    let stroff = nlists.len() as u32;
    let strsize = strtab.len() as u32;
    let fs_off = stroff + strsize;
    let fs_size = starts.len() as u32;

    let mut blob = nlists;
    blob.extend_from_slice(&strtab);
    blob.extend_from_slice(&starts);

    (
        blob,
        symoff,
        stroff,
        strsize,
        def.symbols.len() as u32,
        fs_off,
        fs_size,
    )
}

fn push_segment(
    out: &mut Vec<u8>,
    is_64: bool,
    name: &str,
    vmaddr: u64,
    vmsize: u64,
    sections: &[&SectionDef],
) {
    if is_64 {
        push_u32(out, LC_SEGMENT_64);
        push_u32(out, 72 + 80 * sections.len() as u32);
        out.extend_from_slice(&name16(name));
        push_u64(out, vmaddr);
        push_u64(out, vmsize);
        push_u64(out, 0); // fileoff
        push_u64(out, vmsize); // filesize
        push_u32(out, 7); // maxprot
        push_u32(out, 5); // initprot
        push_u32(out, sections.len() as u32);
        push_u32(out, 0); // flags

        for section in sections {
            out.extend_from_slice(&name16(section.sect));
            out.extend_from_slice(&name16(section.seg));
            push_u64(out, section.addr);
            push_u64(out, section.data.len() as u64);
            push_u32(out, 0); // offset
            push_u32(out, 0); // align
            push_u32(out, 0); // reloff
            push_u32(out, 0); // nreloc
            push_u32(out, 0); // flags
            push_u32(out, 0); // reserved1
            push_u32(out, 0); // reserved2
            push_u32(out, 0); // reserved3
        }
    } else {
        push_u32(out, LC_SEGMENT);
        push_u32(out, 56 + 68 * sections.len() as u32);
        out.extend_from_slice(&name16(name));
        push_u32(out, vmaddr as u32);
        push_u32(out, vmsize as u32);
        push_u32(out, 0); // fileoff
        push_u32(out, vmsize as u32); // filesize
        push_u32(out, 7); // maxprot
        push_u32(out, 5); // initprot
        push_u32(out, sections.len() as u32);
        push_u32(out, 0); // flags

        for section in sections {
            out.extend_from_slice(&name16(section.sect));
            out.extend_from_slice(&name16(section.seg));
            push_u32(out, section.addr as u32);
            push_u32(out, section.data.len() as u32);
            push_u32(out, 0); // offset
            push_u32(out, 0); // align
            push_u32(out, 0); // reloff
            push_u32(out, 0); // nreloc
            push_u32(out, 0); // flags
            push_u32(out, 0); // reserved1
            push_u32(out, 0); // reserved2
        }
    }
}

/// Builds a one-page `__unwind_info` section with a regular second-level
/// page holding `entries` as `(function offset, encoding)` pairs.
/// `text_end` is the sentinel offset closing the covered range.
pub fn unwind_info_regular(entries: &[(u32, u32)], text_end: u32) -> Vec<u8> {
    let header_len = 28u32;
    let index_off = header_len;
    let index_len = 2 * 12u32;
    let page_off = index_off + index_len;

    let mut out = Vec::new();
    push_u32(&mut out, 1); // version
    push_u32(&mut out, header_len); // common encodings (empty)
    push_u32(&mut out, 0);
    push_u32(&mut out, header_len); // personalities (empty)
    push_u32(&mut out, 0);
    push_u32(&mut out, index_off);
    push_u32(&mut out, 2);

    // First-level index: one real entry plus the terminating sentinel
    push_u32(&mut out, entries[0].0);
    push_u32(&mut out, page_off);
    push_u32(&mut out, 0); // lsda index
    push_u32(&mut out, text_end);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);

    // Regular second-level page
    push_u32(&mut out, 2); // kind
    push_u16(&mut out, 8); // entryPageOffset
    push_u16(&mut out, entries.len() as u16);
    for (func_off, encoding) in entries {
        push_u32(&mut out, *func_off);
        push_u32(&mut out, *encoding);
    }

    out
}

/// Builds a `__unwind_info` section with a compressed second-level page.
/// Entries are `(offset relative to first_func, encoding index)`; indices
/// below `common.len()` select from the common array, the rest from
/// `page_encodings`.
pub fn unwind_info_compressed(
    common: &[u32],
    page_encodings: &[u32],
    first_func: u32,
    entries: &[(u32, u8)],
    text_end: u32,
) -> Vec<u8> {
    let header_len = 28u32;
    let common_off = header_len;
    let common_len = 4 * common.len() as u32;
    let index_off = common_off + common_len;
    let index_len = 2 * 12u32;
    let page_off = index_off + index_len;

    let mut out = Vec::new();
    push_u32(&mut out, 1); // version
    push_u32(&mut out, common_off);
    push_u32(&mut out, common.len() as u32);
    push_u32(&mut out, common_off); // personalities (empty)
    push_u32(&mut out, 0);
    push_u32(&mut out, index_off);
    push_u32(&mut out, 2);

    for encoding in common {
        push_u32(&mut out, *encoding);
    }

    push_u32(&mut out, first_func);
    push_u32(&mut out, page_off);
    push_u32(&mut out, 0);
    push_u32(&mut out, text_end);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);

    // Compressed second-level page
    let entries_off = 12u16;
    let encodings_off = entries_off + 4 * entries.len() as u16;
    push_u32(&mut out, 3); // kind
    push_u16(&mut out, entries_off);
    push_u16(&mut out, entries.len() as u16);
    push_u16(&mut out, encodings_off);
    push_u16(&mut out, page_encodings.len() as u16);
    for (rel_off, enc_index) in entries {
        push_u32(&mut out, (u32::from(*enc_index) << 24) | (rel_off & 0x00ff_ffff));
    }
    for encoding in page_encodings {
        push_u32(&mut out, *encoding);
    }

    out
}
