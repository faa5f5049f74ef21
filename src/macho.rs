//! In-memory Mach-O image parsing.
//!
//! A [`MachO`] view describes one loaded image, read entirely through the
//! task-memory reader: header, load commands, segments and sections, and the
//! symbol-table locators. All multi-byte fields pass through the image's
//! byte-order descriptor, and every pointer produced here is either
//! bounds-checked against a [`MemoryObject`] or read through a bounded copy.

use goblin::mach::header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64};
use goblin::mach::load_command::{
    LC_DYSYMTAB, LC_FUNCTION_STARTS, LC_ID_DYLIB, LC_LOAD_DYLIB, LC_SEGMENT, LC_SEGMENT_64,
    LC_SYMTAB, LC_UUID,
};
use goblin::mach::symbols::{N_SECT, N_STAB, N_TYPE};
use scroll::Endian;

use crate::error::{Error, Result};
use crate::leb::read_uleb128;
use crate::mem::{BufExt, MemoryObject, TaskMemory};

pub const SEG_TEXT: &str = "__TEXT";
pub const SEG_DATA: &str = "__DATA";
pub const SEG_OBJC: &str = "__OBJC";
pub const SEG_DWARF: &str = "__DWARF";
pub const SEG_LINKEDIT: &str = "__LINKEDIT";

/// One mapped segment, addresses as linked (unslid).
#[derive(Clone)]
pub struct Segment {
    pub name: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub sections: Vec<Section>,
}

/// One section, addresses as linked (unslid).
#[derive(Clone)]
pub struct Section {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
}

struct SymtabLocator {
    symoff: u32,
    nsyms: u32,
    stroff: u32,
    strsize: u32,
}

struct DysymtabRanges {
    ilocalsym: u32,
    nlocalsym: u32,
    iextdefsym: u32,
    nextdefsym: u32,
}

/// A parsed view of one Mach-O image in the target task.
pub struct MachO {
    base: u64,
    slide: i64,
    endian: Endian,
    is_64: bool,
    cputype: u32,
    text_vmsize: u64,
    segments: Vec<Segment>,
    symtab: Option<SymtabLocator>,
    dysymtab: Option<DysymtabRanges>,
    uuid: Option<[u8; 16]>,
    function_starts: Option<(u32, u32)>,
    install_name: Option<Vec<u8>>,
}

/// Compares a fixed 16-byte Mach-O name field with a string.
fn name_eq(field: &[u8; 16], name: &str) -> bool {
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..len] == name.as_bytes()
}

fn name_field(buf: &[u8], offset: usize) -> Result<[u8; 16]> {
    let mut field = [0u8; 16];
    field.copy_from_slice(buf.get(offset..offset + 16).ok_or(Error::Invalid)?);
    Ok(field)
}

impl MachO {
    /// Parses the image whose Mach-O header lives at `base` in the task.
    ///
    /// Unknown load commands are skipped via their recorded size; a header
    /// whose command area lies about its extent truncates the walk rather
    /// than failing it.
    pub fn parse(mem: &dyn TaskMemory, base: u64) -> Result<Self> {
        let mut header = [0u8; 28];
        mem.read_into(base, &mut header)?;

        let (endian, is_64) = match header.get_u32(0, Endian::Little)? {
            MH_MAGIC => (Endian::Little, false),
            MH_MAGIC_64 => (Endian::Little, true),
            MH_CIGAM => (Endian::Big, false),
            MH_CIGAM_64 => (Endian::Big, true),
            _ => return Err(Error::Invalid),
        };

        let cputype = header.get_u32(4, endian)?;
        let ncmds = header.get_u32(16, endian)?;
        let sizeofcmds = header.get_u32(20, endian)?;

        let header_size: u64 = if is_64 { 32 } else { 28 };
        let cmds = mem.map(base + header_size, u64::from(sizeofcmds))?;
        let buf = cmds.bytes();

        let mut view = Self {
            base,
            slide: 0,
            endian,
            is_64,
            cputype,
            text_vmsize: 0,
            segments: Vec::new(),
            symtab: None,
            dysymtab: None,
            uuid: None,
            function_starts: None,
            install_name: None,
        };

        let mut offset = 0usize;
        for _ in 0..ncmds {
            if offset + 8 > buf.len() {
                break;
            }
            let cmd = buf.get_u32(offset, endian)?;
            let cmdsize = buf.get_u32(offset + 4, endian)? as usize;
            // The header lied about either sizeofcmds or ncmds
            if cmdsize < 8 || offset + cmdsize > buf.len() {
                break;
            }

            match cmd {
                LC_SEGMENT => view.parse_segment(buf, offset, cmdsize, false)?,
                LC_SEGMENT_64 => view.parse_segment(buf, offset, cmdsize, true)?,
                LC_SYMTAB if cmdsize >= 24 => {
                    view.symtab = Some(SymtabLocator {
                        symoff: buf.get_u32(offset + 8, endian)?,
                        nsyms: buf.get_u32(offset + 12, endian)?,
                        stroff: buf.get_u32(offset + 16, endian)?,
                        strsize: buf.get_u32(offset + 20, endian)?,
                    });
                }
                LC_DYSYMTAB if cmdsize >= 24 => {
                    view.dysymtab = Some(DysymtabRanges {
                        ilocalsym: buf.get_u32(offset + 8, endian)?,
                        nlocalsym: buf.get_u32(offset + 12, endian)?,
                        iextdefsym: buf.get_u32(offset + 16, endian)?,
                        nextdefsym: buf.get_u32(offset + 20, endian)?,
                    });
                }
                LC_UUID if cmdsize >= 24 => {
                    let mut uuid = [0u8; 16];
                    uuid.copy_from_slice(&buf[offset + 8..offset + 24]);
                    view.uuid = Some(uuid);
                }
                LC_ID_DYLIB if cmdsize >= 24 => {
                    let name_offset = buf.get_u32(offset + 8, endian)? as usize;
                    if name_offset < cmdsize {
                        let name = &buf[offset + name_offset..offset + cmdsize];
                        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                        view.install_name = Some(name[..len].to_vec());
                    }
                }
                // Dependent-library entries are recognized but carry nothing
                // the unwinder needs
                LC_LOAD_DYLIB => {}
                LC_FUNCTION_STARTS if cmdsize >= 16 => {
                    view.function_starts = Some((
                        buf.get_u32(offset + 8, endian)?,
                        buf.get_u32(offset + 12, endian)?,
                    ));
                }
                _ => {}
            }

            offset += cmdsize;
        }

        let text = view
            .segments
            .iter()
            .find(|seg| name_eq(&seg.name, SEG_TEXT))
            .ok_or(Error::Invalid)?;
        view.slide = base.wrapping_sub(text.vmaddr) as i64;
        view.text_vmsize = text.vmsize;

        Ok(view)
    }

    fn parse_segment(&mut self, buf: &[u8], offset: usize, cmdsize: usize, is_64: bool) -> Result<()> {
        let endian = self.endian;
        let (seg_size, sect_size) = if is_64 { (72, 80) } else { (56, 68) };
        if cmdsize < seg_size {
            return Err(Error::Invalid);
        }

        let name = name_field(buf, offset + 8)?;
        let (vmaddr, vmsize, fileoff, nsects) = if is_64 {
            (
                buf.get_u64(offset + 24, endian)?,
                buf.get_u64(offset + 32, endian)?,
                buf.get_u64(offset + 40, endian)?,
                buf.get_u32(offset + 64, endian)?,
            )
        } else {
            (
                u64::from(buf.get_u32(offset + 24, endian)?),
                u64::from(buf.get_u32(offset + 28, endian)?),
                u64::from(buf.get_u32(offset + 32, endian)?),
                buf.get_u32(offset + 48, endian)?,
            )
        };

        let mut sections = Vec::with_capacity(nsects as usize);
        let mut sect_offset = offset + seg_size;
        for _ in 0..nsects {
            if sect_offset + sect_size > offset + cmdsize {
                break;
            }

            let (addr, size, file_offset) = if is_64 {
                (
                    buf.get_u64(sect_offset + 32, endian)?,
                    buf.get_u64(sect_offset + 40, endian)?,
                    buf.get_u32(sect_offset + 48, endian)?,
                )
            } else {
                (
                    u64::from(buf.get_u32(sect_offset + 32, endian)?),
                    u64::from(buf.get_u32(sect_offset + 36, endian)?),
                    buf.get_u32(sect_offset + 40, endian)?,
                )
            };

            sections.push(Section {
                sectname: name_field(buf, sect_offset)?,
                segname: name_field(buf, sect_offset + 16)?,
                addr,
                size,
                offset: file_offset,
            });
            sect_offset += sect_size;
        }

        self.segments.push(Segment {
            name,
            vmaddr,
            vmsize,
            fileoff,
            sections,
        });
        Ok(())
    }

    /// The live address of the image's header.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Difference between the live load address and the linked address.
    #[inline]
    pub fn slide(&self) -> i64 {
        self.slide
    }

    #[inline]
    pub fn endian(&self) -> Endian {
        self.endian
    }

    #[inline]
    pub fn is_64(&self) -> bool {
        self.is_64
    }

    #[inline]
    pub fn cputype(&self) -> u32 {
        self.cputype
    }

    pub fn uuid(&self) -> Option<&[u8; 16]> {
        self.uuid.as_ref()
    }

    /// The install name recorded by `LC_ID_DYLIB`, for images that have one.
    pub fn install_name(&self) -> Option<&[u8]> {
        self.install_name.as_deref()
    }

    /// Pointer width of the image in bytes.
    #[inline]
    pub fn word_size(&self) -> u64 {
        if self.is_64 { 8 } else { 4 }
    }

    fn apply_slide(&self, addr: u64) -> u64 {
        addr.wrapping_add(self.slide as u64)
    }

    /// Whether `addr` falls inside the image's mapped `__TEXT` range.
    pub fn contains_address(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.text_vmsize
    }

    fn find_segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|seg| name_eq(&seg.name, name))
    }

    fn find_section(&self, seg_name: &str, sect_name: &str) -> Option<(&Segment, &Section)> {
        let segment = self.find_segment(seg_name)?;
        let section = segment
            .sections
            .iter()
            .find(|sect| name_eq(&sect.sectname, sect_name))?;
        Some((segment, section))
    }

    /// Maps the named section into the analyzer's address space.
    ///
    /// The section's range is validated against its segment's declared
    /// extent before mapping; an inconsistent section is `Invalid`, a
    /// missing one is `NotFound`.
    pub fn map_section(
        &self,
        mem: &dyn TaskMemory,
        seg_name: &str,
        sect_name: &str,
    ) -> Result<MemoryObject> {
        let (segment, section) = self
            .find_section(seg_name, sect_name)
            .ok_or(Error::NotFound)?;

        let seg_end = segment
            .vmaddr
            .checked_add(segment.vmsize)
            .ok_or(Error::Invalid)?;
        let sect_end = section
            .addr
            .checked_add(section.size)
            .ok_or(Error::Invalid)?;
        if section.addr < segment.vmaddr || sect_end > seg_end {
            return Err(Error::Invalid);
        }

        mem.map(self.apply_slide(section.addr), section.size)
    }

    /// The live `[start, end)` range of the named section, if present.
    pub fn section_range(&self, seg_name: &str, sect_name: &str) -> Option<(u64, u64)> {
        let (_, section) = self.find_section(seg_name, sect_name)?;
        let start = self.apply_slide(section.addr);
        Some((start, start + section.size))
    }

    /// Translates a `__LINKEDIT` file offset into a live task address.
    fn linkedit_addr(&self, fileoff: u32) -> Result<u64> {
        let linkedit = self.find_segment(SEG_LINKEDIT).ok_or(Error::NotFound)?;
        let delta = u64::from(fileoff)
            .checked_sub(linkedit.fileoff)
            .ok_or(Error::Invalid)?;
        if delta >= linkedit.vmsize {
            return Err(Error::Invalid);
        }
        Ok(self.apply_slide(linkedit.vmaddr) + delta)
    }

    /// The 1-based ordinal of the section containing the unslid address, as
    /// used by nlist `n_sect` fields.
    fn section_ordinal(&self, unslid: u64) -> Option<u8> {
        let mut ordinal = 0u8;
        for segment in &self.segments {
            for section in &segment.sections {
                ordinal = ordinal.checked_add(1)?;
                if unslid >= section.addr && unslid - section.addr < section.size {
                    return Some(ordinal);
                }
            }
        }
        None
    }

    /// Finds the nearest symbol at or below `ip` and hands its name (leading
    /// underscore stripped) and live address to `cb`.
    ///
    /// The scan covers the `LC_DYSYMTAB` local and external-defined ranges
    /// when present, skips debugging stabs, and only considers symbols
    /// defined in the same section as `ip`.
    pub fn find_symbol(
        &self,
        mem: &dyn TaskMemory,
        ip: u64,
        cb: impl FnOnce(&[u8], u64),
    ) -> Result<()> {
        let symtab = self.symtab.as_ref().ok_or(Error::NotFound)?;
        let unslid = ip.wrapping_sub(self.slide as u64);
        let ip_section = self.section_ordinal(unslid);

        let nlist_size = if self.is_64 { 16 } else { 12 };
        let symbols = mem.map(
            self.linkedit_addr(symtab.symoff)?,
            u64::from(symtab.nsyms) * nlist_size as u64,
        )?;
        let strings = mem.map(
            self.linkedit_addr(symtab.stroff)?,
            u64::from(symtab.strsize),
        )?;

        let ranges: [(u32, u32); 2] = match &self.dysymtab {
            Some(dysym) => [
                (dysym.ilocalsym, dysym.nlocalsym),
                (dysym.iextdefsym, dysym.nextdefsym),
            ],
            None => [(0, symtab.nsyms), (0, 0)],
        };

        let buf = symbols.bytes();
        let mut best: Option<(u64, u32)> = None;
        for (start, count) in ranges {
            for index in start..start.saturating_add(count).min(symtab.nsyms) {
                let offset = index as usize * nlist_size;
                let n_type = buf.get_u8(offset + 4)?;
                if n_type & N_STAB != 0 || n_type & N_TYPE != N_SECT {
                    continue;
                }
                if let Some(ordinal) = ip_section {
                    if buf.get_u8(offset + 5)? != ordinal {
                        continue;
                    }
                }

                let value = buf.get_ptr(offset + 8, self.is_64, self.endian)?;
                if value > unslid {
                    continue;
                }
                if best.is_none_or(|(best_value, _)| value > best_value) {
                    best = Some((value, buf.get_u32(offset, self.endian)?));
                }
            }
        }

        let (value, strx) = best.ok_or(Error::NotFound)?;
        let names = strings.bytes();
        let name_start = strx as usize;
        let name = names.get(name_start..).ok_or(Error::Invalid)?;
        let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let name = &name[..len];
        let name = name.strip_prefix(b"_").unwrap_or(name);

        cb(name, self.apply_slide(value));
        Ok(())
    }

    /// Walks the `LC_FUNCTION_STARTS` delta stream for the start address of
    /// the function containing `ip`. Used when the symbol table has no
    /// answer.
    pub fn nearest_function_start(&self, mem: &dyn TaskMemory, ip: u64) -> Result<u64> {
        let (dataoff, datasize) = self.function_starts.ok_or(Error::NotFound)?;
        let blob = mem.map(self.linkedit_addr(dataoff)?, u64::from(datasize))?;

        let text = self.find_segment(SEG_TEXT).ok_or(Error::Invalid)?;
        let unslid = ip.wrapping_sub(self.slide as u64);

        let buf = blob.bytes();
        let mut offset = 0usize;
        let mut address = text.vmaddr;
        let mut best = None;
        while offset < buf.len() {
            let delta = read_uleb128(buf, &mut offset)?;
            if delta == 0 {
                break;
            }
            address = address.wrapping_add(delta);
            if address > unslid {
                break;
            }
            best = Some(address);
        }

        best.map(|addr| self.apply_slide(addr)).ok_or(Error::NotFound)
    }
}
