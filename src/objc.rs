//! Objective-C metadata parsing.
//!
//! Extracts `(is_meta, class, selector, IMP)` tuples from an image's ObjC
//! runtime data, covering both the legacy ObjC1 `__OBJC.__module_info`
//! layout and the modern ObjC2 `__DATA.__objc_classlist` layout in 32- and
//! 64-bit flavors. Everything is read through validated memory objects or
//! bounded copies; a class that fails to parse is skipped, not fatal.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::macho::{MachO, SEG_DATA, SEG_OBJC};
use crate::mem::{self, BufExt, MemoryObject, TaskMemory};

const SECT_MODULE_INFO: &str = "__module_info";
const SECT_CLASS_LIST: &str = "__objc_classlist";
const SECT_OBJC_CONST: &str = "__objc_const";
const SECT_OBJC_DATA: &str = "__objc_data";

/// ObjC1 class-info flag: the class's method list is a single inline list
/// rather than a NULL-terminated array of list pointers.
const CLS_NO_METHOD_ARRAY: u32 = 0x4000;
/// Alternate ObjC1 method-list array terminator.
const END_OF_METHODS_LIST: u32 = 0xffff_ffff;

bitflags! {
    /// Flags in an ObjC2 class's `data_rw` structure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ClassRwFlags: u32 {
        /// The runtime has realized the class; its fields are valid.
        const REALIZED = 1 << 31;
        /// `data_ro` is a heap-allocated copy rather than a pointer into
        /// `__objc_const`.
        const COPIED_RO = 1 << 27;
    }
}

/// Longest class or selector name the parser hands to a visitor; longer
/// names are truncated.
const NAME_BUF: usize = 512;

const CLASS_CACHE_SIZE: usize = 1024;

/// Per-capture ObjC scratch state.
///
/// Holds the currently-mapped metadata sections, the sticky "this process
/// speaks ObjC2" flag, and an open-addressed `data_rw → data_ro` hint
/// table. The table storage is allocated once at construction, before any
/// crash; nothing on the parse path allocates.
pub struct ObjcCache {
    last_image: Option<u64>,
    objc_const: Option<MemoryObject>,
    class_list: Option<MemoryObject>,
    objc_data: Option<MemoryObject>,
    got_objc2: bool,
    keys: Box<[u64]>,
    values: Box<[u64]>,
}

impl Default for ObjcCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjcCache {
    pub fn new() -> Self {
        Self {
            last_image: None,
            objc_const: None,
            class_list: None,
            objc_data: None,
            got_objc2: false,
            keys: vec![0; CLASS_CACHE_SIZE].into_boxed_slice(),
            values: vec![0; CLASS_CACHE_SIZE].into_boxed_slice(),
        }
    }

    fn cache_index(key: u64) -> usize {
        ((key >> 2) as usize) % CLASS_CACHE_SIZE
    }

    /// Looks up a `data_ro` address previously recorded for `key`, or 0.
    fn cache_lookup(&self, key: u64) -> u64 {
        let index = Self::cache_index(key);
        if self.keys[index] == key {
            self.values[index]
        } else {
            0
        }
    }

    /// Records a `data_rw → data_ro` association. The table has no chaining
    /// and no eviction: an occupied slot keeps its existing entry. It is
    /// strictly a hint.
    fn cache_set(&mut self, key: u64, value: u64) {
        let index = Self::cache_index(key);
        if self.keys[index] == 0 {
            self.keys[index] = key;
            self.values[index] = value;
        }
    }

    fn drop_mapped_sections(&mut self) {
        self.objc_const = None;
        self.class_list = None;
        self.objc_data = None;
    }

    /// Maps the three ObjC2 metadata sections for `view`, reusing the
    /// existing mappings when the image is unchanged.
    fn map_sections(&mut self, mem: &dyn TaskMemory, view: &MachO) -> Result<()> {
        if self.last_image == Some(view.base()) {
            return Ok(());
        }

        // Reset eagerly so a partial failure cannot leave stale mappings
        // attributed to the new image
        self.drop_mapped_sections();
        self.last_image = None;

        // All the read-only class data lives in __objc_const
        self.objc_const = Some(view.map_section(mem, SEG_DATA, SECT_OBJC_CONST)?);
        self.class_list = Some(view.map_section(mem, SEG_DATA, SECT_CLASS_LIST)?);
        // If the class list was found, the data section must also be found
        self.objc_data = Some(view.map_section(mem, SEG_DATA, SECT_OBJC_DATA)?);

        self.last_image = Some(view.base());
        Ok(())
    }
}

/// Streams every method in `view`'s ObjC metadata to `visitor` as
/// `(is_meta, class_name, method_name, imp)`.
///
/// Tries the ObjC1 layout first, falling back to ObjC2; once ObjC2 data has
/// been seen in any image, the ObjC1 probe is skipped for the rest of the
/// capture. Name slices are only valid for the duration of the call.
pub fn enumerate_methods<F>(
    mem: &dyn TaskMemory,
    view: &MachO,
    cache: &mut ObjcCache,
    mut visitor: F,
) -> Result<()>
where
    F: FnMut(bool, &[u8], &[u8], u64),
{
    let objc1 = if cache.got_objc2 {
        // ObjC1 data couldn't exist before; don't bother probing for it
        Err(Error::NotFound)
    } else {
        parse_module_info(mem, view, &mut visitor)
    };

    match objc1 {
        Ok(()) => Ok(()),
        Err(Error::NotFound) => {
            parse_class_list(mem, view, cache, &mut visitor)?;
            cache.got_objc2 = true;
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Reads a fixed-size structure into a stack buffer.
fn read_struct<'b>(mem: &dyn TaskMemory, addr: u64, buf: &'b mut [u8]) -> Result<&'b [u8]> {
    mem.read_into(addr, buf)?;
    Ok(buf)
}

// ObjC1 structure sizes
const OBJC1_MODULE_SIZE: usize = 16; // version, size, name, symtab
const OBJC1_SYMTAB_SIZE: usize = 12; // sel_ref_cnt, refs, cls_def_count, cat_def_count
const OBJC1_CLASS_SIZE: usize = 40; // isa .. protocols
const OBJC1_METHOD_LIST_SIZE: usize = 8; // obsolete, count
const OBJC1_METHOD_SIZE: usize = 12; // name, types, imp

/// Parses legacy class data from an `__OBJC.__module_info` section.
fn parse_module_info<F>(mem: &dyn TaskMemory, view: &MachO, visitor: &mut F) -> Result<()>
where
    F: FnMut(bool, &[u8], &[u8], u64),
{
    let endian = view.endian();
    let modules = view.map_section(mem, SEG_OBJC, SECT_MODULE_INFO)?;
    let buf = modules.bytes();

    for module_off in (0..buf.len()).step_by(OBJC1_MODULE_SIZE) {
        if module_off + OBJC1_MODULE_SIZE > buf.len() {
            break;
        }
        let symtab_ptr = u64::from(buf.get_u32(module_off + 12, endian)?);
        if symtab_ptr == 0 {
            continue;
        }

        let mut symtab_buf = [0u8; OBJC1_SYMTAB_SIZE];
        let symtab = read_struct(mem, symtab_ptr, &mut symtab_buf)?;
        let class_count = symtab.get_u16(8, endian)?;

        for i in 0..u64::from(class_count) {
            // Class pointers are laid out immediately after the symtab
            // header
            let cursor = symtab_ptr + OBJC1_SYMTAB_SIZE as u64 + i * 4;
            let class_ptr = u64::from(mem::read_u32(mem, cursor, endian)?);

            let mut class_buf = [0u8; OBJC1_CLASS_SIZE];
            let class = match read_struct(mem, class_ptr, &mut class_buf) {
                Ok(class) => class,
                Err(err) => {
                    log::debug!("skipping unreadable ObjC1 class at {class_ptr:#x}: {err}");
                    continue;
                }
            };

            if let Err(err) = parse_objc1_class(mem, view, class, false, visitor) {
                log::debug!("skipping ObjC1 class at {class_ptr:#x}: {err}");
                continue;
            }

            // The metaclass hangs off the class's isa pointer
            let isa = u64::from(class.get_u32(0, endian)?);
            let mut meta_buf = [0u8; OBJC1_CLASS_SIZE];
            match read_struct(mem, isa, &mut meta_buf) {
                Ok(metaclass) => {
                    if let Err(err) = parse_objc1_class(mem, view, metaclass, true, visitor) {
                        log::debug!("skipping ObjC1 metaclass at {isa:#x}: {err}");
                    }
                }
                Err(err) => {
                    log::debug!("skipping unreadable ObjC1 metaclass at {isa:#x}: {err}");
                }
            }
        }
    }

    Ok(())
}

fn parse_objc1_class<F>(
    mem: &dyn TaskMemory,
    view: &MachO,
    class: &[u8],
    is_meta: bool,
    visitor: &mut F,
) -> Result<()>
where
    F: FnMut(bool, &[u8], &[u8], u64),
{
    let endian = view.endian();

    let name_ptr = u64::from(class.get_u32(8, endian)?);
    let mut class_name_buf = [0u8; NAME_BUF];
    let class_name_len = mem::read_cstring(mem, name_ptr, &mut class_name_buf)?.len();

    // The methods field is either a pointer to a single method_list, or a
    // pointer to a terminated array of method_list pointers, depending on
    // CLS_NO_METHOD_ARRAY in the info field
    let info = class.get_u32(16, endian)?;
    let has_list_array = info & CLS_NO_METHOD_ARRAY == 0;
    let mut list_cursor = u64::from(class.get_u32(28, endian)?);

    loop {
        let list_ptr = if has_list_array {
            let ptr = u64::from(mem::read_u32(mem, list_cursor, endian)?);
            // The runtime accepts either terminator
            if ptr == 0 || ptr == u64::from(END_OF_METHODS_LIST) {
                break;
            }
            list_cursor += 4;
            ptr
        } else {
            // A NULL single list simply means no methods
            if list_cursor == 0 {
                break;
            }
            list_cursor
        };

        let mut list_buf = [0u8; OBJC1_METHOD_LIST_SIZE];
        let list = read_struct(mem, list_ptr, &mut list_buf)?;
        let count = list.get_u32(4, endian)?;

        for i in 0..u64::from(count) {
            let method_ptr =
                list_ptr + OBJC1_METHOD_LIST_SIZE as u64 + i * OBJC1_METHOD_SIZE as u64;
            let mut method_buf = [0u8; OBJC1_METHOD_SIZE];
            let method = read_struct(mem, method_ptr, &mut method_buf)?;

            let sel_ptr = u64::from(method.get_u32(0, endian)?);
            let imp = u64::from(method.get_u32(8, endian)?);

            let mut sel_buf = [0u8; NAME_BUF];
            let sel = mem::read_cstring(mem, sel_ptr, &mut sel_buf)?;

            visitor(is_meta, &class_name_buf[..class_name_len], sel, imp);
        }

        if !has_list_array {
            break;
        }
    }

    Ok(())
}

// ObjC2 structure sizes, by image pointer width
fn objc2_class_size(is_64: bool) -> u64 {
    // isa, superclass, cache, vtable, data_rw
    if is_64 { 40 } else { 20 }
}

fn objc2_rw_size(is_64: bool) -> usize {
    // flags, version, data_ro
    if is_64 { 16 } else { 12 }
}

fn objc2_ro_size(is_64: bool) -> u64 {
    if is_64 { 72 } else { 40 }
}

/// Field offsets inside `data_ro`: (name, baseMethods).
fn objc2_ro_offsets(is_64: bool) -> (usize, usize) {
    if is_64 { (24, 32) } else { (16, 20) }
}

/// Parses modern class data from a `__DATA.__objc_classlist` section.
fn parse_class_list<F>(
    mem: &dyn TaskMemory,
    view: &MachO,
    cache: &mut ObjcCache,
    visitor: &mut F,
) -> Result<()>
where
    F: FnMut(bool, &[u8], &[u8], u64),
{
    cache.map_sections(mem, view)?;

    let endian = view.endian();
    let is_64 = view.is_64();
    let word = view.word_size();
    let class_size = objc2_class_size(is_64);

    let class_list = cache.class_list.take().ok_or(Error::Internal)?;
    let result: Result<()> = (|| {
        let list = class_list.bytes();
        let class_count = list.len() / word as usize;

        for i in 0..class_count {
            let class_ptr = list.get_ptr(i * word as usize, is_64, endian)?;

            let data = cache.objc_data.as_ref().ok_or(Error::Internal)?;
            let Some(class) = data.remap(class_ptr, class_size) else {
                log::debug!("class pointer {class_ptr:#x} lies outside __objc_data, skipping");
                continue;
            };
            let isa = class.get_ptr(0, is_64, endian)?;
            let data_rw = class.get_ptr((4 * word) as usize, is_64, endian)?;

            if let Err(err) = parse_objc2_class(mem, view, cache, data_rw, false, visitor) {
                log::debug!("skipping ObjC2 class at {class_ptr:#x}: {err}");
            }

            // And again for the metaclass, which carries the class (+)
            // methods
            let data = cache.objc_data.as_ref().ok_or(Error::Internal)?;
            let Some(metaclass) = data.remap(isa, class_size) else {
                log::debug!("metaclass pointer {isa:#x} lies outside __objc_data, skipping");
                continue;
            };
            let meta_rw = metaclass.get_ptr((4 * word) as usize, is_64, endian)?;

            if let Err(err) = parse_objc2_class(mem, view, cache, meta_rw, true, visitor) {
                log::debug!("skipping ObjC2 metaclass at {isa:#x}: {err}");
            }
        }
        Ok(())
    })();

    cache.class_list = Some(class_list);
    result
}

fn parse_objc2_class<F>(
    mem: &dyn TaskMemory,
    view: &MachO,
    cache: &mut ObjcCache,
    data_rw: u64,
    is_meta: bool,
    visitor: &mut F,
) -> Result<()>
where
    F: FnMut(bool, &[u8], &[u8], u64),
{
    let endian = view.endian();
    let is_64 = view.is_64();
    let word = view.word_size();
    let ro_size = objc2_ro_size(is_64);
    let (name_off, methods_off) = objc2_ro_offsets(is_64);

    // The low bits of the data pointer are runtime flags
    let data_ptr = data_rw & !3u64;

    let mut ro_copy = [0u8; 72];
    let ro_copy = &mut ro_copy[..ro_size as usize];

    // (name_ptr, methods_ptr), from whichever representation of data_ro we
    // manage to reach
    let mut cached_ro = cache.cache_lookup(data_ptr);
    let (name_ptr, methods_ptr) = if cached_ro == 0 {
        let mut rw_buf = [0u8; 16];
        let rw = read_struct(mem, data_ptr, &mut rw_buf[..objc2_rw_size(is_64)])?;
        let flags = ClassRwFlags::from_bits_retain(rw.get_u32(0, endian)?);

        // An unrealized class's fields have not been populated by the
        // runtime and cannot be trusted
        if !flags.contains(ClassRwFlags::REALIZED) {
            return Ok(());
        }

        cached_ro = rw.get_ptr(8, is_64, endian)?;

        let ro: &[u8] = if flags.contains(ClassRwFlags::COPIED_RO) {
            // Heap-allocated copy; only reachable through a bounded read
            read_struct(mem, cached_ro, ro_copy)?
        } else {
            let objc_const = cache.objc_const.as_ref().ok_or(Error::Internal)?;
            objc_const.remap(cached_ro, ro_size).ok_or(Error::Invalid)?
        };
        let fields = (
            ro.get_ptr(name_off, is_64, endian)?,
            ro.get_ptr(methods_off, is_64, endian)?,
        );

        cache.cache_set(data_ptr, cached_ro);
        fields
    } else {
        // The cached address was validated when it was recorded; try the
        // cheap remap first and fall back to a copy
        let objc_const = cache.objc_const.as_ref().ok_or(Error::Internal)?;
        let ro: &[u8] = match objc_const.remap(cached_ro, ro_size) {
            Some(ro) => ro,
            None => read_struct(mem, cached_ro, ro_copy)?,
        };
        (
            ro.get_ptr(name_off, is_64, endian)?,
            ro.get_ptr(methods_off, is_64, endian)?,
        )
    };

    let mut class_name_buf = [0u8; NAME_BUF];
    let class_name_len = mem::read_cstring(mem, name_ptr, &mut class_name_buf)?.len();

    if methods_ptr == 0 {
        return Ok(());
    }

    // Method list: an { entsize, count } header followed by count entries
    // of entsize bytes; the low entsize bits are flags
    let objc_const = cache.objc_const.as_ref().ok_or(Error::Internal)?;
    let header = objc_const.remap(methods_ptr, 8).ok_or(Error::Invalid)?;
    let entsize = u64::from(header.get_u32(0, endian)?) & !3u64;
    let count = u64::from(header.get_u32(4, endian)?);
    if entsize < 3 * word {
        return Err(Error::Invalid);
    }

    let entries = objc_const
        .remap(methods_ptr + 8, entsize * count)
        .ok_or(Error::Invalid)?;

    for i in 0..count {
        let entry = &entries[(i * entsize) as usize..((i + 1) * entsize) as usize];
        let sel_ptr = entry.get_ptr(0, is_64, endian)?;
        let imp = entry.get_ptr((2 * word) as usize, is_64, endian)?;

        let mut sel_buf = [0u8; NAME_BUF];
        let sel = mem::read_cstring(mem, sel_ptr, &mut sel_buf)?;

        visitor(is_meta, &class_name_buf[..class_name_len], sel, imp);
    }

    Ok(())
}

/// Finds the method whose IMP most closely precedes `ip` and hands exactly
/// that method to `callback`.
///
/// Runs two enumeration passes: the first tracks the best candidate IMP at
/// or below the address, the second re-walks the metadata to recover the
/// winning method's names.
pub fn find_method<F>(
    mem: &dyn TaskMemory,
    view: &MachO,
    cache: &mut ObjcCache,
    ip: u64,
    callback: F,
) -> Result<()>
where
    F: FnOnce(bool, &[u8], &[u8], u64),
{
    let mut best_imp = 0u64;
    enumerate_methods(mem, view, cache, |_, _, _, imp| {
        if imp >= best_imp && imp <= ip {
            best_imp = imp;
        }
    })?;

    if best_imp == 0 {
        return Err(Error::NotFound);
    }

    let mut callback = Some(callback);
    enumerate_methods(mem, view, cache, |is_meta, class_name, sel, imp| {
        if imp == best_imp {
            if let Some(callback) = callback.take() {
                callback(is_meta, class_name, sel, imp);
            }
        }
    })
}
