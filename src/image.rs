//! The list of binary images loaded in the target task.

use std::cell::OnceCell;

use crate::error::{Error, Result};
use crate::macho::MachO;
use crate::mem::TaskMemory;

/// One loaded image: its live header address, its name, and a lazily parsed
/// Mach-O view.
pub struct Image {
    base: u64,
    name: Vec<u8>,
    view: OnceCell<std::result::Result<MachO, Error>>,
}

impl Image {
    pub fn new(base: u64, name: impl Into<Vec<u8>>) -> Self {
        Self {
            base,
            name: name.into(),
            view: OnceCell::new(),
        }
    }

    /// The address of the image's Mach-O header in the task.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The image path as reported by the loader. May be empty.
    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    /// The file name component of [`name`](Self::name).
    pub fn short_name(&self) -> &[u8] {
        match self.name.iter().rposition(|&b| b == b'/') {
            Some(pos) => &self.name[pos + 1..],
            None => &self.name,
        }
    }

    /// The Mach-O view of this image, parsed on first use.
    pub fn view(&self, mem: &dyn TaskMemory) -> Result<&MachO> {
        self.view
            .get_or_init(|| MachO::parse(mem, self.base))
            .as_ref()
            .map_err(|err| *err)
    }

    /// Whether `addr` falls inside this image's mapped `__TEXT` range.
    pub fn contains(&self, mem: &dyn TaskMemory, addr: u64) -> bool {
        self.view(mem)
            .map(|view| view.contains_address(addr))
            .unwrap_or(false)
    }
}

/// An ordered, append-only collection of loaded images.
///
/// The list is built by the invoker before a capture and borrowed for its
/// duration; image ranges never overlap, so at most one image contains any
/// given address.
#[derive(Default)]
pub struct ImageList {
    // Sorted by base address
    images: Vec<Image>,
}

impl ImageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an image, keeping the list sorted. An image already recorded
    /// at the same base address is ignored; the loader will happily report
    /// the same image more than once.
    pub fn append(&mut self, image: Image) {
        match self
            .images
            .binary_search_by(|existing| existing.base.cmp(&image.base))
        {
            Ok(_) => {}
            Err(index) => self.images.insert(index, image),
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Image> {
        self.images.iter()
    }

    /// Finds the image whose `__TEXT` range contains `addr`.
    pub fn containing(&self, mem: &dyn TaskMemory, addr: u64) -> Option<&Image> {
        // The candidate is the last image at or below the address; ranges do
        // not overlap so no other image can contain it.
        let index = match self
            .images
            .binary_search_by(|existing| existing.base.cmp(&addr))
        {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };

        let image = &self.images[index];
        image.contains(mem, addr).then_some(image)
    }
}
