//! Symbolication: mapping an instruction pointer back to a name.
//!
//! The Objective-C metadata is consulted first, since on these platforms it
//! names the overwhelming majority of frames; the Mach-O symbol table is the
//! fallback, and an image-relative offset the last resort.

use crate::error::{Error, Result};
use crate::image::ImageList;
use crate::mem::TaskMemory;
use crate::objc::{self, ObjcCache};

/// What an instruction pointer resolved to. Borrowed names are only valid
/// for the duration of the callback.
pub enum Symbol<'a> {
    /// An Objective-C method, from the runtime metadata.
    Method {
        is_meta: bool,
        class_name: &'a [u8],
        method_name: &'a [u8],
        imp: u64,
    },
    /// A plain symbol from the Mach-O symbol table.
    Function { name: &'a [u8], address: u64 },
    /// Nothing matched; all that is known is the enclosing image.
    Image { name: &'a [u8], offset: u64 },
}

/// Resolves `ip` against the image list and invokes `cb` with the best
/// available symbol.
///
/// Fails with `NotFound` only when no image contains `ip` at all; any
/// degradation below that still produces a `Symbol::Image`.
pub fn symbolicate<F>(
    mem: &dyn TaskMemory,
    images: &ImageList,
    cache: &mut ObjcCache,
    ip: u64,
    cb: F,
) -> Result<()>
where
    F: FnOnce(&Symbol<'_>),
{
    let image = images.containing(mem, ip).ok_or(Error::NotFound)?;
    let view = image.view(mem)?;

    let mut cb = Some(cb);

    match objc::find_method(mem, view, cache, ip, |is_meta, class_name, method_name, imp| {
        if let Some(cb) = cb.take() {
            cb(&Symbol::Method {
                is_meta,
                class_name,
                method_name,
                imp,
            });
        }
    }) {
        Ok(()) => {
            // find_method only succeeds after it has delivered the match
            if cb.is_none() {
                return Ok(());
            }
        }
        Err(Error::NotFound) => {}
        Err(err) => {
            log::debug!("ObjC method search failed for {ip:#x}: {err}");
        }
    }

    match view.find_symbol(mem, ip, |name, address| {
        if let Some(cb) = cb.take() {
            cb(&Symbol::Function { name, address });
        }
    }) {
        Ok(()) => {
            if cb.is_none() {
                return Ok(());
            }
        }
        Err(Error::NotFound) => {}
        Err(err) => {
            log::debug!("symbol table search failed for {ip:#x}: {err}");
        }
    }

    if let Some(cb) = cb.take() {
        cb(&Symbol::Image {
            name: image.short_name(),
            offset: ip - image.base(),
        });
    }
    Ok(())
}
