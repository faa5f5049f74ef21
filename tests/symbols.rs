//! Symbol resolution: Mach-O symbol-table lookup, the function-starts
//! stream, and the image+offset fallback.

mod common;

use common::*;
use crash_unwind::objc::ObjcCache;
use crash_unwind::symbols::{Symbol, symbolicate};
use crash_unwind::{Image, ImageList};

const BASE: u64 = 0x6000_0000;

fn build_symbol_image(task: &mut FakeTask) {
    let mut def = ImageDef::new_64(BASE, 0x1000);
    def.sections.push(SectionDef {
        seg: "__TEXT",
        sect: "__text",
        addr: BASE + 0x100,
        data: vec![0u8; 0x200],
    });
    def.symtab = Some(SymtabDef {
        linkedit_base: 0x6100_0000,
        symbols: vec![("start", BASE + 0x100), ("main", BASE + 0x140)],
        function_starts: vec![0x100, 0x140, 0x1c0],
    });
    build_image(task, &def);
}

#[test]
fn nearest_preceding_symbol_wins() {
    let mut task = FakeTask::new();
    build_symbol_image(&mut task);

    let mut images = ImageList::new();
    images.append(Image::new(BASE, &b"/usr/bin/app"[..]));

    let mut cache = ObjcCache::new();
    let mut resolved = None;
    symbolicate(&task, &images, &mut cache, BASE + 0x160, |symbol| {
        if let Symbol::Function { name, address } = symbol {
            resolved = Some((name.to_vec(), *address));
        }
    })
    .unwrap();

    assert_eq!(resolved, Some((b"main".to_vec(), BASE + 0x140)));
}

#[test]
fn unknown_image_is_an_error_but_unknown_symbol_is_not() {
    let mut task = FakeTask::new();

    // An image with no symbol table at all
    let def = ImageDef::new_64(BASE, 0x1000);
    build_image(&mut task, &def);

    let mut images = ImageList::new();
    images.append(Image::new(BASE, &b"/usr/lib/bare.dylib"[..]));

    let mut cache = ObjcCache::new();
    let mut fallback = None;
    symbolicate(&task, &images, &mut cache, BASE + 0x123, |symbol| {
        if let Symbol::Image { name, offset } = symbol {
            fallback = Some((name.to_vec(), *offset));
        }
    })
    .unwrap();
    assert_eq!(fallback, Some((b"bare.dylib".to_vec(), 0x123)));

    // An address outside every image cannot be attributed at all
    assert!(symbolicate(&task, &images, &mut cache, 0xdead_0000, |_| {
        panic!("nothing to resolve");
    })
    .is_err());
}

#[test]
fn function_starts_locate_unnamed_functions() {
    let mut task = FakeTask::new();
    build_symbol_image(&mut task);

    let image = Image::new(BASE, &b"/usr/bin/app"[..]);
    let view = image.view(&task).unwrap();

    assert_eq!(
        view.nearest_function_start(&task, BASE + 0x180).unwrap(),
        BASE + 0x140
    );
    assert_eq!(
        view.nearest_function_start(&task, BASE + 0x1f0).unwrap(),
        BASE + 0x1c0
    );
    // Before the first recorded function
    assert!(view.nearest_function_start(&task, BASE + 0x50).is_err());
}

#[test]
fn missing_section_is_not_found() {
    use crash_unwind::error::Error;

    let mut task = FakeTask::new();
    build_symbol_image(&mut task);

    let image = Image::new(BASE, &b"/usr/bin/app"[..]);
    let view = image.view(&task).unwrap();

    assert!(matches!(
        view.map_section(&task, "__TEXT", "__unwind_info"),
        Err(Error::NotFound)
    ));
    assert!(view.map_section(&task, "__TEXT", "__text").is_ok());
}
