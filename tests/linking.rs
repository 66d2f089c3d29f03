//! End-to-end linking tests over synthesized COFF objects and libraries.

mod common;

use common::*;
use object::read::Object as _;
use pelink::arch::i386::I386;
use pelink::diag::Diagnostics;
use pelink::library::LibraryFile;
use pelink::locate::SymbolLocator;
use pelink::session::LinkSession;
use pelink::symbol::Resolution;
use tempfile::TempDir;

const IMAGE_BASE: u64 = 0x0040_0000;
const TEXT_VA: u64 = IMAGE_BASE + 0x1000;

#[test]
fn cross_object_reference_resolves_and_patches() {
    let dir = TempDir::new().unwrap();

    // file1 calls `_add`, which file2 defines.
    let mut obj1 = TestObj::new();
    obj1.append_code(&[0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3]);
    obj1.define("mainCRTStartup", 0);
    let callee = obj1.reference("_add");
    obj1.call_reloc(1, callee);
    let obj1_path = write_file(dir.path(), "main.obj", &obj1.build());
    let obj2_path = write_file(dir.path(), "add.obj", &defining_obj("_add"));

    let config = test_config(
        dir.path(),
        vec![obj1_path, obj2_path],
        vec![dummy_lib(dir.path())],
    );
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    // Worklist drained, `_add` resolved to file2's definition.
    assert_eq!(session.symbols().unresolved_count(), 0);
    let add = session.symbols().lookup("_add").unwrap();
    assert_eq!(session.symbols().entry(add).defining_object, Some(1));

    let bytes = std::fs::read(dir.path().join("out.exe")).unwrap();
    let file = object::File::parse(bytes.as_slice()).unwrap();
    assert_eq!(file.entry(), TEXT_VA);

    // file2's fragment lands 16-aligned after file1's six bytes, so the
    // call displacement is S - (P + 4) = 0x401010 - 0x401005.
    let text_offset = 512;
    let displacement =
        u32::from_le_bytes(bytes[text_offset + 1..text_offset + 5].try_into().unwrap());
    assert_eq!(displacement, 0xB);
}

#[test]
fn missing_symbol_fails_with_nonempty_worklist() {
    let dir = TempDir::new().unwrap();

    let mut obj = TestObj::new();
    obj.append_code(&[0xC3]);
    obj.define("mainCRTStartup", 0);
    obj.reference("_missing_fn");
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let config = test_config(dir.path(), vec![obj_path], vec![dummy_lib(dir.path())]);
    let mut session = LinkSession::new(I386, &config);
    let err = session.link().unwrap_err();
    assert!(err.to_string().contains("unresolved"));
    assert!(session.symbols().unresolved_count() > 0);
    assert!(session.diagnostics().has_errors());
}

#[test]
fn library_sourced_symbol_is_rejected_for_export() {
    let dir = TempDir::new().unwrap();

    // `_exported_fn` lives only in a library member; referencing it links
    // fine, but exporting it must fail.
    let archive = build_archive(&[("exported", defining_obj("_exported_fn"))]);
    let lib_path = write_file(dir.path(), "exp.lib", &archive);

    let mut obj = TestObj::new();
    obj.append_code(&[0xC3]);
    obj.define("mainCRTStartup", 0);
    obj.reference("_exported_fn");
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let mut config = test_config(dir.path(), vec![obj_path], vec![lib_path]);
    config.exports = vec!["exported_fn".to_string()];
    let mut session = LinkSession::new(I386, &config);
    let err = session.link().unwrap_err();
    assert!(err.to_string().contains("export"));
    assert!(session.diagnostics().has_errors());
    assert!(session.image().exports.is_empty());
}

#[test]
fn startup_symbol_found_in_library_via_underscore() {
    let dir = TempDir::new().unwrap();

    let archive = build_archive(&[("crt0", defining_obj("_mainCRTStartup"))]);
    let lib_path = write_file(dir.path(), "crt.lib", &archive);

    let mut obj = TestObj::new();
    obj.append_code(&[0xC3]);
    obj.define("_helper_fn", 0);
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let config = test_config(dir.path(), vec![obj_path], vec![lib_path]);
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    assert!(session.diagnostics().warning_count() > 0);
    let pulled = session.objects().iter().find(|o| o.from_library).unwrap();
    assert_eq!(pulled.library_index, Some(0));
    assert!(pulled.library.as_deref().unwrap().ends_with("crt.lib"));

    let bytes = std::fs::read(dir.path().join("out.exe")).unwrap();
    let file = object::File::parse(bytes.as_slice()).unwrap();
    assert_ne!(file.entry(), 0);
}

#[test]
fn repeated_references_pull_the_member_once() {
    let dir = TempDir::new().unwrap();

    let archive = build_archive(&[("add", defining_obj("_add"))]);
    let lib_path = write_file(dir.path(), "add.lib", &archive);

    let mut obj1 = TestObj::new();
    obj1.append_code(&[0xC3]);
    obj1.define("mainCRTStartup", 0);
    obj1.reference("_add");
    let obj1_path = write_file(dir.path(), "one.obj", &obj1.build());

    let mut obj2 = TestObj::new();
    obj2.append_code(&[0xC3]);
    obj2.define("_other", 0);
    obj2.reference("_add");
    let obj2_path = write_file(dir.path(), "two.obj", &obj2.build());

    let config = test_config(dir.path(), vec![obj1_path, obj2_path], vec![lib_path]);
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    // Two direct objects plus exactly one extracted member.
    assert_eq!(session.objects().len(), 3);
    assert_eq!(session.symbols().unresolved_count(), 0);
}

#[test]
fn underscore_fallback_resolves_with_warning() {
    let dir = TempDir::new().unwrap();

    let archive = build_archive(&[("helper", defining_obj("_helper"))]);
    let lib_path = write_file(dir.path(), "helper.lib", &archive);

    let mut obj = TestObj::new();
    obj.append_code(&[0xC3]);
    obj.define("mainCRTStartup", 0);
    obj.reference("helper");
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let config = test_config(dir.path(), vec![obj_path], vec![lib_path]);
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    assert!(session.diagnostics().warning_count() > 0);
    assert!(!session.diagnostics().has_errors());
    // The bare spelling is re-registered as an alias of the definition.
    let bare = session.symbols().lookup("helper").unwrap();
    let prefixed = session.symbols().lookup("_helper").unwrap();
    assert_eq!(bare, prefixed);
}

#[test]
fn weak_external_reference_is_tolerated() {
    let dir = TempDir::new().unwrap();

    let mut obj = TestObj::new();
    obj.append_code(&[0xC3]);
    obj.define("mainCRTStartup", 0);
    obj.weak_reference("_optional_hook");
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let config = test_config(dir.path(), vec![obj_path], vec![dummy_lib(dir.path())]);
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    let id = session.symbols().lookup("_optional_hook").unwrap();
    assert_eq!(session.symbols().entry(id).resolution, Resolution::Weak);
    assert_eq!(session.symbols().unresolved_count(), 0);
}

#[test]
fn search_modes_locate_the_same_member() {
    let dir = TempDir::new().unwrap();

    let lib1 = build_archive(&[("alpha", defining_obj("_alpha"))]);
    let lib2 = build_archive(&[
        ("beta", defining_obj("_beta")),
        ("gamma", defining_obj("_gamma")),
    ]);
    let lib1_path = write_file(dir.path(), "one.lib", &lib1);
    let lib2_path = write_file(dir.path(), "two.lib", &lib2);

    let mut per_library = vec![
        LibraryFile::load_with_own_index(&lib1_path, 0).unwrap(),
        LibraryFile::load_with_own_index(&lib2_path, 1).unwrap(),
    ];
    let mut combined_map = std::collections::HashMap::new();
    let mut combined = vec![
        LibraryFile::load_with_combined_index(&lib1_path, 0, &mut combined_map).unwrap(),
        LibraryFile::load_with_combined_index(&lib2_path, 1, &mut combined_map).unwrap(),
    ];

    let per_locator = SymbolLocator::PerLibrary;
    let combined_locator = SymbolLocator::Combined { map: combined_map };

    for name in ["_alpha", "_beta", "_gamma"] {
        let mut diag = Diagnostics::new();
        let a = per_locator
            .find(&mut per_library, name, &mut diag)
            .unwrap()
            .unwrap();
        let b = combined_locator
            .find(&mut combined, name, &mut diag)
            .unwrap()
            .unwrap();
        assert_eq!(a.library, b.library, "library index for {name}");
        assert_eq!(a.offset, b.offset, "member offset for {name}");
        assert_eq!(a.data, b.data);
    }

    let mut diag = Diagnostics::new();
    assert!(per_locator
        .find(&mut per_library, "_absent", &mut diag)
        .unwrap()
        .is_none());
    assert!(combined_locator
        .find(&mut combined, "_absent", &mut diag)
        .unwrap()
        .is_none());
}

#[test]
fn dll_import_thunk_synthesizes_import_table() {
    let dir = TempDir::new().unwrap();

    let archive = build_archive(&[(
        "beepimp",
        import_stub("_MessageBeep", "USER32.dll"),
    )]);
    let lib_path = write_file(dir.path(), "user32.lib", &archive);

    let mut obj = TestObj::new();
    obj.append_code(&[0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3]);
    obj.define("mainCRTStartup", 0);
    let beep = obj.reference("_MessageBeep");
    obj.call_reloc(1, beep);
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let config = test_config(dir.path(), vec![obj_path], vec![lib_path]);
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    let imports = &session.image().imports;
    assert_eq!(imports.len(), 1);
    assert_eq!(imports[0].dll, "USER32.dll");
    assert_eq!(imports[0].name.as_deref(), Some("MessageBeep"));
    assert_ne!(imports[0].iat_rva, 0);

    let bytes = std::fs::read(dir.path().join("out.exe")).unwrap();
    let file = object::File::parse(bytes.as_slice()).unwrap();
    let read_back = file.imports().unwrap();
    assert_eq!(read_back.len(), 1);
    assert_eq!(read_back[0].library(), &b"USER32.dll"[..]);
    assert_eq!(read_back[0].name(), &b"MessageBeep"[..]);
}

#[test]
fn dll_build_emits_export_table_and_companions() {
    let dir = TempDir::new().unwrap();

    let mut obj = TestObj::new();
    obj.append_code(&[0xC3, 0xC3]);
    obj.define("mainCRTStartup", 0);
    obj.define("_exported_fn", 1);
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let mut config = test_config(dir.path(), vec![obj_path], vec![dummy_lib(dir.path())]);
    config.dll = true;
    config.output = dir.path().join("out.dll");
    config.exports = vec!["exported_fn".to_string()];
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    // The export entry carries the requested name, not the decorated one.
    assert_eq!(session.image().exports.len(), 1);
    assert_eq!(session.image().exports[0].name, "exported_fn");

    // Companion files were pre-created alongside the image.
    assert!(dir.path().join("out.lib").exists());
    assert!(dir.path().join("out.exp").exists());

    let bytes = std::fs::read(dir.path().join("out.dll")).unwrap();
    let file = object::File::parse(bytes.as_slice()).unwrap();
    let exports = file.exports().unwrap();
    assert_eq!(exports.len(), 1);
    assert_eq!(exports[0].name(), &b"exported_fn"[..]);
    assert_eq!(exports[0].address(), TEXT_VA + 1);
}

#[test]
fn empty_input_lists_are_reported() {
    let dir = TempDir::new().unwrap();

    let obj_path = write_file(dir.path(), "main.obj", &defining_obj("mainCRTStartup"));
    let config = test_config(dir.path(), vec![obj_path], Vec::new());
    let mut session = LinkSession::new(I386, &config);
    let err = session.link().unwrap_err();
    assert!(err.to_string().contains("no library files"));

    let config = test_config(dir.path(), Vec::new(), vec![dummy_lib(dir.path())]);
    let mut session = LinkSession::new(I386, &config);
    let err = session.link().unwrap_err();
    assert!(err.to_string().contains("no object files"));
}

#[test]
fn combined_index_links_like_per_library() {
    let dir = TempDir::new().unwrap();

    let archive = build_archive(&[("add", defining_obj("_add"))]);
    let lib_path = write_file(dir.path(), "add.lib", &archive);

    let mut obj = TestObj::new();
    obj.append_code(&[0xE8, 0x00, 0x00, 0x00, 0x00, 0xC3]);
    obj.define("mainCRTStartup", 0);
    let callee = obj.reference("_add");
    obj.call_reloc(1, callee);
    let obj_path = write_file(dir.path(), "main.obj", &obj.build());

    let mut config = test_config(dir.path(), vec![obj_path], vec![lib_path]);
    config.combined_lib_index = true;
    let mut session = LinkSession::new(I386, &config);
    session.link().unwrap();

    assert_eq!(session.symbols().unresolved_count(), 0);
    assert!(session.objects().iter().any(|o| o.from_library));
}
