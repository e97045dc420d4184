use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use exec::{
    CompiledUnit, ConstructionError, ExecConfig, ExecutionManager, LinkError, LookupError,
    RelocKind, Section, SymbolNameKind, TargetDescription,
};
use test_log::test;

fn manager() -> ExecutionManager {
    ExecutionManager::new(TargetDescription::new("x86_64-unknown-linux-gnu")).unwrap()
}

fn data_unit(unit_name: &str, symbol: &str, bytes: Vec<u8>) -> CompiledUnit {
    let mut unit = CompiledUnit::new(unit_name);
    let s = unit.add_section(Section::data(".data", bytes));
    unit.export(symbol, s, 0);
    unit
}

#[test]
fn load_exports_are_resolvable() {
    let mut m = manager();

    let a = data_unit("a", "foo", vec![1; 8]);
    let id_a = a.id();
    m.load(a).unwrap();
    assert!(m.is_resident(id_a));
    let foo = m.lookup("foo", SymbolNameKind::Mangled).unwrap();
    assert!(!foo.is_null());

    let b = data_unit("b", "bar", vec![2; 8]);
    m.load(b).unwrap();
    assert!(m.lookup("foo", SymbolNameKind::Mangled).is_ok());
    assert!(m.lookup("bar", SymbolNameKind::Mangled).is_ok());
    assert_eq!(m.resident_count(), 2);
}

#[test]
fn unload_never_loaded_is_noop() {
    let mut m = manager();
    let ghost = CompiledUnit::new("ghost");
    let id = ghost.id();
    // never loaded
    m.unload(id).unwrap();
    assert_eq!(m.resident_count(), 0);
}

#[test]
fn unload_removes_symbols_and_memory() {
    let mut m = manager();
    let baseline = m.memory_used();

    let a = data_unit("a", "foo", vec![1; 8]);
    let id = a.id();
    m.load(a).unwrap();
    assert!(m.memory_used() > baseline);

    m.unload(id).unwrap();
    assert!(!m.is_resident(id));
    assert_eq!(m.memory_used(), baseline);
    assert!(matches!(
        m.lookup("foo", SymbolNameKind::Mangled),
        Err(LookupError::NotFound(_))
    ));

    // unloading again is a no-op, not a retry
    m.unload(id).unwrap();
}

#[test]
fn failed_load_leaves_nothing_resident() {
    let mut m = manager();
    let baseline = m.memory_used();

    let mut bad = CompiledUnit::new("bad");
    let s = bad.add_section(Section::data(".data", vec![0; 16]));
    bad.export("bad_sym", s, 0);
    bad.relocate(s, 8, "undefined_external_reference", RelocKind::Abs64, 0);
    let id = bad.id();

    let err = m.load(bad).unwrap_err();
    assert!(matches!(err, LinkError::MissingSymbol(_)));
    assert!(!m.is_resident(id));
    assert_eq!(m.resident_count(), 0);
    assert_eq!(m.memory_used(), baseline);
    assert!(matches!(
        m.lookup("bad_sym", SymbolNameKind::Mangled),
        Err(LookupError::NotFound(_))
    ));
}

#[test]
fn duplicate_definitions_are_rejected() {
    let mut m = manager();
    let mut unit = CompiledUnit::new("dup");
    let s = unit.add_section(Section::data(".data", vec![0; 8]));
    unit.export("twice", s, 0);
    unit.export("twice", s, 4);
    let err = m.load(unit).unwrap_err();
    assert!(matches!(err, LinkError::DuplicateSymbol(_)));
    assert_eq!(m.resident_count(), 0);
}

#[test]
fn abs64_relocation_links_across_units() {
    let mut m = manager();

    let mut a = CompiledUnit::new("a");
    let sa = a.add_section(Section::rodata(".rodata", vec![0x2a; 8]));
    a.export("cell", sa, 0);
    m.load(a).unwrap();
    let cell = m.lookup("cell", SymbolNameKind::Mangled).unwrap();
    assert_eq!(unsafe { *cell.as_ptr::<u8>() }, 0x2a);

    // b stores the absolute address of a's cell in its own data
    let mut b = CompiledUnit::new("b");
    let s = b.add_section(Section::data(".data", vec![0; 8]));
    b.export("cell_ref", s, 0);
    b.relocate(s, 0, "cell", RelocKind::Abs64, 0);
    m.load(b).unwrap();

    let cell_ref = m.lookup("cell_ref", SymbolNameKind::Mangled).unwrap();
    let stored = unsafe { (cell_ref.as_ptr::<u8>() as *const usize).read_unaligned() };
    assert_eq!(stored, cell.as_usize());
}

#[test]
fn rel32_relocation_within_window() {
    let mut m = manager();

    let mut unit = CompiledUnit::new("rel");
    let d1 = unit.add_section(Section::data(".data.cell", vec![0; 8]));
    let d2 = unit.add_section(Section::data(".data.site", vec![0; 8]));
    unit.export("cell", d1, 0);
    unit.export("site", d2, 0);
    unit.relocate(d2, 0, "cell", RelocKind::Rel32, 0);
    m.load(unit).unwrap();

    let cell = m.lookup("cell", SymbolNameKind::Mangled).unwrap();
    let site = m.lookup("site", SymbolNameKind::Mangled).unwrap();
    let delta = unsafe { (site.as_ptr::<u8>() as *const i32).read_unaligned() };
    assert_eq!(delta as i64, cell.as_usize() as i64 - site.as_usize() as i64);
}

#[test]
fn rel32_to_distant_absolute_is_out_of_range() {
    let mut m = manager();

    let mut unit = CompiledUnit::new("far");
    let s = unit.add_section(Section::data(".data", vec![0; 8]));
    unit.export("site", s, 0);
    // the addend pushes the target a terabyte past anything reachable
    unit.relocate(s, 0, "site", RelocKind::Rel32, 1i64 << 40);
    let err = m.load(unit).unwrap_err();
    assert!(matches!(err, LinkError::RelocationOutOfRange(_)));
}

#[test]
fn initializers_run_in_append_order_once() {
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    extern "C" fn init_a() {
        ORDER.lock().unwrap().push("a");
    }
    extern "C" fn init_b() {
        ORDER.lock().unwrap().push("b");
    }

    let mut m = manager();

    let mut a = data_unit("a", "a_data", vec![0; 8]);
    a.local_absolute("a_ctor", init_a as usize);
    a.add_initializer("a_ctor");
    m.load(a).unwrap();

    let mut b = data_unit("b", "b_data", vec![0; 8]);
    b.local_absolute("b_ctor", init_b as usize);
    b.add_initializer("b_ctor");
    m.load(b).unwrap();

    m.run_initializers().unwrap();
    assert_eq!(*ORDER.lock().unwrap(), vec!["a", "b"]);

    // idempotent: a second call runs nothing
    m.run_initializers().unwrap();
    assert_eq!(*ORDER.lock().unwrap(), vec!["a", "b"]);

    // a later load only runs the new unit's initializers
    let mut c = data_unit("c", "c_data", vec![0; 8]);
    c.local_absolute("c_ctor", init_a as usize);
    c.add_initializer("c_ctor");
    m.load(c).unwrap();
    m.run_initializers().unwrap();
    assert_eq!(*ORDER.lock().unwrap(), vec!["a", "b", "a"]);
}

#[test]
fn finalizers_run_in_reverse_order_once() {
    static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    extern "C" fn fini_a() {
        ORDER.lock().unwrap().push("a");
    }
    extern "C" fn fini_b() {
        ORDER.lock().unwrap().push("b");
    }

    let mut m = manager();

    let mut a = data_unit("a", "fa_data", vec![0; 8]);
    a.local_absolute("a_dtor", fini_a as usize);
    a.add_finalizer("a_dtor");
    m.load(a).unwrap();

    let mut b = data_unit("b", "fb_data", vec![0; 8]);
    b.local_absolute("b_dtor", fini_b as usize);
    b.add_finalizer("b_dtor");
    m.load(b).unwrap();

    // finalizers only run for initialized units
    m.run_finalizers().unwrap();
    assert!(ORDER.lock().unwrap().is_empty());

    m.run_initializers().unwrap();
    m.run_finalizers().unwrap();
    assert_eq!(*ORDER.lock().unwrap(), vec!["b", "a"]);

    m.run_finalizers().unwrap();
    assert_eq!(*ORDER.lock().unwrap(), vec!["b", "a"]);
}

#[test]
fn missing_initializer_entry_fails_the_load() {
    let mut m = manager();
    let mut unit = data_unit("u", "u_data", vec![0; 8]);
    unit.add_initializer("no_such_ctor");
    let err = m.load(unit).unwrap_err();
    assert!(matches!(err, LinkError::InitializerMissing(_)));
    assert_eq!(m.resident_count(), 0);
    assert!(matches!(
        m.lookup("u_data", SymbolNameKind::Mangled),
        Err(LookupError::NotFound(_))
    ));
}

// the concrete lifecycle walk: load A, resolve, link B against it,
// initialize, unload A, and check what remains resolvable
#[test]
fn incremental_session_lifecycle() {
    static INITS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn count_init() {
        INITS.fetch_add(1, Ordering::SeqCst);
    }

    let mut m = manager();

    let mut a = CompiledUnit::new("a");
    let sa = a.add_section(Section::data(".data", vec![7; 8]));
    a.export("foo", sa, 0);
    let id_a = a.id();
    m.load(a).unwrap();
    let foo = m.lookup("foo", SymbolNameKind::Mangled).unwrap();
    assert!(!foo.is_null());

    let mut b = CompiledUnit::new("b");
    let sb = b.add_section(Section::data(".data", vec![0; 8]));
    b.export("bar", sb, 0);
    b.relocate(sb, 0, "foo", RelocKind::Abs64, 0);
    b.local_absolute("b_ctor", count_init as usize);
    b.add_initializer("b_ctor");
    m.load(b).unwrap();

    m.run_initializers().unwrap();
    assert_eq!(INITS.load(Ordering::SeqCst), 1);

    m.unload(id_a).unwrap();
    assert!(matches!(
        m.lookup("foo", SymbolNameKind::Mangled),
        Err(LookupError::NotFound(_))
    ));
    // b's own exports survive; its reference into a is now dangling, which
    // is the documented unload-order hazard
    assert!(m.lookup("bar", SymbolNameKind::Mangled).is_ok());
}

#[test]
fn redefinition_shadows_earlier_unit() {
    let mut m = manager();

    let a = data_unit("a", "value", vec![1; 8]);
    m.load(a).unwrap();
    let first = m.lookup("value", SymbolNameKind::Mangled).unwrap();

    let b = data_unit("b", "value", vec![2; 8]);
    let id_b = b.id();
    m.load(b).unwrap();
    let second = m.lookup("value", SymbolNameKind::Mangled).unwrap();
    assert_ne!(first, second);

    // most-recent-definition-wins: unloading the redefining unit drops the
    // name entirely rather than restoring the shadowed binding
    m.unload(id_b).unwrap();
    assert!(matches!(
        m.lookup("value", SymbolNameKind::Mangled),
        Err(LookupError::NotFound(_))
    ));
}

#[test]
fn process_scope_is_searched_last() {
    let m = manager();
    // not defined by any unit, but the host process has it
    let malloc = m.lookup("malloc", SymbolNameKind::Raw).unwrap();
    assert!(!malloc.is_null());

    assert!(matches!(
        m.lookup("definitely_not_a_symbol_anywhere", SymbolNameKind::Raw),
        Err(LookupError::NotFound(_))
    ));
}

#[test]
fn units_can_link_against_process_symbols() {
    let mut m = manager();
    let mut unit = CompiledUnit::new("p");
    let s = unit.add_section(Section::data(".data", vec![0; 8]));
    unit.export("malloc_ref", s, 0);
    unit.relocate(s, 0, "malloc", RelocKind::Abs64, 0);
    m.load(unit).unwrap();

    let malloc = m.lookup("malloc", SymbolNameKind::Raw).unwrap();
    let malloc_ref = m.lookup("malloc_ref", SymbolNameKind::Mangled).unwrap();
    let stored = unsafe { (malloc_ref.as_ptr::<u8>() as *const usize).read_unaligned() };
    assert_eq!(stored, malloc.as_usize());
}

#[test]
fn macho_targets_mangle_lookups() {
    let mut m =
        ExecutionManager::new(TargetDescription::new("aarch64-apple-darwin")).unwrap();
    // the front end hands over linker-level names, already decorated
    let unit = data_unit("m", "_entry", vec![0; 8]);
    m.load(unit).unwrap();

    assert!(m.lookup("entry", SymbolNameKind::Mangled).is_ok());
    assert!(m.lookup("_entry", SymbolNameKind::Raw).is_ok());
    assert!(matches!(
        m.lookup("entry", SymbolNameKind::Raw),
        Err(LookupError::NotFound(_))
    ));
}

#[test]
fn windows_target_fails_construction() {
    let err = ExecutionManager::new(TargetDescription::new("x86_64-pc-windows-msvc"));
    assert!(matches!(err, Err(ConstructionError::UnsupportedTarget(_))));
}

#[test]
fn bogus_runtime_support_fails_construction() {
    let config = ExecConfig {
        runtime_support: Some("/nonexistent/libruntime_support.so".into()),
        ..Default::default()
    };
    let err = ExecutionManager::create(TargetDescription::new("x86_64-unknown-linux-gnu"), config);
    assert!(matches!(err, Err(ConstructionError::RuntimeSupport { .. })));
}

#[test]
fn managers_are_independent() {
    let mut m1 = manager();
    let mut m2 = manager();

    m1.load(data_unit("a", "only_in_one", vec![0; 8])).unwrap();
    assert!(m1.lookup("only_in_one", SymbolNameKind::Mangled).is_ok());
    assert!(matches!(
        m2.lookup("only_in_one", SymbolNameKind::Mangled),
        Err(LookupError::NotFound(_))
    ));

    m2.load(data_unit("b", "only_in_one", vec![1; 8])).unwrap();
    let a1 = m1.lookup("only_in_one", SymbolNameKind::Mangled).unwrap();
    let a2 = m2.lookup("only_in_one", SymbolNameKind::Mangled).unwrap();
    assert_ne!(a1, a2);
}

#[test]
fn bss_sections_are_zeroed() {
    let mut m = manager();
    let mut unit = CompiledUnit::new("z");
    let s = unit.add_section(Section::bss(".bss", 64));
    unit.export("zeroes", s, 0);
    m.load(unit).unwrap();

    let zeroes = m.lookup("zeroes", SymbolNameKind::Mangled).unwrap();
    let buf = unsafe { std::slice::from_raw_parts(zeroes.as_ptr::<u8>(), 64) };
    assert!(buf.iter().all(|b| *b == 0));
}

#[cfg(target_arch = "x86_64")]
#[test]
fn mapped_code_executes() {
    let mut m = manager();

    // mov eax, 42; ret
    let code = vec![0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
    let mut unit = CompiledUnit::new("jit");
    let s = unit.add_section(Section::code(".text", code));
    unit.export("answer", s, 0);
    m.load(unit).unwrap();

    let ret: i32 = m.invoke("answer", ()).unwrap();
    assert_eq!(ret, 42);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn unloaded_code_frees_its_pages() {
    let mut m = manager();
    let baseline = m.memory_used();

    let code = vec![0xb8, 0x07, 0x00, 0x00, 0x00, 0xc3];
    let mut unit = CompiledUnit::new("jit");
    let s = unit.add_section(Section::code(".text", code));
    unit.export("seven", s, 0);
    let id = unit.id();
    m.load(unit).unwrap();

    let ret: i32 = m.invoke("seven", ()).unwrap();
    assert_eq!(ret, 7);

    m.unload(id).unwrap();
    assert_eq!(m.memory_used(), baseline);
    assert!(matches!(
        m.invoke::<(), i32>("seven", ()),
        Err(LookupError::NotFound(_))
    ));
}

#[test]
fn debug_dump_does_not_disturb_state() {
    let mut m = manager();
    m.load(data_unit("a", "dbg", vec![0; 8])).unwrap();
    m.debug();
    assert!(m.lookup("dbg", SymbolNameKind::Mangled).is_ok());
}
