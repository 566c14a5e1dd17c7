//! Build script for the trampoline table.
//!
//! Generates `$OUT_DIR/trampolines.rs` holding the table size and the
//! ordinal → entry lookup. Every entry is a distinct monomorphization of
//! `trampoline::<V, N>`, so each ordinal gets its own function address.
//!
//! The table size comes from `HOSTCALL_TRAMPOLINE_SLOTS` (default 256).

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

const DEFAULT_SLOTS: usize = 256;
const MAX_SLOTS: usize = 4096;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=HOSTCALL_TRAMPOLINE_SLOTS");

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let slots = match env::var("HOSTCALL_TRAMPOLINE_SLOTS") {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .unwrap_or_else(|_| panic!("HOSTCALL_TRAMPOLINE_SLOTS is not a number: {raw:?}")),
        Err(_) => DEFAULT_SLOTS,
    };
    assert!(
        (1..=MAX_SLOTS).contains(&slots),
        "HOSTCALL_TRAMPOLINE_SLOTS must be in 1..={MAX_SLOTS}, got {slots}"
    );

    fs::write(out_dir.join("trampolines.rs"), generate(slots)).unwrap();
}

fn generate(slots: usize) -> String {
    let mut out = String::new();
    out.push_str("// @generated by build.rs. Do not edit.\n\n");
    out.push_str("/// Number of trampoline entries compiled into this build.\n");
    writeln!(out, "pub const TABLE_SIZE: usize = {slots};").unwrap();
    out.push('\n');
    out.push_str("fn lookup<V: VmApi>(ordinal: u16) -> Option<ForeignMethodFn<V>> {\n");
    out.push_str("    let entry: ForeignMethodFn<V> = match ordinal {\n");
    for n in 0..slots {
        writeln!(out, "        {n} => trampoline::<V, {n}>,").unwrap();
    }
    out.push_str("        _ => return None,\n");
    out.push_str("    };\n");
    out.push_str("    Some(entry)\n");
    out.push_str("}\n");
    out
}
