//! Shared fixtures for the integration tests: a plain-text codec and WAT
//! guest modules implementing the full export contract.
#![allow(dead_code)]

use std::string::FromUtf8Error;

use cascade::{Artifact, Codec, Language, Metadata};

/// UTF-8 string carried verbatim on the wire.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl Codec for Text {
    type Error = FromUtf8Error;

    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), Self::Error> {
        buf.clear();
        buf.extend_from_slice(self.0.as_bytes());
        Ok(())
    }

    fn decode(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.0 = String::from_utf8(buf.to_vec())?;
        Ok(())
    }
}

/// Common allocator and plumbing shared by the guest templates: a bump
/// `malloc`, an accounting `free`, and a `run` that appends one byte
/// produced by `marker_expr` before forwarding through `next`.
fn guest_template(globals: &str, run_prelude: &str, marker_expr: &str) -> String {
    format!(
        r#"
    (module
        (import "env" "next" (func $next (param i32 i32) (result i64)))
        (memory (export "memory") 2)
        (global $heap (mut i32) (i32.const 64))
        {globals}

        (func $malloc (export "malloc") (param $len i64) (result i64)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap
                (i32.and
                    (i32.add
                        (i32.add (global.get $heap) (i32.wrap_i64 (local.get $len)))
                        (i32.const 7))
                    (i32.const -8)))
            (i64.extend_i32_u (local.get $ptr))
        )

        (func $free (export "free") (param $ptr i64))

        (func $run (export "run") (param $ptr i32) (param $len i32) (result i64)
            (local $out i32)
            (local $outlen i32)
            (local $packed i64)
            {run_prelude}
            (local.set $outlen (i32.add (local.get $len) (i32.const 1)))
            (local.set $out
                (i32.wrap_i64 (call $malloc (i64.extend_i32_u (local.get $outlen)))))
            (memory.copy (local.get $out) (local.get $ptr) (local.get $len))
            (i32.store8 (i32.add (local.get $out) (local.get $len)) {marker_expr})
            (call $free (i64.extend_i32_u (local.get $ptr)))
            (local.set $packed (call $next (local.get $out) (local.get $outlen)))
            (call $free (i64.extend_i32_u (local.get $out)))
            (local.get $packed)
        )
    )
    "#
    )
}

/// A guest that appends `marker` and forwards through `next`.
pub fn chained_guest(marker: char) -> String {
    guest_template("", "", &format!("(i32.const {})", marker as u32))
}

/// A guest whose appended byte is `'0' + runs`, where `runs` counts how
/// often this instantiation has executed. Fresh instantiations start
/// from scratch, so persistent guest state is observable.
pub fn stateful_guest() -> String {
    guest_template(
        r#"(global $runs (mut i32) (i32.const 0))"#,
        "(global.set $runs (i32.add (global.get $runs) (i32.const 1)))",
        "(i32.add (i32.const 48) (global.get $runs))",
    )
}

/// A guest whose `run` traps immediately.
pub fn trapping_guest() -> &'static str {
    r#"
    (module
        (import "env" "next" (func $next (param i32 i32) (result i64)))
        (memory (export "memory") 1)
        (func $run (export "run") (param i32 i32) (result i64)
            unreachable
        )
        (func $malloc (export "malloc") (param $len i64) (result i64) (i64.const 64))
        (func $free (export "free") (param $ptr i64))
    )
    "#
}

pub fn artifact(name: &str, wat_src: &str) -> Artifact {
    let bytes = wat::parse_str(wat_src).expect("parse WAT");
    Artifact::new(Metadata::new(name, Language::Rust, "sig-test"), bytes)
}

pub fn artifact_in(name: &str, language: Language, wat_src: &str) -> Artifact {
    let bytes = wat::parse_str(wat_src).expect("parse WAT");
    Artifact::new(Metadata::new(name, language, "sig-test"), bytes)
}
