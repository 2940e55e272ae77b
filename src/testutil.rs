//! Shared fixtures for unit tests: a plain-text codec and WAT guest
//! modules implementing the full export contract with a bump allocator.

use std::string::FromUtf8Error;

use crate::artifact::{Artifact, Language, Metadata};
use crate::context::Codec;

/// UTF-8 string carried verbatim on the wire.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Text(pub(crate) String);

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

/// A guest that appends `marker` to the incoming bytes, forwards through
/// `next`, and hands the host's result straight back. Allocator traffic
/// is counted in the exported `allocs`/`frees` globals.
pub(crate) fn chained_guest(marker: char) -> String {
    format!(
        r#"
    (module
        (import "env" "next" (func $next (param i32 i32) (result i64)))
        (memory (export "memory") 2)
        (global $heap (mut i32) (i32.const 64))
        (global $allocs (mut i32) (i32.const 0))
        (global $frees (mut i32) (i32.const 0))
        (export "allocs" (global $allocs))
        (export "frees" (global $frees))

        (func $malloc (export "malloc") (param $len i64) (result i64)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap
                (i32.and
                    (i32.add
                        (i32.add (global.get $heap) (i32.wrap_i64 (local.get $len)))
                        (i32.const 7))
                    (i32.const -8)))
            (global.set $allocs (i32.add (global.get $allocs) (i32.const 1)))
            (i64.extend_i32_u (local.get $ptr))
        )

        (func $free (export "free") (param $ptr i64)
            (global.set $frees (i32.add (global.get $frees) (i32.const 1)))
        )

        (func $run (export "run") (param $ptr i32) (param $len i32) (result i64)
            (local $out i32)
            (local $outlen i32)
            (local $packed i64)
            ;; copy the incoming context and append our marker
            (local.set $outlen (i32.add (local.get $len) (i32.const 1)))
            (local.set $out
                (i32.wrap_i64 (call $malloc (i64.extend_i32_u (local.get $outlen)))))
            (memory.copy (local.get $out) (local.get $ptr) (local.get $len))
            (i32.store8 (i32.add (local.get $out) (local.get $len)) (i32.const {code}))
            ;; done with the incoming buffer
            (call $free (i64.extend_i32_u (local.get $ptr)))
            ;; continue the chain; the result lands in our memory
            (local.set $packed (call $next (local.get $out) (local.get $outlen)))
            (call $free (i64.extend_i32_u (local.get $out)))
            (local.get $packed)
        )
    )
    "#,
        code = marker as u32
    )
}

pub(crate) fn artifact(name: &str, wat_src: &str) -> Artifact {
    let bytes = wat::parse_str(wat_src).expect("parse WAT");
    Artifact::new(Metadata::new(name, Language::Rust, "sig-test"), bytes)
}
