//! Cascade: chained WebAssembly function execution against a shared
//! context.
//!
//! A host process registers independently compiled WASM functions as an
//! ordered chain. Each invocation instantiates (or reuses) the whole
//! chain and drives a schema-typed request/response value through it: the
//! host calls the head module's `run`, each module hands the serialized
//! context to its successor through the imported `next` host function,
//! and the tail yields to a host-supplied continuation before the chain
//! unwinds.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │              Cascade Runtime               │
//! │                                            │
//! │  artifact  - registered function metadata  │
//! │  context   - request/response envelope     │
//! │  runtime   - chain compilation + dispatch  │
//! │                                            │
//! ├────────────────────────────────────────────┤
//! │         WASM execution (wasmtime)          │
//! └────────────────────────────────────────────┘
//! ```
//!
//! ## Module contract
//!
//! Every guest module exports `run(ptr: u32, len: u32) -> u64`,
//! `malloc(len: u64) -> u64` and `free(ptr: u64)`, plus a linear memory
//! named `memory`, and may import `next(ptr: u32, len: u32) -> u64` from
//! `env`. Pointer/length pairs cross the boundary packed into one u64
//! with the length in the high 32 bits.
//!
//! ## Example
//!
//! ```ignore
//! use cascade::{Artifact, Context, Language, Metadata, Runtime};
//!
//! let artifact = Artifact::new(
//!     Metadata::new("middleware", Language::Go, "sig-v1"),
//!     std::fs::read("middleware.wasm")?,
//! );
//! let runtime = Runtime::new([artifact], |mut ctx: Context<Request>| {
//!     ctx.value_mut().headers.insert("served-by".into(), "origin".into());
//!     ctx
//! })?;
//!
//! let mut instance = runtime.instance()?;
//! *instance.context_mut().value_mut() = request;
//! instance.run()?;
//! let response = instance.context().value();
//! ```

pub mod artifact;
pub mod context;
pub mod runtime;

#[cfg(test)]
pub(crate) mod testutil;

pub use artifact::{Artifact, Language, Metadata};
pub use context::{Codec, Context};
pub use runtime::{Function, Instance, NextFn, Runtime, RuntimeBuilder, RuntimeError};
