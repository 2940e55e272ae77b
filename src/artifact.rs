//! Compiled function artifacts and their metadata.
//!
//! An [`Artifact`] is what the build pipeline hands the runtime: raw WASM
//! bytes plus descriptive metadata. The runtime never cares which language
//! produced the bytes; [`Language`] exists so embedders can label and
//! persist chain definitions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use wasmparser::{ExternalKind, Parser, Payload, TypeRef};

use crate::runtime::RuntimeError;

/// Source language a guest function was compiled from.
///
/// Metadata only: the execution path never branches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Go,
    Rust,
    TypeScript,
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Go => write!(f, "go"),
            Language::Rust => write!(f, "rust"),
            Language::TypeScript => write!(f, "typescript"),
        }
    }
}

/// Descriptive metadata for one compiled function.
///
/// `signature_hash` identifies the schema the function was generated
/// against; every function in a chain (and the host) must agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub language: Language,
    pub signature_hash: String,
}

impl Metadata {
    pub fn new(
        name: impl Into<String>,
        language: Language,
        signature_hash: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            language,
            signature_hash: signature_hash.into(),
        }
    }
}

/// Raw WASM bytes plus metadata, as produced by the build pipeline.
#[derive(Debug, Clone)]
pub struct Artifact {
    metadata: Metadata,
    bytes: Vec<u8>,
}

/// Exports every guest module must provide.
const REQUIRED_FUNCS: [&str; 3] = ["run", "malloc", "free"];

/// The one host function a guest may import.
pub(crate) const HOST_MODULE: &str = "env";
pub(crate) const HOST_NEXT: &str = "next";

impl Artifact {
    pub fn new(metadata: Metadata, bytes: Vec<u8>) -> Self {
        Self { metadata, bytes }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn into_parts(self) -> (Metadata, Vec<u8>) {
        (self.metadata, self.bytes)
    }

    /// Content digest of the WASM bytes, for diagnostics and log
    /// correlation.
    pub fn digest(&self) -> String {
        Sha256::digest(&self.bytes)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    /// Check the module against the chain export/import contract before
    /// compilation: it must export `run`, `malloc`, `free` and a linear
    /// memory, and may import nothing but `env::next`.
    ///
    /// Signature-level checking (exact param/result types) is left to
    /// instantiation, which resolves typed exports.
    pub(crate) fn validate_contract(&self) -> Result<(), RuntimeError> {
        let name = &self.metadata.name;
        let mut exported_funcs = Vec::new();
        let mut exports_memory = false;

        for payload in Parser::new(0).parse_all(&self.bytes) {
            let payload = payload
                .map_err(|e| RuntimeError::Compile(format!("function '{}': {}", name, e)))?;
            match payload {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import.map_err(|e| {
                            RuntimeError::Compile(format!("function '{}': {}", name, e))
                        })?;
                        let allowed = import.module == HOST_MODULE
                            && import.name == HOST_NEXT
                            && matches!(import.ty, TypeRef::Func(_));
                        if !allowed {
                            return Err(RuntimeError::Compile(format!(
                                "function '{}' imports '{}::{}'; only '{}::{}' is provided",
                                name, import.module, import.name, HOST_MODULE, HOST_NEXT
                            )));
                        }
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export.map_err(|e| {
                            RuntimeError::Compile(format!("function '{}': {}", name, e))
                        })?;
                        match export.kind {
                            ExternalKind::Func => exported_funcs.push(export.name.to_string()),
                            ExternalKind::Memory if export.name == "memory" => {
                                exports_memory = true;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        for required in REQUIRED_FUNCS {
            if !exported_funcs.iter().any(|f| f.as_str() == required) {
                return Err(RuntimeError::Compile(format!(
                    "function '{}' does not export '{}'",
                    name, required
                )));
            }
        }
        if !exports_memory {
            return Err(RuntimeError::Compile(format!(
                "function '{}' does not export a linear memory named 'memory'",
                name
            )));
        }

        Ok(())
    }
}
