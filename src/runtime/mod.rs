//! Chain runtime
//!
//! Compiles registered function artifacts once, wires the host-exports
//! module, and builds isolated [`Instance`]s of the configured chain on
//! demand.

mod host;
mod instance;
mod module;

pub use instance::Instance;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use wasmtime::{Config, Engine, InstancePre, Linker, Module};

use crate::artifact::{Artifact, Language, Metadata};
use crate::context::{Codec, Context};
use instance::InstanceState;

/// Everything that can go wrong in the runtime.
///
/// Setup-time variants (`Compile`, `HostInit`) mean no runtime was
/// produced. `Instantiation` is fatal to the one instance being built or
/// reset. The remaining variants are scoped to a single `run`: they leave
/// the runtime and other instances intact, but the failing instance's
/// context and guest memories are not guaranteed consistent.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("module compilation failed: {0}")]
    Compile(String),

    #[error("host module setup failed: {0}")]
    HostInit(String),

    #[error("instantiation failed: {0}")]
    Instantiation(String),

    #[error("guest allocation failed: {0}")]
    Allocation(String),

    #[error("memory write failed: {0}")]
    MemoryWrite(String),

    #[error("memory read failed: {0}")]
    MemoryRead(String),

    #[error("context decode failed: {0}")]
    Decode(String),

    #[error("context encode failed: {0}")]
    Encode(String),

    #[error("chain has no functions")]
    EmptyChain,

    #[error("next called by a module the runtime did not dispatch")]
    UnresolvedModule,

    #[error("guest trapped: {0}")]
    Trap(anyhow::Error),
}

/// The host-level continuation invoked when the chain's tail calls
/// `next`: receives the deserialized context, returns the context to send
/// back up the chain.
pub type NextFn<T> = Arc<dyn Fn(Context<T>) -> Context<T> + Send + Sync>;

/// One registered function: an ordering-stable wrapper around a compiled
/// module and its metadata. Immutable once the runtime is built; shared
/// read-only by every instance.
pub struct Function<T: Codec> {
    metadata: Metadata,
    digest: String,
    raw: Vec<u8>,
    pre: InstancePre<InstanceState<T>>,
}

impl<T: Codec> Function<T> {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn language(&self) -> Language {
        self.metadata.language
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Content digest of the raw WASM bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The original bytes the function was registered with.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The engine-level compiled module.
    pub fn compiled(&self) -> &Module {
        self.pre.module()
    }

    pub(crate) fn pre(&self) -> &InstancePre<InstanceState<T>> {
        &self.pre
    }
}

/// Shared, read-only chain definition: engine, compiled functions in
/// invocation order, and the host continuation. Instances hold this
/// behind an `Arc`; it lives as long as the runtime or any instance.
pub(crate) struct Chain<T: Codec> {
    pub(crate) engine: Engine,
    pub(crate) functions: Vec<Function<T>>,
    pub(crate) next: NextFn<T>,
    ids: AtomicU64,
}

/// Builder for a [`Runtime`].
pub struct RuntimeBuilder<T: Codec> {
    artifacts: Vec<Artifact>,
    next: Option<NextFn<T>>,
    epoch_interruption: bool,
}

impl<T: Codec + 'static> RuntimeBuilder<T> {
    pub fn new() -> Self {
        Self {
            artifacts: Vec::new(),
            next: None,
            epoch_interruption: false,
        }
    }

    /// Append a function to the chain. Registration order is invocation
    /// order: the first function registered is the head.
    pub fn function(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn functions(mut self, artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        self.artifacts.extend(artifacts);
        self
    }

    /// The continuation invoked when the tail of the chain calls `next`.
    /// Defaults to the identity: the context comes back unchanged.
    pub fn next(mut self, f: impl Fn(Context<T>) -> Context<T> + Send + Sync + 'static) -> Self {
        self.next = Some(Arc::new(f));
        self
    }

    /// Enable epoch-based interruption so embedders can impose deadlines
    /// via [`Engine::increment_epoch`] and
    /// [`Instance::set_epoch_deadline`].
    pub fn epoch_interruption(mut self, enabled: bool) -> Self {
        self.epoch_interruption = enabled;
        self
    }

    /// Compile every artifact in order and set up the host-exports
    /// module. Nothing is retained on failure.
    pub fn build(self) -> Result<Runtime<T>, RuntimeError> {
        let mut config = Config::new();
        if self.epoch_interruption {
            config.epoch_interruption(true);
        }
        let engine =
            Engine::new(&config).map_err(|e| RuntimeError::HostInit(e.to_string()))?;

        let mut linker = Linker::new(&engine);
        host::register(&mut linker)?;

        // every function in a chain must be generated against the same
        // schema as its peers and the host
        if let Some((first, rest)) = self.artifacts.split_first() {
            let expected = &first.metadata().signature_hash;
            for artifact in rest {
                if &artifact.metadata().signature_hash != expected {
                    return Err(RuntimeError::Compile(format!(
                        "function '{}' was built against signature '{}', chain expects '{}'",
                        artifact.name(),
                        artifact.metadata().signature_hash,
                        expected
                    )));
                }
            }
        }

        let mut functions = Vec::with_capacity(self.artifacts.len());
        for artifact in self.artifacts {
            artifact.validate_contract()?;
            let module = Module::new(&engine, artifact.bytes()).map_err(|e| {
                RuntimeError::Compile(format!("function '{}': {}", artifact.name(), e))
            })?;
            let pre = linker.instantiate_pre(&module).map_err(|e| {
                RuntimeError::Compile(format!("function '{}': {}", artifact.name(), e))
            })?;
            let digest = artifact.digest();
            debug!(function = artifact.name(), digest = %&digest[..8], "function compiled");
            let (metadata, raw) = artifact.into_parts();
            functions.push(Function {
                metadata,
                digest,
                raw,
                pre,
            });
        }

        info!(functions = functions.len(), "chain runtime ready");

        let next = self.next.unwrap_or_else(|| Arc::new(|ctx| ctx));
        Ok(Runtime {
            chain: Arc::new(Chain {
                engine,
                functions,
                next,
                ids: AtomicU64::new(0),
            }),
        })
    }
}

impl<T: Codec + 'static> Default for RuntimeBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The chain runtime: owns the engine, the compiled functions and the
/// host continuation, and builds isolated [`Instance`]s on demand.
///
/// Instances from the same runtime may run concurrently; the runtime
/// itself is only read after construction.
pub struct Runtime<T: Codec> {
    chain: Arc<Chain<T>>,
}

impl<T: Codec> std::fmt::Debug for Runtime<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("functions", &self.chain.functions.len())
            .finish_non_exhaustive()
    }
}

impl<T: Codec + 'static> Runtime<T> {
    /// Compile `artifacts` in chain order with `next` as the tail
    /// continuation. See [`RuntimeBuilder`] for more control.
    pub fn new(
        artifacts: impl IntoIterator<Item = Artifact>,
        next: impl Fn(Context<T>) -> Context<T> + Send + Sync + 'static,
    ) -> Result<Self, RuntimeError> {
        RuntimeBuilder::new().functions(artifacts).next(next).build()
    }

    pub fn builder() -> RuntimeBuilder<T> {
        RuntimeBuilder::new()
    }

    /// The functions of the chain, in invocation order.
    pub fn functions(&self) -> &[Function<T>] {
        &self.chain.functions
    }

    /// The underlying engine, e.g. for driving epoch ticks from a timer
    /// thread.
    pub fn engine(&self) -> &Engine {
        &self.chain.engine
    }

    /// Instantiate a fresh copy of every function and wire them into a
    /// chain. Partial instantiations are torn down on failure.
    pub fn instance(&self) -> Result<Instance<T>, RuntimeError> {
        let id = self.chain.ids.fetch_add(1, Ordering::Relaxed);
        Instance::create(id, Arc::clone(&self.chain))
    }

    /// Recycle an instance: drop every live module instantiation and
    /// re-instantiate from the compiled chain, keeping the context
    /// envelope. On failure the instance must be discarded.
    pub fn reset(&self, instance: &mut Instance<T>) -> Result<(), RuntimeError> {
        instance.rebuild()
    }
}
