//! Instance lifecycle: one live invocation context per chain.
//!
//! An [`Instance`] owns a fresh instantiation of every function in the
//! chain inside its own store, so no guest state or linear memory is ever
//! shared between instances. The same instance may be reused across calls
//! when persistent guest state is wanted, or created per call for
//! stateless isolation.

use std::sync::Arc;

use tracing::debug;
use wasmtime::Store;

use super::module::{self, ModuleHandle};
use super::{Chain, NextFn, RuntimeError};
use crate::context::{Codec, Context};

/// Store data for one instance: the chain's module handles, the dispatch
/// stack identifying which module is currently executing, and the context
/// envelope.
pub(crate) struct InstanceState<T: Codec> {
    pub(crate) modules: Vec<ModuleHandle>,
    pub(crate) stack: Vec<usize>,
    pub(crate) context: Context<T>,
    pub(crate) next: NextFn<T>,
}

impl<T: Codec> InstanceState<T> {
    pub(crate) fn new(next: NextFn<T>) -> Self {
        Self {
            modules: Vec::new(),
            stack: Vec::new(),
            context: Context::new(),
            next,
        }
    }

    /// State with no registered modules, for exercising the host import
    /// outside a runtime-managed dispatch.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self::new(Arc::new(|ctx| ctx))
    }
}

/// Instantiate every function of the chain into a fresh store.
///
/// Dropping the store tears down every instantiation made so far, so a
/// failure part-way through leaks nothing.
pub(crate) fn build_store<T>(chain: &Chain<T>) -> Result<Store<InstanceState<T>>, RuntimeError>
where
    T: Codec + 'static,
{
    let mut store = Store::new(&chain.engine, InstanceState::new(Arc::clone(&chain.next)));
    let count = chain.functions.len();
    for (index, function) in chain.functions.iter().enumerate() {
        let instantiated = function.pre().instantiate(&mut store).map_err(|e| {
            RuntimeError::Instantiation(format!("function '{}': {}", function.name(), e))
        })?;
        let handle = ModuleHandle::bind(&mut store, instantiated, function.name(), index, count)?;
        store.data_mut().modules.push(handle);
    }
    Ok(store)
}

/// One live invocation context: the chain's modules wired head to tail,
/// plus the mutable [`Context`] carried across hops.
pub struct Instance<T: Codec> {
    id: u64,
    chain: Arc<Chain<T>>,
    store: Store<InstanceState<T>>,
}

impl<T: Codec + 'static> Instance<T> {
    pub(crate) fn create(id: u64, chain: Arc<Chain<T>>) -> Result<Self, RuntimeError> {
        let store = build_store(&chain)?;
        debug!(instance = id, modules = chain.functions.len(), "instance created");
        Ok(Self { id, chain, store })
    }

    /// Identifier of this instance within its runtime, for log
    /// correlation.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of linked modules; equals the runtime's function count.
    pub fn chain_len(&self) -> usize {
        self.store.data().modules.len()
    }

    /// The context bound to this instance. The underlying buffer is
    /// reused call-to-call; do not retain references past the instance.
    pub fn context(&self) -> &Context<T> {
        &self.store.data().context
    }

    pub fn context_mut(&mut self) -> &mut Context<T> {
        &mut self.store.data_mut().context
    }

    /// Arm the engine's epoch deadline for this instance's store. Only
    /// effective on runtimes built with epoch interruption enabled.
    pub fn set_epoch_deadline(&mut self, ticks_beyond_current: u64) {
        self.store.set_epoch_deadline(ticks_beyond_current);
    }

    /// Execute the chain against the current context.
    ///
    /// Synchronous: the call does not return until every module and the
    /// host continuation have completed. On success the context value
    /// holds the final result. On a per-call error the context and guest
    /// memories are not guaranteed consistent; discard the instance or
    /// recycle it through [`Runtime::reset`](super::Runtime::reset).
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        let head = match self.store.data().modules.first() {
            Some(head) => head.clone(),
            None => return Err(RuntimeError::EmptyChain),
        };

        // the value is authoritative at call entry; sync it to the wire
        self.store
            .data_mut()
            .context
            .serialize()
            .map_err(|e| RuntimeError::Encode(e.to_string()))?;
        // hand-off copy; the instance's own buffer stays behind for the
        // tail dispatch
        let input = self.store.data().context.wire().to_vec();

        let mut output = Vec::with_capacity(input.len());
        module::call_guest(&mut self.store, &head, 0, &input, &mut output)?;

        let ctx = &mut self.store.data_mut().context;
        let wire = ctx.wire_mut();
        wire.clear();
        wire.extend_from_slice(&output);
        ctx.deserialize()
            .map_err(|e| RuntimeError::Decode(e.to_string()))
    }

    /// Tear down every module instantiation and rebuild from the compiled
    /// chain, keeping the context envelope. Reclaims guest memory growth.
    pub(crate) fn rebuild(&mut self) -> Result<(), RuntimeError> {
        let mut store = build_store(&self.chain)?;
        let ctx = std::mem::take(&mut self.store.data_mut().context);
        store.data_mut().context = ctx;
        // replacing the store drops the previous instantiations
        self.store = store;
        debug!(instance = self.id, "instance reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeBuilder;
    use crate::testutil::{artifact, chained_guest, Text};

    fn marker_runtime(markers: &[char]) -> crate::Runtime<Text> {
        let mut builder = RuntimeBuilder::new();
        for (i, marker) in markers.iter().enumerate() {
            builder = builder.function(artifact(&format!("fn-{}", i), &chained_guest(*marker)));
        }
        builder
            .next(|mut ctx: Context<Text>| {
                ctx.value_mut().0.push('!');
                ctx
            })
            .build()
            .expect("build runtime")
    }

    #[test]
    fn chain_is_fully_linked() {
        let runtime = marker_runtime(&['a', 'b', 'c']);
        let instance = runtime.instance().expect("instance");

        assert_eq!(instance.chain_len(), 3);
        let modules = &instance.store.data().modules;
        assert_eq!(modules[0].next, Some(1));
        assert_eq!(modules[1].next, Some(2));
        assert_eq!(modules[2].next, None);
    }

    #[test]
    fn mallocs_and_frees_pair_up() {
        let runtime = marker_runtime(&['x', 'y']);
        let mut instance = runtime.instance().expect("instance");
        instance.context_mut().value_mut().0 = "seed".into();
        instance.run().expect("run");

        for handle in instance.store.data().modules.clone() {
            let allocs = handle
                .instance
                .get_global(&mut instance.store, "allocs")
                .expect("allocs global")
                .get(&mut instance.store)
                .i32()
                .expect("i32 global");
            let frees = handle
                .instance
                .get_global(&mut instance.store, "frees")
                .expect("frees global")
                .get(&mut instance.store)
                .i32()
                .expect("i32 global");
            assert!(allocs > 0, "module '{}' never allocated", handle.name);
            assert_eq!(
                allocs, frees,
                "module '{}' leaked guest buffers",
                handle.name
            );
        }
    }

    #[test]
    fn run_reports_stale_modules_after_misuse() {
        // direct sanity check of the dispatch-stack discipline: a normal
        // run leaves the stack empty again
        let runtime = marker_runtime(&['z']);
        let mut instance = runtime.instance().expect("instance");
        instance.run().expect("run");
        assert!(instance.store.data().stack.is_empty());
    }
}
