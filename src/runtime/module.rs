//! One instantiated guest module and the host↔guest calling convention.
//!
//! Every hop, in either direction, follows the same four steps against the
//! callee: `malloc` a buffer, write the serialized context into it, invoke
//! (`run` for guests, the imported `next` for the host), then unpack the
//! returned pointer/length, read the result out and `free` it.
//!
//! WASM exports return a single scalar, so the result pointer and length
//! travel bit-packed in one u64: length in the high 32 bits, pointer in
//! the low 32 bits. Host and every guest code generator must agree on this
//! layout exactly.

use tracing::trace;
use wasmtime::{AsContextMut, Memory, TypedFunc};

use super::instance::InstanceState;
use super::RuntimeError;
use crate::context::Codec;

/// Pack a (pointer, length) pair into the single u64 a WASM export can
/// return.
pub(crate) fn pack(ptr: u32, len: u32) -> u64 {
    (u64::from(len) << 32) | u64::from(ptr)
}

/// Inverse of [`pack`].
pub(crate) fn unpack(packed: u64) -> (u32, u32) {
    ((packed & 0xFFFF_FFFF) as u32, (packed >> 32) as u32)
}

/// An instantiated guest function inside one chain instance.
///
/// Holds the resolved typed exports and the forward link: the index of the
/// next module in the owning instance's chain, or `None` at the tail.
/// Handles never outlive their instance's store.
#[derive(Clone)]
pub(crate) struct ModuleHandle {
    pub(crate) name: String,
    pub(crate) instance: wasmtime::Instance,
    pub(crate) memory: Memory,
    pub(crate) run: TypedFunc<(u32, u32), u64>,
    pub(crate) malloc: TypedFunc<u64, u64>,
    pub(crate) free: TypedFunc<u64, ()>,
    pub(crate) next: Option<usize>,
}

impl ModuleHandle {
    /// Resolve the export contract of a freshly instantiated module and
    /// wire its forward link.
    pub(crate) fn bind(
        mut store: impl AsContextMut,
        instance: wasmtime::Instance,
        name: &str,
        index: usize,
        chain_len: usize,
    ) -> Result<Self, RuntimeError> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| {
                RuntimeError::Instantiation(format!(
                    "function '{}' does not export a linear memory",
                    name
                ))
            })?;
        let run = instance
            .get_typed_func::<(u32, u32), u64>(&mut store, "run")
            .map_err(|e| RuntimeError::Instantiation(format!("function '{}': {}", name, e)))?;
        let malloc = instance
            .get_typed_func::<u64, u64>(&mut store, "malloc")
            .map_err(|e| RuntimeError::Instantiation(format!("function '{}': {}", name, e)))?;
        let free = instance
            .get_typed_func::<u64, ()>(&mut store, "free")
            .map_err(|e| RuntimeError::Instantiation(format!("function '{}': {}", name, e)))?;

        let next = if index + 1 < chain_len {
            Some(index + 1)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            instance,
            memory,
            run,
            malloc,
            free,
            next,
        })
    }
}

/// Drive one guest module through the four-step convention.
///
/// `index` must be the position of `handle` within the instance's chain;
/// it is pushed onto the dispatch stack for the duration of the `run`
/// call so the `next` import can identify its caller.
///
/// On success `output` holds the guest's serialized result and the
/// guest-allocated result buffer has been released.
pub(crate) fn call_guest<T, S>(
    mut store: S,
    handle: &ModuleHandle,
    index: usize,
    input: &[u8],
    output: &mut Vec<u8>,
) -> Result<(), RuntimeError>
where
    T: Codec + 'static,
    S: AsContextMut<Data = InstanceState<T>>,
{
    trace!(module = %handle.name, len = input.len(), "dispatching run");

    // 1. allocate in the callee
    let ptr = handle
        .malloc
        .call(&mut store, input.len() as u64)
        .map_err(|e| RuntimeError::Allocation(format!("'{}': {}", handle.name, e)))?
        as u32;

    // 2. copy the serialized context into the callee's memory; the hand-off
    //    has not happened yet, so a failed write is paired with a free here
    if let Err(e) = handle.memory.write(&mut store, ptr as usize, input) {
        let _ = handle.free.call(&mut store, u64::from(ptr));
        return Err(RuntimeError::MemoryWrite(format!(
            "'{}': {}",
            handle.name, e
        )));
    }

    // 3. invoke; the callee now owns the input buffer
    store.as_context_mut().data_mut().stack.push(index);
    let invoked = handle.run.call(&mut store, (ptr, input.len() as u32));
    store.as_context_mut().data_mut().stack.pop();
    let packed = invoked.map_err(unwind_error)?;

    // 4. read the result back out; the callee's buffer is released even
    //    when the read fails
    let (out_ptr, out_len) = unpack(packed);
    let read = read_exact(&mut store, &handle.memory, out_ptr, out_len, output);
    let freed = handle.free.call(&mut store, u64::from(out_ptr));
    read?;
    freed.map_err(unwind_error)?;

    Ok(())
}

/// Copy `len` bytes at `ptr` out of a module's memory into `out`.
pub(crate) fn read_exact(
    store: impl AsContextMut,
    memory: &Memory,
    ptr: u32,
    len: u32,
    out: &mut Vec<u8>,
) -> Result<(), RuntimeError> {
    out.clear();
    out.resize(len as usize, 0);
    memory
        .read(&store, ptr as usize, out)
        .map_err(|e| RuntimeError::MemoryRead(e.to_string()))
}

/// Map an error crossing the engine boundary back into the runtime's
/// taxonomy: an error raised by our own `next` import travels through the
/// guest as a trap and is recovered here by downcast; anything else is a
/// genuine guest fault.
pub(crate) fn unwind_error(err: wasmtime::Error) -> RuntimeError {
    match err.downcast::<RuntimeError>() {
        Ok(host) => host,
        Err(trap) => RuntimeError::Trap(trap),
    }
}
