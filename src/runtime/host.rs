//! The host side of the chain: the `env::next` import.
//!
//! Every guest module imports exactly one host function. When a guest has
//! finished its own work it serializes its context and calls
//! `next(ptr, len)`; the host either cascades into the next module of the
//! chain or, at the tail, hands the context to the embedder-supplied
//! continuation. Either way the updated bytes are written back into the
//! calling guest's memory and returned as a packed pointer/length.
//!
//! The calling module is identified through the instance's dispatch stack:
//! the runtime pushes a module's index before invoking its `run` export
//! and pops it afterwards, so the top of the stack is always the module a
//! `next` call originates from. No name lookup, no global registry; a
//! `next` call with an empty stack means the module was invoked outside
//! the runtime's control and is rejected outright.

use std::sync::Arc;

use tracing::trace;
use wasmtime::{Caller, Linker};

use super::instance::InstanceState;
use super::{module, RuntimeError};
use crate::artifact::{HOST_MODULE, HOST_NEXT};
use crate::context::Codec;

/// Register the host-exports module on a linker. Called once per runtime;
/// failure here means the runtime cannot be constructed.
pub(crate) fn register<T>(linker: &mut Linker<InstanceState<T>>) -> Result<(), RuntimeError>
where
    T: Codec + 'static,
{
    linker
        .func_wrap(
            HOST_MODULE,
            HOST_NEXT,
            |mut caller: Caller<'_, InstanceState<T>>, ptr: u32, len: u32| -> wasmtime::Result<u64> {
                dispatch_next(&mut caller, ptr, len).map_err(wasmtime::Error::from)
            },
        )
        .map_err(|e| RuntimeError::HostInit(e.to_string()))?;
    Ok(())
}

/// Handle one `next` call from a guest module.
fn dispatch_next<T>(
    caller: &mut Caller<'_, InstanceState<T>>,
    ptr: u32,
    len: u32,
) -> Result<u64, RuntimeError>
where
    T: Codec + 'static,
{
    // the module currently executing `run` is the one calling us
    let current = caller
        .data()
        .stack
        .last()
        .copied()
        .ok_or(RuntimeError::UnresolvedModule)?;
    let calling = caller
        .data()
        .modules
        .get(current)
        .cloned()
        .ok_or(RuntimeError::UnresolvedModule)?;

    // pull the guest's serialized context out of its memory
    let mut payload = Vec::with_capacity(len as usize);
    module::read_exact(&mut *caller, &calling.memory, ptr, len, &mut payload)?;

    let result = match calling.next {
        Some(next_index) => {
            // cascade: forward the bytes to the next module untouched
            let target = caller
                .data()
                .modules
                .get(next_index)
                .cloned()
                .ok_or(RuntimeError::UnresolvedModule)?;
            let mut out = Vec::with_capacity(payload.len());
            module::call_guest(&mut *caller, &target, next_index, &payload, &mut out)?;
            out
        }
        None => {
            // tail: rebind the instance's context to the received bytes
            // and hand it to the embedding application
            trace!(module = %calling.name, "chain tail reached, invoking host continuation");
            let state = caller.data_mut();
            let mut ctx = std::mem::take(&mut state.context);
            let wire = ctx.wire_mut();
            wire.clear();
            wire.extend_from_slice(&payload);
            if let Err(e) = ctx.deserialize() {
                caller.data_mut().context = ctx;
                return Err(RuntimeError::Decode(e.to_string()));
            }

            let continuation = Arc::clone(&caller.data().next);
            let mut ctx = continuation(ctx);

            let encoded = ctx.serialize();
            let out = ctx.wire().to_vec();
            caller.data_mut().context = ctx;
            if let Err(e) = encoded {
                return Err(RuntimeError::Encode(e.to_string()));
            }
            out
        }
    };

    // write the updated context back into the caller's own memory and
    // complete its `next` call with the packed location
    let out_ptr = calling
        .malloc
        .call(&mut *caller, result.len() as u64)
        .map_err(|e| RuntimeError::Allocation(format!("'{}': {}", calling.name, e)))?
        as u32;
    if let Err(e) = calling.memory.write(&mut *caller, out_ptr as usize, &result) {
        let _ = calling.free.call(&mut *caller, u64::from(out_ptr));
        return Err(RuntimeError::MemoryWrite(format!(
            "'{}': {}",
            calling.name, e
        )));
    }

    Ok(module::pack(out_ptr, result.len() as u32))
}
