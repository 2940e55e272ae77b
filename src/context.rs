//! Request/response envelope shared across chain hops.
//!
//! A [`Context`] pairs the application value with the wire buffer that
//! carries it across the host/guest memory boundary. The two are kept in
//! sync only at explicit points: [`Context::serialize`] re-encodes the
//! value into the buffer, [`Context::deserialize`] re-decodes the buffer
//! into the value. Hops that merely forward bytes never pay for a
//! re-encode.

use std::error::Error;

/// Encode/decode logic for the application value carried by a [`Context`].
///
/// Implementations are typically generated from a schema; the runtime
/// itself never looks inside the produced bytes. `encode` must fully
/// replace the buffer contents, `decode` must fully replace the value.
pub trait Codec: Default {
    type Error: Error + Send + Sync + 'static;

    /// Serialize `self` into `buf`, replacing its contents.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), Self::Error>;

    /// Replace `self` with the value decoded from `buf`.
    fn decode(&mut self, buf: &[u8]) -> Result<(), Self::Error>;
}

/// The mutable envelope passed between every hop of a chain.
///
/// Owned by exactly one [`Instance`](crate::Instance) at a time. The wire
/// buffer is reused call-to-call, so repeated invocations on the same
/// instance do not reallocate.
#[derive(Debug, Default, Clone)]
pub struct Context<T: Codec> {
    value: T,
    buffer: Vec<u8>,
}

impl<T: Codec> Context<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing application value; the wire buffer starts empty
    /// and stale until the next [`serialize`](Self::serialize).
    pub fn with_value(value: T) -> Self {
        Self {
            value,
            buffer: Vec::new(),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// The last serialized form of the value. Stale if the value was
    /// mutated since the last sync point.
    pub fn wire(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn wire_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// Re-encode the value into the wire buffer.
    pub fn serialize(&mut self) -> Result<(), T::Error> {
        self.value.encode(&mut self.buffer)
    }

    /// Re-decode the wire buffer into the value.
    pub fn deserialize(&mut self) -> Result<(), T::Error> {
        self.value.decode(&self.buffer)
    }
}
