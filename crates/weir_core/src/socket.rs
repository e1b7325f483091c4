//! Sockets: typed byte buffers attached to tasks.
//!
//! An output socket owns a [`SocketBuffer`]. Binding an input socket to an
//! output makes both hold the same buffer, so identity equality of buffers is
//! how a binding is observed.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::id::SocketRef;

/// Primitive element type carried by a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    /// Signed 8-bit integer
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// Unsigned 8-bit integer
    UInt8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Unsigned 32-bit integer
    UInt32,
    /// Unsigned 64-bit integer
    UInt64,
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
}

impl Datatype {
    /// Size of one element in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    /// Short type name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt8 => "uint8",
            Self::UInt16 => "uint16",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Data direction of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketDirection {
    /// Consumes data produced elsewhere
    In,
    /// Produces data
    Out,
    /// Consumes data and passes the same buffer on, modified in place
    Forward,
}

impl SocketDirection {
    /// Whether the socket can be bound to a producer
    #[must_use]
    pub const fn consumes(&self) -> bool {
        matches!(self, Self::In | Self::Forward)
    }

    /// Whether other sockets can be bound to this one
    #[must_use]
    pub const fn produces(&self) -> bool {
        matches!(self, Self::Out | Self::Forward)
    }
}

/// Shared, lock-protected byte buffer
///
/// Cloning shares the buffer. Tasks of one sequence replica run on a single
/// thread, so the lock is uncontended except across adaptor boundaries.
#[derive(Debug, Clone)]
pub struct SocketBuffer(Arc<Mutex<Vec<u8>>>);

impl SocketBuffer {
    /// Allocate a zero-filled buffer
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    /// Lock the bytes
    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identity comparison: do both handles designate the same storage
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Copy the bytes of `src` into this buffer
    ///
    /// Lengths must match; copying a buffer onto itself is a no-op.
    pub fn copy_from(&self, src: &Self) -> bool {
        if self.same_as(src) {
            return true;
        }
        let src = src.lock();
        let mut dst = self.lock();
        if src.len() != dst.len() {
            return false;
        }
        dst.copy_from_slice(&src);
        true
    }

    /// Resize in place, zero-filling new bytes
    pub(crate) fn resize(&self, len: usize) {
        self.lock().resize(len, 0);
    }
}

/// A socket of a task
#[derive(Debug, Clone)]
pub struct Socket {
    name: String,
    direction: SocketDirection,
    datatype: Datatype,
    n_elmts: usize,
    n_frames: usize,
    buffer: SocketBuffer,
    bound: Option<SocketRef>,
}

impl Socket {
    /// Create an unbound socket holding `n_elmts` elements per frame
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        direction: SocketDirection,
        datatype: Datatype,
        n_elmts: usize,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            datatype,
            n_elmts,
            n_frames: 1,
            buffer: SocketBuffer::zeroed(n_elmts * datatype.size()),
            bound: None,
        }
    }

    /// Socket name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Direction
    #[must_use]
    pub const fn direction(&self) -> SocketDirection {
        self.direction
    }

    /// Element type
    #[must_use]
    pub const fn datatype(&self) -> Datatype {
        self.datatype
    }

    /// Elements per frame
    #[must_use]
    pub const fn n_elmts(&self) -> usize {
        self.n_elmts
    }

    /// Frames carried per execution
    #[must_use]
    pub const fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Bytes of a single frame
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.n_elmts * self.datatype.size()
    }

    /// Total bytes across all frames
    #[must_use]
    pub const fn n_bytes(&self) -> usize {
        self.frame_bytes() * self.n_frames
    }

    /// The buffer this socket reads or writes
    #[must_use]
    pub fn buffer(&self) -> &SocketBuffer {
        &self.buffer
    }

    /// The producer socket this one is bound to
    #[must_use]
    pub const fn bound_to(&self) -> Option<SocketRef> {
        self.bound
    }

    pub(crate) fn attach(&mut self, producer: SocketRef, buffer: SocketBuffer) {
        self.bound = Some(producer);
        self.buffer = buffer;
    }

    pub(crate) fn detach(&mut self) -> Option<SocketRef> {
        self.buffer = SocketBuffer::zeroed(self.n_bytes());
        self.bound.take()
    }

    pub(crate) fn share_buffer(&mut self, buffer: SocketBuffer) {
        self.buffer = buffer;
    }

    pub(crate) fn set_n_frames(&mut self, n_frames: usize) {
        self.n_frames = n_frames;
        self.buffer.resize(self.n_bytes());
    }

    /// Same layout and binding, freshly allocated storage
    #[must_use]
    pub(crate) fn fresh_copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            direction: self.direction,
            datatype: self.datatype,
            n_elmts: self.n_elmts,
            n_frames: self.n_frames,
            buffer: SocketBuffer::zeroed(self.n_bytes()),
            bound: self.bound,
        }
    }
}

/// Read a `u32` element from a byte slice (native endian)
#[must_use]
pub fn read_u32(bytes: &[u8], index: usize) -> Option<u32> {
    let start = index * 4;
    let chunk = bytes.get(start..start + 4)?;
    Some(u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

/// Write a `u32` element into a byte slice (native endian)
pub fn write_u32(bytes: &mut [u8], index: usize, value: u32) -> bool {
    let start = index * 4;
    match bytes.get_mut(start..start + 4) {
        Some(chunk) => {
            chunk.copy_from_slice(&value.to_ne_bytes());
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_sizes() {
        assert_eq!(Datatype::Int8.size(), 1);
        assert_eq!(Datatype::UInt16.size(), 2);
        assert_eq!(Datatype::Float32.size(), 4);
        assert_eq!(Datatype::Int64.size(), 8);
        assert_eq!(Datatype::Float64.name(), "float64");
    }

    #[test]
    fn test_socket_sizes() {
        let mut socket = Socket::new("out", SocketDirection::Out, Datatype::Int32, 16);
        assert_eq!(socket.frame_bytes(), 64);
        assert_eq!(socket.n_bytes(), 64);
        assert_eq!(socket.buffer().len(), 64);

        socket.set_n_frames(4);
        assert_eq!(socket.n_bytes(), 256);
        assert_eq!(socket.buffer().len(), 256);
    }

    #[test]
    fn test_buffer_identity() {
        let a = SocketBuffer::zeroed(8);
        let b = a.clone();
        let c = SocketBuffer::zeroed(8);
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }

    #[test]
    fn test_buffer_copy_from() {
        let a = SocketBuffer::zeroed(8);
        let b = SocketBuffer::zeroed(8);
        a.lock()[3] = 42;
        assert!(b.copy_from(&a));
        assert_eq!(b.lock()[3], 42);

        let short = SocketBuffer::zeroed(4);
        assert!(!short.copy_from(&a));
        assert!(a.copy_from(&a.clone()));
    }

    #[test]
    fn test_detach_reallocates() {
        let mut socket = Socket::new("in", SocketDirection::In, Datatype::UInt8, 4);
        let shared = SocketBuffer::zeroed(4);
        let producer = SocketRef::new(crate::TaskId::from_raw(0), 0);
        socket.attach(producer, shared.clone());
        assert!(socket.buffer().same_as(&shared));
        assert_eq!(socket.detach(), Some(producer));
        assert!(!socket.buffer().same_as(&shared));
        assert_eq!(socket.bound_to(), None);
    }

    #[test]
    fn test_u32_helpers() {
        let mut bytes = vec![0u8; 8];
        assert!(write_u32(&mut bytes, 1, 0xdead_beef));
        assert_eq!(read_u32(&bytes, 1), Some(0xdead_beef));
        assert_eq!(read_u32(&bytes, 2), None);
        assert!(!write_u32(&mut bytes, 2, 1));
    }

    proptest::proptest! {
        #[test]
        fn prop_socket_bytes_follow_frames(
            datatype in proptest::sample::select(vec![
                Datatype::Int8,
                Datatype::Int16,
                Datatype::UInt32,
                Datatype::Float64,
            ]),
            n_elmts in 1usize..64,
            n_frames in 1usize..8,
        ) {
            let mut socket = Socket::new("s", SocketDirection::Forward, datatype, n_elmts);
            socket.set_n_frames(n_frames);
            proptest::prop_assert_eq!(socket.frame_bytes(), n_elmts * datatype.size());
            proptest::prop_assert_eq!(socket.n_bytes(), socket.frame_bytes() * n_frames);
            proptest::prop_assert_eq!(socket.buffer().len(), socket.n_bytes());
        }
    }
}
