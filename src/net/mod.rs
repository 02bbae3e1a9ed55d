//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ProxyHandler
//!     → transport.rs (pooled roundtrip, raw dial, TLS client)
//!     → Backend
//!
//! Scratch space for rendering and hand-built requests:
//!     buffer.rs (pooled, returned on drop)
//! ```

pub mod buffer;
pub mod transport;

pub use buffer::{BufferPool, PooledBuffer};
pub use transport::{BoxedIo, HyperTransport, Transport, TransportError};
