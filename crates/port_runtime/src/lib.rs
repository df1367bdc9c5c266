pub mod memory;
pub mod port;

#[cfg(feature = "test-utils")]
pub mod test_util;

pub use memory::{EmitError, MemoryRuntime};
pub use port::{InboundPort, Listener, OutboundPort, Port, PortKind, PortRuntime, PortSet, SendError};
