//! The streaming core: packet codec, meta builder, signal registry,
//! connection manager, WebSocket RX filter, and JSON-RPC control channel
//! (components A-F).

pub mod connection;
pub mod jsonrpc;
pub mod meta;
pub mod packet;
pub mod registry;
pub mod stream;
pub mod ws_frame;
pub mod ws_rx;

pub use connection::{BoxedSocket, ConnectionManager, IncomingConnection};
pub use registry::{SampleSource, SignalDefinition, SignalRegistry, SignalType, TimeSpec};
pub use stream::{SendBackend, StreamHandle};
