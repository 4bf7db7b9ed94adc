//! Stream transports for capture data
//!
//! Sources feed the decoder, sinks carry the encoder's output. Both exist in
//! a file flavor and a TCP flavor; the TCP writer is the server and the TCP
//! reader the single client (see the socket protocol notes in `sink`).

pub mod sink;
pub mod source;

pub use sink::{FileSink, Sink, SocketListener, SocketSink, VecSink};
pub use source::{FileSource, SocketCancel, SocketSource, Source};
