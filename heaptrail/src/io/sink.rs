//! Byte sinks a capture stream is written to
//!
//! A [`Sink`] carries the encoded record stream either into a file or to a
//! single live consumer over TCP. The writer side of the socket protocol is
//! the server: it binds a port, accepts exactly one client and streams the
//! wire format verbatim until the process ends.

use log::info;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::path::Path;

/// Sequential byte sink for the encoder.
pub trait Sink: Send {
    /// Write the whole buffer.
    ///
    /// # Errors
    /// Returns an error if the underlying stream rejects the bytes.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Push buffered bytes down to the OS.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> std::io::Result<()>;

    /// Flush and release the underlying stream.
    ///
    /// # Errors
    /// Returns an error if the final flush fails.
    fn close(&mut self) -> std::io::Result<()>;
}

/// Buffered capture-file writer.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    /// Create (or truncate) a capture file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<FileSink> {
        let file = File::create(path.as_ref())?;
        info!("writing capture to {}", path.as_ref().display());
        Ok(FileSink { writer: BufWriter::new(file) })
    }
}

impl Sink for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Bound-but-not-yet-connected half of a [`SocketSink`].
///
/// Binding and accepting are split so the tracked process can announce the
/// port it ended up with (port 0 requests an ephemeral one) before blocking
/// in accept.
pub struct SocketListener {
    listener: TcpListener,
}

impl SocketListener {
    /// Bind `addr` without accepting yet.
    ///
    /// # Errors
    /// Returns an error if the bind fails.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> std::io::Result<SocketListener> {
        let listener = TcpListener::bind(addr)?;
        info!("waiting for live reader on {}", listener.local_addr()?);
        Ok(SocketListener { listener })
    }

    /// The address the listener actually bound.
    ///
    /// # Errors
    /// Returns an error if the local address cannot be queried.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Block until the single consumer connects.
    ///
    /// # Errors
    /// Returns an error if accepting fails.
    pub fn accept(self) -> std::io::Result<SocketSink> {
        let (stream, peer) = self.listener.accept()?;
        info!("live reader connected from {peer}");
        Ok(SocketSink { stream })
    }
}

/// TCP server sink: accepts one client and streams to it.
pub struct SocketSink {
    stream: TcpStream,
}

impl SocketSink {
    /// Bind `addr` and block until the single consumer connects.
    ///
    /// # Errors
    /// Returns an error if binding or accepting fails.
    pub fn accept_on<A: ToSocketAddrs>(addr: A) -> std::io::Result<SocketSink> {
        SocketListener::bind(addr)?.accept()
    }
}

impl Sink for SocketSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush()
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.stream.flush()?;
        let _ = self.stream.shutdown(Shutdown::Both);
        Ok(())
    }
}

/// In-memory sink used by tests and the codec unit checks.
#[derive(Default)]
pub struct VecSink {
    pub bytes: Vec<u8>,
}

impl VecSink {
    #[must_use]
    pub fn new() -> VecSink {
        VecSink::default()
    }
}

impl Sink for VecSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.bytes.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
