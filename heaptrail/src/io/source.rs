//! Byte sources a capture stream is decoded from
//!
//! A [`Source`] delivers the raw bytes of one capture stream, either from a
//! file on disk or from a live TCP connection to a tracked process. Reads are
//! all-or-nothing: a short read reports failure and the decoder decides
//! whether that is a clean end of stream or a truncation.

use log::{debug, info};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sequential byte source for the decoder.
pub trait Source: Send {
    /// Fill `buf` completely. Returns false on end of stream or short read;
    /// no partial data is delivered.
    fn read(&mut self, buf: &mut [u8]) -> bool;

    /// Read bytes until `delim`, consuming the delimiter and excluding it
    /// from the result. Returns None if the stream ends before the delimiter.
    fn getline(&mut self, delim: u8) -> Option<String>;

    /// True until the source is closed locally (or cancelled from outside).
    /// End of data alone does not close a source; the decoder uses this to
    /// tell truncation apart from deliberate teardown.
    fn is_open(&self) -> bool;

    fn close(&mut self);
}

fn read_delimited<R: BufRead>(reader: &mut R, delim: u8) -> Option<String> {
    let mut raw = Vec::new();
    let n = reader.read_until(delim, &mut raw).ok()?;
    if n == 0 || raw.last() != Some(&delim) {
        return None;
    }
    raw.pop();
    Some(String::from_utf8_lossy(&raw).into_owned())
}

/// Buffered sequential reader over a capture file.
pub struct FileSource {
    reader: BufReader<File>,
    open: bool,
}

impl FileSource {
    /// Open a capture file for reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<FileSource> {
        let file = File::open(path.as_ref())?;
        debug!("reading capture from {}", path.as_ref().display());
        Ok(FileSource { reader: BufReader::new(file), open: true })
    }
}

impl Source for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> bool {
        self.open && self.reader.read_exact(buf).is_ok()
    }

    fn getline(&mut self, delim: u8) -> Option<String> {
        if !self.open {
            return None;
        }
        read_delimited(&mut self.reader, delim)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
    }
}

/// Blocking TCP reader connected to a live capture writer.
///
/// The tracked process acts as the TCP server; this source is the single
/// client. Reads block until bytes arrive. A [`SocketCancel`] handle obtained
/// up front can shut the connection down from another thread, which makes a
/// blocked read return end-of-stream with `is_open() == false` so the
/// consumer tears down without logging a truncation.
pub struct SocketSource {
    reader: BufReader<TcpStream>,
    open: Arc<AtomicBool>,
}

impl SocketSource {
    /// Connect to a live capture writer at `addr` (host:port).
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> std::io::Result<SocketSource> {
        let stream = TcpStream::connect(addr)?;
        info!("connected to live capture at {}", stream.peer_addr()?);
        Ok(SocketSource {
            reader: BufReader::new(stream),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Handle for closing this source from another thread.
    ///
    /// # Errors
    /// Returns an error if the underlying stream cannot be cloned.
    pub fn cancel_handle(&self) -> std::io::Result<SocketCancel> {
        Ok(SocketCancel {
            stream: self.reader.get_ref().try_clone()?,
            open: Arc::clone(&self.open),
        })
    }
}

impl Source for SocketSource {
    fn read(&mut self, buf: &mut [u8]) -> bool {
        self.open.load(Ordering::Acquire) && self.reader.read_exact(buf).is_ok()
    }

    fn getline(&mut self, delim: u8) -> Option<String> {
        if !self.open.load(Ordering::Acquire) {
            return None;
        }
        read_delimited(&mut self.reader, delim)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::Release);
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
    }
}

/// External cancellation handle for a [`SocketSource`].
pub struct SocketCancel {
    stream: TcpStream,
    open: Arc<AtomicBool>,
}

impl SocketCancel {
    /// Mark the source closed and shut the socket down, waking any thread
    /// blocked in a read.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
