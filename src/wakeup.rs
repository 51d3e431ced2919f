//! a single-reader, many-writer signalling primitive that unblocks the
//! worker's blocking wait on the multi handle.
//!
//! implemented as a loopback TCP pair rather than a unix pipe so the same
//! code works on every target the `curl` crate supports; `curl_multi_wait`
//! accepts an arbitrary extra socket to poll alongside the transfers'
//! sockets, and a connected TCP pair is as good a socket as any for that.

use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
};

/// the write half, cloned into every caller thread that needs to wake the worker.
#[derive(Clone)]
pub(crate) struct WakeupWriter {
    stream: std::sync::Arc<TcpStream>,
}

/// the read half, owned exclusively by the worker for the duration of its run.
pub(crate) struct WakeupReader {
    stream: TcpStream,
}

/// create a connected pair and put both ends into nonblocking mode so that
/// neither a writer posting a byte nor the worker draining them ever blocks.
pub(crate) fn pair() -> io::Result<(WakeupWriter, WakeupReader)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let writer = TcpStream::connect(addr)?;
    let (reader, _) = listener.accept()?;

    writer.set_nodelay(true)?;
    reader.set_nodelay(true)?;
    writer.set_nonblocking(true)?;
    reader.set_nonblocking(true)?;

    Ok((
        WakeupWriter {
            stream: std::sync::Arc::new(writer),
        },
        WakeupReader { stream: reader },
    ))
}

impl WakeupWriter {
    /// post a single byte. coalesces naturally: if the socket buffer is
    /// already full of pending wakeup bytes, `WouldBlock` just means the
    /// worker has not drained the previous ones yet, which is fine.
    pub(crate) fn wake(&self) {
        match (&*self.stream).write(&[0u8]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => tracing::debug!("failed to write to wakeup channel: {e}"),
        }
    }
}

impl WakeupReader {
    pub(crate) fn socket(&self) -> curl_sys::curl_socket_t {
        raw_socket(&self.stream)
    }

    /// drain every byte currently buffered. a buffer large enough for a
    /// normal burst is consumed in one read; any leftover bytes merely cause
    /// the next wait to return immediately, which is harmless.
    pub(crate) fn drain(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) if n < buf.len() => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::debug!("failed to drain wakeup channel: {e}");
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
fn raw_socket(stream: &TcpStream) -> curl_sys::curl_socket_t {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(windows)]
fn raw_socket(stream: &TcpStream) -> curl_sys::curl_socket_t {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket() as curl_sys::curl_socket_t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakeup_round_trip() {
        let (writer, mut reader) = pair().unwrap();
        writer.wake();
        writer.wake();
        // give the loopback connection a moment; nonblocking reads retry below.
        std::thread::sleep(std::time::Duration::from_millis(10));
        reader.drain();
    }
}
