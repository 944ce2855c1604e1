//! Minimal HTTP server that records inbound webhook POST bodies.
//!
//! A node under test delivers callbacks to a configured local URL; the
//! listener's accept loop runs on a background thread for the lifetime of the
//! test and appends each reconstructed body to a shared, ordered record list.
//! Message framing is recovered from the `Content-Length` header even when
//! the header and body arrive split across arbitrarily small socket reads.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::error;

use crate::error::Result;

/// Fixed local port nodes are configured to deliver callbacks to.
pub const CALLBACK_PORT: u16 = 23232;

const READ_CHUNK: usize = 256;

pub struct CallbackListener {
    local_addr: SocketAddr,
    records: Arc<Mutex<Vec<Vec<u8>>>>,
    stopping: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Binds the fixed callback port and starts the accept loop.
    pub fn start() -> Result<Self> {
        Self::bind(CALLBACK_PORT)
    }

    /// Binds an arbitrary port (0 picks a free one; used by tests).
    pub fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        let local_addr = listener.local_addr()?;
        let records = Arc::new(Mutex::new(Vec::new()));
        let stopping = Arc::new(AtomicBool::new(false));

        let thread_records = Arc::clone(&records);
        let thread_stopping = Arc::clone(&stopping);
        let accept_thread = std::thread::spawn(move || {
            loop {
                let mut socket = match listener.accept() {
                    Ok((socket, _)) => socket,
                    Err(e) => {
                        error!("callback listener accept failed: {e}");
                        break;
                    }
                };
                if thread_stopping.load(Ordering::SeqCst) {
                    break;
                }
                match read_request_body(&mut socket) {
                    Ok(body) => thread_records
                        .lock()
                        .expect("callback record lock")
                        .push(body),
                    Err(e) => {
                        error!("callback listener failed to read request: {e}");
                        continue;
                    }
                }
                let body = "ok\n";
                let _ = write!(
                    socket,
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
            }
        });

        Ok(CallbackListener {
            local_addr,
            records,
            stopping,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The URL a node should be configured to POST callbacks to.
    pub fn url(&self) -> String {
        format!("http://{}/", self.local_addr)
    }

    /// The recorded request bodies, in arrival order. The accept thread is
    /// the only writer; callers read after the node-side action completed.
    pub fn bodies(&self) -> Vec<Vec<u8>> {
        self.records.lock().expect("callback record lock").clone()
    }

    pub fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        // Unblock the accept call so the loop observes the flag.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reads one HTTP request from `reader` and returns its body, accumulating
/// 256-byte reads until the headers are fully seen and then until
/// `Content-Length` body bytes have arrived. A single read is never assumed
/// to return a complete message.
pub fn read_request_body<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    let header_end = loop {
        if let Some(end) = find_header_end(&buffer) {
            break end;
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of headers",
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let content_length = parse_content_length(&buffer[..header_end]);
    let mut body = buffer.split_off(header_end);
    while body.len() < content_length {
        let want = (content_length - body.len()).min(READ_CHUNK);
        let n = reader.read(&mut chunk[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(body)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .or_else(|| buffer.windows(2).position(|w| w == b"\n\n").map(|p| p + 2))
}

/// Case-insensitive Content-Length extraction; absent or unparseable means
/// an empty body.
fn parse_content_length(headers: &[u8]) -> usize {
    let text = String::from_utf8_lossy(headers).to_ascii_lowercase();
    text.lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A reader that hands out the prepared chunks one `read` call at a time.
    struct FragmentedReader {
        chunks: Vec<Vec<u8>>,
        next: usize,
    }

    impl FragmentedReader {
        fn new(chunks: Vec<Vec<u8>>) -> Self {
            FragmentedReader { chunks, next: 0 }
        }
    }

    impl Read for FragmentedReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.next >= self.chunks.len() {
                return Ok(0);
            }
            let chunk = &mut self.chunks[self.next];
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.next += 1;
            }
            Ok(n)
        }
    }

    fn request_for(body: &str) -> Vec<u8> {
        format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn reconstructs_body_from_single_byte_reads() {
        let body = r#"{"event":"block_produced","height":42}"#;
        let chunks = request_for(body)
            .into_iter()
            .map(|b| vec![b])
            .collect::<Vec<_>>();
        let got = read_request_body(&mut FragmentedReader::new(chunks)).unwrap();
        assert_eq!(got, body.as_bytes());
    }

    #[test]
    fn reconstructs_body_split_at_every_boundary() {
        let body = r#"{"event":"callback","payload":[1,2,3]}"#;
        let raw = request_for(body);
        for split in 1..raw.len() {
            let chunks = vec![raw[..split].to_vec(), raw[split..].to_vec()];
            let got = read_request_body(&mut FragmentedReader::new(chunks)).unwrap();
            assert_eq!(got, body.as_bytes(), "split at byte {split}");
        }
    }

    #[test]
    fn missing_content_length_means_empty_body() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\n\r\n".to_vec();
        let got = read_request_body(&mut FragmentedReader::new(vec![raw])).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut raw = request_for(r#"{"key":"value"}"#);
        raw.truncate(raw.len() - 4);
        let err = read_request_body(&mut FragmentedReader::new(vec![raw])).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn listener_records_bodies_in_arrival_order() {
        let listener = CallbackListener::bind(0).unwrap();
        for payload in [r#"{"seq":1}"#, r#"{"seq":2}"#] {
            let mut socket = TcpStream::connect(("127.0.0.1", listener.port())).unwrap();
            // Dribble the request out in small fragments.
            for fragment in request_for(payload).chunks(3) {
                socket.write_all(fragment).unwrap();
                socket.flush().unwrap();
            }
            let mut response = String::new();
            socket.read_to_string(&mut response).unwrap();
            assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        }
        let bodies = listener.bodies();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], br#"{"seq":1}"#);
        assert_eq!(bodies[1], br#"{"seq":2}"#);
    }
}
