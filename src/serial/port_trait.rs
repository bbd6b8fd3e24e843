//! Trait abstraction for serial port reads to enable testing

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bounded-timeout byte source
#[async_trait]
pub trait SerialReader: Send {
    /// Read whatever arrives within `timeout` into `buf`
    ///
    /// Returns `Ok(0)` when nothing arrived in time. A closed stream is an
    /// [`io::ErrorKind::UnexpectedEof`] error.
    async fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
}

/// [`SerialReader`] over any async byte stream
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> SerialReader for StreamReader<R> {
    async fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match tokio::time::timeout(timeout, self.inner.read(buf)).await {
            Ok(Ok(0)) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial stream closed")),
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// One scripted read result
    #[derive(Debug, Clone)]
    pub enum Chunk {
        Data(Vec<u8>),
        Silence,
        Error(io::ErrorKind),
    }

    /// Mock serial reader for testing
    ///
    /// Replays scripted chunks; once the script is exhausted every read
    /// times out.
    #[derive(Clone, Default)]
    pub struct MockSerialReader {
        pub chunks: Arc<Mutex<VecDeque<Chunk>>>,
        pub reads: Arc<Mutex<usize>>,
    }

    impl MockSerialReader {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_data(&self, data: &[u8]) {
            self.chunks.lock().unwrap().push_back(Chunk::Data(data.to_vec()));
        }

        pub fn push(&self, chunk: Chunk) {
            self.chunks.lock().unwrap().push_back(chunk);
        }

        pub fn read_count(&self) -> usize {
            *self.reads.lock().unwrap()
        }
    }

    #[async_trait]
    impl SerialReader for MockSerialReader {
        async fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            *self.reads.lock().unwrap() += 1;
            let next = self.chunks.lock().unwrap().pop_front();
            match next {
                Some(Chunk::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        let rest = data.split_off(n);
                        self.chunks.lock().unwrap().push_front(Chunk::Data(rest));
                    }
                    Ok(n)
                }
                Some(Chunk::Error(kind)) => Err(io::Error::new(kind, "Mock read error")),
                Some(Chunk::Silence) | None => {
                    tokio::time::sleep(timeout).await;
                    Ok(0)
                }
            }
        }
    }
}
