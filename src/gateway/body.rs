// src/gateway/body.rs
use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use hyper::Body;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::StreamReader;

/// Reads chunks into a buffer that starts at `initial` bytes and doubles
/// each time a read fills it, up to `max`.
pub struct GrowableReader<R> {
    reader: R,
    capacity: usize,
    max: usize,
}

impl<R> GrowableReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, initial: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            reader,
            capacity: initial.clamp(1, max),
            max,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::zeroed(self.capacity);
        let read = self.reader.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        buf.truncate(read);
        if read == self.capacity && self.capacity < self.max {
            self.capacity = self.capacity.saturating_mul(2).min(self.max);
        }
        Ok(Some(buf.freeze()))
    }

    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_chunk().await?.map(|chunk| (chunk, reader)))
        })
    }
}

/// Re-chunks an upstream body through a [`GrowableReader`].
pub fn stream_body(body: Body, initial: usize, max: usize) -> Body {
    let reader = StreamReader::new(body.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
    Body::wrap_stream(GrowableReader::new(reader, initial, max).into_stream())
}
