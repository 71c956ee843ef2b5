//! The byte stream handed to a consumer by `Session::request_resource`.
//!
//! A stream is either fully buffered (cache hit, or a network body read to the
//! end before the consumer arrived) or live: the bytes read so far followed by
//! the rest of the connection. A live stream reports, once, whether the body
//! was read to completion together with every byte it produced.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use quickpage_core::Error;

use crate::connection::SessionConnection;

/// Called once when a live stream is closed: `(read_complete, all_bytes)`.
pub type CloseHook = Box<dyn FnOnce(bool, Vec<u8>) + Send>;

pub struct SessionStream {
    buffered: Option<Bytes>,
    source: Option<Arc<dyn SessionConnection>>,
    captured: Vec<u8>,
    finished: bool,
    from_cache: bool,
    on_close: Option<CloseHook>,
}

impl fmt::Debug for SessionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStream")
            .field("buffered", &self.buffered.as_ref().map(Bytes::len))
            .field("live", &self.source.is_some())
            .field("finished", &self.finished)
            .field("from_cache", &self.from_cache)
            .finish()
    }
}

impl SessionStream {
    /// Stream over a validated cache entry.
    pub fn from_cache(bytes: impl Into<Bytes>) -> Self {
        let mut stream = Self::complete(bytes);
        stream.from_cache = true;
        stream
    }

    /// Stream over a network body that was already read to the end.
    pub fn complete(bytes: impl Into<Bytes>) -> Self {
        Self {
            buffered: Some(bytes.into()),
            source: None,
            captured: Vec::new(),
            finished: false,
            from_cache: false,
            on_close: None,
        }
    }

    /// Stream over `prefix` followed by whatever `source` still has to give.
    pub fn live(prefix: Vec<u8>, source: Arc<dyn SessionConnection>, on_close: CloseHook) -> Self {
        Self {
            captured: prefix.clone(),
            buffered: Some(Bytes::from(prefix)),
            source: Some(source),
            finished: false,
            from_cache: false,
            on_close: Some(on_close),
        }
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn is_live(&self) -> bool {
        self.source.is_some()
    }

    /// Next chunk, or `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        if let Some(buffered) = self.buffered.take()
            && !buffered.is_empty()
        {
            return Ok(Some(buffered));
        }
        let Some(source) = self.source.clone() else {
            self.finished = true;
            return Ok(None);
        };

        match source.read_chunk().await {
            Ok(Some(chunk)) => {
                self.captured.extend_from_slice(&chunk);
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.finished = true;
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Drain the stream into one buffer.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    fn close(&mut self) {
        if let Some(source) = self.source.take() {
            source.disconnect();
        }
        if let Some(hook) = self.on_close.take() {
            hook(self.finished, std::mem::take(&mut self.captured));
        }
    }
}

impl Drop for SessionStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    use crate::connection::{ConnectRequest, ResponseHead};

    struct Chunks(Mutex<VecDeque<&'static str>>);

    #[async_trait]
    impl SessionConnection for Chunks {
        async fn connect(&self, _request: &ConnectRequest) -> Result<ResponseHead, Error> {
            Ok(ResponseHead::new(200))
        }
        async fn read_chunk(&self) -> Result<Option<Bytes>, Error> {
            Ok(self.0.lock().pop_front().map(|s| Bytes::from_static(s.as_bytes())))
        }
        fn disconnect(&self) {
            self.0.lock().clear();
        }
    }

    fn source(chunks: &[&'static str]) -> Arc<dyn SessionConnection> {
        Arc::new(Chunks(Mutex::new(chunks.iter().copied().collect())))
    }

    #[tokio::test]
    async fn test_cache_stream() {
        let stream = SessionStream::from_cache(b"cached".to_vec());
        assert!(stream.is_from_cache());
        assert!(!stream.is_live());
        assert_eq!(stream.read_to_end().await.unwrap(), b"cached");
    }

    #[tokio::test]
    async fn test_live_stream_reports_complete_body() {
        let seen = Arc::new(Mutex::new(None));
        let hook_seen = seen.clone();
        let stream = SessionStream::live(
            b"<html>".to_vec(),
            source(&["<body>", "</body></html>"]),
            Box::new(move |complete, bytes| *hook_seen.lock() = Some((complete, bytes))),
        );

        let body = stream.read_to_end().await.unwrap();
        assert_eq!(body, b"<html><body></body></html>");
        let (complete, captured) = seen.lock().take().unwrap();
        assert!(complete);
        assert_eq!(captured, body);
    }

    #[tokio::test]
    async fn test_live_stream_dropped_early_is_incomplete() {
        let seen = Arc::new(Mutex::new(None));
        let hook_seen = seen.clone();
        let mut stream = SessionStream::live(
            b"<html>".to_vec(),
            source(&["<body>"]),
            Box::new(move |complete, bytes| *hook_seen.lock() = Some((complete, bytes))),
        );

        assert_eq!(stream.next_chunk().await.unwrap().unwrap(), Bytes::from_static(b"<html>"));
        drop(stream);
        let (complete, captured) = seen.lock().take().unwrap();
        assert!(!complete);
        assert_eq!(captured, b"<html>");
    }
}
