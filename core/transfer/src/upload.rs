//! Streaming uploads to the destination.
//!
//! Objects below [`SIMPLE_UPLOAD_LIMIT`] go up in one request. Everything
//! else, including objects of unknown size, goes through an upload session in
//! fixed-size chunks.

use bytes::BytesMut;
use futures::StreamExt;
use std::sync::Arc;
use tracing::debug;

use skyferry_common::{Error, RemotePath, Result};
use skyferry_storage::{
    ByteStream, ChunkOutcome, ChunkRange, ConflictBehavior, DestinationProvider, UploadSession,
    UploadedItem,
};

/// Largest object size sent in a single request, exclusive.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;

/// Session chunks must be a multiple of this many bytes.
pub const CHUNK_UNIT: usize = 320 * 1024;

/// Default number of [`CHUNK_UNIT`]s per chunk.
pub const DEFAULT_CHUNK_UNITS: u32 = 50;

/// Progress callback; receives cumulative bytes sent.
pub type Progress<'a> = &'a (dyn Fn(u64) + Send + Sync);

/// How an object is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One request carrying the whole body.
    Simple,
    /// A resumable upload session fed chunk by chunk.
    Session,
}

impl UploadStrategy {
    /// Pick the strategy for an object of `size_hint` bytes.
    pub fn for_size(size_hint: Option<u64>) -> Self {
        match size_hint {
            Some(size) if size < SIMPLE_UPLOAD_LIMIT => UploadStrategy::Simple,
            _ => UploadStrategy::Session,
        }
    }
}

/// Uploads byte streams to the destination.
pub struct UploadEngine {
    destination: Arc<dyn DestinationProvider>,
    chunk_size: usize,
}

impl UploadEngine {
    /// Create an engine whose session chunks are `chunk_units` x 320 KiB.
    pub fn new(destination: Arc<dyn DestinationProvider>, chunk_units: u32) -> Self {
        Self {
            destination,
            chunk_size: chunk_units.max(1) as usize * CHUNK_UNIT,
        }
    }

    /// Upload `stream` as `folder/filename`, replacing any existing object.
    ///
    /// # Errors
    /// - `InvalidInput` if the stream length disagrees with `size_hint`, or
    ///   if an empty stream of unknown size would need a session
    /// - Destination errors; a failed chunk aborts the whole upload
    pub async fn upload(
        &self,
        stream: ByteStream,
        filename: &str,
        folder: &RemotePath,
        size_hint: Option<u64>,
        progress: Option<Progress<'_>>,
    ) -> Result<UploadedItem> {
        match UploadStrategy::for_size(size_hint) {
            UploadStrategy::Simple => {
                debug!("Simple upload of {}/{}", folder, filename);
                let item = self
                    .destination
                    .upload_simple(folder, filename, stream, size_hint)
                    .await?;
                if let (Some(report), Some(size)) = (progress, size_hint) {
                    report(size);
                }
                Ok(item)
            }
            UploadStrategy::Session => {
                self.upload_in_session(stream, filename, folder, size_hint, progress)
                    .await
            }
        }
    }

    async fn upload_in_session(
        &self,
        mut stream: ByteStream,
        filename: &str,
        folder: &RemotePath,
        size_hint: Option<u64>,
        progress: Option<Progress<'_>>,
    ) -> Result<UploadedItem> {
        let mut session: Option<UploadSession> = None;
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut offset: u64 = 0;
        let mut exhausted = false;

        loop {
            // Buffer past one chunk so the final chunk is known before it is sent
            while buffer.len() <= self.chunk_size && !exhausted {
                match stream.next().await {
                    Some(piece) => buffer.extend_from_slice(&piece?),
                    None => exhausted = true,
                }
            }

            if buffer.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "Cannot open an upload session for empty stream {}",
                    filename
                )));
            }

            let last = exhausted && buffer.len() <= self.chunk_size;
            let take = if last { buffer.len() } else { self.chunk_size };
            let sent = offset + take as u64;

            if let Some(expected) = size_hint {
                if sent > expected {
                    return Err(Error::InvalidInput(format!(
                        "Stream for {} is longer than the expected {} bytes",
                        filename, expected
                    )));
                }
                if last && sent != expected {
                    return Err(Error::InvalidInput(format!(
                        "Stream for {} has {} bytes, expected {}",
                        filename, sent, expected
                    )));
                }
            }

            let range = ChunkRange {
                start: offset,
                end: sent - 1,
                total: if last { Some(sent) } else { size_hint },
            };

            if session.is_none() {
                debug!("Opening upload session for {}/{}", folder, filename);
                session = Some(
                    self.destination
                        .create_upload_session(folder, filename, ConflictBehavior::Replace)
                        .await?,
                );
            }
            let open = session
                .as_ref()
                .ok_or_else(|| Error::Storage("Upload session missing".to_string()))?;

            let data = buffer.split_to(take).freeze();
            let outcome = self.destination.upload_chunk(open, range, data).await?;
            offset = sent;
            if let Some(report) = progress {
                report(offset);
            }

            match outcome {
                ChunkOutcome::Complete(item) => {
                    if !last {
                        return Err(Error::Network(format!(
                            "Destination closed the session for {} at byte {}",
                            filename, offset
                        )));
                    }
                    debug!("Session upload of {} complete ({} bytes)", filename, offset);
                    return Ok(item);
                }
                ChunkOutcome::Continue if last => {
                    return Err(Error::Network(format!(
                        "Destination did not complete the upload of {}",
                        filename
                    )));
                }
                ChunkOutcome::Continue => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;
    use skyferry_storage::MemoryDestination;
    use std::sync::Mutex;

    fn body(data: &[u8], piece: usize) -> ByteStream {
        let pieces: Vec<Result<Bytes>> = data
            .chunks(piece.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(stream::iter(pieces))
    }

    fn base() -> RemotePath {
        RemotePath::parse("Base/A").unwrap()
    }

    #[test]
    fn test_threshold_routing() {
        assert_eq!(
            UploadStrategy::for_size(Some(SIMPLE_UPLOAD_LIMIT - 1)),
            UploadStrategy::Simple
        );
        assert_eq!(
            UploadStrategy::for_size(Some(SIMPLE_UPLOAD_LIMIT)),
            UploadStrategy::Session
        );
        assert_eq!(UploadStrategy::for_size(Some(0)), UploadStrategy::Simple);
        assert_eq!(UploadStrategy::for_size(None), UploadStrategy::Session);
    }

    #[tokio::test]
    async fn test_just_below_limit_uses_one_request() {
        let dest = Arc::new(MemoryDestination::new());
        let engine = UploadEngine::new(dest.clone(), DEFAULT_CHUNK_UNITS);
        let data = vec![1u8; (SIMPLE_UPLOAD_LIMIT - 1) as usize];

        engine
            .upload(body(&data, 100_000), "a.bin", &base(), Some(data.len() as u64), None)
            .await
            .unwrap();

        assert_eq!(dest.simple_uploads(), 1);
        assert_eq!(dest.sessions_opened(), 0);
        assert_eq!(dest.file("Base/A/a.bin").await.unwrap().len(), data.len());
    }

    #[tokio::test]
    async fn test_at_limit_uses_session_with_known_total() {
        let dest = Arc::new(MemoryDestination::new());
        let engine = UploadEngine::new(dest.clone(), 4);
        let data: Vec<u8> = (0..SIMPLE_UPLOAD_LIMIT).map(|i| (i % 251) as u8).collect();
        let total = data.len() as u64;

        let seen = Mutex::new(Vec::new());
        let progress = |sent: u64| seen.lock().unwrap().push(sent);

        let item = engine
            .upload(body(&data, 70_000), "b.bin", &base(), Some(total), Some(&progress))
            .await
            .unwrap();

        assert_eq!(item.size, Some(total));
        assert_eq!(dest.simple_uploads(), 0);
        assert_eq!(dest.sessions_opened(), 1);
        assert_eq!(&dest.file("Base/A/b.bin").await.unwrap()[..], &data[..]);

        let chunk = (4 * CHUNK_UNIT) as u64;
        let ranges = dest.chunk_ranges().await;
        assert_eq!(ranges.len(), 4);
        assert!(ranges.iter().all(|r| r.total == Some(total)));
        assert_eq!(ranges[0].header_value(), format!("bytes 0-{}/{}", chunk - 1, total));

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.last(), Some(&total));
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_unknown_size_declares_total_on_last_chunk() {
        let dest = Arc::new(MemoryDestination::new());
        let engine = UploadEngine::new(dest.clone(), 1);
        let data = vec![9u8; CHUNK_UNIT * 2 + 10];

        engine
            .upload(body(&data, 50_000), "c.bin", &base(), None, None)
            .await
            .unwrap();

        let ranges = dest.chunk_ranges().await;
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].total, None);
        assert_eq!(ranges[1].total, None);
        assert_eq!(ranges[2].total, Some(data.len() as u64));
        assert_eq!(ranges[2].end, data.len() as u64 - 1);
        assert!(ranges[0].header_value().ends_with("/*"));
    }

    #[tokio::test]
    async fn test_exact_multiple_of_chunk_size() {
        let dest = Arc::new(MemoryDestination::new());
        let engine = UploadEngine::new(dest.clone(), 1);
        let data = vec![3u8; CHUNK_UNIT * 2];

        engine
            .upload(body(&data, CHUNK_UNIT), "d.bin", &base(), None, None)
            .await
            .unwrap();

        let ranges = dest.chunk_ranges().await;
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].total, Some(data.len() as u64));
    }

    #[tokio::test]
    async fn test_short_stream_is_rejected() {
        let dest = Arc::new(MemoryDestination::new());
        let engine = UploadEngine::new(dest.clone(), 1);
        let data = vec![0u8; CHUNK_UNIT * 13 + 5];
        let claimed = data.len() as u64 + 100;

        let result = engine
            .upload(body(&data, 65_536), "e.bin", &base(), Some(claimed), None)
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(dest.file("Base/A/e.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_long_stream_is_rejected() {
        let dest = Arc::new(MemoryDestination::new());
        let engine = UploadEngine::new(dest.clone(), 1);
        let data = vec![0u8; SIMPLE_UPLOAD_LIMIT as usize + CHUNK_UNIT];

        let result = engine
            .upload(body(&data, 65_536), "f.bin", &base(), Some(SIMPLE_UPLOAD_LIMIT), None)
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(dest.file("Base/A/f.bin").await.is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_of_unknown_size() {
        let dest = Arc::new(MemoryDestination::new());
        let engine = UploadEngine::new(dest.clone(), 1);

        let result = engine.upload(body(&[], 1), "g.bin", &base(), None, None).await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(dest.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_chunk_failure_aborts_upload() {
        let dest = Arc::new(MemoryDestination::new().fail_uploads_of("h.bin"));
        let engine = UploadEngine::new(dest.clone(), 1);
        let data = vec![0u8; SIMPLE_UPLOAD_LIMIT as usize];

        let result = engine
            .upload(body(&data, 65_536), "h.bin", &base(), Some(data.len() as u64), None)
            .await;

        assert!(matches!(result, Err(Error::Network(_))));
        assert!(dest.chunk_ranges().await.is_empty());
    }
}
