//! Chunked uploads through resumable upload sessions.
//!
//! Small files go up in a single authenticated PUT. Larger files are sent
//! through an upload session in fixed-size chunks, strictly in byte order,
//! each acknowledged before the next is read.

use bytes::Bytes;
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::json;
use std::fs::Metadata;
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use graphdrive_common::{ConflictBehavior, Error, Result, TransferResult, TransferStatus, TransferTarget};

use super::client::GraphClient;
use super::transfer::TransferOptions;
use super::types::{encode_segment, DriveItem, FileSystemInfo, UploadSessionResponse};
use crate::http::{HttpMethod, HttpRequest};
use crate::progress::{TransferDirection, TransferProgress};
use crate::retry::{retry_part, TransferPart};

/// Files up to this size are uploaded with one PUT.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 4 * 1024 * 1024;
/// Chunk sizes must be a multiple of this.
pub const CHUNK_ALIGNMENT: u64 = 320 * 1024;
/// Largest chunk accepted by upload sessions (60 MiB).
pub const MAX_CHUNK_SIZE: u64 = 192 * CHUNK_ALIGNMENT;
pub const DEFAULT_CHUNK_SIZE: u64 = MAX_CHUNK_SIZE;

/// Round a requested chunk size down to the alignment, within
/// `[CHUNK_ALIGNMENT, MAX_CHUNK_SIZE]`.
pub fn align_chunk_size(requested: u64) -> u64 {
    (requested / CHUNK_ALIGNMENT * CHUNK_ALIGNMENT).clamp(CHUNK_ALIGNMENT, MAX_CHUNK_SIZE)
}

/// Split `[0, total)` into consecutive half-open chunks of `chunk_size`.
/// The last chunk holds the remainder.
pub fn chunk_ranges(total: u64, chunk_size: u64) -> Vec<Range<u64>> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::with_capacity(total.div_ceil(chunk_size) as usize);
    let mut start = 0;
    while start < total {
        let end = (start + chunk_size).min(total);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Destination of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// File name in the drive.
    pub name: String,
    /// Parent folder item id; `None` for the drive root.
    pub parent_id: Option<String>,
}

impl UploadTarget {
    /// # Errors
    /// - Empty name
    pub fn new(name: impl Into<String>, parent_id: Option<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(Error::InvalidInput(format!(
                "Invalid upload file name '{}'",
                name
            )));
        }
        Ok(Self { name, parent_id })
    }

    /// Target named after the local file, optionally overridden.
    pub fn for_file(
        source: &Path,
        name: Option<&str>,
        parent_id: Option<String>,
    ) -> Result<Self> {
        let name = match name {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    Error::InvalidInput(format!("'{}' has no file name", source.display()))
                })?
                .to_string(),
        };
        Self::new(name, parent_id)
    }

    fn item_path(&self, action: &str) -> String {
        let name = encode_segment(&self.name);
        match &self.parent_id {
            Some(parent) => format!("me/drive/items/{}:/{}:/{}", encode_segment(parent), name, action),
            None => format!("me/drive/root:/{}:/{}", name, action),
        }
    }
}

/// Server-side state of one resumable upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Pre-authenticated URL accepting chunk PUTs.
    pub upload_url: String,
    pub file_size: u64,
    pub chunk_size: u64,
    /// Bytes acknowledged by the server so far.
    pub bytes_sent: u64,
    pub expires_at: Option<DateTime<Utc>>,
}

enum ChunkOutcome {
    /// 202: the session expects more data.
    Accepted,
    /// 200/201: the file is assembled.
    Completed(DriveItem),
}

/// Uploads local files to the drive.
pub struct UploadEngine {
    client: GraphClient,
}

impl UploadEngine {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Upload `source` to `target`.
    ///
    /// # Preconditions
    /// - `source` is a regular file
    ///
    /// # Postconditions
    /// - The result carries the id of the created item
    ///
    /// # Errors
    /// - `Upload` with the acknowledged byte offset when a chunk is rejected
    ///   or exhausts its retries
    /// - `Cancelled` if the cancellation token fires; the session is deleted
    #[instrument(skip_all, fields(name = %target.name, conflict = %options.conflict))]
    pub async fn upload(
        &self,
        source: &Path,
        target: &UploadTarget,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        let metadata = tokio::fs::metadata(source).await?;
        if !metadata.is_file() {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a file",
                source.display()
            )));
        }
        if options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let total = metadata.len();
        if total <= SIMPLE_UPLOAD_LIMIT {
            return self.upload_small(source, target, total, options).await;
        }

        let mut session = self
            .create_session(target, options.conflict, &metadata, options)
            .await?;

        let result = options
            .run_cancellable(self.send_chunks(source, &mut session, target, options))
            .await;

        match result {
            Ok(item) => {
                info!(item_id = %item.id, bytes = total, "Upload complete");
                Ok(TransferResult {
                    target: TransferTarget::Item(item.id),
                    bytes_transferred: total,
                    status: TransferStatus::Completed,
                })
            }
            Err(err) => {
                self.cancel_session(&session).await;
                Err(err)
            }
        }
    }

    async fn upload_small(
        &self,
        source: &Path,
        target: &UploadTarget,
        total: u64,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        let data = Bytes::from(tokio::fs::read(source).await?);
        let url = self.client.url(&format!(
            "{}?@microsoft.graph.conflictBehavior={}",
            target.item_path("content"),
            options.conflict.as_str()
        ));
        debug!(bytes = total, "Uploading in a single request");

        let part = TransferPart::Chunk {
            index: 0,
            offset: 0,
        };
        let item: DriveItem = options
            .run_cancellable(retry_part(&options.retry, part, || {
                let request = HttpRequest::put(url.as_str())
                    .header("content-type", "application/octet-stream")
                    .body(data.clone());
                let client = &self.client;
                async move { client.execute(request).await?.json::<DriveItem>().await }
            }))
            .await?;

        options.notify(&TransferProgress {
            direction: TransferDirection::Upload,
            name: target.name.clone(),
            parts_done: 1,
            parts_total: 1,
            bytes_done: total,
            total_bytes: total,
        });
        info!(item_id = %item.id, bytes = total, "Upload complete");

        Ok(TransferResult {
            target: TransferTarget::Item(item.id),
            bytes_transferred: total,
            status: if total == 0 {
                TransferStatus::Empty
            } else {
                TransferStatus::Completed
            },
        })
    }

    /// Open a resumable upload session for the target.
    pub async fn create_session(
        &self,
        target: &UploadTarget,
        conflict: ConflictBehavior,
        metadata: &Metadata,
        options: &TransferOptions,
    ) -> Result<UploadSession> {
        let body = json!({
            "item": {
                "@microsoft.graph.conflictBehavior": conflict.as_str(),
                "name": target.name,
                "fileSystemInfo": file_system_info(metadata),
            }
        });

        let response: UploadSessionResponse = self
            .client
            .send_json(HttpMethod::Post, &target.item_path("createUploadSession"), &body)
            .await?;

        let chunk_size = align_chunk_size(options.chunk_size);
        let session = UploadSession {
            upload_url: response.upload_url,
            file_size: metadata.len(),
            chunk_size,
            bytes_sent: 0,
            expires_at: response.expiration_date_time,
        };
        info!(
            file_size = session.file_size,
            chunk_size,
            chunks = session.file_size.div_ceil(chunk_size),
            "Upload session created"
        );

        Ok(session)
    }

    async fn send_chunks(
        &self,
        source: &Path,
        session: &mut UploadSession,
        target: &UploadTarget,
        options: &TransferOptions,
    ) -> Result<DriveItem> {
        let mut file = File::open(source).await?;
        let ranges = chunk_ranges(session.file_size, session.chunk_size);
        let parts_total = ranges.len();
        let upload_url = session.upload_url.clone();
        let total = session.file_size;

        for (index, range) in ranges.into_iter().enumerate() {
            if options.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if session.expires_at.is_some_and(|at| at <= Utc::now()) {
                return Err(Error::Upload {
                    offset: range.start,
                    message: "Upload session expired".to_string(),
                });
            }

            let part = TransferPart::Chunk {
                index,
                offset: range.start,
            };
            let mut buffer = vec![0u8; (range.end - range.start) as usize];
            file.read_exact(&mut buffer)
                .await
                .map_err(|e| part.wrap(e.into()))?;
            let chunk = Bytes::from(buffer);

            debug!(
                chunk = index + 1,
                of = parts_total,
                start = range.start,
                end = range.end,
                "Uploading chunk"
            );
            let outcome = retry_part(&options.retry, part, || {
                self.put_chunk(&upload_url, chunk.clone(), &range, total)
            })
            .await?;

            session.bytes_sent = range.end;
            options.notify(&TransferProgress {
                direction: TransferDirection::Upload,
                name: target.name.clone(),
                parts_done: index + 1,
                parts_total,
                bytes_done: session.bytes_sent,
                total_bytes: total,
            });

            let is_last = range.end == total;
            match outcome {
                ChunkOutcome::Completed(item) if is_last => return Ok(item),
                ChunkOutcome::Accepted if !is_last => {}
                ChunkOutcome::Completed(_) => {
                    return Err(Error::Upload {
                        offset: session.bytes_sent,
                        message: "Upload session completed before all chunks were sent"
                            .to_string(),
                    });
                }
                ChunkOutcome::Accepted => {
                    return Err(Error::Upload {
                        offset: session.bytes_sent,
                        message: "Final chunk accepted but no item was returned".to_string(),
                    });
                }
            }
        }

        Err(Error::Upload {
            offset: session.bytes_sent,
            message: "No chunks to upload".to_string(),
        })
    }

    async fn put_chunk(
        &self,
        upload_url: &str,
        chunk: Bytes,
        range: &Range<u64>,
        total: u64,
    ) -> Result<ChunkOutcome> {
        let request = HttpRequest::put(upload_url)
            .header(
                "content-range",
                format!("bytes {}-{}/{}", range.start, range.end - 1, total),
            )
            .body(chunk);

        let response = self.client.execute_anonymous(request).await?;
        match response.status {
            202 => Ok(ChunkOutcome::Accepted),
            200 | 201 => Ok(ChunkOutcome::Completed(response.json().await?)),
            status => Err(Error::Request {
                status,
                message: "Unexpected response to chunk upload".to_string(),
            }),
        }
    }

    /// Delete an abandoned upload session. Failures are only logged.
    async fn cancel_session(&self, session: &UploadSession) {
        debug!(bytes_sent = session.bytes_sent, "Deleting upload session");
        if let Err(e) = self
            .client
            .execute_anonymous(HttpRequest::delete(session.upload_url.as_str()))
            .await
        {
            warn!("Failed to delete upload session: {}", e);
        }
    }
}

/// Local timestamps sent with the upload session. Creation time falls back
/// to the modification time where the platform does not record it.
fn file_system_info(metadata: &Metadata) -> FileSystemInfo {
    let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
    let created = metadata
        .created()
        .ok()
        .map(DateTime::<Utc>::from)
        .or(modified);

    FileSystemInfo {
        created_date_time: created.map(|t| t.trunc_subsecs(0)),
        last_modified_date_time: modified.map(|t| t.trunc_subsecs(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::onedrive::client::testing::{authorized_client, MockTransport};
    use crate::retry::RetryConfig;
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio_util::sync::CancellationToken;

    const UPLOAD_URL: &str = "https://upload.test/session/1";
    const MIB: u64 = 1024 * 1024;

    fn temp_file(len: u64) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn sparse_file(len: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        file
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    /// Parse `bytes s-e/t` into (s, e, t).
    fn content_range(request: &HttpRequest) -> (u64, u64, u64) {
        let value = request.header_value("content-range").unwrap();
        let (range, total) = value.trim_start_matches("bytes ").split_once('/').unwrap();
        let (start, end) = range.split_once('-').unwrap();
        (start.parse().unwrap(), end.parse().unwrap(), total.parse().unwrap())
    }

    /// Upload session endpoint: 202 until the last byte, then 201 with the item.
    fn session_handler(request: &HttpRequest) -> Result<HttpResponse> {
        match request.method {
            HttpMethod::Post => Ok(HttpResponse::from_json(
                200,
                &json!({"uploadUrl": UPLOAD_URL, "expirationDateTime": "2030-01-01T00:00:00Z"}),
            )),
            HttpMethod::Put => {
                let (_, end, total) = content_range(request);
                if end + 1 == total {
                    Ok(HttpResponse::from_json(201, &json!({"id": "01NEWITEM", "name": "big.bin"})))
                } else {
                    Ok(HttpResponse::from_json(202, &json!({"nextExpectedRanges": [format!("{}-", end + 1)]})))
                }
            }
            HttpMethod::Delete => Ok(HttpResponse::from_bytes(204, "")),
            _ => Ok(HttpResponse::from_bytes(400, "unexpected")),
        }
    }

    fn chunk_puts(transport: &MockTransport) -> Vec<HttpRequest> {
        transport
            .requests()
            .into_iter()
            .filter(|r| r.method == HttpMethod::Put)
            .collect()
    }

    #[test]
    fn test_align_chunk_size() {
        assert_eq!(align_chunk_size(60 * MIB), 60 * MIB);
        assert_eq!(align_chunk_size(100 * MIB), 60 * MIB);
        assert_eq!(align_chunk_size(MIB), 3 * CHUNK_ALIGNMENT);
        assert_eq!(align_chunk_size(1), CHUNK_ALIGNMENT);
        assert_eq!(DEFAULT_CHUNK_SIZE, 62914560);
    }

    #[test]
    fn test_chunk_ranges_150_mib() {
        let ranges = chunk_ranges(150 * MIB, DEFAULT_CHUNK_SIZE);
        assert_eq!(
            ranges,
            vec![0..62914560, 62914560..125829120, 125829120..157286400]
        );
    }

    #[test]
    fn test_chunk_ranges_exact_multiple() {
        let ranges = chunk_ranges(2 * CHUNK_ALIGNMENT, CHUNK_ALIGNMENT);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1], CHUNK_ALIGNMENT..2 * CHUNK_ALIGNMENT);
        assert!(chunk_ranges(0, CHUNK_ALIGNMENT).is_empty());
    }

    proptest! {
        #[test]
        fn prop_chunk_ranges_cover_file_once(total in 1u64..(1u64 << 34), multiple in 1u64..=192) {
            let chunk = multiple * CHUNK_ALIGNMENT;
            let ranges = chunk_ranges(total, chunk);

            prop_assert_eq!(ranges.first().unwrap().start, 0);
            prop_assert_eq!(ranges.last().unwrap().end, total);
            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            for range in &ranges[..ranges.len() - 1] {
                prop_assert_eq!(range.end - range.start, chunk);
            }
            let last = ranges.last().unwrap();
            let expected_last = if total % chunk == 0 { chunk } else { total % chunk };
            prop_assert_eq!(last.end - last.start, expected_last);
        }
    }

    #[test]
    fn test_upload_target_paths() {
        let root = UploadTarget::new("Q1 report.pdf", None).unwrap();
        assert_eq!(
            root.item_path("createUploadSession"),
            "me/drive/root:/Q1%20report.pdf:/createUploadSession"
        );

        let nested = UploadTarget::new("a.txt", Some("01PARENT".to_string())).unwrap();
        assert_eq!(nested.item_path("content"), "me/drive/items/01PARENT:/a.txt:/content");

        assert!(UploadTarget::new("", None).is_err());
        assert!(UploadTarget::new("a/b", None).is_err());
    }

    #[test]
    fn test_upload_target_for_file() {
        let target = UploadTarget::for_file(Path::new("/tmp/notes.md"), None, None).unwrap();
        assert_eq!(target.name, "notes.md");

        let renamed =
            UploadTarget::for_file(Path::new("/tmp/notes.md"), Some("todo.md"), None).unwrap();
        assert_eq!(renamed.name, "todo.md");
    }

    #[tokio::test]
    async fn test_small_file_single_put() {
        let file = temp_file(1024);
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::from_json(201, &json!({"id": "01SMALL", "name": "a.txt"})))
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("a.txt", None).unwrap();

        let result = engine
            .upload(file.path(), &target, &TransferOptions::new())
            .await
            .unwrap();

        assert_eq!(result.item_id(), Some("01SMALL"));
        assert_eq!(result.bytes_transferred, 1024);
        assert_eq!(result.status, TransferStatus::Completed);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, HttpMethod::Put);
        assert_eq!(
            requests[0].url,
            "https://graph.test/v1.0/me/drive/root:/a.txt:/content?@microsoft.graph.conflictBehavior=rename"
        );
        assert_eq!(requests[0].header_value("authorization"), Some("Bearer AT0"));
        assert_eq!(requests[0].body.as_ref().unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_empty_file_reports_empty_status() {
        let file = temp_file(0);
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::from_json(201, &json!({"id": "01EMPTY"})))
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("empty.txt", None).unwrap();

        let result = engine
            .upload(file.path(), &target, &TransferOptions::new())
            .await
            .unwrap();

        assert_eq!(result.status, TransferStatus::Empty);
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_150_mib_upload_sends_three_sequential_chunks() {
        let file = sparse_file(150 * MIB);
        let transport = MockTransport::new(session_handler);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", Some("01PARENT".to_string())).unwrap();

        let result = engine
            .upload(file.path(), &target, &TransferOptions::new())
            .await
            .unwrap();

        assert_eq!(result.item_id(), Some("01NEWITEM"));
        assert_eq!(result.bytes_transferred, 157286400);

        let puts = chunk_puts(&transport);
        let ranges: Vec<_> = puts.iter().map(content_range).collect();
        assert_eq!(
            ranges,
            vec![
                (0, 62914559, 157286400),
                (62914560, 125829119, 157286400),
                (125829120, 157286399, 157286400),
            ]
        );
        for put in &puts {
            assert_eq!(put.url, UPLOAD_URL);
            assert!(put.header_value("authorization").is_none());
        }
        assert_eq!(puts[2].body.as_ref().unwrap().len(), 31457280);
    }

    #[tokio::test]
    async fn test_session_request_body() {
        let file = temp_file(SIMPLE_UPLOAD_LIMIT + 1);
        let transport = MockTransport::new(session_handler);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();
        let options = TransferOptions::new().with_conflict_behavior(ConflictBehavior::Replace);

        engine.upload(file.path(), &target, &options).await.unwrap();

        let post = &transport.requests()[0];
        assert_eq!(post.method, HttpMethod::Post);
        assert_eq!(
            post.url,
            "https://graph.test/v1.0/me/drive/root:/big.bin:/createUploadSession"
        );
        let body: serde_json::Value = serde_json::from_slice(post.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["item"]["@microsoft.graph.conflictBehavior"], "replace");
        assert_eq!(body["item"]["name"], "big.bin");
        assert!(body["item"]["fileSystemInfo"]["lastModifiedDateTime"].is_string());
        assert!(body["item"]["fileSystemInfo"]["createdDateTime"].is_string());
    }

    #[tokio::test]
    async fn test_chunks_carry_file_bytes_in_order() {
        let size = SIMPLE_UPLOAD_LIMIT + 1;
        let file = temp_file(size);
        let transport = MockTransport::new(session_handler);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();

        let progress = Arc::new(Mutex::new(Vec::new()));
        let progress_clone = progress.clone();
        let options = TransferOptions::new()
            .with_chunk_size(2 * CHUNK_ALIGNMENT)
            .with_observer(move |p: &TransferProgress| {
                progress_clone.lock().unwrap().push((p.parts_done, p.bytes_done))
            });

        engine.upload(file.path(), &target, &options).await.unwrap();

        let puts = chunk_puts(&transport);
        assert_eq!(puts.len(), 7);

        let mut uploaded = Vec::new();
        for put in &puts {
            let (start, end, total) = content_range(put);
            assert_eq!(start, uploaded.len() as u64);
            assert_eq!(total, size);
            let body = put.body.as_ref().unwrap();
            assert_eq!(body.len() as u64, end - start + 1);
            uploaded.extend_from_slice(body);
        }
        assert_eq!(uploaded, std::fs::read(file.path()).unwrap());

        let progress = progress.lock().unwrap();
        assert_eq!(progress.len(), 7);
        assert_eq!(progress[0], (1, 2 * CHUNK_ALIGNMENT));
        assert_eq!(progress[6], (7, size));
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_is_retried() {
        let failures = Arc::new(AtomicUsize::new(0));
        let failures_clone = failures.clone();
        let transport = MockTransport::new(move |request| {
            if request.method == HttpMethod::Put {
                let (start, _, _) = content_range(request);
                if start > 0 && failures_clone.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Ok(HttpResponse::from_bytes(503, "service unavailable"));
                }
            }
            session_handler(request)
        });
        let file = temp_file(SIMPLE_UPLOAD_LIMIT + 1);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();
        let options = TransferOptions::new()
            .with_chunk_size(2 * CHUNK_ALIGNMENT)
            .with_retry(fast_retry());

        let result = engine.upload(file.path(), &target, &options).await.unwrap();

        assert_eq!(result.item_id(), Some("01NEWITEM"));
        // 7 chunks + 2 retries of the second
        assert_eq!(chunk_puts(&transport).len(), 9);
        assert_eq!(transport.count(HttpMethod::Delete), 0);
    }

    #[tokio::test]
    async fn test_client_error_aborts_with_offset() {
        let transport = MockTransport::new(|request| {
            if request.method == HttpMethod::Put {
                let (start, _, _) = content_range(request);
                if start >= 2 * CHUNK_ALIGNMENT {
                    return Ok(HttpResponse::from_json(
                        416,
                        &json!({"error": {"code": "invalidRange", "message": "Fragment overlap"}}),
                    ));
                }
            }
            session_handler(request)
        });
        let file = temp_file(SIMPLE_UPLOAD_LIMIT + 1);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();
        let options = TransferOptions::new()
            .with_chunk_size(2 * CHUNK_ALIGNMENT)
            .with_retry(fast_retry());

        let result = engine.upload(file.path(), &target, &options).await;

        match result {
            Err(Error::Upload { offset, message }) => {
                assert_eq!(offset, 2 * CHUNK_ALIGNMENT);
                assert!(message.contains("Fragment overlap"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // Client errors are not retried
        assert_eq!(chunk_puts(&transport).len(), 2);
        assert_eq!(transport.count(HttpMethod::Delete), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_upload() {
        let transport = MockTransport::new(|request| {
            if request.method == HttpMethod::Put {
                return Err(Error::Transient("connection reset".to_string()));
            }
            session_handler(request)
        });
        let file = temp_file(SIMPLE_UPLOAD_LIMIT + 1);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();
        let options = TransferOptions::new().with_retry(fast_retry());

        let result = engine.upload(file.path(), &target, &options).await;

        assert!(matches!(result, Err(Error::Upload { offset: 0, .. })));
        assert_eq!(chunk_puts(&transport).len(), 3);
        assert_eq!(transport.count(HttpMethod::Delete), 1);
    }

    #[tokio::test]
    async fn test_cancellation_deletes_session() {
        let transport = MockTransport::new(session_handler);
        let file = temp_file(SIMPLE_UPLOAD_LIMIT + 1);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let options = TransferOptions::new()
            .with_chunk_size(2 * CHUNK_ALIGNMENT)
            .with_cancellation(cancel)
            .with_observer(move |_: &TransferProgress| cancel_clone.cancel());

        let result = engine.upload(file.path(), &target, &options).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(chunk_puts(&transport).len(), 1);
        assert_eq!(transport.count(HttpMethod::Delete), 1);
    }

    #[tokio::test]
    async fn test_file_shrinking_mid_upload_reports_offset() {
        let transport = MockTransport::new(session_handler);
        let file = temp_file(2 * CHUNK_ALIGNMENT);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();
        let mut session = UploadSession {
            upload_url: UPLOAD_URL.to_string(),
            file_size: 3 * CHUNK_ALIGNMENT,
            chunk_size: CHUNK_ALIGNMENT,
            bytes_sent: 0,
            expires_at: None,
        };

        let result = engine
            .send_chunks(file.path(), &mut session, &target, &TransferOptions::new())
            .await;

        match result {
            Err(Error::Upload { offset, .. }) => assert_eq!(offset, 2 * CHUNK_ALIGNMENT),
            other => panic!("expected upload error, got {:?}", other),
        }
        assert_eq!(chunk_puts(&transport).len(), 2);
    }

    #[tokio::test]
    async fn test_expired_session_is_not_used() {
        let transport = MockTransport::new(|request| {
            if request.method == HttpMethod::Post {
                return Ok(HttpResponse::from_json(
                    200,
                    &json!({"uploadUrl": UPLOAD_URL, "expirationDateTime": "2020-01-01T00:00:00Z"}),
                ));
            }
            session_handler(request)
        });
        let file = temp_file(SIMPLE_UPLOAD_LIMIT + 1);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("big.bin", None).unwrap();

        let result = engine
            .upload(file.path(), &target, &TransferOptions::new())
            .await;

        assert!(matches!(result, Err(Error::Upload { offset: 0, .. })));
        assert!(chunk_puts(&transport).is_empty());
        assert_eq!(transport.count(HttpMethod::Delete), 1);
    }

    #[tokio::test]
    async fn test_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new(session_handler);
        let (client, _) = authorized_client(transport.clone());
        let engine = UploadEngine::new(client);
        let target = UploadTarget::new("dir", None).unwrap();

        let result = engine
            .upload(dir.path(), &target, &TransferOptions::new())
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(transport.requests().is_empty());
    }
}
