//! Segmented downloads with a bounded number of concurrent range requests.
//!
//! The destination file is created at its final size up front. Each segment
//! owns a disjoint byte range and writes it at its own offset, so the order in
//! which segments finish does not affect the result.

use futures::stream::{self, StreamExt, TryStreamExt};
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::pin::pin;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use graphdrive_common::{Error, Result, TransferResult, TransferStatus, TransferTarget};

use super::client::GraphClient;
use super::transfer::TransferOptions;
use super::types::{encode_segment, DriveItem};
use crate::http::HttpRequest;
use crate::progress::{TransferDirection, TransferProgress};
use crate::retry::{retry_part, RetryConfig, TransferPart};

/// Target size of one segment; files up to this size use a single request.
pub const SEGMENT_UNIT: u64 = 1024 * 1024;

/// How a file is split across concurrent range requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    pub total_size: u64,
    /// Ordered half-open ranges partitioning `[0, total_size)`.
    pub segments: Vec<Range<u64>>,
    pub max_connections: usize,
}

impl DownloadPlan {
    /// Partition `total_size` bytes for at most `max_connections` requests.
    ///
    /// Files up to [`SEGMENT_UNIT`], or a limit of one connection, get a single
    /// segment. Otherwise the file is cut into
    /// `min(max_connections, ceil(total_size / SEGMENT_UNIT))` equal ranges,
    /// the last one absorbing the remainder.
    ///
    /// # Errors
    /// - `max_connections` is zero
    pub fn new(total_size: u64, max_connections: usize) -> Result<Self> {
        if max_connections == 0 {
            return Err(Error::InvalidInput(
                "max_connections must be at least 1".to_string(),
            ));
        }

        let segments = if total_size == 0 {
            Vec::new()
        } else if total_size <= SEGMENT_UNIT || max_connections == 1 {
            vec![0..total_size]
        } else {
            let count = (max_connections as u64).min(total_size.div_ceil(SEGMENT_UNIT));
            let typical = total_size / count;
            (0..count)
                .map(|i| {
                    let start = i * typical;
                    let end = if i == count - 1 {
                        total_size
                    } else {
                        start + typical
                    };
                    start..end
                })
                .collect()
        };

        Ok(Self {
            total_size,
            segments,
            max_connections,
        })
    }

    /// Whether segments are fetched with `Range` requests.
    pub fn is_segmented(&self) -> bool {
        self.segments.len() > 1
    }
}

/// Where the file content is fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSource {
    pub url: String,
    /// Pre-authenticated download URLs must not carry a bearer token.
    pub authenticated: bool,
}

impl DownloadSource {
    /// Prefer the item's pre-authenticated download URL; fall back to the
    /// authenticated content endpoint, which redirects to the binary content.
    pub fn for_item(client: &GraphClient, item: &DriveItem) -> Self {
        match &item.download_url {
            Some(url) => Self {
                url: url.clone(),
                authenticated: false,
            },
            None => Self {
                url: client.url(&format!("me/drive/items/{}/content", encode_segment(&item.id))),
                authenticated: true,
            },
        }
    }
}

/// Downloads drive files to the local filesystem.
pub struct DownloadEngine {
    client: GraphClient,
}

impl DownloadEngine {
    pub fn new(client: GraphClient) -> Self {
        Self { client }
    }

    /// Download the file `item_id` to `destination`.
    ///
    /// # Errors
    /// - `InvalidInput` for folders or a zero connection limit
    /// - `Download` with segment context once a segment exhausts its retries
    /// - `Cancelled` if the cancellation token fires; the partial file is kept
    #[instrument(skip(self, destination, options), fields(max_connections = options.max_connections))]
    pub async fn download(
        &self,
        item_id: &str,
        destination: &Path,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        options.validate_connections()?;
        let item: DriveItem = self
            .client
            .get_json(&format!("me/drive/items/{}", encode_segment(item_id)))
            .await?;
        self.download_item(&item, destination, options).await
    }

    /// Download an item whose metadata is already known.
    pub async fn download_item(
        &self,
        item: &DriveItem,
        destination: &Path,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        if item.is_folder() {
            return Err(Error::InvalidInput(format!(
                "'{}' is a folder, only files can be downloaded",
                item.name
            )));
        }
        let plan = DownloadPlan::new(item.size, options.max_connections)?;
        if options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let file = File::create(destination).await?;
        if plan.total_size == 0 {
            warn!(name = %item.name, "Remote file is empty, created empty file");
            return Ok(TransferResult {
                target: TransferTarget::Path(destination.to_path_buf()),
                bytes_transferred: 0,
                status: TransferStatus::Empty,
            });
        }
        file.set_len(plan.total_size).await?;
        drop(file);

        let source = DownloadSource::for_item(&self.client, item);
        info!(
            name = %item.name,
            size = plan.total_size,
            segments = plan.segments.len(),
            "Starting download"
        );

        options
            .run_cancellable(self.fetch_segments(&source, &plan, destination, &item.name, options))
            .await?;

        info!(name = %item.name, bytes = plan.total_size, "Download complete");
        Ok(TransferResult {
            target: TransferTarget::Path(destination.to_path_buf()),
            bytes_transferred: plan.total_size,
            status: TransferStatus::Completed,
        })
    }

    async fn fetch_segments(
        &self,
        source: &DownloadSource,
        plan: &DownloadPlan,
        destination: &Path,
        name: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        let ranged = plan.is_segmented();
        let parts_total = plan.segments.len();

        let completed = stream::iter(plan.segments.iter().cloned().enumerate())
            .map(|(index, range)| {
                self.fetch_segment(source, destination, index, range, ranged, &options.retry)
            })
            .buffer_unordered(plan.max_connections);
        let mut completed = pin!(completed);

        let mut parts_done = 0;
        let mut bytes_done = 0;
        while let Some(bytes) = completed.try_next().await? {
            parts_done += 1;
            bytes_done += bytes;
            options.notify(&TransferProgress {
                direction: TransferDirection::Download,
                name: name.to_string(),
                parts_done,
                parts_total,
                bytes_done,
                total_bytes: plan.total_size,
            });
            if options.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }

        Ok(())
    }

    async fn fetch_segment(
        &self,
        source: &DownloadSource,
        destination: &Path,
        index: usize,
        range: Range<u64>,
        ranged: bool,
        retry: &RetryConfig,
    ) -> Result<u64> {
        debug!(segment = index, start = range.start, end = range.end, "Fetching segment");
        let part = TransferPart::Segment {
            index,
            offset: range.start,
        };
        retry_part(retry, part, || {
            self.fetch_range(source, destination, range.clone(), ranged)
        })
        .await
    }

    /// Fetch one range and write it at its offset. Short or oversized bodies
    /// are reported as transient so the segment is retried.
    async fn fetch_range(
        &self,
        source: &DownloadSource,
        destination: &Path,
        range: Range<u64>,
        ranged: bool,
    ) -> Result<u64> {
        let mut request = HttpRequest::get(source.url.as_str());
        if ranged {
            request = request.header("range", format!("bytes={}-{}", range.start, range.end - 1));
        }

        let response = if source.authenticated {
            self.client.execute(request).await?
        } else {
            self.client.execute_anonymous(request).await?
        };
        if ranged && response.status != 206 {
            return Err(Error::Request {
                status: response.status,
                message: "Server did not honor the range request".to_string(),
            });
        }

        let expected = range.end - range.start;
        let mut file = OpenOptions::new().write(true).open(destination).await?;
        file.seek(SeekFrom::Start(range.start)).await?;

        let mut body = response.into_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if written + chunk.len() as u64 > expected {
                return Err(Error::Transient(format!(
                    "Segment returned more than the {} bytes requested",
                    expected
                )));
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written < expected {
            return Err(Error::Transient(format!(
                "Short segment: received {} of {} bytes",
                written, expected
            )));
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpMethod, HttpResponse, HttpTransport};
    use crate::onedrive::client::testing::{authorized_client, MockTransport};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const MIB: u64 = 1024 * 1024;
    const DOWNLOAD_URL: &str = "https://download.test/file?tempauth=x";

    fn test_data(len: usize) -> Arc<Vec<u8>> {
        Arc::new((0..len).map(|i| ((i * 31 + i / 7) % 256) as u8).collect())
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false)
    }

    fn parse_range(request: &HttpRequest) -> Option<(usize, usize)> {
        let value = request.header_value("range")?;
        let (start, end) = value.trim_start_matches("bytes=").split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()?))
    }

    fn item_json(size: usize, download_url: Option<&str>) -> serde_json::Value {
        let mut item = json!({"id": "01FILE", "name": "video.mp4", "size": size, "file": {}});
        if let Some(url) = download_url {
            item["@microsoft.graph.downloadUrl"] = json!(url);
        }
        item
    }

    /// Serves item metadata and ranged content for `data`.
    fn content_handler(
        data: Arc<Vec<u8>>,
    ) -> impl Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static {
        move |request| {
            if request.url.ends_with("me/drive/items/01FILE") {
                return Ok(HttpResponse::from_json(200, &item_json(data.len(), Some(DOWNLOAD_URL))));
            }
            match parse_range(request) {
                Some((start, end)) => Ok(HttpResponse::from_bytes(206, data[start..=end].to_vec())),
                None => Ok(HttpResponse::from_bytes(200, data.to_vec())),
            }
        }
    }

    fn content_gets(transport: &MockTransport) -> Vec<HttpRequest> {
        transport
            .requests()
            .into_iter()
            .filter(|r| r.method == HttpMethod::Get && !r.url.ends_with("01FILE"))
            .collect()
    }

    #[test]
    fn test_plan_single_segment() {
        assert_eq!(DownloadPlan::new(MIB, 8).unwrap().segments, vec![0..MIB]);
        assert_eq!(DownloadPlan::new(50 * MIB, 1).unwrap().segments, vec![0..50 * MIB]);
        assert!(DownloadPlan::new(0, 8).unwrap().segments.is_empty());
        assert!(!DownloadPlan::new(MIB, 8).unwrap().is_segmented());
    }

    #[test]
    fn test_plan_segment_count() {
        let plan = DownloadPlan::new(3 * MIB + 5, 8).unwrap();
        assert_eq!(plan.segments.len(), 4);

        let plan = DownloadPlan::new(100 * MIB, 8).unwrap();
        assert_eq!(plan.segments.len(), 8);
        assert_eq!(plan.segments[0], 0..100 * MIB / 8);
    }

    #[test]
    fn test_plan_last_segment_absorbs_remainder() {
        let plan = DownloadPlan::new(10 * MIB + 3, 4).unwrap();
        let typical = (10 * MIB + 3) / 4;
        assert_eq!(plan.segments[0], 0..typical);
        assert_eq!(plan.segments[3], 3 * typical..10 * MIB + 3);
    }

    #[test]
    fn test_plan_rejects_zero_connections() {
        assert!(matches!(DownloadPlan::new(MIB, 0), Err(Error::InvalidInput(_))));
    }

    proptest! {
        #[test]
        fn prop_plan_partitions_file(total in 1u64..(1u64 << 40), max_connections in 1usize..=32) {
            let plan = DownloadPlan::new(total, max_connections).unwrap();

            prop_assert!(!plan.segments.is_empty());
            prop_assert!(plan.segments.len() <= max_connections);
            prop_assert_eq!(plan.segments[0].start, 0);
            prop_assert_eq!(plan.segments.last().unwrap().end, total);
            for pair in plan.segments.windows(2) {
                prop_assert_eq!(pair[0].end, pair[1].start);
            }
            for segment in &plan.segments {
                prop_assert!(segment.start < segment.end);
            }
        }
    }

    #[tokio::test]
    async fn test_connection_count_does_not_change_result() {
        let data = test_data((5 * MIB + 123) as usize);
        let dir = TempDir::new().unwrap();

        let mut outputs = Vec::new();
        for max_connections in [1, 8] {
            let transport = MockTransport::new(content_handler(data.clone()));
            let (client, _) = authorized_client(transport.clone());
            let engine = DownloadEngine::new(client);
            let destination = dir.path().join(format!("out-{}.bin", max_connections));
            let options = TransferOptions::new().with_max_connections(max_connections);

            let result = engine.download("01FILE", &destination, &options).await.unwrap();

            assert_eq!(result.status, TransferStatus::Completed);
            assert_eq!(result.bytes_transferred, data.len() as u64);
            assert_eq!(result.path(), Some(&destination));

            let gets = content_gets(&transport);
            let expected_requests = if max_connections == 1 { 1 } else { 6 };
            assert_eq!(gets.len(), expected_requests);
            for get in &gets {
                assert_eq!(get.url, DOWNLOAD_URL);
                assert!(get.header_value("authorization").is_none());
            }
            if max_connections == 1 {
                assert!(gets[0].header_value("range").is_none());
            }

            outputs.push(std::fs::read(&destination).unwrap());
        }

        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], *data);
    }

    /// Serves ranged content slowly, recording the most requests ever in flight.
    struct PeakTrackingTransport {
        data: Arc<Vec<u8>>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for PeakTrackingTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let (start, end) = parse_range(&request).unwrap_or((0, self.data.len() - 1));
            Ok(HttpResponse::from_bytes(206, self.data[start..=end].to_vec()))
        }
    }

    #[tokio::test]
    async fn test_requests_in_flight_never_exceed_connection_limit() {
        const SEGMENT: u64 = 64 * 1024;
        let data = test_data((20 * SEGMENT) as usize);
        let transport = Arc::new(PeakTrackingTransport {
            data: data.clone(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.bin");
        std::fs::File::create(&destination)
            .unwrap()
            .set_len(data.len() as u64)
            .unwrap();

        let plan = DownloadPlan {
            total_size: data.len() as u64,
            segments: (0..20).map(|i| i * SEGMENT..(i + 1) * SEGMENT).collect(),
            max_connections: 3,
        };
        let source = DownloadSource {
            url: DOWNLOAD_URL.to_string(),
            authenticated: false,
        };

        engine
            .fetch_segments(&source, &plan, &destination, "out.bin", &TransferOptions::new())
            .await
            .unwrap();

        assert_eq!(transport.peak.load(Ordering::SeqCst), 3);
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&destination).unwrap(), *data);
    }

    #[tokio::test]
    async fn test_short_segment_is_retried() {
        let data = test_data((4 * MIB) as usize);
        let truncated = Arc::new(AtomicUsize::new(0));
        let truncated_clone = truncated.clone();
        let inner = content_handler(data.clone());
        let transport = MockTransport::new(move |request| {
            if let Some((start, end)) = parse_range(request) {
                if start > 0 && truncated_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Ok(HttpResponse::from_bytes(206, data[start..end].to_vec()));
                }
            }
            inner(request)
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.bin");
        let options = TransferOptions::new().with_retry(fast_retry());

        engine.download("01FILE", &destination, &options).await.unwrap();

        assert_eq!(content_gets(&transport).len(), 5);
        assert_eq!(std::fs::read(&destination).unwrap(), *test_data((4 * MIB) as usize));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_download() {
        let data = test_data((2 * MIB) as usize);
        let inner = content_handler(data.clone());
        let transport = MockTransport::new(move |request| {
            if let Some((start, _)) = parse_range(request) {
                if start > 0 {
                    return Ok(HttpResponse::from_bytes(503, "service unavailable"));
                }
            }
            inner(request)
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.bin");
        let options = TransferOptions::new().with_retry(fast_retry());

        let result = engine.download("01FILE", &destination, &options).await;

        match result {
            Err(Error::Download { segment, offset, .. }) => {
                assert_eq!(segment, 1);
                assert_eq!(offset, MIB);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // Partial file is left in place
        assert!(destination.exists());
    }

    #[tokio::test]
    async fn test_ignored_range_is_not_retried() {
        let data = test_data((2 * MIB) as usize);
        let transport = MockTransport::new(move |request| {
            if request.url.ends_with("01FILE") {
                return Ok(HttpResponse::from_json(200, &item_json(data.len(), Some(DOWNLOAD_URL))));
            }
            Ok(HttpResponse::from_bytes(200, data.to_vec()))
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let options = TransferOptions::new().with_retry(fast_retry());

        let result = engine
            .download("01FILE", &dir.path().join("out.bin"), &options)
            .await;

        assert!(matches!(result, Err(Error::Download { .. })));
        assert!(content_gets(&transport).len() <= 2);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let data = test_data((7 * MIB + 1) as usize);
        let transport = MockTransport::new(content_handler(data.clone()));
        let (client, _) = authorized_client(transport);
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let options = TransferOptions::new()
            .with_max_connections(4)
            .with_observer(move |p: &TransferProgress| {
                seen_clone.lock().unwrap().push((p.parts_done, p.bytes_done))
            });

        engine
            .download("01FILE", &dir.path().join("out.bin"), &options)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for pair in seen.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
            assert_eq!(pair[0].0 + 1, pair[1].0);
        }
        assert_eq!(seen.last().unwrap().1, data.len() as u64);
    }

    #[tokio::test]
    async fn test_folder_is_rejected() {
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::from_json(
                200,
                &json!({"id": "01DIR", "name": "Documents", "folder": {"childCount": 2}}),
            ))
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();

        let result = engine
            .download("01DIR", &dir.path().join("out"), &TransferOptions::new())
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_creates_empty_destination() {
        let transport = MockTransport::new(|_| {
            Ok(HttpResponse::from_json(200, &item_json(0, Some(DOWNLOAD_URL))))
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("empty.txt");

        let result = engine
            .download("01FILE", &destination, &TransferOptions::new())
            .await
            .unwrap();

        assert_eq!(result.status, TransferStatus::Empty);
        assert_eq!(std::fs::metadata(&destination).unwrap().len(), 0);
        assert!(content_gets(&transport).is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_to_authenticated_content_url() {
        let data = test_data(1000);
        let served = data.clone();
        let transport = MockTransport::new(move |request| {
            if request.url.ends_with("me/drive/items/01FILE") {
                return Ok(HttpResponse::from_json(200, &item_json(served.len(), None)));
            }
            Ok(HttpResponse::from_bytes(200, served.to_vec()))
        });
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("small.bin");

        engine
            .download("01FILE", &destination, &TransferOptions::new())
            .await
            .unwrap();

        let gets = content_gets(&transport);
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].url, "https://graph.test/v1.0/me/drive/items/01FILE/content");
        assert_eq!(gets[0].header_value("authorization"), Some("Bearer AT0"));
        assert_eq!(std::fs::read(&destination).unwrap(), *data);
    }

    #[tokio::test]
    async fn test_cancellation_keeps_partial_file() {
        let data = test_data((2 * MIB) as usize);
        let transport = MockTransport::new(content_handler(data.clone()));
        let (client, _) = authorized_client(transport);
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let destination = dir.path().join("out.bin");

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let options = TransferOptions::new()
            .with_max_connections(2)
            .with_cancellation(cancel)
            .with_observer(move |_: &TransferProgress| cancel_clone.cancel());

        let result = engine.download("01FILE", &destination, &options).await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(std::fs::metadata(&destination).unwrap().len(), data.len() as u64);
    }

    #[tokio::test]
    async fn test_zero_connections_rejected_before_requests() {
        let transport = MockTransport::new(content_handler(test_data(10)));
        let (client, _) = authorized_client(transport.clone());
        let engine = DownloadEngine::new(client);
        let dir = TempDir::new().unwrap();
        let options = TransferOptions::new().with_max_connections(0);

        let result = engine
            .download("01FILE", &dir.path().join("out.bin"), &options)
            .await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(transport.requests().is_empty());
    }
}
