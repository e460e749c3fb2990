// Parallel segment fetcher: bounded-concurrency downloads into the job
// workspace, per-file classification, and DRM inference from failure rates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use reqwest::header::CONTENT_TYPE;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use url::Url;

use crate::HarvestError;
use crate::client::HttpClient;
use crate::config::FetcherConfig;
use crate::hls::classifier::{SegmentClass, SegmentClassifier};
use crate::hls::collector::SegmentReference;
use crate::hls::tally::{AbortPolicy, FetchTally, TallySnapshot};
use crate::sink::SharedSink;
use crate::workspace::JobWorkspace;

/// One download attempt: where to fetch from and the file this job owns.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub index: usize,
    pub url: Url,
    pub path: PathBuf,
}

/// A downloaded segment that passed classification.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFile {
    pub index: usize,
    pub path: PathBuf,
    pub size: u64,
    pub class: SegmentClass,
}

#[derive(Debug)]
pub enum SegmentOutcome {
    Downloaded(SegmentFile),
    Failed {
        index: usize,
        /// Set when the body was received but rejected by the classifier.
        class: Option<SegmentClass>,
        reason: String,
    },
}

impl SegmentOutcome {
    fn failed(index: usize, reason: impl Into<String>) -> Self {
        Self::Failed {
            index,
            class: None,
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait SegmentDownloader: Send + Sync {
    /// Downloads one segment. Per-segment problems are reported as
    /// `SegmentOutcome::Failed`, never as a panic or an error.
    async fn download(&self, job: &FetchJob, token: &CancellationToken) -> SegmentOutcome;
}

pub struct HttpSegmentDownloader {
    client: HttpClient,
    timeout: Duration,
    classifier: SegmentClassifier,
}

impl HttpSegmentDownloader {
    pub fn new(client: HttpClient, timeout: Duration, classifier: SegmentClassifier) -> Self {
        Self {
            client,
            timeout,
            classifier,
        }
    }

    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        job: &FetchJob,
        token: &CancellationToken,
    ) -> Result<u64, HarvestError> {
        let file = tokio::fs::File::create(&job.path).await?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(HarvestError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    writer.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
        writer.flush().await?;
        Ok(written)
    }
}

async fn discard(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove rejected segment file");
        }
    }
}

#[async_trait]
impl SegmentDownloader for HttpSegmentDownloader {
    async fn download(&self, job: &FetchJob, token: &CancellationToken) -> SegmentOutcome {
        let response = match self.client.get(&job.url, self.timeout, "segment", token).await {
            Ok(response) => response,
            Err(e) => return SegmentOutcome::failed(job.index, e.to_string()),
        };

        let is_html = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("text/html"));
        if is_html {
            return SegmentOutcome::Failed {
                index: job.index,
                class: Some(SegmentClass::HtmlError),
                reason: "server answered with an HTML page".to_string(),
            };
        }

        let size = match self.stream_to_file(response, job, token).await {
            Ok(size) => size,
            Err(e) => {
                discard(&job.path).await;
                return SegmentOutcome::failed(job.index, e.to_string());
            }
        };
        if size == 0 {
            discard(&job.path).await;
            return SegmentOutcome::failed(job.index, "empty response body");
        }

        match self.classifier.classify_file(&job.path).await {
            Ok(class) if class.is_usable() => {
                trace!(index = job.index, size, class = %class, "Segment accepted");
                SegmentOutcome::Downloaded(SegmentFile {
                    index: job.index,
                    path: job.path.clone(),
                    size,
                    class,
                })
            }
            Ok(class) => {
                discard(&job.path).await;
                SegmentOutcome::Failed {
                    index: job.index,
                    class: Some(class),
                    reason: format!("content classified as {class}"),
                }
            }
            Err(e) => {
                discard(&job.path).await;
                SegmentOutcome::failed(job.index, format!("classification failed: {e}"))
            }
        }
    }
}

/// Result of a fetch run that was not aborted.
#[derive(Debug)]
pub struct FetchReport {
    /// Accepted files, ascending by index.
    pub segments: Vec<SegmentFile>,
    pub failures: usize,
    pub tally: TallySnapshot,
}

pub struct ParallelSegmentFetcher {
    downloader: Arc<dyn SegmentDownloader>,
    config: FetcherConfig,
    sink: SharedSink,
}

impl ParallelSegmentFetcher {
    pub fn new(
        downloader: Arc<dyn SegmentDownloader>,
        config: FetcherConfig,
        sink: SharedSink,
    ) -> Self {
        Self {
            downloader,
            config,
            sink,
        }
    }

    #[instrument(skip_all, fields(index = job.index))]
    async fn run_job(
        downloader: Arc<dyn SegmentDownloader>,
        job: FetchJob,
        token: CancellationToken,
    ) -> SegmentOutcome {
        if token.is_cancelled() {
            return SegmentOutcome::failed(job.index, "cancelled before start");
        }
        tokio::select! {
            _ = token.cancelled() => SegmentOutcome::failed(job.index, "cancelled"),
            outcome = downloader.download(&job, &token) => outcome,
        }
    }

    /// Downloads every segment with at most `concurrency` jobs in flight. Fails
    /// with `ContentDrmProtected` as soon as the failure pattern points at
    /// protected content; in-flight jobs are dropped at that point.
    pub async fn fetch_all(
        &self,
        segments: &[SegmentReference],
        workspace: &JobWorkspace,
        token: &CancellationToken,
    ) -> Result<FetchReport, HarvestError> {
        if token.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let total = segments.len();
        let concurrency = self.config.concurrency.max(1);
        let policy = AbortPolicy::from(&self.config);
        let tally = FetchTally::new();
        let abort = token.child_token();
        let progress_step = (total / 10).max(1);

        info!(total, concurrency, "Starting segment downloads");
        self.sink.emit(&format!(
            "Downloading {total} segment(s) with {concurrency} worker(s)"
        ));

        let mut pending = segments.iter().map(|reference| FetchJob {
            index: reference.index,
            url: reference.url.clone(),
            path: workspace.segment_path(reference.index, &reference.url),
        });
        let mut in_flight = FuturesUnordered::new();
        let mut accepted = Vec::with_capacity(total);

        loop {
            while in_flight.len() < concurrency && !abort.is_cancelled() {
                let Some(job) = pending.next() else { break };
                in_flight.push(Self::run_job(
                    Arc::clone(&self.downloader),
                    job,
                    abort.clone(),
                ));
            }

            if in_flight.is_empty() {
                if abort.is_cancelled() {
                    return Err(HarvestError::Cancelled);
                }
                break;
            }

            let outcome = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    debug!(in_flight = in_flight.len(), "Fetch cancelled, dropping in-flight jobs");
                    return Err(HarvestError::Cancelled);
                }
                Some(outcome) = in_flight.next() => outcome,
            };

            match outcome {
                SegmentOutcome::Downloaded(file) => {
                    tally.record_success();
                    accepted.push(file);
                }
                SegmentOutcome::Failed {
                    index,
                    class,
                    reason,
                } => {
                    tally.record_failure();
                    debug!(index, class = ?class, reason = %reason, "Segment failed");
                }
            }

            let snapshot = tally.snapshot();
            if let Err(e) = policy.check_running(&snapshot) {
                abort.cancel();
                error!(
                    completed = snapshot.completed,
                    failed = snapshot.failed,
                    in_flight = in_flight.len(),
                    "Aborting fetch: {e}"
                );
                self.sink.emit(&format!("Aborting: {e}"));
                return Err(e);
            }

            if snapshot.completed % progress_step == 0 || snapshot.completed == total {
                self.sink.emit(&format!(
                    "Downloaded {}/{total} segment(s), {} failed",
                    snapshot.completed, snapshot.failed
                ));
            }
        }

        let snapshot = tally.snapshot();
        policy.check_settled(&snapshot).inspect_err(|e| {
            error!(succeeded = snapshot.succeeded, total, "Fetch rejected: {e}");
            self.sink.emit(&format!("Aborting: {e}"));
        })?;

        accepted.sort_by_key(|file| file.index);
        if snapshot.failed > 0 {
            warn!(failed = snapshot.failed, total, "Some segments could not be downloaded");
        }
        info!(accepted = accepted.len(), failed = snapshot.failed, "Segment downloads finished");

        Ok(FetchReport {
            segments: accepted,
            failures: snapshot.failed,
            tally: snapshot,
        })
    }
}
