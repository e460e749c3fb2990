// HLS acquisition coordinator: wires resolver, collector, fetcher and
// reassembly together for one job and guarantees workspace cleanup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use url::Url;

use crate::client::HttpClient;
use crate::config::HarvestConfig;
use crate::decrypt::{SegmentDecryptor, SegmentKey};
use crate::hls::classifier::SegmentClassifier;
use crate::hls::collector::SegmentCollector;
use crate::hls::fetcher::{HttpSegmentDownloader, ParallelSegmentFetcher, SegmentDownloader};
use crate::hls::playlist::{HttpManifestSource, ManifestSource, PlaylistResolver};
use crate::merge::{Decryption, FfmpegMuxer, Muxer, ReassemblyCoordinator};
use crate::sink::SharedSink;
use crate::workspace::JobWorkspace;
use crate::{FailureKind, HarvestError};

/// What a successful job produced.
#[derive(Debug, Clone)]
pub struct AcquisitionReport {
    pub output: PathBuf,
    /// The media playlist that was harvested (the selected variant for a master).
    pub media_url: Url,
    pub was_live: bool,
    pub segments_found: usize,
    pub segments_downloaded: usize,
    pub fetch_failures: usize,
    pub segments_merged: usize,
    pub degraded: bool,
}

/// Terminal result of [`HlsHarvester::run`].
#[derive(Debug, Clone)]
pub enum AcquisitionOutcome {
    Completed(AcquisitionReport),
    Failed { kind: FailureKind, reason: String },
}

impl AcquisitionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

impl From<HarvestError> for AcquisitionOutcome {
    fn from(err: HarvestError) -> Self {
        Self::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// Entry point for one acquisition job.
///
/// ```no_run
/// use std::path::Path;
/// use std::sync::Arc;
/// use harvest_engine::{HarvestConfig, HlsHarvester, TracingSink};
///
/// # async fn demo() {
/// let harvester = HlsHarvester::new(HarvestConfig::default(), Arc::new(TracingSink));
/// let outcome = harvester
///     .run("https://example.com/master.m3u8", Path::new("video.mp4"))
///     .await;
/// assert!(outcome.is_success());
/// # }
/// ```
pub struct HlsHarvester {
    config: HarvestConfig,
    sink: SharedSink,
    token: CancellationToken,
    muxer: Option<Arc<dyn Muxer>>,
    decryption: Option<Decryption>,
    manifest_source: Option<Arc<dyn ManifestSource>>,
    downloader: Option<Arc<dyn SegmentDownloader>>,
}

impl HlsHarvester {
    pub fn new(config: HarvestConfig, sink: SharedSink) -> Self {
        Self {
            config,
            sink,
            token: CancellationToken::new(),
            muxer: None,
            decryption: None,
            manifest_source: None,
            downloader: None,
        }
    }

    /// Replaces the ffmpeg muxer built from `MergeConfig::muxer_program`.
    pub fn with_muxer(mut self, muxer: Arc<dyn Muxer>) -> Self {
        self.muxer = Some(muxer);
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn SegmentDecryptor>, key: SegmentKey) -> Self {
        self.decryption = Some(Decryption { decryptor, key });
        self
    }

    /// Replaces the HTTP manifest source.
    pub fn with_manifest_source(mut self, source: Arc<dyn ManifestSource>) -> Self {
        self.manifest_source = Some(source);
        self
    }

    /// Replaces the HTTP segment downloader.
    pub fn with_downloader(mut self, downloader: Arc<dyn SegmentDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Token that cancels the whole job when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Runs the job end to end. The job workspace is removed before this
    /// returns, whatever the outcome.
    pub async fn run(&self, manifest_url: &str, output: &Path) -> AcquisitionOutcome {
        let span = info_span!("hls_job", url = %manifest_url);
        async {
            let result = match JobWorkspace::create(self.config.workspace_root.as_deref()) {
                Ok(workspace) => {
                    let result = self.acquire(manifest_url, &workspace, output).await;
                    if let Err(e) = workspace.close() {
                        warn!(error = %e, "Workspace cleanup failed");
                    }
                    result
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(report) => {
                    info!(output = %report.output.display(), merged = report.segments_merged, "Acquisition completed");
                    self.sink
                        .emit(&format!("Done: {}", report.output.display()));
                    AcquisitionOutcome::Completed(report)
                }
                Err(e) => {
                    error!(kind = %e.kind(), error = %e, "Acquisition failed");
                    self.sink.emit(&format!("Failed ({}): {e}", e.kind()));
                    AcquisitionOutcome::from(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn acquire(
        &self,
        manifest_url: &str,
        workspace: &JobWorkspace,
        output: &Path,
    ) -> Result<AcquisitionReport, HarvestError> {
        let url = Url::parse(manifest_url)
            .map_err(|e| HarvestError::invalid_url(manifest_url, e.to_string()))?;
        let token = &self.token;

        let client = HttpClient::new(&self.config.downloader)?.with_origin(&url);
        let classifier = SegmentClassifier::new(self.config.classifier.clone());

        let source: Arc<dyn ManifestSource> = match &self.manifest_source {
            Some(source) => Arc::clone(source),
            None => Arc::new(HttpManifestSource::new(
                client.clone(),
                self.config.playlist.manifest_timeout,
            )),
        };
        let downloader: Arc<dyn SegmentDownloader> = match &self.downloader {
            Some(downloader) => Arc::clone(downloader),
            None => Arc::new(HttpSegmentDownloader::new(
                client,
                self.config.fetcher.segment_timeout,
                classifier.clone(),
            )),
        };
        let muxer: Arc<dyn Muxer> = match &self.muxer {
            Some(muxer) => Arc::clone(muxer),
            None => Arc::new(FfmpegMuxer::new(&self.config.merge.muxer_program)),
        };

        self.sink.emit(&format!("Resolving {url}"));
        let playlist = PlaylistResolver::new(Arc::clone(&source), Arc::clone(&self.sink))
            .resolve(&url, token)
            .await?;

        let segments = SegmentCollector::new(
            source,
            self.config.playlist.clone(),
            Arc::clone(&self.sink),
        )
        .collect_all(&playlist, token)
        .await?
        .into_vec();

        let fetch = ParallelSegmentFetcher::new(
            downloader,
            self.config.fetcher.clone(),
            Arc::clone(&self.sink),
        )
        .fetch_all(&segments, workspace, token)
        .await?;

        let merge = ReassemblyCoordinator::new(
            muxer,
            classifier,
            self.config.merge.clone(),
            Arc::clone(&self.sink),
        )
        .with_decryption(self.decryption.clone())
        .merge(&fetch.segments, workspace, output, token)
        .await?;

        Ok(AcquisitionReport {
            output: merge.output,
            media_url: playlist.media_url().clone(),
            was_live: playlist.is_live,
            segments_found: segments.len(),
            segments_downloaded: fetch.segments.len(),
            fetch_failures: fetch.failures,
            segments_merged: merge.merged,
            degraded: merge.degraded,
        })
    }
}
