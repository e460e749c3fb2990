// Segment collection: turn the resolved media playlist into the full list of
// segment URLs, re-polling live playlists until they end or stall.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::HarvestError;
use crate::config::PlaylistConfig;
use crate::hls::manifest::{declares_key, has_end_marker, segment_urls};
use crate::hls::playlist::{ManifestSource, ResolvedPlaylist};
use crate::sink::SharedSink;

/// A segment URL and its position in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReference {
    pub index: usize,
    pub url: Url,
}

/// Insertion-ordered, URL-deduplicated segment list. Only ever grows.
#[derive(Debug, Default, Clone)]
pub struct SegmentSet {
    segments: Vec<SegmentReference>,
    seen: HashSet<Url>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds unseen URLs in order and returns how many were new.
    pub fn extend<I>(&mut self, urls: I) -> usize
    where
        I: IntoIterator<Item = Url>,
    {
        let before = self.segments.len();
        for url in urls {
            if self.seen.insert(url.clone()) {
                let index = self.segments.len();
                self.segments.push(SegmentReference { index, url });
            }
        }
        self.segments.len() - before
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SegmentReference> {
        self.segments.iter()
    }

    pub fn into_vec(self) -> Vec<SegmentReference> {
        self.segments
    }
}

pub struct SegmentCollector {
    source: Arc<dyn ManifestSource>,
    config: PlaylistConfig,
    sink: SharedSink,
}

impl SegmentCollector {
    pub fn new(source: Arc<dyn ManifestSource>, config: PlaylistConfig, sink: SharedSink) -> Self {
        Self {
            source,
            config,
            sink,
        }
    }

    /// Collects every segment the playlist exposes. The already-fetched text of
    /// `playlist` is the first poll; live playlists are re-fetched until an end
    /// marker shows up, `live_max_idle_polls` consecutive polls bring nothing
    /// new, or a poll fails.
    pub async fn collect_all(
        &self,
        playlist: &ResolvedPlaylist,
        token: &CancellationToken,
    ) -> Result<SegmentSet, HarvestError> {
        let base_url = playlist.base_url();
        let mut segments = SegmentSet::new();
        let mut key_seen = declares_key(playlist.text());
        segments.extend(segment_urls(base_url, playlist.text()));

        if !playlist.is_live && playlist.has_end_marker {
            debug!(segments = segments.len(), "VOD playlist complete on first fetch");
        } else if playlist.has_end_marker {
            debug!(segments = segments.len(), "Playlist already carries an end marker");
        } else {
            self.sink.emit(&format!(
                "Live playlist: {} segment(s) so far, polling every {:?}",
                segments.len(),
                self.config.live_poll_interval
            ));
            key_seen |= self.poll_live(playlist, &mut segments, token).await?;
        }

        if segments.is_empty() {
            return Err(if key_seen {
                HarvestError::ManifestEncrypted
            } else {
                HarvestError::NoSegmentsFound
            });
        }

        info!(segments = segments.len(), "Segment collection finished");
        self.sink
            .emit(&format!("Collected {} segment URL(s)", segments.len()));
        Ok(segments)
    }

    /// Returns whether any polled text declared a key.
    async fn poll_live(
        &self,
        playlist: &ResolvedPlaylist,
        segments: &mut SegmentSet,
        token: &CancellationToken,
    ) -> Result<bool, HarvestError> {
        let media_url = playlist.media_url();
        let base_url = playlist.base_url();
        let mut key_seen = false;
        let mut idle_rounds = 0u32;
        let mut round = 0u32;

        while idle_rounds < self.config.live_max_idle_polls {
            tokio::select! {
                _ = token.cancelled() => return Err(HarvestError::Cancelled),
                _ = tokio::time::sleep(self.config.live_poll_interval) => {}
            }
            round += 1;

            let text = match self.source.fetch_manifest(media_url, token).await {
                Ok(text) => text,
                Err(HarvestError::Cancelled) => return Err(HarvestError::Cancelled),
                Err(e) => {
                    warn!(url = %media_url, round, error = %e, "Live poll failed, keeping collected segments");
                    self.sink.emit(&format!(
                        "Live poll failed ({e}); continuing with {} segment(s)",
                        segments.len()
                    ));
                    break;
                }
            };

            key_seen |= declares_key(&text);
            let added = segments.extend(segment_urls(base_url, &text));
            if added > 0 {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
            }
            debug!(round, added, total = segments.len(), idle_rounds, "Live poll");

            if has_end_marker(&text) {
                self.sink.emit(&format!(
                    "End of stream after {round} poll(s), {} segment(s)",
                    segments.len()
                ));
                return Ok(key_seen);
            }
        }

        if idle_rounds >= self.config.live_max_idle_polls {
            self.sink.emit(&format!(
                "No new segments in {idle_rounds} consecutive poll(s); stopping"
            ));
        }
        Ok(key_seen)
    }
}
