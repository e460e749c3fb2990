// Playlist resolution: fetch the top-level manifest, follow a master playlist
// to its variant, and report what kind of media playlist was found.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::HarvestError;
use crate::client::HttpClient;
use crate::hls::manifest::Manifest;
use crate::sink::SharedSink;

/// Where manifest text comes from. The HTTP implementation is the only one in
/// production; tests substitute scripted sources.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches `url` once. Failures are `FetchFailed` (or `Cancelled`) and are
    /// not retried above the transport layer.
    async fn fetch_manifest(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<String, HarvestError>;
}

#[derive(Debug, Clone)]
pub struct HttpManifestSource {
    client: HttpClient,
    timeout: Duration,
}

impl HttpManifestSource {
    pub fn new(client: HttpClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch_manifest(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<String, HarvestError> {
        debug!(url = %url, "Fetching manifest");
        self.client
            .get_text(url, self.timeout, "manifest", token)
            .await
            .map_err(|e| match e {
                HarvestError::Cancelled => HarvestError::Cancelled,
                other => HarvestError::fetch_failed(url.as_str(), other),
            })
    }
}

/// The media playlist selected for a job.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    pub manifest: Manifest,
    pub is_live: bool,
    pub has_end_marker: bool,
}

impl ResolvedPlaylist {
    fn from_manifest(manifest: Manifest) -> Self {
        Self {
            is_live: manifest.is_live(),
            has_end_marker: manifest.has_end_marker(),
            manifest,
        }
    }

    pub fn media_url(&self) -> &Url {
        self.manifest.url()
    }

    pub fn base_url(&self) -> &Url {
        self.manifest.base_url()
    }

    pub fn text(&self) -> &str {
        self.manifest.text()
    }
}

pub struct PlaylistResolver {
    source: Arc<dyn ManifestSource>,
    sink: SharedSink,
}

impl PlaylistResolver {
    pub fn new(source: Arc<dyn ManifestSource>, sink: SharedSink) -> Self {
        Self { source, sink }
    }

    /// Fetches `manifest_url`. A master playlist is followed to its last listed
    /// variant; otherwise the manifest itself is the media playlist.
    pub async fn resolve(
        &self,
        manifest_url: &Url,
        token: &CancellationToken,
    ) -> Result<ResolvedPlaylist, HarvestError> {
        let text = self.source.fetch_manifest(manifest_url, token).await?;
        let manifest = Manifest::new(manifest_url.clone(), text)?;

        if !manifest.is_master() {
            info!(url = %manifest_url, "Manifest is a media playlist");
            return Ok(ResolvedPlaylist::from_manifest(manifest));
        }

        let variants = manifest.variant_urls();
        let Some(selected) = variants.last().cloned() else {
            return Err(HarvestError::invalid_url(
                manifest_url.as_str(),
                "master playlist lists no resolvable variant",
            ));
        };
        info!(
            url = %manifest_url,
            variants = variants.len(),
            selected = %selected,
            "Master playlist detected, selecting last variant"
        );
        self.sink.emit(&format!(
            "Master playlist with {} variant(s); using {selected}",
            variants.len()
        ));

        let text = self.source.fetch_manifest(&selected, token).await?;
        let media = Manifest::new(selected, text)?;
        if media.is_master() {
            warn!(url = %media.url(), "Selected variant is itself a master playlist");
        }
        Ok(ResolvedPlaylist::from_manifest(media))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sink::NullSink;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Serves canned text per URL and records every request.
    #[derive(Default)]
    pub(crate) struct StaticSource {
        pub pages: HashMap<String, String>,
        pub requests: Mutex<Vec<String>>,
    }

    impl StaticSource {
        pub fn with(mut self, url: &str, text: &str) -> Self {
            self.pages.insert(url.to_string(), text.to_string());
            self
        }
    }

    #[async_trait]
    impl ManifestSource for StaticSource {
        async fn fetch_manifest(
            &self,
            url: &Url,
            _token: &CancellationToken,
        ) -> Result<String, HarvestError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.pages
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| HarvestError::fetch_failed(url.as_str(), "HTTP 404"))
        }
    }

    fn resolver(source: StaticSource) -> (PlaylistResolver, Arc<StaticSource>) {
        let source = Arc::new(source);
        let resolver = PlaylistResolver::new(source.clone(), Arc::new(NullSink));
        (resolver, source)
    }

    #[tokio::test]
    async fn master_playlist_follows_last_variant() {
        let (resolver, source) = resolver(
            StaticSource::default()
                .with(
                    "https://cdn.test/show/master.m3u8",
                    "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2\nhigh/index.m3u8\n",
                )
                .with(
                    "https://cdn.test/show/high/index.m3u8",
                    "#EXTM3U\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:4,\na.ts\n#EXT-X-ENDLIST\n",
                ),
        );

        let url = Url::parse("https://cdn.test/show/master.m3u8").unwrap();
        let resolved = resolver.resolve(&url, &CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.media_url().as_str(), "https://cdn.test/show/high/index.m3u8");
        assert_eq!(resolved.base_url().as_str(), "https://cdn.test/show/high/");
        assert!(!resolved.is_live);
        assert!(resolved.has_end_marker);
        assert_eq!(source.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn media_playlist_is_used_directly() {
        let (resolver, source) = resolver(StaticSource::default().with(
            "https://cdn.test/live/index.m3u8",
            "#EXTM3U\n#EXTINF:2,\nseg1.ts\n",
        ));

        let url = Url::parse("https://cdn.test/live/index.m3u8").unwrap();
        let resolved = resolver.resolve(&url, &CancellationToken::new()).await.unwrap();

        assert!(resolved.is_live);
        assert!(!resolved.has_end_marker);
        assert_eq!(source.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal() {
        let (resolver, _) = resolver(StaticSource::default());
        let url = Url::parse("https://cdn.test/missing.m3u8").unwrap();
        let err = resolver
            .resolve(&url, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::FetchFailed { .. }));
    }
}
