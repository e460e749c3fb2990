use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Certificate verification policy for the fetch client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Verify server certificates (default)
    #[default]
    Strict,
    /// Trust every certificate. Some CDNs serving HLS present broken chains;
    /// this must be opted into explicitly.
    AcceptInvalidCerts,
}

/// Configurable options for the shared HTTP client
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Custom HTTP headers, merged over [`DownloaderConfig::get_default_headers`]
    pub headers: HeaderMap,

    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub tls_policy: TlsPolicy,

    /// Send `Origin`/`Referer` derived from the manifest URL on every request
    pub send_origin_headers: bool,

    /// Transport-level retry for connect/timeout errors and 5xx/429 statuses
    pub retry: RetryPolicy,

    // --- Connection Pool Configuration ---
    /// Maximum idle connections to keep per host.
    /// Segment downloads hit a single CDN host, so this tracks the fetch concurrency.
    pub pool_max_idle_per_host: usize,

    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            tls_policy: TlsPolicy::Strict,
            send_origin_headers: true,
            retry: RetryPolicy::default(),
            pool_max_idle_per_host: 24,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        default_headers
    }

    /// Default headers with the user-supplied ones layered on top.
    pub fn effective_headers(&self) -> HeaderMap {
        let mut headers = Self::get_default_headers();
        for (name, value) in self.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }
}

// --- Playlist Configuration ---
#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    pub manifest_timeout: Duration,
    /// Fixed wait before every live re-poll
    pub live_poll_interval: Duration,
    /// Consecutive polls without new segments before giving up on a live stream
    pub live_max_idle_polls: u32,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            manifest_timeout: Duration::from_secs(10),
            live_poll_interval: Duration::from_secs(3),
            live_max_idle_polls: 10,
        }
    }
}

// --- Fetcher Configuration ---
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Max concurrent segment downloads
    pub concurrency: usize,
    pub segment_timeout: Duration,
    /// Number of leading completions that must not all fail
    pub early_abort_window: usize,
    /// Completions required before the sustained failure ratio is evaluated
    pub sustained_abort_min_completed: usize,
    pub sustained_abort_failure_ratio: f64,
    /// Minimum overall success ratio once every job has settled
    pub min_success_ratio: f64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 24,
            segment_timeout: Duration::from_secs(15),
            early_abort_window: 10,
            sustained_abort_min_completed: 20,
            sustained_abort_failure_ratio: 0.95,
            min_success_ratio: 0.10,
        }
    }
}

// --- Classifier Configuration ---
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Bytes read from the head of each file
    pub header_window: usize,
    /// Leading bytes searched for the transport-stream sync byte
    pub sync_scan_bytes: usize,
    /// Distinct-byte ratio above which a non-text sample is treated as ciphertext
    pub entropy_threshold: f64,
    /// Bytes searched for a transport stream hidden behind a genuine image header
    pub wrapped_scan_limit: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            header_window: 188,
            sync_scan_bytes: 4,
            entropy_threshold: 0.6,
            wrapped_scan_limit: 256 * 1024,
        }
    }
}

// --- Merge Configuration ---
#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub muxer_program: PathBuf,
    /// Survivor ratio below which a degraded-output warning is emitted
    pub degraded_ratio: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            muxer_program: PathBuf::from("ffmpeg"),
            degraded_ratio: 0.8,
        }
    }
}

// --- Top-Level Configuration ---
#[derive(Debug, Clone, Default)]
pub struct HarvestConfig {
    pub downloader: DownloaderConfig,
    pub playlist: PlaylistConfig,
    pub fetcher: FetcherConfig,
    pub classifier: ClassifierConfig,
    pub merge: MergeConfig,
    /// Parent directory for per-job temporary directories (system temp dir when `None`)
    pub workspace_root: Option<PathBuf>,
}

impl HarvestConfig {
    pub fn builder() -> HarvestConfigBuilder {
        HarvestConfigBuilder::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HarvestConfigBuilder {
    config: HarvestConfig,
}

impl HarvestConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.fetcher.concurrency = concurrency.max(1);
        self.config.downloader.pool_max_idle_per_host = concurrency.max(1);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.downloader.user_agent = user_agent.into();
        self
    }

    pub fn header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.config.downloader.headers.insert(name, value);
        self
    }

    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.downloader.proxy = Some(proxy);
        self
    }

    pub fn use_system_proxy(mut self, enabled: bool) -> Self {
        self.config.downloader.use_system_proxy = enabled;
        self
    }

    pub fn tls_policy(mut self, policy: TlsPolicy) -> Self {
        self.config.downloader.tls_policy = policy;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.downloader.retry = policy;
        self
    }

    pub fn manifest_timeout(mut self, timeout: Duration) -> Self {
        self.config.playlist.manifest_timeout = timeout;
        self
    }

    pub fn segment_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetcher.segment_timeout = timeout;
        self
    }

    pub fn live_poll_interval(mut self, interval: Duration) -> Self {
        self.config.playlist.live_poll_interval = interval;
        self
    }

    pub fn live_max_idle_polls(mut self, polls: u32) -> Self {
        self.config.playlist.live_max_idle_polls = polls;
        self
    }

    pub fn muxer_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.merge.muxer_program = program.into();
        self
    }

    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = Some(root.into());
        self
    }

    pub fn build(self) -> HarvestConfig {
        self.config
    }
}
