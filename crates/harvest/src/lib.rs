pub mod client;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod hls;
pub mod merge;
pub mod proxy;
pub mod retry;
pub mod sink;
pub mod workspace;

pub use client::HttpClient;
pub use config::{
    ClassifierConfig, DownloaderConfig, FetcherConfig, HarvestConfig, HarvestConfigBuilder,
    MergeConfig, PlaylistConfig, TlsPolicy,
};
pub use decrypt::{Aes128CbcDecryptor, SegmentDecryptor, SegmentKey};
pub use error::{FailureKind, HarvestError};
pub use hls::{AcquisitionOutcome, AcquisitionReport, HlsHarvester, SegmentClass};
pub use merge::{FfmpegMuxer, Muxer};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use retry::RetryPolicy;
pub use sink::{LogSink, NullSink, SharedSink, TracingSink};
