// HLS acquisition pipeline: resolve, collect, fetch, classify

pub mod classifier;
pub mod collector;
mod coordinator;
pub mod fetcher;
pub mod manifest;
pub mod playlist;
mod tally;

// Re-exports for easier access
pub use classifier::{DisguiseKind, ImageFormat, SegmentClass, SegmentClassifier};
pub use collector::{SegmentCollector, SegmentReference, SegmentSet};
pub use coordinator::{AcquisitionOutcome, AcquisitionReport, HlsHarvester};
pub use fetcher::{
    FetchJob, FetchReport, HttpSegmentDownloader, ParallelSegmentFetcher, SegmentDownloader,
    SegmentFile, SegmentOutcome,
};
pub use manifest::Manifest;
pub use playlist::{HttpManifestSource, ManifestSource, PlaylistResolver, ResolvedPlaylist};
pub use tally::{AbortPolicy, FetchTally, TallySnapshot};
