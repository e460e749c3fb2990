use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("acquisition cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("failed to fetch manifest {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("manifest exposes no segments")]
    NoSegmentsFound,

    #[error("manifest declares an encryption key and exposes no plain segments")]
    ManifestEncrypted,

    #[error(
        "content appears DRM protected ({failed}/{completed} segment jobs failed): {reason}"
    )]
    ContentDrmProtected {
        completed: usize,
        failed: usize,
        reason: String,
    },

    #[error("none of the {candidates} downloaded segments survived validation")]
    NoValidSegments { candidates: usize },

    #[error("muxer exited with {status}: {diagnostics}")]
    MergeFailed { status: String, diagnostics: String },

    #[error("muxer executable `{program}` not found")]
    MuxerNotFound { program: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },
}

/// Closed classification of terminal pipeline failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    FetchFailed,
    NoSegmentsFound,
    ManifestEncrypted,
    ContentDrmProtected,
    NoValidSegments,
    MergeFailed,
    MuxerNotFound,
    Cancelled,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchFailed => "fetch_failed",
            Self::NoSegmentsFound => "no_segments_found",
            Self::ManifestEncrypted => "manifest_encrypted",
            Self::ContentDrmProtected => "content_drm_protected",
            Self::NoValidSegments => "no_valid_segments",
            Self::MergeFailed => "merge_failed",
            Self::MuxerNotFound => "muxer_not_found",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl HarvestError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn fetch_failed(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::FetchFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn drm_protected(completed: usize, failed: usize, reason: impl Into<String>) -> Self {
        Self::ContentDrmProtected {
            completed,
            failed,
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Whether the transport layer may retry the request that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Network { source } => {
                source.is_connect() || source.is_timeout() || source.is_request()
            }
            Self::Io { .. } => true,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Configuration { .. }
            | Self::FetchFailed { .. }
            | Self::NoSegmentsFound
            | Self::ManifestEncrypted
            | Self::ContentDrmProtected { .. }
            | Self::NoValidSegments { .. }
            | Self::MergeFailed { .. }
            | Self::MuxerNotFound { .. }
            | Self::Decryption { .. } => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::FetchFailed { .. } | Self::HttpStatus { .. } | Self::Network { .. } => {
                FailureKind::FetchFailed
            }
            Self::NoSegmentsFound => FailureKind::NoSegmentsFound,
            Self::ManifestEncrypted => FailureKind::ManifestEncrypted,
            Self::ContentDrmProtected { .. } => FailureKind::ContentDrmProtected,
            Self::NoValidSegments { .. } => FailureKind::NoValidSegments,
            Self::MergeFailed { .. } => FailureKind::MergeFailed,
            Self::MuxerNotFound { .. } => FailureKind::MuxerNotFound,
            Self::Cancelled => FailureKind::Cancelled,
            Self::InvalidUrl { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Configuration { .. }
            | Self::Io { .. }
            | Self::Decryption { .. } => FailureKind::Internal,
        }
    }
}
