//! Error types for the stargz-fetch library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, StargzError>`. Every variant maps to a stable machine-readable
//! code via [`StargzError::code`], and variants that wrap a lower-level
//! failure expose it through `std::error::Error::source`, so callers can walk
//! the full cause chain while matching on the domain code.
//!
//! # Error Categories
//!
//! - **Lookup errors**: [`BlobNotFound`], [`UnknownBlob`], [`FileNotFound`]
//! - **Input validation**: [`InvalidDigest`], [`InvalidImageRef`]
//! - **TOC decoding**: [`InvalidFooter`], [`TocDecode`], [`TocDownload`]
//! - **Registry access**: [`ManifestFetch`], [`RangeRequest`], [`Network`]
//! - **Authentication**: [`AuthRequired`], [`AuthUnsupported`], [`AuthFailed`]
//! - **Downloads**: [`DownloadFailed`], [`Io`]
//!
//! [`BlobNotFound`]: StargzError::BlobNotFound
//! [`UnknownBlob`]: StargzError::UnknownBlob
//! [`FileNotFound`]: StargzError::FileNotFound
//! [`InvalidDigest`]: StargzError::InvalidDigest
//! [`InvalidImageRef`]: StargzError::InvalidImageRef
//! [`InvalidFooter`]: StargzError::InvalidFooter
//! [`TocDecode`]: StargzError::TocDecode
//! [`TocDownload`]: StargzError::TocDownload
//! [`ManifestFetch`]: StargzError::ManifestFetch
//! [`RangeRequest`]: StargzError::RangeRequest
//! [`Network`]: StargzError::Network
//! [`AuthRequired`]: StargzError::AuthRequired
//! [`AuthUnsupported`]: StargzError::AuthUnsupported
//! [`AuthFailed`]: StargzError::AuthFailed
//! [`DownloadFailed`]: StargzError::DownloadFailed
//! [`Io`]: StargzError::Io

/// Boxed error used as the cause in wrapping variants.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for operations that may return a [`StargzError`].
pub type Result<T> = std::result::Result<T, StargzError>;

/// Error type for stargz-fetch operations.
#[derive(Debug, thiserror::Error)]
pub enum StargzError {
    /// The requested blob digest is not part of the image manifest.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// A blob digest was passed that the storage snapshot does not know.
    #[error("unknown blob: {digest}")]
    UnknownBlob { digest: String },

    /// The requested file has no `reg` entry in the layer TOC.
    #[error("file not found: {path}")]
    FileNotFound { path: String },

    /// A digest string does not have the `algorithm:hex` shape.
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// An image reference could not be parsed as `host[:port]/repo[:tag]`.
    #[error("invalid image reference: {reference}")]
    InvalidImageRef { reference: String },

    /// Neither the modern nor the legacy eStargz footer layout matched.
    #[error("failed to parse eStargz footer")]
    InvalidFooter,

    /// The TOC section could not be decoded (gzip, tar, or JSON corruption).
    #[error("failed to decode TOC")]
    TocDecode {
        #[source]
        source: BoxedError,
    },

    /// Fetching or decoding the TOC of a specific blob failed.
    #[error("failed to download TOC for blob {digest}")]
    TocDownload {
        digest: String,
        #[source]
        source: BoxedError,
    },

    /// The image manifest is empty: it lists no layer blobs.
    #[error("image has no layer blobs")]
    EmptyImage,

    /// Fetching the image manifest failed.
    #[error("failed to fetch manifest for {image_ref}")]
    ManifestFetch {
        image_ref: String,
        #[source]
        source: BoxedError,
    },

    /// The registry demands Basic authentication but no credential is configured.
    #[error("registry requires basic auth but no credentials provided")]
    AuthRequired,

    /// The registry answered with an authentication scheme we do not speak.
    #[error("unsupported auth scheme: {scheme}")]
    AuthUnsupported { scheme: String },

    /// The authentication handshake itself failed (token endpoint, decoding).
    #[error("authentication failed")]
    AuthFailed {
        #[source]
        source: BoxedError,
    },

    /// A ranged blob request returned an unexpected HTTP status.
    #[error("range request failed with status {status}")]
    RangeRequest { status: u16 },

    /// A transport-level failure talking to the registry.
    #[error("network error")]
    Network {
        #[source]
        source: BoxedError,
    },

    /// A per-file download attempt failed.
    #[error("download failed: {path}")]
    DownloadFailed {
        path: String,
        #[source]
        source: BoxedError,
    },

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StargzError {
    /// Stable machine-readable code for this error.
    ///
    /// Several variants share a code: the code identifies the operation that
    /// failed as seen by a caller, while the variant carries the precise
    /// failure site.
    pub fn code(&self) -> &'static str {
        use StargzError::*;
        match self {
            BlobNotFound { .. } | UnknownBlob { .. } => "BLOB_NOT_FOUND",
            FileNotFound { .. } => "FILE_NOT_FOUND",
            InvalidDigest { .. } => "INVALID_DIGEST",
            InvalidImageRef { .. } => "INVALID_IMAGE_REF",
            ManifestFetch { .. } | EmptyImage => "MANIFEST_FETCH_FAILED",
            InvalidFooter | TocDecode { .. } | TocDownload { .. } => "TOC_DOWNLOAD_FAILED",
            AuthRequired | AuthUnsupported { .. } | AuthFailed { .. } => "AUTH_FAILED",
            RangeRequest { .. } | Network { .. } | DownloadFailed { .. } | Io(_) => {
                "DOWNLOAD_FAILED"
            }
        }
    }
}

/// Build a [`BoxedError`] from a plain message.
pub(crate) fn message(msg: impl Into<String>) -> BoxedError {
    msg.into().into()
}
