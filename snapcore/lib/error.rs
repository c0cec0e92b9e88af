use std::{
    error::Error,
    fmt::{self, Display},
};

use snaputils::UtilsError;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a snapshotter-related operation.
pub type SnapshotterResult<T> = Result<T, SnapshotterError>;

/// An error that occurred while orchestrating daemons, mounts or block-mode layers.
#[derive(pretty_error_debug::Debug, Error)]
pub enum SnapshotterError {
    /// The requested daemon, instance or snapshot does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record for the same key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A daemon or snapshot did not reach the expected state in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The content hash of a layer did not match the expected digest.
    #[error("content digest mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// The digest advertised by the image.
        expected: String,

        /// The digest computed over the received content.
        actual: String,
    },

    /// A remote source failed or returned an unusable response.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A daemon control endpoint reported an error.
    #[error("daemon api error (code {code}): {message}")]
    DaemonApi {
        /// The error code reported by the daemon.
        code: String,

        /// The error message reported by the daemon.
        message: String,
    },

    /// An argument or label was missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The configuration failed validation.
    #[error("config validation errors: {0:?}")]
    ConfigValidation(Vec<String>),

    /// An external tool exited unsuccessfully.
    #[error("command `{command}` failed with {status}: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,

        /// The exit status.
        status: String,

        /// Captured standard error output.
        stderr: String,
    },

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from a system call.
    #[error("system call error: {0}")]
    Nix(#[from] nix::Error),

    /// An error from the utilities crate.
    #[error("utils error: {0}")]
    Utils(#[from] UtilsError),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// An OCI specification error.
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// An image reference could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error.
    #[error("database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error on the daemon control connection.
    #[error("daemon connection error: {0}")]
    Hyper(#[from] hyper::Error),

    /// A malformed HTTP request was built.
    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotterError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SnapshotterError {
        SnapshotterError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns `true` if the error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            SnapshotterError::NotFound(_) => true,
            SnapshotterError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            SnapshotterError::Nix(e) => *e == nix::Error::ENOENT,
            _ => false,
        }
    }

    /// Returns `true` if the error means the target already exists.
    pub fn is_already_exists(&self) -> bool {
        match self {
            SnapshotterError::AlreadyExists(_) => true,
            SnapshotterError::Io(e) => e.kind() == std::io::ErrorKind::AlreadyExists,
            SnapshotterError::Nix(e) => *e == nix::Error::EEXIST,
            _ => false,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `SnapshotterResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> SnapshotterResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
