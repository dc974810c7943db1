use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error types for the repo-digest library.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// IO error with context about the file path.
    #[error("IO error accessing '{path}': {message}")]
    Io {
        /// Path where the error occurred
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration: {message}")]
    Config {
        /// Detailed error message
        message: String,
    },

    /// A repository path cannot be turned into tree segments.
    #[error("Invalid repository path '{path}': {reason}")]
    InvalidPath {
        /// The offending path
        path: String,
        /// Reason why it was rejected
        reason: String,
    },

    /// The same path is both a file and a directory.
    #[error("Path '{path}' is used both as a file and as a directory")]
    PathConflict {
        /// Path of the conflicting node
        path: String,
    },

    /// No processable files found in directory.
    #[error("No processable files found in '{path}'. Check .gitignore rules or file permissions.")]
    NoFiles {
        /// Directory that was scanned
        path: PathBuf,
    },

    /// Invalid UTF-8 encountered in file.
    #[error("Invalid UTF-8 encoding in file '{path}'. File may be binary or use unsupported encoding.")]
    InvalidUtf8 {
        /// Path to file with encoding issues
        path: PathBuf,
    },

    /// A chat model call failed.
    #[error("LLM provider '{provider}' failed: {message}")]
    Llm {
        /// Name of the provider
        provider: String,
        /// Error message
        message: String,
    },

    /// Summarizing a directory failed; the whole reduction pass is aborted.
    #[error("Failed to summarize '{path}': {message}")]
    Summarization {
        /// Directory whose group could not be summarized
        path: String,
        /// Underlying error message
        message: String,
    },

    /// The model's final answer could not be parsed as JSON.
    #[error("Failed to parse model response: {message}")]
    Parse {
        /// Error message
        message: String,
    },

    /// The parsed answer does not match the analysis schema.
    #[error("Model response does not match the analysis schema: {message}")]
    SchemaMismatch {
        /// Error message
        message: String,
    },

    /// The retrieval index was queried before documents were added.
    #[error("Retrieval index has not been initialized with documents")]
    IndexNotInitialized,

    /// The retrieval index was populated twice.
    #[error("Retrieval index is already initialized")]
    IndexAlreadyInitialized,

    /// Template rendering error.
    #[error("Failed to render template '{template}': {message}")]
    Template {
        /// Template name
        template: String,
        /// Error message
        message: String,
    },

    /// JSON serialization error.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// System time error.
    #[error("System time error: {message}")]
    SystemTime {
        /// Error message
        message: String,
    },
}

impl Error {
    /// Creates an IO error with path context.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: source.to_string(),
        }
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid path error.
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a template error.
    #[must_use]
    pub fn template(template: impl Into<String>, source: tera::Error) -> Self {
        Self::Template {
            template: template.into(),
            message: source.to_string(),
        }
    }

    /// Creates a template error for a template rejected before rendering.
    #[must_use]
    pub fn template_validation(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid UTF-8 error.
    #[must_use]
    pub fn invalid_utf8(path: impl Into<PathBuf>) -> Self {
        Self::InvalidUtf8 { path: path.into() }
    }

    /// Creates a no files error.
    #[must_use]
    pub fn no_files(path: impl Into<PathBuf>) -> Self {
        Self::NoFiles { path: path.into() }
    }

    /// Creates an LLM provider error.
    #[must_use]
    pub fn llm(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Llm {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Creates a parse error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a schema mismatch error.
    #[must_use]
    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    /// Returns true if this is an IO error.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if the final answer could not be parsed or validated.
    #[must_use]
    pub const fn is_parse(&self) -> bool {
        matches!(self, Self::Parse { .. } | Self::SchemaMismatch { .. })
    }
}

// Conversion implementations for convenient error handling
impl From<std::time::SystemTimeError> for Error {
    fn from(e: std::time::SystemTimeError) -> Self {
        Self::SystemTime {
            message: e.to_string(),
        }
    }
}

impl From<tera::Error> for Error {
    fn from(e: tera::Error) -> Self {
        Self::Template {
            template: "unknown".to_string(),
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
