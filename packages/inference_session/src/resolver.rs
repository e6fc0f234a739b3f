//! Model reference resolution.
//!
//! Turns the caller's model reference into a readable byte source for the
//! engine. The source is owned by the load path and closed once the engine
//! load returns.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SessionError;

const CONTENT_SCHEME: &str = "content://";
const FILE_SCHEME: &str = "file://";

/// A model reference: a filesystem path or a content-style handle
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModelReference {
    Path(PathBuf),
    /// Opaque provider-backed reference, kept verbatim
    Content(String),
}

impl ModelReference {
    /// `content://` references are kept as-is, `file://` is stripped to a path.
    pub fn parse(reference: &str) -> Self {
        if reference.starts_with(CONTENT_SCHEME) {
            ModelReference::Content(reference.to_string())
        } else {
            let path = reference.strip_prefix(FILE_SCHEME).unwrap_or(reference);
            ModelReference::Path(PathBuf::from(path))
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(self, ModelReference::Content(_))
    }

    /// Memory mapping only makes sense for plain files
    pub fn supports_mmap(&self) -> bool {
        !self.is_content()
    }
}

impl fmt::Display for ModelReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelReference::Path(path) => write!(f, "{}", path.display()),
            ModelReference::Content(uri) => write!(f, "{}", uri),
        }
    }
}

/// Readable model bytes handed to the engine
pub enum ModelSource {
    File { path: PathBuf, file: File },
    Reader(Box<dyn Read + Send>),
}

impl ModelSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ModelSource::File { path, .. } => Some(path),
            ModelSource::Reader(_) => None,
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::File { path, .. } => f.debug_struct("File").field("path", path).finish(),
            ModelSource::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Capability that opens model references
pub trait ModelResolver: Send + Sync + 'static {
    fn resolve(&self, reference: &ModelReference) -> Result<ModelSource, SessionError>;
}

/// Resolves plain filesystem paths; has no content provider.
#[derive(Clone, Debug, Default)]
pub struct FsResolver;

impl ModelResolver for FsResolver {
    fn resolve(&self, reference: &ModelReference) -> Result<ModelSource, SessionError> {
        match reference {
            ModelReference::Path(path) => {
                debug!("Opening model file {}", path.display());
                let file = File::open(path).map_err(|e| SessionError::Resolve {
                    reference: reference.to_string(),
                    message: e.to_string(),
                    source: Some(e),
                })?;
                Ok(ModelSource::File {
                    path: path.clone(),
                    file,
                })
            }
            ModelReference::Content(uri) => Err(SessionError::Resolve {
                reference: uri.clone(),
                message: "no content provider registered".to_string(),
                source: None,
            }),
        }
    }
}
