//! Compilation inputs and path safety.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use crate::error::{WorkerError, WorkerResult};
use crate::fingerprint;

/// One input file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    /// UTF-8 text (sources).
    Text(String),
    /// Opaque bytes (images, fonts).
    Binary(Vec<u8>),
}

impl FileContent {
    /// The raw bytes, whichever variant.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

/// The full input set for one build.
///
/// Files are kept in a sorted map so fingerprinting is independent of
/// the order callers added them.
#[derive(Debug, Clone)]
pub struct CompileInput {
    /// Engine selector (opaque; resolved against the engine table).
    pub engine: String,
    /// Entry point file name.
    pub entry: String,
    /// Relative path → content.
    pub files: BTreeMap<String, FileContent>,
}

impl CompileInput {
    /// Create an input set with no files yet.
    ///
    /// # Errors
    ///
    /// [`WorkerError::UnsafePath`] if the entry name itself is unsafe.
    pub fn new(engine: impl Into<String>, entry: impl Into<String>) -> WorkerResult<Self> {
        let entry = entry.into();
        validate_path(&entry)?;
        Ok(Self {
            engine: engine.into(),
            entry,
            files: BTreeMap::new(),
        })
    }

    /// Add one file, validating its path.
    ///
    /// # Errors
    ///
    /// [`WorkerError::UnsafePath`] for absolute paths, `..` components,
    /// or empty names.
    pub fn add_file(
        &mut self,
        path: impl Into<String>,
        content: FileContent,
    ) -> WorkerResult<&mut Self> {
        let path = path.into();
        validate_path(&path)?;
        self.files.insert(path, content);
        Ok(self)
    }

    /// The SHA-256 content fingerprint of this input set.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.engine, &self.entry, &self.files)
    }
}

/// Reject paths that could write outside the scratch tree.
///
/// Path names containing `..` or absolute prefixes are rejected rather
/// than stripped, so a hostile path never silently maps onto a different
/// file.
pub(crate) fn validate_path(path: &str) -> WorkerResult<()> {
    if path.is_empty() || path.contains('\0') {
        return Err(WorkerError::UnsafePath(path.to_owned()));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(WorkerError::UnsafePath(path.to_owned()));
    }
    for component in p.components() {
        match component {
            Component::Normal(_) => {},
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(WorkerError::UnsafePath(path.to_owned()));
            },
        }
    }
    Ok(())
}
