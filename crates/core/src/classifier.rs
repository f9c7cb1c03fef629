//! Dataset classification hook.
//!
//! The orchestrator asks the classifier for a coarse dataset type once, when
//! new content is admitted. Duplicates reuse the type already stored on the
//! job they resolve to.

use std::path::Path;

use crate::job::JobMetadata;

/// Assigns a coarse dataset type to an upload.
pub trait Classifier: Send + Sync {
    /// Returns the dataset type, or `None` if the upload is not recognised.
    fn classify(&self, metadata: &JobMetadata) -> Option<String>;
}

/// Classifies uploads by file extension.
#[derive(Debug, Clone, Default)]
pub struct ExtensionClassifier;

impl ExtensionClassifier {
    pub fn new() -> Self {
        Self
    }
}

impl Classifier for ExtensionClassifier {
    fn classify(&self, metadata: &JobMetadata) -> Option<String> {
        let ext = Path::new(&metadata.original_filename)
            .extension()?
            .to_str()?
            .to_ascii_lowercase();

        match ext.as_str() {
            "csv" => Some("csv".to_string()),
            "xlsx" | "xls" => Some("excel".to_string()),
            _ => None,
        }
    }
}
