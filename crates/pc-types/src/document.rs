use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::ids::DocumentId;

pub const MAX_INLINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentSource {
    Stored {
        repository: String,
        git_ref: String,
        path: String,
    },
    Inline {
        content: Vec<u8>,
        filename: String,
        mime: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: DocumentId,
    pub source: DocumentSource,
    pub content_hash: Option<String>,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(source: DocumentSource, display_name: Option<String>) -> Result<Self, TypeError> {
        let content_hash = match &source {
            DocumentSource::Inline { content, .. } => {
                if content.len() > MAX_INLINE_BYTES {
                    return Err(TypeError::Validation(format!(
                        "inline document content exceeds {MAX_INLINE_BYTES} bytes"
                    )));
                }
                Some(sha256_hex(content))
            }
            DocumentSource::Stored { .. } => None,
        };
        let display_name = display_name.unwrap_or_else(|| default_display_name(&source));
        Ok(Self {
            document_id: DocumentId::new(),
            source,
            content_hash,
            display_name,
            created_at: Utc::now(),
        })
    }
}

fn default_display_name(source: &DocumentSource) -> String {
    match source {
        DocumentSource::Stored { path, .. } => path
            .rsplit('/')
            .next()
            .unwrap_or(path)
            .to_string(),
        DocumentSource::Inline { filename, .. } => filename.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunDocumentStatus {
    Pending,
    Processing,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    pub run_id: crate::ids::RunId,
    pub document_id: DocumentId,
    pub status: RunDocumentStatus,
    pub sort_order: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_over_size_limit_is_rejected() {
        let source = DocumentSource::Inline {
            content: vec![0u8; MAX_INLINE_BYTES + 1],
            filename: "big.md".into(),
            mime: "text/markdown".into(),
        };
        assert!(Document::new(source, None).is_err());
    }

    #[test]
    fn inline_document_gets_a_content_hash_and_default_display_name() {
        let source = DocumentSource::Inline {
            content: b"hello".to_vec(),
            filename: "hello.md".into(),
            mime: "text/markdown".into(),
        };
        let doc = Document::new(source, None).unwrap();
        assert!(doc.content_hash.is_some());
        assert_eq!(doc.display_name, "hello.md");
    }

    #[test]
    fn stored_document_defaults_display_name_from_path() {
        let source = DocumentSource::Stored {
            repository: "org/repo".into(),
            git_ref: "main".into(),
            path: "docs/spec.md".into(),
        };
        let doc = Document::new(source, None).unwrap();
        assert_eq!(doc.display_name, "spec.md");
        assert!(doc.content_hash.is_none());
    }
}
