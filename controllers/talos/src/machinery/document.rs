//! Machine configuration documents
//!
//! A document is either `Rendered` or `Unset`. Raw input is classified once,
//! where it enters the controller; past that point nothing inspects the text
//! to decide whether it is real.

use crds::DocumentState;
use sha2::{Digest, Sha256};

/// Comment that marks a document as a template that was never filled in
pub const PLACEHOLDER_MARKER: &str = "# This should be populated";

/// A machine configuration document, or the absence of one
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigDocument {
    /// No usable document: missing, empty or still a placeholder
    #[default]
    Unset,
    /// A complete document
    Rendered(String),
}

impl ConfigDocument {
    /// Classify raw input
    pub fn classify(raw: Option<&str>) -> Self {
        match raw {
            Some(text) if !text.trim().is_empty() && !text.contains(PLACEHOLDER_MARKER) => {
                Self::Rendered(text.to_string())
            }
            _ => Self::Unset,
        }
    }

    /// The document text, if rendered
    pub fn rendered(&self) -> Option<&str> {
        match self {
            Self::Rendered(text) => Some(text),
            Self::Unset => None,
        }
    }

    /// State to record alongside the document
    pub fn state(&self) -> DocumentState {
        match self {
            Self::Rendered(_) => DocumentState::Rendered,
            Self::Unset => DocumentState::Unset,
        }
    }

    /// Hex SHA-256 of the document text, if rendered
    pub fn digest(&self) -> Option<String> {
        self.rendered().map(digest)
    }
}

/// Hex SHA-256 of a document
pub fn digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}
