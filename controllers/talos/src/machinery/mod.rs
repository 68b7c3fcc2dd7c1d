//! Local machinery shared by the stages: PKI generation, document rendering,
//! config patches and document classification.

pub mod document;
pub mod patch;
pub mod pki;
pub mod render;

pub use document::{ConfigDocument, PLACEHOLDER_MARKER};
pub use pki::MachineSecrets;
pub use render::render;
