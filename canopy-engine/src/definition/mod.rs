// Definition Module
// YAML pipeline definitions and their translation into node trees

pub mod models;
pub mod parser;

pub use models::{NodeBody, NodeSpec};
pub use parser::{Definition, DefinitionParser};

use crate::error::{ExpansionError, TreeError};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading a pipeline definition
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid node at '{path}': {message}")]
    Invalid { path: String, message: String },

    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl From<DefinitionError> for ExpansionError {
    fn from(err: DefinitionError) -> Self {
        ExpansionError::new(err.to_string())
    }
}
