//! kfold schema: patch metadata from the server's OpenAPI document and the
//! three-way patch algorithm built on it.

#![forbid(unsafe_code)]

mod openapi;
mod patch;

pub use openapi::{ListStrategy, NoPatchMeta, PatchMeta, SchemaIndex};
pub use patch::{apply_patch, apply_strategic, three_way, DELETE_FROM_PRIMITIVE_LIST, PATCH_DIRECTIVE};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("openapi document has no definitions")]
    NoDefinitions,
}
