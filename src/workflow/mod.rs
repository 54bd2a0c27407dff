//! Workflow definitions: wire format, parsing, graph, validation.
//!
//! A definition is a flat list of typed steps plus an implicit `start`
//! step. Steps link through `next.default` and, for branching kinds,
//! `next.alternative`.

mod cache;
mod graph;
mod parser;
mod types;
mod validator;

pub use cache::DefinitionCache;
pub use graph::StepGraph;
pub use parser::{parse_definition, parse_definition_file};
pub use types::*;
pub use validator::{ensure_publishable, validate, validate_definition, ValidationError};
