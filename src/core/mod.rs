//! Core orchestration logic: types, parsing, ordering, rendering, execution.

pub mod backend;
pub mod codegen;
pub mod copier;
pub mod env;
pub mod error;
pub mod executor;
pub mod hasher;
pub mod hooks;
pub mod parser;
pub mod reference;
pub mod renderer;
pub mod resolver;
pub mod retry;
pub mod template;
pub mod terraform;
pub mod types;
pub mod workspace;
