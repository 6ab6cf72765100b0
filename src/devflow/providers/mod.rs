// src/devflow/providers/mod.rs

pub mod common;
pub mod lmstudio;
pub mod ollama;

pub use lmstudio::LmStudioProvider;
pub use ollama::OllamaProvider;
