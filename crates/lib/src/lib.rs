//! Perch core library: Messages API client, SSE decoding, tool dispatch, history and the
//! conversation orchestrator shared by the CLI and desktop applications.

pub mod config;
pub mod exec;
pub mod history;
pub mod init;
pub mod llm;
pub mod orchestrator;
pub mod stream;
pub mod tools;
