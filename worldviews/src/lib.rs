// Library interface for worldviews modules
// This allows tests and the binary to import modules

pub mod cache;
pub mod content;
pub mod dispatcher;
pub mod events;
pub mod generator;
pub mod ingestion;
pub mod llm;
pub mod models;
pub mod news_api;
pub mod prompts;
pub mod scraping;
pub mod storage;
pub mod worker;
