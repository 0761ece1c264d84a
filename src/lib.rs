//! RLM Engine - sandboxed recursive execution for Recursive Language Models
//!
//! A model answers questions over inputs far larger than its context window
//! by writing code that explores the input inside a sandbox, issuing
//! recursive sub-queries, and finishing with `FINAL(...)`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rlm_engine::config::RlmConfig;
//! use rlm_engine::provider::ModelClient;
//! use rlm_engine::rlm::{ExecuteOptions, Executor};
//!
//! async fn run(client: Arc<dyn ModelClient>, input: String) -> anyhow::Result<()> {
//!     let config = RlmConfig::load().await?;
//!     let options = ExecuteOptions::from_config(&config);
//!     let executor = Executor::new(client, config);
//!     let result = executor
//!         .execute("Which services log errors?", input.into(), options)
//!         .await?;
//!     println!("{}", result.response);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod provider;
pub mod rlm;
pub mod telemetry;
