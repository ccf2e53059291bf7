//! Class-conditional image-token generation by next-scale prediction, in pure Rust.
//!
//! A candle-based implementation of the VAR model: a transformer predicts a
//! pyramid of codebook indices coarse to fine, one whole resolution per
//! step, with classifier-free guidance. Loads safetensors weights directly.
//!
//! ## Architecture
//!
//! ```text
//! class label ─▶ class embedding ─▶ start tokens (stage 0)
//!                       │
//!                       ▼ (AdaLN conditioning)
//!            transformer stack (KV cache) ─▶ head ─▶ logits
//!                       ▲                              │
//!   word_embed + lvl_pos│                              ▼ guided sampling
//!                       │                         stage indices
//!              codebook next_stage_input ◀────── codebook embed
//! ```
//!
//! ## Modules
//!
//! - [`config`] — model and codebook configuration
//! - [`model`] — stage layout, embeddings, transformer, head, generation
//! - [`codebook`] — codebook trait, multi-scale vector quantizer, resampling
//! - [`sampling`] — top-k/top-p restriction, categorical and Gumbel sampling
//! - [`manager`] — queue serializing generation requests onto one model

pub mod codebook;
pub mod config;
pub mod manager;
pub mod model;
pub mod sampling;

mod error;

pub use error::{Error, Result};
