//! Model components.
//!
//! ## Components
//!
//! - [`stages`] — stage layout: resolutions, ranges, level index
//! - [`embed`] — class conditioning, start tokens, position/level embeddings
//! - [`transformer`] — the block stack, attention with KV cache, causal stage mask
//! - [`head`] — adaptive norm + vocabulary projection
//! - [`var`] — the assembled model and teacher forcing
//! - [`generation`] — guided stage-by-stage sampling

pub mod embed;
pub mod generation;
pub mod head;
pub mod stages;
pub mod transformer;
pub mod var;

pub use generation::{Generation, GenerationParams, LabelSpec, OutputMode};
pub use stages::StageLayout;
pub use var::VarModel;
