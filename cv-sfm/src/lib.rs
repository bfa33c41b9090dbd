//! Refinement of sparse structure-from-motion reconstructions.
//!
//! Given a directory of images and a reference model, the pipeline
//!
//! 1. extracts sparse features of every image, led by its reference observations
//!    ([`extract_features`]),
//! 2. selects the pairs of images sharing the most tracks ([`select_covisible_pairs`]),
//! 3. matches the features of those pairs ([`match_pairs`]),
//! 4. refines the model ([`Refiner::triangulate`]).
//!
//! Intermediate results are kept in a [`FeatureStore`] and a [`MatchStore`], and models are read
//! and written as COLMAP text through the [`ReconstructionStore`]. [`run_pipeline`] chains all of
//! it.

mod bicubic;
mod dense;
mod error;
mod features;
mod matching;
mod model;
mod pairs;
mod pipeline;
mod refine;
mod settings;
mod store;

pub use dense::*;
pub use error::*;
pub use features::*;
pub use matching::*;
pub use model::*;
pub use pairs::*;
pub use pipeline::*;
pub use refine::*;
pub use settings::*;
pub use store::*;
