//! Combined-scan processing: render, segment, extract identities, match
//! against the roster, split, aggregate presence and bundle for review.

pub mod bundle;
pub mod extract;
pub mod matcher;
pub mod presence;
pub mod render;
pub mod roster;
pub mod run;
pub mod segment;
pub mod split;

pub use run::{Collaborators, run_job};
