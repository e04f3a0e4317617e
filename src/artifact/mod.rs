//! Per-tenant search artifacts: an ordered metadata list paired with a
//! vector index, kept equal in length.

pub mod index;
pub mod store;
pub mod updater;

pub use index::{FlatIndex, VectorIndex};
pub use store::{Artifact, ArtifactEntry, ArtifactStore, FsArtifactStore};
pub use updater::{ArtifactUpdater, SearchHit};
