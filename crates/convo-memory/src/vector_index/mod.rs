//! Vector index management: per-conversation ANN structures, their on-disk
//! artifacts, and model migration.

pub mod artifact;
pub mod index;
pub mod manager;
pub mod migration;

pub use artifact::IndexArtifact;
pub use index::{cosine_distance, ConversationIndex, HnswSettings};
pub use manager::{IndexSlot, VectorIndexManager};
pub use migration::{MigrationReport, MigrationRunner};
