//! Collaborator capabilities for callers: persistence and payload codecs.
//! Nothing in `core` depends on these.

pub mod codec;
pub mod repository;

pub use codec::{Base64Codec, CodecError, CodecRegistry, IdentityCodec, PayloadCodec};
pub use repository::{Entity, InMemoryRepository, Repository, RepositoryError};
