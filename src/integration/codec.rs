use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("no codec registered as '{0}'")]
    UnknownCodec(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Reversible payload transform applied by callers before publish and after
/// consume. Payloads stay opaque to the broker.
pub trait PayloadCodec: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn encode(&self, plain: &[u8]) -> Result<Bytes, CodecError>;

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

impl PayloadCodec for IdentityCodec {
    fn name(&self) -> &str {
        "identity"
    }

    fn encode(&self, plain: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(plain))
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(encoded))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Base64Codec;

impl PayloadCodec for Base64Codec {
    fn name(&self) -> &str {
        "base64"
    }

    fn encode(&self, plain: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(STANDARD.encode(plain)))
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes, CodecError> {
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Named codecs, so several schemes can be in use at once.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: DashMap<String, Arc<dyn PayloadCodec>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `identity` and `base64`.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(IdentityCodec));
        registry.register(Arc::new(Base64Codec));
        registry
    }

    /// Registers `codec` under its own name, returning the codec it replaced.
    pub fn register(&self, codec: Arc<dyn PayloadCodec>) -> Option<Arc<dyn PayloadCodec>> {
        self.codecs.insert(codec.name().to_string(), codec)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PayloadCodec>, CodecError> {
        self.codecs
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CodecError::UnknownCodec(name.to_string()))
    }

    pub fn encode(&self, name: &str, plain: &[u8]) -> Result<Bytes, CodecError> {
        self.get(name)?.encode(plain)
    }

    pub fn decode(&self, name: &str, encoded: &[u8]) -> Result<Bytes, CodecError> {
        self.get(name)?.decode(encoded)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names())
            .finish()
    }
}
