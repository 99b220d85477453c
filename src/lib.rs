//! # Citadel Keyring
//!
//! Key ring management for data protection: decides which key protects new
//! payloads, rotates keys before they expire, and keeps the current key ring
//! cached so hot paths never wait on storage.
//!
//! ## Quick Start
//!
//! ```rust
//! use citadel_keyring::{InMemoryKeyRepository, KeyManagementOptions, KeyRingProvider};
//! use std::sync::Arc;
//!
//! let repository = Arc::new(InMemoryKeyRepository::new());
//! let provider = KeyRingProvider::with_repository(repository, KeyManagementOptions::default()).unwrap();
//!
//! // First call generates a key (the repository is empty) and caches the ring.
//! let ring = provider.current_key_ring().unwrap();
//!
//! let encryptor = ring.default_authenticated_encryptor().unwrap();
//! let sealed = encryptor.encrypt(b"secret", b"purpose").unwrap();
//!
//! let (by_id, revoked) = ring.get_encryptor_by_key_id(&ring.default_key_id()).unwrap().unwrap();
//! assert!(!revoked);
//! assert_eq!(by_id.decrypt(&sealed, b"purpose").unwrap(), b"secret");
//! ```
//!
//! ## Pieces
//!
//! - [`PolicyResolver`]: picks the default key and says when a new one is due
//! - [`KeyRing`]: immutable snapshot; encryptors are built once per key, on demand
//! - [`CacheableKeyRing`]: a ring plus its expiry time and invalidation token
//! - [`KeyRingProvider`]: lock-free reads, single-flight refresh, stale reads during refresh
//! - [`KeyRepository`]: storage seam, with [`InMemoryKeyRepository`] for tests
//!
//! ## What's NOT Provided
//!
//! - Payload framing (key id headers) or a protect/unprotect API
//! - Durable key storage or key escrow

#![deny(unsafe_code)]

pub mod cacheable;
pub mod encryptor;
pub mod error;
pub mod key;
pub mod key_ring;
pub mod options;
pub mod provider;
pub mod repository;
pub mod resolver;
pub mod types;

// Re-export main types for convenience
pub use cacheable::{CacheableKeyRing, ExpirationToken};
pub use encryptor::{Aes256GcmDescriptor, Aes256GcmEncryptor, AuthenticatedEncryptor, EncryptorDescriptor};
pub use error::{EncryptorError, KeyRingError, RepositoryError};
pub use key::Key;
pub use key_ring::KeyRing;
pub use options::KeyManagementOptions;
pub use provider::{CacheableKeyRingSource, KeyRingFactory, KeyRingProvider};
pub use repository::{InMemoryKeyRepository, KeyRepository};
pub use resolver::{DefaultKeyResolution, DefaultKeyResolver, PolicyResolver};
pub use types::KeyId;
