//! Core library for `ivf-vault`.
//!
//! Envelope-encrypted versioned secrets, DEK rotation and field encryption,
//! leases, dynamic database credentials with dual-slot rotation, path
//! policies, vault tokens, zero-trust and continuous access evaluation,
//! multi-provider unseal, encrypted backup and restore, and the audit and
//! SIEM event trail. This crate depends on `ivf-vault-storage` for the
//! storage backend trait and has no HTTP surface and no timers;
//! [`maintenance::Maintenance`] is the single-shot sweep a scheduler drives.

pub mod audit;
pub mod audit_file;
pub mod cae;
pub mod crypto;
pub mod db_rotation;
pub mod dek;
pub mod dr;
pub mod dynamic;
pub mod error;
pub mod kek;
pub mod kms;
pub mod lease;
pub mod maintenance;
pub mod policy;
pub mod rotation_schedule;
pub mod secret;
pub mod siem;
pub mod store;
pub mod table_source;
pub mod token;
pub mod unseal;
pub mod vault;
pub mod zero_trust;

pub use error::{ErrorKind, VaultError};
pub use vault::{Vault, VaultOptions};
