//! Building and reading API vault entries through a [`SecretCipher`].

use crate::crypto::{CryptoError, SecretCipher};
use crate::model::{Patch, VaultEntry};

pub const NO_EXPIRY: &str = "No Expiry";

/// A patch for a new vault entry holding `secret` encrypted.
pub fn seal_entry(
    cipher: &dyn SecretCipher,
    service_name: &str,
    secret: &str,
    expiry_date: Option<&str>,
) -> Result<Patch, CryptoError> {
    Ok(Patch::with_new_id()
        .set("service_name", service_name)
        .set("encrypted_key", cipher.encrypt(secret)?)
        .set("expiry_date", expiry_date.unwrap_or(NO_EXPIRY)))
}

/// Replace the secret of an existing entry.
pub fn rotate_secret(
    cipher: &dyn SecretCipher,
    entry_id: &str,
    secret: &str,
) -> Result<Patch, CryptoError> {
    Ok(Patch::new(entry_id).set("encrypted_key", cipher.encrypt(secret)?))
}

pub fn reveal(cipher: &dyn SecretCipher, entry: &VaultEntry) -> Result<String, CryptoError> {
    cipher.decrypt(&entry.encrypted_key)
}
