//! The forward/reverse policy layer: wraps the raw codec with the
//! local-domain exemption and the optional alias-store indirection.
//! `Ok(None)` means "leave the address unchanged", not a failure - the
//! caller (socketmap responder or milter hook) treats it exactly like a
//! cache miss.

use std::time::Duration;

use store::AliasStore;

use crate::codec::{is_srs_address, Srs};
use crate::domain::DomainTrie;
use crate::error::SrsError;

/// The literal host part of an alias-store indirection address
/// (`<key>@1`), matching `SRS_IS_SRS_ADDRESS`'s sibling convention in the
/// reference `postsrsd_reverse`, which tests the reversed address's host
/// for the literal string `"1"`.
const ALIAS_HOST: &str = "1";

/// Rewrites `sender`'s envelope-from for outbound forwarding. Returns
/// `Ok(None)` when `sender`'s domain is a member of `local_domains` - mail
/// that originates locally rather than being relayed through never needs
/// rewriting, regardless of `always_rewrite` (that flag only controls
/// whether an address already in `srs_domain` itself passes through
/// unchanged, a narrower and separate check made inside [`Srs::forward`]).
pub async fn forward(
    sender: &str,
    srs_domain: &str,
    srs: &Srs,
    store: Option<&dyn AliasStore>,
    local_domains: &DomainTrie,
    now: u64,
) -> Result<Option<String>, SrsError> {
    let Some((_user, domain)) = sender.split_once('@') else {
        return Err(SrsError::MissingDomain);
    };

    if local_domains.contains_suffix(domain) {
        return Ok(None);
    }

    // Only addresses not already carrying an SRS cookie get aliased - an
    // address crossing a second forwarder is wrapped in SRS1 directly,
    // never indirected through the alias store a second time.
    let address_to_wrap = if let (Some(store), false) = (store, is_srs_address(sender)) {
        let key = store_original(store, sender, Duration::from_secs(srs.max_age_days as u64 * 86_400)).await?;
        format!("{key}@{ALIAS_HOST}")
    } else {
        sender.to_string()
    };

    let wrapped = srs.forward(now, srs_domain, &address_to_wrap)?;
    Ok(Some(wrapped))
}

/// Reverses `recipient`'s SRS wrapping back to the true original recipient.
/// Returns `Ok(None)` when `recipient` carries no SRS cookie at all - it was
/// never one of ours to begin with.
pub async fn reverse(
    recipient: &str,
    srs: &Srs,
    store: Option<&dyn AliasStore>,
    now: u64,
) -> Result<Option<String>, SrsError> {
    let unwrapped = match srs.reverse(now, recipient) {
        Ok(address) => address,
        Err(SrsError::NotSrsAddress) => return Ok(None),
        Err(e) => return Err(e),
    };

    let (key, host) = unwrapped.split_once('@').ok_or(SrsError::MissingDomain)?;
    if host != ALIAS_HOST {
        return Ok(Some(unwrapped));
    }

    match store {
        Some(store) => {
            let full_key = format!("{key}@{ALIAS_HOST}").to_ascii_uppercase();
            let original = store
                .get(&full_key)
                .await
                .map_err(|e| SrsError::StoreLookupFailed(e.to_string()))?
                .ok_or(SrsError::StoreKeyNotFound)?;
            Ok(Some(original))
        }
        None => Err(SrsError::NoDatabaseForAlias),
    }
}

/// Stores `address` under its base32hex(SHA1) key and returns the key, for
/// the `original-envelope = database` indirection mode. The key is
/// deterministic in `address` alone (not time-salted), so a repeated
/// rewrite of the same address just refreshes the existing row's TTL via
/// the backend's replace-on-conflict write, matching `database_write`.
async fn store_original(store: &dyn AliasStore, address: &str, ttl: Duration) -> Result<String, SrsError> {
    use sha1::{Digest, Sha1};

    let digest = Sha1::digest(address.as_bytes());
    let key = crate::alphabet::base32hex_encode(&digest);

    store
        .put(&format!("{key}@{ALIAS_HOST}").to_ascii_uppercase(), address, ttl)
        .await
        .map_err(|e| SrsError::StoreLookupFailed(e.to_string()))?;
    Ok(key)
}
