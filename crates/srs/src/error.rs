use thiserror::Error;

/// Every way an SRS address can fail to parse or verify, mirroring the
/// `SRS_E*` taxonomy from the reference implementation's error codes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SrsError {
    #[error("address does not carry an SRS cookie")]
    NotSrsAddress,
    #[error("SRS0 address is missing its hash field")]
    NoSrsHash,
    #[error("SRS0 address hash does not verify")]
    WrongHash,
    #[error("SRS0 hash is shorter than the configured minimum")]
    HashTooShort,
    #[error("SRS timestamp has expired")]
    TimestampOutOfDate,
    #[error("SRS address is missing a required '{0}' separator")]
    MissingSeparator(char),
    #[error("SRS address local part is malformed: {0}")]
    MalformedAddress(&'static str),
    #[error("address has no '@' domain part")]
    MissingDomain,
    #[error("no secrets are configured")]
    NoSecrets,
    #[error("alias store lookup failed: {0}")]
    StoreLookupFailed(String),
    #[error("alias store has no record for this opaque key")]
    StoreKeyNotFound,
    #[error("rewriting is disabled by configuration")]
    NotRewritten,
    #[error("no database for alias")]
    NoDatabaseForAlias,
}
