use std::fs;
use std::io;
use std::path::Path;

/// The ordered list of HMAC signing secrets. The first entry is always used
/// to sign new addresses; every entry is tried in turn when verifying, so a
/// secret rotation (prepend the new one, keep the old one around for
/// `maxage` days) never invalidates addresses already in flight.
#[derive(Debug, Clone)]
pub struct Secrets(Vec<String>);

impl Secrets {
    pub fn new(secrets: Vec<String>) -> Self {
        Secrets(secrets)
    }

    /// Reads one secret per line, trailing `\r\n` stripped and blank lines
    /// skipped. Unlike the domains file, a secret line has no comment
    /// syntax - a leading `#` is part of the secret, not a remark, since a
    /// secret is an opaque byte string rather than a domain name.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let secrets = contents
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Ok(Secrets(secrets))
    }

    pub fn signing(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
