use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::util::errors::StdError;

/// A `major.minor.patch` MySQL server version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MysqlVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MysqlVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl FromStr for MysqlVersion {
    type Err = StdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StdError::ValidationError(format!("invalid MySQL version {s:?}"));
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, StdError> {
            parts.next().ok_or_else(invalid)?.parse::<u32>().map_err(|_| invalid())
        };
        let version = MysqlVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl fmt::Display for MysqlVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl PartialOrd for MysqlVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MysqlVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

/// Returns the tag of `image` when it is `{repository}:{tag}`.
pub fn image_tag<'a>(image: &'a str, repository: &str) -> Option<&'a str> {
    image.strip_prefix(repository)?.strip_prefix(':')
}
