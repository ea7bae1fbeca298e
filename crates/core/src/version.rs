use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Server `major.minor` in parsed form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
}

impl ServerVersion {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse the `major`/`minor` strings reported by discovery. Managed
    /// offerings report minors like `27+`; trailing non-digits are ignored.
    pub fn parse(major: &str, minor: &str) -> Option<Self> {
        fn leading_digits(s: &str) -> Option<u32> {
            let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }
        Some(Self { major: leading_digits(major)?, minor: leading_digits(minor)? })
    }

    pub fn compare(&self, major: u32, minor: u32) -> Ordering {
        (self.major, self.minor).cmp(&(major, minor))
    }
}

impl std::fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
