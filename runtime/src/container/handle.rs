use std::collections::HashSet;
use std::fmt;

use crate::error::{WardenError, WardenResult};

const ALLOCATION_ATTEMPTS: usize = 64;

/// Eight lowercase hex characters naming a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    pub const LEN: usize = 8;

    /// Accepts only the canonical form produced by the allocator.
    pub fn parse(raw: &str) -> Option<Handle> {
        let valid = raw.len() == Self::LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Handle(raw.to_string()))
    }

    fn from_bits(bits: u32) -> Handle {
        Handle(format!("{:08x}", bits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hands out random handles, never repeating one within the process lifetime.
#[derive(Debug, Default)]
pub(crate) struct HandleAllocator {
    issued: HashSet<Handle>,
}

impl HandleAllocator {
    pub(crate) fn allocate(&mut self) -> WardenResult<Handle> {
        for _ in 0..ALLOCATION_ATTEMPTS {
            let candidate = Handle::from_bits(rand::random::<u32>());
            if self.issued.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
        Err(WardenError::internal("handle space exhausted"))
    }

    #[cfg(test)]
    pub(crate) fn issued(&self) -> usize {
        self.issued.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_canonical_form_only() {
        assert!(Handle::parse("0a1b2c3d").is_some());
        assert!(Handle::parse("0A1B2C3D").is_none());
        assert!(Handle::parse("0a1b2c3").is_none());
        assert!(Handle::parse("100000000").is_none());
        assert!(Handle::parse("0a1b2c3g").is_none());
        assert!(Handle::parse("").is_none());
    }

    #[test]
    fn allocated_handles_are_distinct_and_well_formed() {
        let mut allocator = HandleAllocator::default();
        let mut seen = HashSet::new();
        for _ in 0..2_000 {
            let handle = allocator.allocate().unwrap();
            assert_eq!(Handle::parse(handle.as_str()), Some(handle.clone()));
            assert!(seen.insert(handle));
        }
        assert_eq!(allocator.issued(), 2_000);
    }
}
