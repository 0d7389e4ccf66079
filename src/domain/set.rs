use rustc_hash::FxHashSet;

use super::name;

/// Set of normalized domain names with longest-suffix matching.
#[derive(Debug, Default, Clone)]
pub struct DomainSet {
    names: FxHashSet<Box<str>>,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizes and inserts `raw`. Returns false (without inserting) for
    /// anything that is not a valid domain name.
    pub fn add(&mut self, raw: &str) -> bool {
        match name::normalize(raw) {
            Some(domain) => {
                self.names.insert(domain.into_boxed_str());
                true
            }
            None => false,
        }
    }

    /// True iff `name` equals or is a subdomain of any stored name.
    ///
    /// Walks from the full name towards the TLD, dropping one leading label
    /// per step.
    pub fn matches(&self, name: &str) -> bool {
        if self.names.is_empty() {
            return false;
        }

        let mut part = name;
        loop {
            if self.names.contains(part) {
                return true;
            }
            match part.find('.') {
                Some(idx) => {
                    part = &part[idx + 1..];
                    if part.is_empty() {
                        break;
                    }
                }
                None => break,
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| n.as_ref())
    }
}
