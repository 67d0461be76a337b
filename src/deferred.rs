//! Module with the set of peers whose reply is held back until the local exit.

use std::collections::BTreeSet;

#[derive(Debug, Default, Clone)]
pub struct DeferredSet(BTreeSet<String>);

impl DeferredSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Function that records a peer owed a reply.
    ///
    /// Returns `false` if the peer was already owed one, which means it sent a
    /// second request before getting an answer to the first.
    pub fn defer(&mut self, address: &str) -> bool {
        self.0.insert(address.to_string())
    }

    /// Function that empties the set and returns the peers that were in it.
    pub fn drain(&mut self) -> Vec<String> {
        std::mem::take(&mut self.0).into_iter().collect()
    }
}
