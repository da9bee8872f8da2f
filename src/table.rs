//! The subscription table.
//!
//! Stored as a dense, chunk-grown array rather than a hash map or linked
//! list: churn is expected only at client start-up, so keeping entries
//! physically adjacent wins on cache behavior even though lookup and removal
//! are both linear. Deletion compacts the valid prefix so iteration is
//! always a plain scan; insertion appends at the end.

use crate::error::Error;
use crate::selector::Selector;

/// Number of entries the table's backing vector grows by when full.
const TABLE_CHUNK: usize = 32;

/// A single stored subscription: a selector plus the opaque token of its
/// owning connection. A token of 0 is never valid.
#[derive(Debug, Clone, Copy)]
struct Entry {
    selector: Selector,
    token: u64,
}

/// What a successful match against the table yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub token: u64,
    pub payload: u32,
}

/// The subscription table.
///
/// Grows in fixed-size chunks as entries are inserted; not a hard cap, just
/// the increment used when the backing storage fills.
pub struct SubscriptionTable {
    entries: Vec<Entry>,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(TABLE_CHUNK),
        }
    }

    fn locate(&self, request: &Selector) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.selector.covers(request))
    }

    /// Insert a new subscription. Rejects precondition violations and
    /// coverage overlap with an existing entry.
    pub fn insert(&mut self, selector: Selector, token: u64) -> Result<(), Error> {
        if token == 0 {
            return Err(Error::invalid_argument("token is zero"));
        }
        selector.validate_subscription()?;

        if let Some(idx) = self.locate(&selector) {
            let existing = &self.entries[idx].selector;
            return Err(Error::already_registered(format!(
                "{:04X}:{:02X}:{:08X} already registered as {:04X}:{:02X}:{:08X}",
                selector.crate_mask,
                selector.irq_mask,
                selector.vector,
                existing.crate_mask,
                existing.irq_mask,
                existing.vector,
            )));
        }

        if self.entries.len() == self.entries.capacity() {
            self.entries
                .try_reserve(TABLE_CHUNK)
                .map_err(|e| Error::out_of_memory(e.to_string()))?;
        }
        self.entries.push(Entry { selector, token });
        Ok(())
    }

    /// Find the subscription that covers `concrete`, per the first-registered
    /// tie-break. Returns `None` when nothing matches.
    pub fn match_concrete(&self, concrete: &Selector) -> Option<Match> {
        self.entries.iter().find_map(|e| {
            if e.selector.covers(concrete) {
                Some(Match {
                    token: e.token,
                    payload: e.selector.payload,
                })
            } else {
                None
            }
        })
    }

    /// Release a single subscription. The selector must equal a stored
    /// selector exactly (not merely cover it) and the token must match the
    /// recorded owner.
    pub fn release(&mut self, selector: &Selector, token: u64) -> Result<(), Error> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.selector.triple_eq(selector));

        let idx = match idx {
            Some(idx) => idx,
            None => {
                return Err(Error::not_found(format!(
                    "{:04X}:{:02X}:{:08X} not registered",
                    selector.crate_mask, selector.irq_mask, selector.vector
                )));
            }
        };

        if self.entries[idx].token != token {
            return Err(Error::invalid_argument(format!(
                "{:04X}:{:02X}:{:08X} release request from wrong owner",
                selector.crate_mask, selector.irq_mask, selector.vector
            )));
        }

        self.entries.remove(idx);
        Ok(())
    }

    /// Remove every subscription owned by `token`. Always succeeds, even if
    /// there was nothing to remove.
    pub fn release_all(&mut self, token: u64) {
        self.entries.retain(|e| e.token != token);
    }

    /// For each of the sixteen crates, the union of IRQ masks of
    /// subscriptions that include that crate. Used to recompute per-crate
    /// enable registers.
    pub fn enumerate_enable_masks(&self) -> [u8; 16] {
        let mut masks = [0u8; 16];
        for entry in &self.entries {
            for (crate_num, mask) in masks.iter_mut().enumerate() {
                if entry.selector.crate_mask & (1u16 << crate_num) != 0 {
                    *mask |= entry.selector.irq_mask;
                }
            }
        }
        masks
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{ANYIRQ, ANYVECTOR};

    #[test]
    fn specific_then_wildcard_resolves_by_priority() {
        let mut t = SubscriptionTable::new();
        t.insert(Selector::new(0x0001, 0x02, 0xDEAD_BEEF, 1), 10)
            .unwrap();
        t.insert(Selector::new(0x0001, 0x02, ANYVECTOR, 2), 10)
            .unwrap();

        let m = t
            .match_concrete(&Selector::concrete(0, 1, 0xDEAD_BEEF, 0))
            .unwrap();
        assert_eq!(m.payload, 1);

        let m = t
            .match_concrete(&Selector::concrete(0, 1, 0x1234_5678, 0))
            .unwrap();
        assert_eq!(m.payload, 2);
    }

    #[test]
    fn wildcard_then_specific_is_rejected_as_overlap() {
        let mut t = SubscriptionTable::new();
        t.insert(Selector::new(0x0001, 0x02, ANYVECTOR, 2), 10)
            .unwrap();
        let err = t
            .insert(Selector::new(0x0001, 0x02, 0xDEAD_BEEF, 1), 10)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::AlreadyRegistered);
    }

    #[test]
    fn release_requires_owner_match() {
        let mut t = SubscriptionTable::new();
        let sel = Selector::new(0x0002, 0x80, 0xDEAD_BEEF, 0);
        t.insert(sel, 10).unwrap();
        let err = t.release(&sel, 20).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
        // Still present under the correct owner.
        t.release(&sel, 10).unwrap();
        assert_eq!(t.count(), 0);
    }

    #[test]
    fn release_requires_exact_triple() {
        let mut t = SubscriptionTable::new();
        t.insert(Selector::new(0x0001, ANYIRQ, ANYVECTOR, 0), 10)
            .unwrap();
        let err = t
            .release(&Selector::new(0x0001, 0x02, ANYVECTOR, 0), 10)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn release_all_removes_only_owned_entries() {
        let mut t = SubscriptionTable::new();
        t.insert(Selector::new(0x0001, 0x02, ANYVECTOR, 0), 10)
            .unwrap();
        t.insert(Selector::new(0x0002, 0x04, ANYVECTOR, 0), 20)
            .unwrap();
        t.release_all(10);
        assert_eq!(t.count(), 1);
        assert!(t.match_concrete(&Selector::concrete(1, 2, 5, 0)).is_some());
        assert!(t.match_concrete(&Selector::concrete(0, 1, 5, 0)).is_none());
    }

    #[test]
    fn enumerate_enable_masks_unions_per_crate() {
        let mut t = SubscriptionTable::new();
        t.insert(Selector::new(0x0003, 0x02, ANYVECTOR, 0), 10)
            .unwrap();
        t.insert(Selector::new(0x0001, 0x04, ANYVECTOR, 0), 20)
            .unwrap();
        let masks = t.enumerate_enable_masks();
        assert_eq!(masks[0], 0x02 | 0x04);
        assert_eq!(masks[1], 0x02);
        assert_eq!(masks[2], 0);
    }

    #[test]
    fn insert_rejects_zero_token() {
        let mut t = SubscriptionTable::new();
        let err = t
            .insert(Selector::new(0x0001, 0x02, ANYVECTOR, 0), 0)
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn table_grows_past_initial_chunk() {
        let mut t = SubscriptionTable::new();
        for crate_num in 0..16u8 {
            for irq in 1..8u8 {
                t.insert(Selector::concrete(crate_num, irq, 0xFFFF_FFFF, 0), 1)
                    .unwrap();
            }
        }
        assert_eq!(t.count(), 16 * 7);
    }
}
