//! Ordered, de-duplicated lists of cryptographic actions.  Entries live in
//! a push-only arena and refer to each other by index, so a signature can
//! point at its hash without back-pointer cycles.

use crate::cms::attributes::CmsAttributes;
use crate::error::{err, ErrorKind, Result};
use crate::provider::{contexts_represent_same_key, ContextHandle};
use std::sync::Arc;

/// Action kinds, in list sort order.  The numeric order is what makes a
/// sorted list execute correctly: compression before encryption on the way
/// in, decryption before hashing on the way out (reverse order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionType {
    KeyExchangePkc = 1,
    KeyExchange = 2,
    Compress = 3,
    Hash = 4,
    Crypt = 5,
    Sign = 6,
}

/// Outcome of an insertion-point probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    /// List is empty; insert at the head.
    Empty,
    /// Insertion point found, no duplicate.
    Ok,
    /// Same action was added automatically earlier; the explicit add is
    /// absorbed and the automatic flag cleared.
    Present,
    /// A genuine duplicate.
    AlreadyInited,
}

pub struct ActionEntry {
    pub action: ActionType,
    pub context: Option<ContextHandle>,
    /// Signing certificate for CMS-format signer infos and key-transport
    /// recipients.
    pub certificate: Option<Arc<crate::cert::Certificate>>,
    /// CMS signed attributes riding on a signature action.
    pub extra_data: Option<CmsAttributes>,
    /// Index of the hash action a signature covers.
    pub associated_action: Option<u16>,
    pub added_automatically: bool,
    pub needs_controller: bool,
}

impl ActionEntry {
    fn new(action: ActionType, context: Option<ContextHandle>) -> Self {
        ActionEntry {
            action,
            context,
            certificate: None,
            extra_data: None,
            associated_action: None,
            added_automatically: false,
            needs_controller: false,
        }
    }
}

/// One sorted action list.  The arena is push-only so entry indices stay
/// stable; `order` holds the sort.
pub struct ActionList {
    arena: Vec<ActionEntry>,
    order: Vec<u16>,
    /// De-enveloping main lists sort in reverse so that the session-key
    /// action lands ahead of the hash actions.
    descending: bool,
}

impl ActionList {
    pub fn new() -> Self {
        ActionList { arena: Vec::new(), order: Vec::new(), descending: false }
    }

    pub fn new_descending() -> Self {
        ActionList { arena: Vec::new(), order: Vec::new(), descending: true }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn entry(&self, index: u16) -> &ActionEntry {
        &self.arena[index as usize]
    }

    pub fn entry_mut(&mut self, index: u16) -> &mut ActionEntry {
        &mut self.arena[index as usize]
    }

    /// Entries in list order.
    pub fn iter(&self) -> impl Iterator<Item = &ActionEntry> {
        self.order.iter().map(|&i| &self.arena[i as usize])
    }

    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        self.order.iter().copied()
    }

    /// First entry of the given type; the list is sorted, so this is the
    /// start of the group.
    pub fn find(&self, action: ActionType) -> Option<u16> {
        self.order
            .iter()
            .copied()
            .find(|&i| self.arena[i as usize].action == action)
    }

    fn precedes(&self, a: ActionType, b: ActionType) -> bool {
        if self.descending {
            a > b
        } else {
            a < b
        }
    }

    /// Find the insertion point for an action and check the group for a
    /// duplicate of the same key.
    pub fn find_and_check(
        &mut self,
        action: ActionType,
        context: Option<&ContextHandle>,
    ) -> (usize, ActionResult) {
        if self.order.is_empty() {
            return (0, ActionResult::Empty);
        }
        // Skip groups that sort ahead of this action.
        let mut position = 0;
        while position < self.order.len()
            && self.precedes(self.arena[self.order[position] as usize].action, action)
        {
            position += 1;
        }
        // Walk the group looking for the same key; contexts compare to
        // contexts and certs to certs, a context never equals a cert even
        // when the key matches.
        while position < self.order.len()
            && self.arena[self.order[position] as usize].action == action
        {
            let entry = &mut self.arena[self.order[position] as usize];
            if let (Some(a), Some(b)) = (context, entry.context.as_ref()) {
                if contexts_represent_same_key(a, b) {
                    if entry.added_automatically {
                        entry.added_automatically = false;
                        return (position, ActionResult::Present);
                    }
                    return (position, ActionResult::AlreadyInited);
                }
            }
            position += 1;
        }
        (position, ActionResult::Ok)
    }

    /// Insert at a previously-computed point; returns the arena index.
    pub fn add(
        &mut self,
        position: usize,
        action: ActionType,
        context: Option<ContextHandle>,
    ) -> Result<u16> {
        if self.arena.len() >= u16::MAX as usize {
            return err(ErrorKind::Overflow);
        }
        let index = self.arena.len() as u16;
        self.arena.push(ActionEntry::new(action, context));
        self.order.insert(position.min(self.order.len()), index);
        Ok(index)
    }

    /// Probe and insert in one step for the common case.
    pub fn check_and_add(
        &mut self,
        action: ActionType,
        context: Option<ContextHandle>,
    ) -> Result<u16> {
        let (position, result) = self.find_and_check(action, context.as_ref());
        match result {
            ActionResult::AlreadyInited => err(ErrorKind::AlreadyInited),
            ActionResult::Present => {
                Ok(self.order[position])
            }
            _ => self.add(position, action, context),
        }
    }

    /// Whether any hash action still lacks a controlling signature.
    pub fn has_uncontrolled_hash(&self) -> bool {
        self.iter()
            .any(|entry| entry.action == ActionType::Hash && entry.needs_controller)
    }
}

impl Default for ActionList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_by_action_type() {
        let mut list = ActionList::new();
        list.check_and_add(ActionType::Crypt, None).unwrap();
        list.check_and_add(ActionType::Compress, None).unwrap();
        list.check_and_add(ActionType::Hash, None).unwrap();
        let kinds: Vec<_> = list.iter().map(|e| e.action).collect();
        assert_eq!(
            kinds,
            vec![ActionType::Compress, ActionType::Hash, ActionType::Crypt]
        );
    }

    #[test]
    fn descending_puts_crypt_before_hash() {
        let mut list = ActionList::new_descending();
        list.check_and_add(ActionType::Hash, None).unwrap();
        list.check_and_add(ActionType::Crypt, None).unwrap();
        let kinds: Vec<_> = list.iter().map(|e| e.action).collect();
        assert_eq!(kinds, vec![ActionType::Crypt, ActionType::Hash]);
    }

    #[test]
    fn indices_stay_stable_across_inserts() {
        let mut list = ActionList::new();
        let crypt = list.check_and_add(ActionType::Crypt, None).unwrap();
        let hash = list.check_and_add(ActionType::Hash, None).unwrap();
        // The hash sorts ahead of the crypt but both keep their indices.
        assert_eq!(list.entry(crypt).action, ActionType::Crypt);
        assert_eq!(list.entry(hash).action, ActionType::Hash);
    }

    #[cfg(feature = "soft")]
    #[test]
    fn duplicate_context_detected() {
        use crate::oid::{AlgorithmId, Mode};
        use crate::provider::CapabilityRegistry;

        let registry = CapabilityRegistry::software();
        let key = crate::testkeys::rsa512_private_parts();
        let ctx = registry.create_context(AlgorithmId::Rsa, Mode::Pkc).unwrap();
        registry.load_key(&ctx, &key.to_der()).unwrap();

        let mut list = ActionList::new();
        list.check_and_add(ActionType::Sign, Some(ctx.clone())).unwrap();
        assert_eq!(
            list.check_and_add(ActionType::Sign, Some(ctx)).unwrap_err().kind(),
            ErrorKind::AlreadyInited
        );
    }

    #[cfg(feature = "soft")]
    #[test]
    fn automatic_add_absorbs_first_explicit_add() {
        use crate::oid::{AlgorithmId, Mode};
        use crate::provider::CapabilityRegistry;

        let registry = CapabilityRegistry::software();
        let ctx = registry.create_context(AlgorithmId::Sha1, Mode::None).unwrap();

        let mut list = ActionList::new();
        let auto = list.check_and_add(ActionType::Hash, Some(ctx.clone())).unwrap();
        list.entry_mut(auto).added_automatically = true;

        // The caller's first mention of the same context is not an error...
        let (_, result) = list.find_and_check(ActionType::Hash, Some(&ctx));
        assert_eq!(result, ActionResult::Present);
        // ...but a second one is.
        let (_, result) = list.find_and_check(ActionType::Hash, Some(&ctx));
        assert_eq!(result, ActionResult::AlreadyInited);
    }
}
