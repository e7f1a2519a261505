//! Content lists: unresolved requirements surfaced while de-enveloping.
//! Each entry is created when its header object is parsed and consumed
//! when the caller supplies matching key material.

use crate::cms::attributes::CmsAttributes;
use crate::cms::query::ObjectInfo;
use crate::cms::FormatType;
use crate::error::Error;
use crate::provider::ContextHandle;
use crate::secure::SecretBuffer;

/// What kind of resource an entry needs (or, for signatures, offers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredInfo {
    Password,
    PrivateKey,
    SessionKey,
    Key,
    Signature,
}

pub struct ContentListEntry {
    pub required: RequiredInfo,
    pub format: FormatType,
    /// The encoded object this entry was built from; the data offsets in
    /// `info` index into it.  Held in secret storage since wrapped keys
    /// pass through here.
    pub object: SecretBuffer,
    pub info: ObjectInfo,
    pub processed: bool,
    pub processing_result: Option<Result<(), Error>>,
    /// Key used to check a signature, kept for later queries.
    pub sig_check_key: Option<ContextHandle>,
    /// Verified signed attributes recovered from a signature entry.
    pub extra_data: Option<CmsAttributes>,
}

impl ContentListEntry {
    pub fn new(required: RequiredInfo, object: &[u8], info: ObjectInfo) -> Self {
        let format = info.format;
        ContentListEntry {
            required,
            format,
            object: SecretBuffer::from_slice(object),
            info,
            processed: false,
            processing_result: None,
            sig_check_key: None,
            extra_data: None,
        }
    }

    /// Bytes of the embedded encrypted key or signature.
    pub fn data(&self) -> &[u8] {
        let (offset, length) = self.info.data;
        &self.object.as_slice()[offset..offset + length]
    }

    pub fn issuer_and_serial(&self) -> Option<&[u8]> {
        let (offset, length) = self.info.issuer_and_serial?;
        Some(&self.object.as_slice()[offset..offset + length])
    }

    pub fn signed_attribute_bytes(&self) -> Option<&[u8]> {
        let (offset, length) = self.info.signed_attributes?;
        Some(&self.object.as_slice()[offset..offset + length])
    }
}

/// The list plus the caller's cursor, mirroring the get-first/get-next
/// resource iteration of the public API.
#[derive(Default)]
pub struct ContentList {
    entries: Vec<ContentListEntry>,
    cursor: Option<usize>,
}

impl ContentList {
    pub fn new() -> Self {
        ContentList { entries: Vec::new(), cursor: None }
    }

    pub fn push(&mut self, entry: ContentListEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ContentListEntry] {
        &self.entries
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut ContentListEntry {
        &mut self.entries[index]
    }

    /// Advance the cursor; `false` once the list is exhausted.
    pub fn next_entry(&mut self) -> bool {
        let next = match self.cursor {
            None => 0,
            Some(current) => current + 1,
        };
        if next >= self.entries.len() {
            return false;
        }
        self.cursor = Some(next);
        true
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&ContentListEntry> {
        self.cursor.map(|i| &self.entries[i])
    }

    /// The entry the caller is positioned on, or the first unprocessed one
    /// matching the given requirement.
    pub fn select(&self, required: RequiredInfo) -> Option<usize> {
        if let Some(current) = self.cursor {
            return Some(current);
        }
        self.entries
            .iter()
            .position(|e| e.required == required && !e.processed)
    }

    pub fn find(&self, required: RequiredInfo) -> Option<usize> {
        self.entries.iter().position(|e| e.required == required)
    }

    /// Drop every non-signature entry; called once the session key is
    /// recovered and the key-exchange records become irrelevant.
    pub fn retain_signatures(&mut self) {
        self.entries.retain(|e| e.required == RequiredInfo::Signature);
        self.cursor = None;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }
}
