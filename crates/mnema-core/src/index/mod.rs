//! # String Index
//!
//! File-backed index attaching text content to link elements and system
//! identifiers to arbitrary elements.
//!
//! Three tries back the lookups: an exact-match trie (content bytes → link
//! addrs), a terms trie (token → candidate link addrs) and a system
//! identifier trie. Raw contents append into channel files; the tries and a
//! per-link metadata table serialize into an image file that is reloaded on
//! startup and verified against the channel manifest.
//!
//! Contents longer than the searchable cap, or containing the reserved
//! terminator byte, are stored and retrievable but not indexed for search.
//!
//! Consistency rule: channel appends happen before any in-memory mutation,
//! so an I/O failure surfaces to the caller while the tries still describe
//! the previous state.

mod channels;
mod trie;

use crate::types::{Addr, MnemaError, Params};
use channels::{ChannelSet, ContentRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use trie::{Alphabet, Trie};

const IMAGE_MAGIC: [u8; 4] = *b"MNMI";
const IMAGE_VERSION: u8 = 1;
const IMAGE_FILE: &str = "index.img";

/// Upper bound on a loadable image, validated before parsing.
const MAX_IMAGE_SIZE: usize = 1024 * 1024 * 1024;

/// In-memory mutations between automatic flushes.
const FLUSH_THRESHOLD: u32 = 256;

// =============================================================================
// METADATA
// =============================================================================

/// Per-link bookkeeping: where the content lives and which index entries
/// must be removed when it is replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkMeta {
    content: ContentRef,
    terms: Vec<Vec<u8>>,
    searchable: bool,
}

/// Everything serialized into the image file.
#[derive(Serialize, Deserialize)]
struct IndexImage {
    exact: Trie<Vec<Addr>>,
    terms: Trie<Vec<Addr>>,
    sysidtf: Trie<Addr>,
    links: Trie<LinkMeta>,
    idtf_by_addr: Trie<Vec<u8>>,
}

/// Aggregate index counters, used by the status surfaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    /// Links currently carrying content.
    pub contents: u64,
    /// Registered system identifiers.
    pub identifiers: u64,
    /// Distinct indexed terms.
    pub terms: u64,
}

/// Decimal key of an addr in the digits tries.
fn addr_key(addr: Addr) -> Vec<u8> {
    let packed = (u32::from(addr.segment) << 16) | u32::from(addr.offset);
    packed.to_string().into_bytes()
}

/// Split on the configured separators, deduplicating tokens through an
/// auxiliary trie.
fn tokenize(bytes: &[u8], separators: &[u8]) -> Vec<Vec<u8>> {
    let mut unique: Trie<()> = Trie::new(Alphabet::Bytes);
    let mut tokens = Vec::new();
    for token in bytes.split(|b| separators.contains(b)) {
        if token.is_empty() {
            continue;
        }
        if let Ok(None) = unique.insert(token, ()) {
            tokens.push(token.to_vec());
        }
    }
    tokens
}

// =============================================================================
// INDEX
// =============================================================================

struct IndexInner {
    dir: PathBuf,
    separators: Vec<u8>,
    max_searchable: usize,
    channels: ChannelSet,
    exact: Trie<Vec<Addr>>,
    terms: Trie<Vec<Addr>>,
    sysidtf: Trie<Addr>,
    links: Trie<LinkMeta>,
    idtf_by_addr: Trie<Vec<u8>>,
    dirty: u32,
}

/// The file-backed string index shared by all contexts of one memory.
pub(crate) struct FsIndex {
    inner: Mutex<IndexInner>,
}

impl FsIndex {
    /// Open (or, with `params.clear`, reinitialize) the index under
    /// `params.repo_path`.
    pub(crate) fn open(params: &Params) -> Result<Self, MnemaError> {
        let dir = params.repo_path.clone();
        if params.clear && dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| MnemaError::IoError(format!("clear repo: {e}")))?;
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| MnemaError::IoError(format!("create repo: {e}")))?;

        let channels = ChannelSet::load(
            &dir,
            params.max_strings_channels,
            u64::from(params.max_strings_channel_size),
        )?;

        let image_path = dir.join(IMAGE_FILE);
        let image = if image_path.exists() {
            let bytes = std::fs::read(&image_path)
                .map_err(|e| MnemaError::IoError(format!("read index image: {e}")))?;
            if bytes.len() > MAX_IMAGE_SIZE {
                return Err(MnemaError::SerializationError(format!(
                    "index image of {} bytes exceeds the {} byte cap",
                    bytes.len(),
                    MAX_IMAGE_SIZE
                )));
            }
            if bytes.len() < 5 || bytes[0..4] != IMAGE_MAGIC || bytes[4] != IMAGE_VERSION {
                return Err(MnemaError::SerializationError(
                    "index image is malformed".to_string(),
                ));
            }
            Some(
                postcard::from_bytes::<IndexImage>(&bytes[5..])
                    .map_err(|e| MnemaError::SerializationError(format!("parse image: {e}")))?,
            )
        } else {
            None
        };

        let (exact, terms, sysidtf, links, idtf_by_addr) = match image {
            Some(image) => (
                image.exact,
                image.terms,
                image.sysidtf,
                image.links,
                image.idtf_by_addr,
            ),
            None => (
                Trie::new(Alphabet::Bytes),
                Trie::new(Alphabet::Bytes),
                Trie::new(Alphabet::Bytes),
                Trie::new(Alphabet::Digits),
                Trie::new(Alphabet::Digits),
            ),
        };

        Ok(Self {
            inner: Mutex::new(IndexInner {
                dir,
                separators: params.term_separators.clone().into_bytes(),
                max_searchable: params.max_searchable_string_size as usize,
                channels,
                exact,
                terms,
                sysidtf,
                links,
                idtf_by_addr,
                dirty: 0,
            }),
        })
    }

    // =========================================================================
    // LINK CONTENT
    // =========================================================================

    /// Replace the content of `link`, updating the exact and terms tries.
    pub(crate) fn set_link_content(&self, link: Addr, bytes: &[u8]) -> Result<(), MnemaError> {
        let mut inner = self.inner.lock();
        let key = addr_key(link);

        // Everything fallible happens before the tries change.
        let old = match inner.links.get(&key) {
            Some(meta) => Some((inner.channels.read(meta.content)?, meta.clone())),
            None => None,
        };
        let content = inner.channels.append(bytes)?;

        if let Some((old_bytes, old_meta)) = old {
            inner.unindex(link, &old_bytes, &old_meta);
        }

        // Binary contents with the reserved terminator byte are stored but
        // kept out of the tries, like oversize contents.
        let indexable = !bytes.contains(&0);
        if indexable {
            inner
                .exact
                .get_or_insert_with(bytes, Vec::new)?
                .push(link);
        }
        let searchable = indexable && bytes.len() <= inner.max_searchable;
        let tokens = if searchable {
            let tokens = tokenize(bytes, &inner.separators);
            for token in &tokens {
                inner.terms.get_or_insert_with(token, Vec::new)?.push(link);
            }
            tokens
        } else {
            Vec::new()
        };
        inner.links.insert(
            &key,
            LinkMeta {
                content,
                terms: tokens,
                searchable,
            },
        )?;
        inner.mark_dirty();
        Ok(())
    }

    /// Content bytes of `link`, if any were ever set.
    pub(crate) fn get_link_content(&self, link: Addr) -> Result<Option<Vec<u8>>, MnemaError> {
        let inner = self.inner.lock();
        match inner.links.get(&addr_key(link)) {
            Some(meta) => Ok(Some(inner.channels.read(meta.content)?)),
            None => Ok(None),
        }
    }

    /// Links whose content is exactly `bytes`.
    pub(crate) fn find_links_by_exact_content(&self, bytes: &[u8]) -> Vec<Addr> {
        self.inner.lock().exact.get(bytes).cloned().unwrap_or_default()
    }

    /// Links whose content contains every token of `bytes`: the
    /// intersection of the per-token id lists.
    pub(crate) fn find_links_by_substring(&self, bytes: &[u8]) -> Vec<Addr> {
        let inner = self.inner.lock();
        let tokens = tokenize(bytes, &inner.separators);
        let mut iter = tokens.iter();
        let Some(first) = iter.next() else {
            return Vec::new();
        };
        let Some(mut result) = inner.terms.get(first).cloned() else {
            return Vec::new();
        };
        for token in iter {
            match inner.terms.get(token) {
                Some(ids) => result.retain(|addr| ids.contains(addr)),
                None => return Vec::new(),
            }
            if result.is_empty() {
                return Vec::new();
            }
        }
        result
    }

    /// Drop every index entry of an erased element.
    pub(crate) fn remove_element(&self, addr: Addr) {
        let mut inner = self.inner.lock();
        let key = addr_key(addr);
        if let Some(meta) = inner.links.remove(&key) {
            match inner.channels.read(meta.content) {
                Ok(old_bytes) => inner.unindex(addr, &old_bytes, &meta),
                Err(e) => {
                    // The exact-match entry cannot be located without the
                    // old bytes; terms are still cleaned from metadata.
                    tracing::warn!(addr = %addr, error = %e, "stale content unreadable during erase");
                    for token in &meta.terms {
                        if let Some(ids) = inner.terms.get_mut(token) {
                            ids.retain(|other| *other != addr);
                        }
                    }
                }
            }
            inner.mark_dirty();
        }
        if let Some(identifier) = inner.idtf_by_addr.remove(&key) {
            inner.sysidtf.remove(&identifier);
            inner.mark_dirty();
        }
    }

    // =========================================================================
    // SYSTEM IDENTIFIERS
    // =========================================================================

    /// Bind a system identifier to an element, replacing any previous
    /// binding of either side.
    pub(crate) fn set_system_identifier(
        &self,
        addr: Addr,
        identifier: &str,
    ) -> Result<(), MnemaError> {
        if identifier.is_empty()
            || !identifier
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(MnemaError::InvalidParams(format!(
                "malformed system identifier {identifier:?}"
            )));
        }
        let mut inner = self.inner.lock();
        let key = addr_key(addr);
        if let Some(previous) = inner.idtf_by_addr.remove(&key) {
            inner.sysidtf.remove(&previous);
        }
        if let Some(displaced) = inner.sysidtf.insert(identifier.as_bytes(), addr)? {
            inner.idtf_by_addr.remove(&addr_key(displaced));
        }
        inner.idtf_by_addr.insert(&key, identifier.as_bytes().to_vec())?;
        inner.mark_dirty();
        Ok(())
    }

    /// Element bound to `identifier`, if any.
    pub(crate) fn resolve_system_identifier(&self, identifier: &str) -> Option<Addr> {
        self.inner.lock().sysidtf.get(identifier.as_bytes()).copied()
    }

    /// Identifier bound to `addr`, if any.
    pub(crate) fn system_identifier_of(&self, addr: Addr) -> Option<String> {
        let inner = self.inner.lock();
        let bytes = inner.idtf_by_addr.get(&addr_key(addr))?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    // =========================================================================
    // PERSISTENCE
    // =========================================================================

    /// Write the trie image and the channel manifest.
    pub(crate) fn flush(&self) -> Result<(), MnemaError> {
        let mut inner = self.inner.lock();
        inner.flush()
    }

    pub(crate) fn stats(&self) -> IndexStats {
        let inner = self.inner.lock();
        IndexStats {
            contents: inner.links.len(),
            identifiers: inner.sysidtf.len(),
            terms: inner.terms.len(),
        }
    }
}

impl IndexInner {
    /// Remove a link's entries for its previous content.
    fn unindex(&mut self, link: Addr, old_bytes: &[u8], meta: &LinkMeta) {
        if let Some(ids) = self.exact.get_mut(old_bytes) {
            ids.retain(|other| *other != link);
            if ids.is_empty() {
                self.exact.remove(old_bytes);
            }
        }
        for token in &meta.terms {
            if let Some(ids) = self.terms.get_mut(token) {
                ids.retain(|other| *other != link);
                if ids.is_empty() {
                    self.terms.remove(token);
                }
            }
        }
    }

    fn mark_dirty(&mut self) {
        self.dirty += 1;
        if self.dirty >= FLUSH_THRESHOLD {
            if let Err(e) = self.flush() {
                tracing::warn!(error = %e, "periodic index flush failed");
            }
        }
    }

    fn flush(&mut self) -> Result<(), MnemaError> {
        let image = IndexImage {
            exact: self.exact.clone(),
            terms: self.terms.clone(),
            sysidtf: self.sysidtf.clone(),
            links: self.links.clone(),
            idtf_by_addr: self.idtf_by_addr.clone(),
        };
        let payload = postcard::to_stdvec(&image)
            .map_err(|e| MnemaError::SerializationError(format!("serialize image: {e}")))?;
        let mut bytes = Vec::with_capacity(5 + payload.len());
        bytes.extend_from_slice(&IMAGE_MAGIC);
        bytes.push(IMAGE_VERSION);
        bytes.extend_from_slice(&payload);
        std::fs::write(self.dir.join(IMAGE_FILE), &bytes)
            .map_err(|e| MnemaError::IoError(format!("write index image: {e}")))?;
        self.channels.write_manifest()?;
        self.channels.sync()?;
        self.dirty = 0;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn open_index(dir: &std::path::Path) -> FsIndex {
        let params = Params {
            repo_path: dir.to_path_buf(),
            max_searchable_string_size: 64,
            ..Params::default()
        };
        FsIndex::open(&params).expect("open index")
    }

    fn link(n: u16) -> Addr {
        Addr::new(0, n)
    }

    #[test]
    fn exact_search_tracks_latest_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = open_index(dir.path());
        index.set_link_content(link(1), b"old content").expect("set");
        index.set_link_content(link(1), b"new content").expect("set");

        assert_eq!(index.find_links_by_exact_content(b"new content"), vec![link(1)]);
        assert_eq!(index.find_links_by_exact_content(b"old content"), Vec::new());
        assert_eq!(
            index.get_link_content(link(1)).expect("get"),
            Some(b"new content".to_vec())
        );
    }

    #[test]
    fn substring_search_intersects_tokens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = open_index(dir.path());
        index
            .set_link_content(link(1), b"the quick brown fox")
            .expect("set");
        index
            .set_link_content(link(2), b"the slow brown bear")
            .expect("set");

        assert_eq!(
            index.find_links_by_substring(b"brown the"),
            vec![link(1), link(2)]
        );
        assert_eq!(index.find_links_by_substring(b"quick brown"), vec![link(1)]);
        assert_eq!(index.find_links_by_substring(b"quick bear"), Vec::new());
        assert_eq!(index.find_links_by_substring(b""), Vec::new());
    }

    #[test]
    fn oversize_content_is_stored_but_not_searchable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = open_index(dir.path());
        let big = vec![b'a'; 100];
        index.set_link_content(link(3), &big).expect("set");
        assert_eq!(index.get_link_content(link(3)).expect("get"), Some(big.clone()));
        assert_eq!(index.find_links_by_substring(&big[..10]), Vec::new());
        // The exact index still covers it.
        assert_eq!(index.find_links_by_exact_content(&big), vec![link(3)]);
    }

    #[test]
    fn binary_content_with_terminator_is_stored_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = open_index(dir.path());
        let binary = b"ab\0cd".to_vec();
        index.set_link_content(link(4), &binary).expect("set");
        assert_eq!(index.get_link_content(link(4)).expect("get"), Some(binary));
        assert_eq!(index.find_links_by_substring(b"ab"), Vec::new());
    }

    #[test]
    fn remove_element_clears_all_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = open_index(dir.path());
        index.set_link_content(link(5), b"doomed words").expect("set");
        index.set_system_identifier(link(5), "doomed_link").expect("set idtf");

        index.remove_element(link(5));
        assert_eq!(index.find_links_by_exact_content(b"doomed words"), Vec::new());
        assert_eq!(index.find_links_by_substring(b"doomed"), Vec::new());
        assert_eq!(index.resolve_system_identifier("doomed_link"), None);
        assert_eq!(index.get_link_content(link(5)).expect("get"), None);
    }

    #[test]
    fn system_identifiers_resolve_both_ways() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = open_index(dir.path());
        let node = Addr::new(1, 1);
        index.set_system_identifier(node, "question_finished_successfully").expect("set");
        assert_eq!(
            index.resolve_system_identifier("question_finished_successfully"),
            Some(node)
        );
        assert_eq!(
            index.system_identifier_of(node).as_deref(),
            Some("question_finished_successfully")
        );
        assert!(index.set_system_identifier(node, "white space").is_err());
        assert!(index.set_system_identifier(node, "").is_err());
    }

    #[test]
    fn rebinding_an_identifier_displaces_the_old_element() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = open_index(dir.path());
        let first = Addr::new(1, 1);
        let second = Addr::new(1, 2);
        index.set_system_identifier(first, "shared_name").expect("set");
        index.set_system_identifier(second, "shared_name").expect("set");
        assert_eq!(index.resolve_system_identifier("shared_name"), Some(second));
        assert_eq!(index.system_identifier_of(first), None);
    }

    #[test]
    fn image_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let index = open_index(dir.path());
            index.set_link_content(link(1), b"durable content").expect("set");
            index.set_system_identifier(Addr::new(2, 2), "persisted_node").expect("set");
            index.flush().expect("flush");
        }
        let reopened = open_index(dir.path());
        assert_eq!(
            reopened.get_link_content(link(1)).expect("get"),
            Some(b"durable content".to_vec())
        );
        assert_eq!(
            reopened.find_links_by_exact_content(b"durable content"),
            vec![link(1)]
        );
        assert_eq!(
            reopened.resolve_system_identifier("persisted_node"),
            Some(Addr::new(2, 2))
        );
    }

    #[test]
    fn clear_reinitializes_the_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let index = open_index(dir.path());
            index.set_link_content(link(1), b"drop me").expect("set");
            index.flush().expect("flush");
        }
        let params = Params {
            repo_path: dir.path().to_path_buf(),
            clear: true,
            ..Params::default()
        };
        let cleared = FsIndex::open(&params).expect("open");
        assert_eq!(cleared.get_link_content(link(1)).expect("get"), None);
        assert_eq!(cleared.stats(), IndexStats::default());
    }
}
