//! Integration tests for link content, search and index persistence.

#![allow(clippy::unwrap_used, clippy::panic)]

use mnema_core::{EventKind, Memory, MnemaError, Params, TypeMask};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn params_for(dir: &std::path::Path) -> Params {
    Params {
        repo_path: dir.to_path_buf(),
        ..Params::default()
    }
}

fn wait_until(predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

#[test]
fn content_overwrite_moves_the_exact_match() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(params_for(dir.path())).unwrap();
    let ctx = memory.context();
    let link = ctx.create_link(TypeMask::LINK_CONST).unwrap();

    let changes = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&changes);
    let _subscription = ctx
        .subscribe(EventKind::ChangeLinkContent, link, TypeMask::UNKNOWN, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    ctx.set_link_content(link, b"old content").unwrap();
    ctx.set_link_content(link, b"new content").unwrap();

    assert_eq!(ctx.find_links_by_content(b"new content").unwrap(), vec![link]);
    assert_eq!(ctx.find_links_by_content(b"old content").unwrap(), Vec::new());
    assert_eq!(ctx.get_link_content(link).unwrap(), b"new content".to_vec());
    // One change event per successful set.
    assert!(wait_until(|| changes.load(Ordering::SeqCst) == 2));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(changes.load(Ordering::SeqCst), 2);
    memory.shutdown().unwrap();
}

#[test]
fn content_round_trip_reflects_last_write() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(params_for(dir.path())).unwrap();
    let ctx = memory.context();
    let link = ctx.create_link(TypeMask::LINK_CONST).unwrap();

    assert_eq!(ctx.get_link_content(link).unwrap(), Vec::<u8>::new());
    for content in [b"first".as_slice(), b"second", b"third"] {
        ctx.set_link_content(link, content).unwrap();
        assert_eq!(ctx.get_link_content(link).unwrap(), content.to_vec());
    }
    memory.shutdown().unwrap();
}

#[test]
fn substring_search_finds_links_by_terms() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(params_for(dir.path())).unwrap();
    let ctx = memory.context();
    let fox = ctx.create_link(TypeMask::LINK_CONST).unwrap();
    let bear = ctx.create_link(TypeMask::LINK_CONST).unwrap();
    ctx.set_link_content(fox, b"the quick brown fox").unwrap();
    ctx.set_link_content(bear, b"the slow brown bear").unwrap();

    assert_eq!(
        ctx.find_links_by_substring(b"brown").unwrap(),
        vec![fox, bear]
    );
    assert_eq!(ctx.find_links_by_substring(b"quick fox").unwrap(), vec![fox]);
    assert_eq!(ctx.find_links_by_substring(b"quick bear").unwrap(), Vec::new());
    memory.shutdown().unwrap();
}

#[test]
fn content_operations_demand_a_link() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(params_for(dir.path())).unwrap();
    let ctx = memory.context();
    let node = ctx.create_node(TypeMask::NODE_CONST).unwrap();

    assert!(matches!(
        ctx.set_link_content(node, b"nope"),
        Err(MnemaError::InvalidParams(_))
    ));
    assert!(ctx.get_link_content(node).is_err());
    memory.shutdown().unwrap();
}

#[test]
fn erased_links_drop_out_of_search_results() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(params_for(dir.path())).unwrap();
    let ctx = memory.context();
    let link = ctx.create_link(TypeMask::LINK_CONST).unwrap();
    ctx.set_link_content(link, b"short lived words").unwrap();

    ctx.erase_element(link).unwrap();
    assert_eq!(
        ctx.find_links_by_content(b"short lived words").unwrap(),
        Vec::new()
    );
    assert_eq!(ctx.find_links_by_substring(b"lived").unwrap(), Vec::new());
    memory.shutdown().unwrap();
}

#[test]
fn system_identifiers_resolve_live_elements_only() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(params_for(dir.path())).unwrap();
    let ctx = memory.context();
    let node = ctx.create_node(TypeMask::NODE_CONST_CLASS).unwrap();
    ctx.set_system_identifier(node, "my_concept").unwrap();

    assert_eq!(ctx.resolve_system_identifier("my_concept").unwrap(), node);
    assert_eq!(ctx.system_identifier_of(node).as_deref(), Some("my_concept"));

    ctx.erase_element(node).unwrap();
    assert!(matches!(
        ctx.resolve_system_identifier("my_concept"),
        Err(MnemaError::IdentifierNotFound(_))
    ));
    memory.shutdown().unwrap();
}

#[test]
fn index_reloads_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let memory = Memory::initialize(params_for(dir.path())).unwrap();
        let ctx = memory.context();
        let link = ctx.create_link(TypeMask::LINK_CONST).unwrap();
        ctx.set_link_content(link, b"durable knowledge").unwrap();
        memory.shutdown().unwrap();
    }
    // Keynode identifiers persisted across the restart and rebound to a
    // fresh store.
    let memory = Memory::initialize(params_for(dir.path())).unwrap();
    let ctx = memory.context();
    assert!(ctx.resolve_system_identifier("question_finished_successfully").is_ok());
    assert_eq!(memory.stats().index.contents, 1);
    memory.shutdown().unwrap();
}

#[test]
fn clear_wipes_the_previous_repo() {
    let dir = tempfile::tempdir().unwrap();
    {
        let memory = Memory::initialize(params_for(dir.path())).unwrap();
        let ctx = memory.context();
        let link = ctx.create_link(TypeMask::LINK_CONST).unwrap();
        ctx.set_link_content(link, b"forget me").unwrap();
        memory.shutdown().unwrap();
    }
    let memory = Memory::initialize(Params {
        clear: true,
        ..params_for(dir.path())
    })
    .unwrap();
    assert_eq!(memory.stats().index.contents, 0);
    memory.shutdown().unwrap();
}

#[test]
fn oversize_content_is_excluded_from_term_search() {
    let dir = tempfile::tempdir().unwrap();
    let memory = Memory::initialize(Params {
        max_searchable_string_size: 16,
        ..params_for(dir.path())
    })
    .unwrap();
    let ctx = memory.context();
    let link = ctx.create_link(TypeMask::LINK_CONST).unwrap();
    let content = b"far beyond the searchable cap";
    ctx.set_link_content(link, content).unwrap();

    assert_eq!(ctx.get_link_content(link).unwrap(), content.to_vec());
    assert_eq!(ctx.find_links_by_content(content).unwrap(), vec![link]);
    assert_eq!(ctx.find_links_by_substring(b"searchable").unwrap(), Vec::new());
    memory.shutdown().unwrap();
}
