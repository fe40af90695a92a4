//! Property-based tests for the type algebra and the content index.

#![allow(clippy::unwrap_used, clippy::panic)]

use mnema_core::{Memory, Params, TypeMask};
use proptest::prelude::*;

// =============================================================================
// MASK STRATEGIES
// =============================================================================

const NAMED_MASKS: [TypeMask; 22] = [
    TypeMask::UNKNOWN,
    TypeMask::CONST,
    TypeMask::VAR,
    TypeMask::NODE,
    TypeMask::NODE_CONST,
    TypeMask::NODE_VAR,
    TypeMask::NODE_CONST_CLASS,
    TypeMask::NODE_CONST_STRUCT,
    TypeMask::NODE_VAR_TUPLE,
    TypeMask::LINK,
    TypeMask::LINK_CONST,
    TypeMask::LINK_VAR,
    TypeMask::EDGE_COMMON,
    TypeMask::EDGE_COMMON_CONST,
    TypeMask::ARC_COMMON,
    TypeMask::ARC_COMMON_CONST,
    TypeMask::ARC_MEMBERSHIP,
    TypeMask::ARC_CONST_POS_PERM,
    TypeMask::ARC_CONST_NEG_PERM,
    TypeMask::ARC_CONST_FUZ_TEMP,
    TypeMask::ARC_VAR_POS_PERM,
    TypeMask::ARC_VAR_NEG_TEMP,
];

fn named_mask() -> impl Strategy<Value = TypeMask> {
    (0..NAMED_MASKS.len()).prop_map(|n| NAMED_MASKS[n])
}

// =============================================================================
// TYPE ALGEBRA PROPERTIES
// =============================================================================

proptest! {
    /// Every named mask is structurally valid.
    #[test]
    fn named_masks_are_valid(mask in named_mask()) {
        prop_assert!(mask.is_valid(), "{mask} should be valid");
    }

    /// Subsumption is reflexive.
    #[test]
    fn subsumption_is_reflexive(mask in named_mask()) {
        prop_assert!(mask.subsumes(mask));
    }

    /// Subsumption is transitive.
    #[test]
    fn subsumption_is_transitive(
        a in named_mask(),
        b in named_mask(),
        c in named_mask()
    ) {
        if a.subsumes(b) && b.subsumes(c) {
            prop_assert!(a.subsumes(c));
        }
    }

    /// The unknown mask subsumes everything; nothing but unknown subsumes
    /// unknown.
    #[test]
    fn unknown_is_the_top_of_the_lattice(mask in named_mask()) {
        prop_assert!(TypeMask::UNKNOWN.subsumes(mask));
        if mask != TypeMask::UNKNOWN {
            prop_assert!(!mask.subsumes(TypeMask::UNKNOWN));
        }
    }

    /// Refining a mask can only narrow what it subsumes.
    #[test]
    fn refinement_narrows_subsumption(
        general in named_mask(),
        refinement in named_mask(),
        probe in named_mask()
    ) {
        let refined = general.with(refinement);
        if refined.subsumes(probe) {
            prop_assert!(general.subsumes(probe));
        }
    }

    /// Raw u16 round-trips through the mask representation.
    #[test]
    fn raw_bits_round_trip(bits in any::<u16>()) {
        prop_assert_eq!(TypeMask::from_bits(bits).bits(), bits);
    }
}

// =============================================================================
// CONTENT INDEX PROPERTIES
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Whatever bytes go in come back out, and the exact index tracks the
    /// latest content only.
    #[test]
    fn content_round_trip(
        first in proptest::collection::vec(1u8..=255, 1..64),
        second in proptest::collection::vec(1u8..=255, 1..64)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let memory = Memory::initialize(Params {
            repo_path: dir.path().to_path_buf(),
            ..Params::default()
        }).unwrap();
        let ctx = memory.context();
        let link = ctx.create_link(TypeMask::LINK_CONST).unwrap();

        ctx.set_link_content(link, &first).unwrap();
        prop_assert_eq!(ctx.get_link_content(link).unwrap(), first.clone());

        ctx.set_link_content(link, &second).unwrap();
        prop_assert_eq!(ctx.get_link_content(link).unwrap(), second.clone());
        prop_assert_eq!(
            ctx.find_links_by_content(&second).unwrap(),
            vec![link]
        );
        if first != second {
            prop_assert_eq!(ctx.find_links_by_content(&first).unwrap(), Vec::new());
        }
        memory.shutdown().unwrap();
    }
}
