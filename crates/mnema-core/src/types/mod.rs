//! # Core Type Definitions
//!
//! This module contains the foundational types for the Mnema semantic-graph
//! memory:
//! - Element identity (`Addr`)
//! - The element type algebra (`TypeMask`)
//! - Engine parameters (`Params`, `LogLevel`)
//! - Error types (`MnemaError`)
//!
//! ## Type algebra
//!
//! An element type is a bitmask over orthogonal axes: constancy, structural
//! kind, node sub-class, arc modality and arc polarity. The node sub-class
//! axis and the membership-arc axes share the same high bits; the structural
//! kind bits disambiguate which axis the high bits belong to.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// =============================================================================
// ELEMENT IDENTITY
// =============================================================================

/// Stable opaque identifier of a graph element: `(segment, offset)`.
///
/// The all-zero value is reserved as "empty/invalid". Identifiers are never
/// reused within a run for an erased element.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Addr {
    /// Segment index in the element store.
    pub segment: u16,
    /// Slot offset inside the segment.
    pub offset: u16,
}

impl Addr {
    /// The reserved empty/invalid identifier.
    pub const EMPTY: Self = Self {
        segment: 0,
        offset: 0,
    };

    /// Create an addr from its halves.
    #[must_use]
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// An addr is valid when it is not the reserved empty value.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.segment != 0 || self.offset != 0
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

// =============================================================================
// TYPE MASK
// =============================================================================

/// Bitmask describing the type of a graph element, a subscription filter or
/// a template slot.
///
/// The zero mask is "Unknown" and subsumes every type.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TypeMask(pub u16);

// Structural kind bits.
const BIT_NODE: u16 = 0x0001;
const BIT_LINK: u16 = 0x0002;
const BIT_COMMON_EDGE: u16 = 0x0004;
const BIT_COMMON_ARC: u16 = 0x0008;
const BIT_MEMBERSHIP_ARC: u16 = 0x0010;

// Constancy bits.
const BIT_CONST: u16 = 0x0020;
const BIT_VAR: u16 = 0x0040;

// Membership-arc axes. These bits are shared with the node sub-class axis;
// the structural kind decides the interpretation.
const BIT_PERM: u16 = 0x0080;
const BIT_TEMP: u16 = 0x0100;
const BIT_POS: u16 = 0x0200;
const BIT_NEG: u16 = 0x0400;
const BIT_FUZ: u16 = 0x0800;

// Node sub-class bits.
const BIT_STRUCT: u16 = 0x0080;
const BIT_TUPLE: u16 = 0x0100;
const BIT_ROLE: u16 = 0x0200;
const BIT_NO_ROLE: u16 = 0x0400;
const BIT_CLASS: u16 = 0x0800;
const BIT_SUPERCLASS: u16 = 0x1000;
const BIT_MATERIAL: u16 = 0x2000;

const MASK_KIND: u16 = BIT_NODE | BIT_COMMON_EDGE | BIT_COMMON_ARC | BIT_MEMBERSHIP_ARC;
const MASK_CONSTANCY: u16 = BIT_CONST | BIT_VAR;
const MASK_ARC_MODALITY: u16 = BIT_PERM | BIT_TEMP;
const MASK_ARC_POLARITY: u16 = BIT_POS | BIT_NEG | BIT_FUZ;
const MASK_NODE_SUBCLASS: u16 = BIT_STRUCT
    | BIT_TUPLE
    | BIT_ROLE
    | BIT_NO_ROLE
    | BIT_CLASS
    | BIT_SUPERCLASS
    | BIT_MATERIAL;
const MASK_UPPER: u16 = MASK_NODE_SUBCLASS;

impl TypeMask {
    // -- Constancy ------------------------------------------------------------

    pub const UNKNOWN: Self = Self(0);
    pub const CONST: Self = Self(BIT_CONST);
    pub const VAR: Self = Self(BIT_VAR);

    // -- Nodes ----------------------------------------------------------------

    pub const NODE: Self = Self(BIT_NODE);
    pub const NODE_CONST: Self = Self(BIT_NODE | BIT_CONST);
    pub const NODE_VAR: Self = Self(BIT_NODE | BIT_VAR);

    pub const NODE_STRUCT: Self = Self(BIT_NODE | BIT_STRUCT);
    pub const NODE_TUPLE: Self = Self(BIT_NODE | BIT_TUPLE);
    pub const NODE_ROLE: Self = Self(BIT_NODE | BIT_ROLE);
    pub const NODE_NO_ROLE: Self = Self(BIT_NODE | BIT_NO_ROLE);
    pub const NODE_CLASS: Self = Self(BIT_NODE | BIT_CLASS);
    pub const NODE_SUPERCLASS: Self = Self(BIT_NODE | BIT_SUPERCLASS);
    pub const NODE_MATERIAL: Self = Self(BIT_NODE | BIT_MATERIAL);

    pub const NODE_CONST_STRUCT: Self = Self(BIT_NODE | BIT_CONST | BIT_STRUCT);
    pub const NODE_CONST_TUPLE: Self = Self(BIT_NODE | BIT_CONST | BIT_TUPLE);
    pub const NODE_CONST_ROLE: Self = Self(BIT_NODE | BIT_CONST | BIT_ROLE);
    pub const NODE_CONST_NO_ROLE: Self = Self(BIT_NODE | BIT_CONST | BIT_NO_ROLE);
    pub const NODE_CONST_CLASS: Self = Self(BIT_NODE | BIT_CONST | BIT_CLASS);
    pub const NODE_CONST_SUPERCLASS: Self = Self(BIT_NODE | BIT_CONST | BIT_SUPERCLASS);
    pub const NODE_CONST_MATERIAL: Self = Self(BIT_NODE | BIT_CONST | BIT_MATERIAL);

    pub const NODE_VAR_STRUCT: Self = Self(BIT_NODE | BIT_VAR | BIT_STRUCT);
    pub const NODE_VAR_TUPLE: Self = Self(BIT_NODE | BIT_VAR | BIT_TUPLE);
    pub const NODE_VAR_ROLE: Self = Self(BIT_NODE | BIT_VAR | BIT_ROLE);
    pub const NODE_VAR_NO_ROLE: Self = Self(BIT_NODE | BIT_VAR | BIT_NO_ROLE);
    pub const NODE_VAR_CLASS: Self = Self(BIT_NODE | BIT_VAR | BIT_CLASS);
    pub const NODE_VAR_SUPERCLASS: Self = Self(BIT_NODE | BIT_VAR | BIT_SUPERCLASS);
    pub const NODE_VAR_MATERIAL: Self = Self(BIT_NODE | BIT_VAR | BIT_MATERIAL);

    // -- Links ----------------------------------------------------------------

    pub const LINK: Self = Self(BIT_NODE | BIT_LINK);
    pub const LINK_CONST: Self = Self(BIT_NODE | BIT_LINK | BIT_CONST);
    pub const LINK_VAR: Self = Self(BIT_NODE | BIT_LINK | BIT_VAR);
    pub const LINK_CLASS: Self = Self(BIT_NODE | BIT_LINK | BIT_CLASS);

    // -- Common edges (undirected) and common arcs (directed) -----------------

    pub const EDGE_COMMON: Self = Self(BIT_COMMON_EDGE);
    pub const EDGE_COMMON_CONST: Self = Self(BIT_COMMON_EDGE | BIT_CONST);
    pub const EDGE_COMMON_VAR: Self = Self(BIT_COMMON_EDGE | BIT_VAR);

    pub const ARC_COMMON: Self = Self(BIT_COMMON_ARC);
    pub const ARC_COMMON_CONST: Self = Self(BIT_COMMON_ARC | BIT_CONST);
    pub const ARC_COMMON_VAR: Self = Self(BIT_COMMON_ARC | BIT_VAR);

    // -- Membership arcs ------------------------------------------------------

    pub const ARC_MEMBERSHIP: Self = Self(BIT_MEMBERSHIP_ARC);

    pub const ARC_CONST_POS_PERM: Self =
        Self(BIT_MEMBERSHIP_ARC | BIT_CONST | BIT_POS | BIT_PERM);
    pub const ARC_CONST_NEG_PERM: Self =
        Self(BIT_MEMBERSHIP_ARC | BIT_CONST | BIT_NEG | BIT_PERM);
    pub const ARC_CONST_FUZ_PERM: Self =
        Self(BIT_MEMBERSHIP_ARC | BIT_CONST | BIT_FUZ | BIT_PERM);
    pub const ARC_CONST_POS_TEMP: Self =
        Self(BIT_MEMBERSHIP_ARC | BIT_CONST | BIT_POS | BIT_TEMP);
    pub const ARC_CONST_NEG_TEMP: Self =
        Self(BIT_MEMBERSHIP_ARC | BIT_CONST | BIT_NEG | BIT_TEMP);
    pub const ARC_CONST_FUZ_TEMP: Self =
        Self(BIT_MEMBERSHIP_ARC | BIT_CONST | BIT_FUZ | BIT_TEMP);

    pub const ARC_VAR_POS_PERM: Self = Self(BIT_MEMBERSHIP_ARC | BIT_VAR | BIT_POS | BIT_PERM);
    pub const ARC_VAR_NEG_PERM: Self = Self(BIT_MEMBERSHIP_ARC | BIT_VAR | BIT_NEG | BIT_PERM);
    pub const ARC_VAR_FUZ_PERM: Self = Self(BIT_MEMBERSHIP_ARC | BIT_VAR | BIT_FUZ | BIT_PERM);
    pub const ARC_VAR_POS_TEMP: Self = Self(BIT_MEMBERSHIP_ARC | BIT_VAR | BIT_POS | BIT_TEMP);
    pub const ARC_VAR_NEG_TEMP: Self = Self(BIT_MEMBERSHIP_ARC | BIT_VAR | BIT_NEG | BIT_TEMP);
    pub const ARC_VAR_FUZ_TEMP: Self = Self(BIT_MEMBERSHIP_ARC | BIT_VAR | BIT_FUZ | BIT_TEMP);

    // -- Accessors ------------------------------------------------------------

    /// Raw bitmask value.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Build a mask from raw bits (validity is not checked here).
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn is_node(self) -> bool {
        self.0 & BIT_NODE != 0
    }

    /// Links carry both the node and the link bit.
    #[must_use]
    pub const fn is_link(self) -> bool {
        self.0 & BIT_LINK != 0
    }

    #[must_use]
    pub const fn is_common_edge(self) -> bool {
        self.0 & BIT_COMMON_EDGE != 0
    }

    #[must_use]
    pub const fn is_common_arc(self) -> bool {
        self.0 & BIT_COMMON_ARC != 0
    }

    #[must_use]
    pub const fn is_membership_arc(self) -> bool {
        self.0 & BIT_MEMBERSHIP_ARC != 0
    }

    /// Any directed connector kind.
    #[must_use]
    pub const fn is_arc(self) -> bool {
        self.0 & (BIT_COMMON_ARC | BIT_MEMBERSHIP_ARC) != 0
    }

    /// Any element with endpoints: arc or common edge.
    #[must_use]
    pub const fn is_connector(self) -> bool {
        self.0 & (BIT_COMMON_EDGE | BIT_COMMON_ARC | BIT_MEMBERSHIP_ARC) != 0
    }

    #[must_use]
    pub const fn is_const(self) -> bool {
        self.0 & BIT_CONST != 0
    }

    #[must_use]
    pub const fn is_var(self) -> bool {
        self.0 & BIT_VAR != 0
    }

    /// Union of two masks.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    // -- Algebra --------------------------------------------------------------

    /// Check structural consistency of a mask.
    ///
    /// Rejected: more than one structural kind, the link bit without the node
    /// bit, both constancy bits, high bits without a structural kind that
    /// gives them meaning, more than one value on a single axis, and the two
    /// reserved top bits.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        if self.0 & !(MASK_KIND | BIT_LINK | MASK_CONSTANCY | MASK_UPPER) != 0 {
            return false;
        }
        let kind = self.0 & MASK_KIND;
        if kind & (kind.wrapping_sub(1)) != 0 {
            return false;
        }
        if self.0 & BIT_LINK != 0 && self.0 & BIT_NODE == 0 {
            return false;
        }
        if self.0 & MASK_CONSTANCY == MASK_CONSTANCY {
            return false;
        }
        let upper = self.0 & MASK_UPPER;
        if upper != 0 {
            if self.0 & BIT_NODE != 0 {
                // Node sub-class: at most one.
                if upper & (upper.wrapping_sub(1)) != 0 {
                    return false;
                }
            } else if self.0 & BIT_MEMBERSHIP_ARC != 0 {
                if upper & !(MASK_ARC_MODALITY | MASK_ARC_POLARITY) != 0 {
                    return false;
                }
                let modality = self.0 & MASK_ARC_MODALITY;
                if modality & (modality.wrapping_sub(1)) != 0 {
                    return false;
                }
                let polarity = self.0 & MASK_ARC_POLARITY;
                if polarity & (polarity.wrapping_sub(1)) != 0 {
                    return false;
                }
            } else {
                return false;
            }
        }
        true
    }

    /// A membership arc is fully specified when it carries exactly one
    /// modality and one polarity; other kinds carry no arc axes.
    #[must_use]
    pub const fn is_fully_specified_arc(self) -> bool {
        self.0 & BIT_MEMBERSHIP_ARC == 0
            || (self.0 & MASK_ARC_MODALITY != 0 && self.0 & MASK_ARC_POLARITY != 0)
    }

    /// Subsumption: an element of type `specific` matches this mask when
    /// every bit set here is also set in `specific`. The zero mask subsumes
    /// every type.
    #[must_use]
    pub const fn subsumes(self, specific: Self) -> bool {
        specific.0 & self.0 == self.0
    }

    /// Replace var constancy with const; template generation materializes
    /// concrete elements from variable slots.
    #[must_use]
    pub const fn to_const(self) -> Self {
        if self.is_var() {
            Self((self.0 & !BIT_VAR) | BIT_CONST)
        } else {
            Self(self.0 | BIT_CONST)
        }
    }
}

impl fmt::Display for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

// =============================================================================
// ENGINE PARAMETERS
// =============================================================================

/// Log level recognized by the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Name usable as a tracing env-filter directive.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Parameters for initializing a [`crate::Memory`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Directory holding the string-index files.
    pub repo_path: PathBuf,
    /// Reinitialize all files under `repo_path` on startup.
    pub clear: bool,
    /// Maximum number of content channel files.
    pub max_strings_channels: u32,
    /// Maximum size of a single channel file, in bytes.
    pub max_strings_channel_size: u32,
    /// Contents longer than this are stored but not term-indexed.
    pub max_searchable_string_size: u32,
    /// Separator characters used by the term tokenizer.
    pub term_separators: String,
    /// Default log level for the process.
    pub log_level: LogLevel,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("mnema-repo"),
            clear: false,
            max_strings_channels: 128,
            max_strings_channel_size: 8 * 1024 * 1024,
            max_searchable_string_size: 1000,
            term_separators: " \t\n\r.,;:!?\"'()[]{}".to_string(),
            log_level: LogLevel::Info,
        }
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors produced by the Mnema engine.
///
/// All fallible operations return `Result<T, MnemaError>`; the engine never
/// panics on bad input.
#[derive(Debug, Error)]
pub enum MnemaError {
    /// Malformed identifier, wrong element kind, or empty addr where one is
    /// required.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Operation on a destroyed context or a shut-down memory.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The addr does not refer to a live element.
    #[error("element not found: {0}")]
    ElementNotFound(Addr),

    /// The system identifier does not resolve to an element.
    #[error("system identifier not found: {0}")]
    IdentifierNotFound(String),

    /// Underlying file/channel error on the string index.
    #[error("I/O error: {0}")]
    IoError(String),

    /// A waiter or a read deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// A persisted image failed to serialize or parse.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

// =============================================================================
// TESTS
// =============================================================================
