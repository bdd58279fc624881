//! Hierarchy identity codec.
//!
//! A worker's position in the organization tree is encoded into a single
//! filesystem-safe token, `HIVE_{ROLE}_W{subordinates}_S{rank}_U{uid:05}`.
//! Worker directories are named by these tokens and nested by hierarchy, so the
//! tree can be rebuilt from directory names alone.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Literal prefix of every identity token.
pub const TOKEN_PREFIX: &str = "HIVE";
/// Upper bound (inclusive) on direct subordinates.
pub const MAX_SUBORDINATES: u32 = 99;
/// Upper bound (inclusive) on uids; matches the five-digit field.
pub const MAX_UID: u32 = 99_999;
const UID_WIDTH: usize = 5;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^HIVE_([A-Z]+)_W(0|[1-9][0-9]*)_S([1-9][0-9]*)_U([0-9]{5})$")
        .expect("token grammar regex is valid")
});

/// Worker roles. The root has no declared layer of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Ceo,
    Cto,
    Coo,
    Lead,
    Dev,
    Qa,
    Doc,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Ceo,
        Role::Cto,
        Role::Coo,
        Role::Lead,
        Role::Dev,
        Role::Qa,
        Role::Doc,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Role::Ceo => "CEO",
            Role::Cto => "CTO",
            Role::Coo => "COO",
            Role::Lead => "LEAD",
            Role::Dev => "DEV",
            Role::Qa => "QA",
            Role::Doc => "DOC",
        }
    }

    pub fn from_code(code: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|role| role.code() == code)
    }

    /// Declared hierarchy layer; `None` for the root.
    pub fn layer(self) -> Option<u8> {
        match self {
            Role::Ceo => None,
            Role::Cto | Role::Coo => Some(1),
            Role::Lead => Some(2),
            Role::Dev | Role::Qa | Role::Doc => Some(3),
        }
    }

    /// Depth in the tree; the root sits at 0.
    pub fn depth(self) -> u8 {
        self.layer().unwrap_or(0)
    }

    pub fn is_root(self) -> bool {
        self.layer().is_none()
    }

    /// Roles on the deepest layer only execute tasks.
    pub fn is_leaf_layer(self) -> bool {
        matches!(self, Role::Dev | Role::Qa | Role::Doc)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Role {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::from_code(s).ok_or_else(|| IdentityError::UnknownRole(s.to_string()))
    }
}

/// Immutable tree position of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub role: Role,
    pub subordinate_count: u32,
    pub sibling_rank: u32,
    pub uid: u32,
}

impl WorkerIdentity {
    /// Build an identity, enforcing field bounds and the role/subordinate shape.
    pub fn new(
        role: Role,
        subordinate_count: u32,
        sibling_rank: u32,
        uid: u32,
    ) -> Result<Self, IdentityError> {
        check_bounds(subordinate_count, sibling_rank, uid)?;
        let identity = Self {
            role,
            subordinate_count,
            sibling_rank,
            uid,
        };
        identity.validate_shape()?;
        Ok(identity)
    }

    pub fn token(&self) -> String {
        format_token(self.role, self.subordinate_count, self.sibling_rank, self.uid)
    }

    pub fn depth(&self) -> u8 {
        self.role.depth()
    }

    /// Leaf workers execute only; a root without subordinates is a leaf too.
    pub fn is_leaf(&self) -> bool {
        self.subordinate_count == 0
    }

    pub fn is_manager(&self) -> bool {
        !self.is_leaf()
    }

    /// Leaf-layer roles must have no subordinates; manager-layer roles need some.
    pub fn validate_shape(&self) -> Result<(), IdentityError> {
        if self.role.is_leaf_layer() && self.subordinate_count != 0 {
            return Err(IdentityError::SubordinateShape {
                role: self.role.code().to_string(),
                expected: "exactly 0",
                actual: self.subordinate_count,
            });
        }
        if !self.role.is_root() && !self.role.is_leaf_layer() && self.subordinate_count == 0 {
            return Err(IdentityError::SubordinateShape {
                role: self.role.code().to_string(),
                expected: "at least 1",
                actual: 0,
            });
        }
        Ok(())
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

impl FromStr for WorkerIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s)
    }
}

/// Encode a tree position into its token.
///
/// Rejects unknown roles and any field outside its bound. Role/subordinate
/// shape is checked separately by [`WorkerIdentity::validate_shape`].
pub fn encode(
    role: &str,
    subordinate_count: u32,
    sibling_rank: u32,
    uid: u32,
) -> Result<String, IdentityError> {
    let role = Role::from_str(role)?;
    check_bounds(subordinate_count, sibling_rank, uid)?;
    Ok(format_token(role, subordinate_count, sibling_rank, uid))
}

/// Decode a token produced by [`encode`]. Any deviation from the grammar or
/// a field bound is an error.
///
/// Like [`encode`], this does not check role/subordinate shape, so
/// `HIVE_DEV_W5_S1_U00002` decodes; use [`decode_strict`] where the token must
/// name a worker that can exist.
pub fn decode(token: &str) -> Result<WorkerIdentity, IdentityError> {
    let malformed = |reason: &str| IdentityError::Malformed {
        token: token.to_string(),
        reason: reason.to_string(),
    };
    let caps = TOKEN_RE
        .captures(token)
        .ok_or_else(|| malformed("expected HIVE_{ROLE}_W{n}_S{n}_U{ddddd}"))?;

    let field = |idx: usize| caps.get(idx).map(|m| m.as_str()).unwrap_or_default();
    let role = Role::from_str(field(1))?;
    let subordinate_count: u32 = field(2)
        .parse()
        .map_err(|_| malformed("subordinate count is not a number"))?;
    let sibling_rank: u32 = field(3)
        .parse()
        .map_err(|_| malformed("sibling rank is not a number"))?;
    let uid: u32 = field(4).parse().map_err(|_| malformed("uid is not a number"))?;

    check_bounds(subordinate_count, sibling_rank, uid)?;
    Ok(WorkerIdentity {
        role,
        subordinate_count,
        sibling_rank,
        uid,
    })
}

/// [`decode`] followed by [`WorkerIdentity::validate_shape`].
pub fn decode_strict(token: &str) -> Result<WorkerIdentity, IdentityError> {
    let identity = decode(token)?;
    identity.validate_shape()?;
    Ok(identity)
}

/// Check that a worker of `child_role` may report directly to `parent`.
pub fn validate_child(parent: &WorkerIdentity, child_role: Role) -> Result<(), IdentityError> {
    let expected = parent.depth() + 1;
    let actual = child_role.depth();
    if child_role.is_root() || actual != expected {
        return Err(IdentityError::LayerMismatch {
            parent: parent.token(),
            child: child_role.code().to_string(),
            expected,
            actual,
        });
    }
    if parent.is_leaf() {
        return Err(IdentityError::ParentIsLeaf {
            parent: parent.token(),
        });
    }
    Ok(())
}

/// Check a complete set of direct children against their parent.
///
/// Each child must pass [`validate_child`] and its own shape check, the count
/// must fit the parent's declared subordinates, and sibling ranks per role must
/// be exactly `1..=n`.
pub fn validate_children(
    parent: &WorkerIdentity,
    children: &[WorkerIdentity],
) -> Result<(), IdentityError> {
    if children.len() > parent.subordinate_count as usize {
        return Err(IdentityError::TooManyChildren {
            parent: parent.token(),
            declared: parent.subordinate_count,
            actual: children.len(),
        });
    }

    let mut ranks: BTreeMap<Role, Vec<u32>> = BTreeMap::new();
    for child in children {
        validate_child(parent, child.role)?;
        child.validate_shape()?;
        ranks.entry(child.role).or_default().push(child.sibling_rank);
    }

    for (role, mut seen) in ranks {
        seen.sort_unstable();
        let contiguous = seen
            .iter()
            .enumerate()
            .all(|(idx, rank)| *rank as usize == idx + 1);
        if !contiguous {
            return Err(IdentityError::SiblingRanks {
                parent: parent.token(),
                role: role.code().to_string(),
                count: seen.len(),
            });
        }
    }
    Ok(())
}

fn check_bounds(subordinate_count: u32, sibling_rank: u32, uid: u32) -> Result<(), IdentityError> {
    if subordinate_count > MAX_SUBORDINATES {
        return Err(IdentityError::SubordinatesOutOfRange {
            value: subordinate_count,
            max: MAX_SUBORDINATES,
        });
    }
    if sibling_rank < 1 {
        return Err(IdentityError::InvalidSiblingRank(sibling_rank));
    }
    if !(1..=MAX_UID).contains(&uid) {
        return Err(IdentityError::UidOutOfRange {
            value: uid,
            max: MAX_UID,
        });
    }
    Ok(())
}

fn format_token(role: Role, subordinate_count: u32, sibling_rank: u32, uid: u32) -> String {
    format!(
        "{TOKEN_PREFIX}_{}_W{subordinate_count}_S{sibling_rank}_U{uid:0width$}",
        role.code(),
        width = UID_WIDTH
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(role: Role, subs: u32, rank: u32, uid: u32) -> WorkerIdentity {
        WorkerIdentity::new(role, subs, rank, uid).expect("valid identity")
    }

    #[test]
    fn encode_decode_round_trips_within_bounds() {
        let cases = [
            (Role::Ceo, 0, 1, 1),
            (Role::Ceo, MAX_SUBORDINATES, 1, MAX_UID),
            (Role::Cto, 3, 2, 42),
            (Role::Lead, 12, 7, 10_000),
            (Role::Dev, 0, 99, 500),
        ];
        for (role, subs, rank, uid) in cases {
            let token = encode(role.code(), subs, rank, uid).expect("encode");
            let decoded = decode(&token).expect("decode");
            assert_eq!(
                decoded,
                WorkerIdentity {
                    role,
                    subordinate_count: subs,
                    sibling_rank: rank,
                    uid
                },
                "token {token}"
            );
        }
    }

    #[test]
    fn encode_pads_uid_to_five_digits() {
        assert_eq!(
            encode("CEO", 0, 1, 1).expect("encode"),
            "HIVE_CEO_W0_S1_U00001"
        );
        assert_eq!(
            encode("LEAD", 4, 2, 123).expect("encode"),
            "HIVE_LEAD_W4_S2_U00123"
        );
    }

    #[test]
    fn encode_rejects_out_of_bounds_fields() {
        assert!(matches!(
            encode("CEO", MAX_SUBORDINATES + 1, 1, 1),
            Err(IdentityError::SubordinatesOutOfRange { .. })
        ));
        assert!(matches!(
            encode("CEO", 0, 0, 1),
            Err(IdentityError::InvalidSiblingRank(0))
        ));
        assert!(matches!(
            encode("CEO", 0, 1, 0),
            Err(IdentityError::UidOutOfRange { .. })
        ));
        assert!(matches!(
            encode("CEO", 0, 1, MAX_UID + 1),
            Err(IdentityError::UidOutOfRange { .. })
        ));
        assert!(matches!(
            encode("INTERN", 0, 1, 1),
            Err(IdentityError::UnknownRole(_))
        ));
        assert!(matches!(
            encode("dev", 0, 1, 1),
            Err(IdentityError::UnknownRole(_))
        ));
    }

    #[test]
    fn decode_leaf_root_token() {
        let identity = decode("HIVE_CEO_W0_S1_U00001").expect("decode");
        assert_eq!(identity.role, Role::Ceo);
        assert_eq!(identity.subordinate_count, 0);
        assert_eq!(identity.sibling_rank, 1);
        assert_eq!(identity.uid, 1);
        assert!(identity.is_leaf());
        assert_eq!(identity.depth(), 0);
    }

    #[test]
    fn strict_decode_adds_the_shape_check() {
        assert!(decode("HIVE_DEV_W5_S1_U00002").is_ok());
        assert!(matches!(
            decode_strict("HIVE_DEV_W5_S1_U00002"),
            Err(IdentityError::SubordinateShape { .. })
        ));
        assert!(matches!(
            decode_strict("HIVE_LEAD_W0_S1_U00003"),
            Err(IdentityError::SubordinateShape { .. })
        ));
        assert!(decode_strict("HIVE_LEAD_W3_S1_U00003").is_ok());
    }

    #[test]
    fn decode_rejects_grammar_deviations() {
        let bad = [
            "",
            "HIVE_CEO_W0_S1_U1",
            "HIVE_CEO_W0_S1_U000001",
            "HIVE_ceo_W0_S1_U00001",
            "PREFIX_CEO_W0_S1_U00001",
            "HIVE_CEO_W00_S1_U00001",
            "HIVE_CEO_W0_S0_U00001",
            "HIVE_CEO_W-1_S1_U00001",
            "HIVE_CEO_W0_S1_U00001_extra",
            "HIVE_CEO_S1_W0_U00001",
            "HIVE_CEO_W1.5_S1_U00001",
        ];
        for token in bad {
            assert!(decode(token).is_err(), "expected error for '{token}'");
        }
    }

    #[test]
    fn decode_rejects_out_of_range_numbers() {
        assert!(matches!(
            decode("HIVE_CEO_W100_S1_U00001"),
            Err(IdentityError::SubordinatesOutOfRange { .. })
        ));
        assert!(matches!(
            decode("HIVE_CEO_W0_S1_U00000"),
            Err(IdentityError::UidOutOfRange { .. })
        ));
        assert!(matches!(
            decode("HIVE_CEO_W99999999999_S1_U00001"),
            Err(IdentityError::Malformed { .. })
        ));
        assert!(matches!(
            decode("HIVE_BOSS_W1_S1_U00001"),
            Err(IdentityError::UnknownRole(_))
        ));
    }

    #[test]
    fn validate_child_against_leaf_root_rejects_non_layer_one_role() {
        let root = decode("HIVE_CEO_W0_S1_U00001").expect("decode");
        for role in [Role::Lead, Role::Dev, Role::Ceo] {
            assert!(
                matches!(
                    validate_child(&root, role),
                    Err(IdentityError::LayerMismatch { .. })
                ),
                "role {role}"
            );
        }
        // Layer is right but a leaf root has no slots.
        assert!(matches!(
            validate_child(&root, Role::Cto),
            Err(IdentityError::ParentIsLeaf { .. })
        ));
    }

    #[test]
    fn validate_child_enforces_layer_plus_one() {
        let root = id(Role::Ceo, 2, 1, 1);
        let cto = id(Role::Cto, 1, 1, 2);
        let lead = id(Role::Lead, 2, 1, 3);

        assert!(validate_child(&root, Role::Cto).is_ok());
        assert!(validate_child(&root, Role::Coo).is_ok());
        assert!(validate_child(&cto, Role::Lead).is_ok());
        assert!(validate_child(&lead, Role::Dev).is_ok());
        assert!(validate_child(&cto, Role::Dev).is_err());
        assert!(validate_child(&lead, Role::Lead).is_err());
    }

    #[test]
    fn shape_rules_for_leaf_and_manager_roles() {
        assert!(WorkerIdentity::new(Role::Dev, 1, 1, 5).is_err());
        assert!(WorkerIdentity::new(Role::Cto, 0, 1, 5).is_err());
        assert!(WorkerIdentity::new(Role::Ceo, 0, 1, 5).is_ok());
        assert!(WorkerIdentity::new(Role::Ceo, 3, 1, 5).is_ok());
    }

    #[test]
    fn validate_children_checks_count_and_ranks() {
        let lead = id(Role::Lead, 3, 1, 10);
        let ok = [
            id(Role::Dev, 0, 1, 11),
            id(Role::Dev, 0, 2, 12),
            id(Role::Qa, 0, 1, 13),
        ];
        assert!(validate_children(&lead, &ok).is_ok());

        let gap = [id(Role::Dev, 0, 1, 11), id(Role::Dev, 0, 3, 12)];
        assert!(matches!(
            validate_children(&lead, &gap),
            Err(IdentityError::SiblingRanks { .. })
        ));

        let small = id(Role::Lead, 1, 1, 10);
        assert!(matches!(
            validate_children(&small, &ok[..2]),
            Err(IdentityError::TooManyChildren { .. })
        ));
    }
}
