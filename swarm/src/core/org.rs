//! Organization planning: expand a declared role tree into concrete identities.

use serde::{Deserialize, Serialize};

use crate::core::identity::{Role, WorkerIdentity, validate_child, validate_children};
use crate::core::uid::UidCounter;
use crate::error::IdentityError;

/// One level of the declared hierarchy. `count` copies share the same subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgNode {
    pub role: Role,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OrgNode>,
}

fn default_count() -> u32 {
    1
}

impl OrgNode {
    pub fn leaf(role: Role, count: u32) -> Self {
        Self {
            role,
            count,
            children: Vec::new(),
        }
    }

    pub fn with_children(role: Role, count: u32, children: Vec<OrgNode>) -> Self {
        Self {
            role,
            count,
            children,
        }
    }

    /// Direct subordinates of one instance of this node.
    /// Direct reports per copy. Saturates, so an absurd declaration still
    /// fails the identity bound check instead of wrapping into range.
    pub fn subordinate_count(&self) -> u32 {
        self.children
            .iter()
            .fold(0u32, |acc, child| acc.saturating_add(child.count))
    }

    /// Total workers this node expands to, including every copy.
    pub fn worker_count(&self) -> u64 {
        let per_copy: u64 = 1 + self
            .children
            .iter()
            .map(OrgNode::worker_count)
            .sum::<u64>();
        per_copy * u64::from(self.count)
    }
}

/// Default organization: CEO → CTO → LEAD → {2 DEV, 1 QA}.
pub fn default_org() -> OrgNode {
    OrgNode::with_children(
        Role::Ceo,
        1,
        vec![OrgNode::with_children(
            Role::Cto,
            1,
            vec![OrgNode::with_children(
                Role::Lead,
                1,
                vec![OrgNode::leaf(Role::Dev, 2), OrgNode::leaf(Role::Qa, 1)],
            )],
        )],
    )
}

/// A worker produced by [`plan_org`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWorker {
    pub identity: WorkerIdentity,
    /// Index of the parent in the planned list.
    pub parent: Option<usize>,
}

/// Expand `root` into identities in pre-order, issuing uids from `uids`.
///
/// Every parent/child pair is checked with [`validate_child`] and every
/// sibling group with [`validate_children`]; the first violation aborts.
pub fn plan_org(root: &OrgNode, uids: &UidCounter) -> Result<Vec<PlannedWorker>, IdentityError> {
    if !root.role.is_root() {
        return Err(IdentityError::LayerMismatch {
            parent: "(none)".to_string(),
            child: root.role.code().to_string(),
            expected: 0,
            actual: root.role.depth(),
        });
    }
    if root.count != 1 {
        return Err(IdentityError::TooManyChildren {
            parent: "(none)".to_string(),
            declared: 1,
            actual: root.count as usize,
        });
    }

    let mut planned = Vec::new();
    expand(root, 1, None, uids, &mut planned)?;
    Ok(planned)
}

fn expand(
    node: &OrgNode,
    sibling_rank: u32,
    parent: Option<usize>,
    uids: &UidCounter,
    planned: &mut Vec<PlannedWorker>,
) -> Result<(), IdentityError> {
    let identity = WorkerIdentity::new(
        node.role,
        node.subordinate_count(),
        sibling_rank,
        uids.issue()?,
    )?;
    let index = planned.len();
    planned.push(PlannedWorker { identity, parent });

    let mut next_rank: std::collections::BTreeMap<Role, u32> = Default::default();
    for child in &node.children {
        validate_child(&identity, child.role)?;
        for _ in 0..child.count {
            let rank = next_rank.entry(child.role).or_insert(0);
            *rank += 1;
            expand(child, *rank, Some(index), uids, planned)?;
        }
    }

    let children: Vec<WorkerIdentity> = planned
        .iter()
        .filter(|worker| worker.parent == Some(index))
        .map(|worker| worker.identity)
        .collect();
    validate_children(&identity, &children)
}
