//! The organization on disk: one directory per worker, named by its identity
//! token and nested under its manager.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument};

use crate::core::identity::{WorkerIdentity, decode, decode_strict, validate_children};
use crate::core::org::{OrgNode, plan_org};
use crate::core::uid::UidCounter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgMember {
    pub identity: WorkerIdentity,
    pub dir: PathBuf,
    pub parent: Option<WorkerIdentity>,
}

impl OrgMember {
    pub fn token(&self) -> String {
        self.identity.token()
    }
}

/// Every worker of the organization, parents before children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Organization {
    pub members: Vec<OrgMember>,
}

impl Organization {
    pub fn root(&self) -> Option<&OrgMember> {
        self.members.iter().find(|member| member.parent.is_none())
    }

    pub fn children_of(&self, identity: &WorkerIdentity) -> Vec<&OrgMember> {
        self.members
            .iter()
            .filter(|member| member.parent.as_ref() == Some(identity))
            .collect()
    }

    /// Everyone below `identity`, at any depth.
    pub fn descendants_of(&self, identity: &WorkerIdentity) -> Vec<&OrgMember> {
        let mut out = Vec::new();
        let mut frontier = vec![*identity];
        while let Some(current) = frontier.pop() {
            for child in self.children_of(&current) {
                frontier.push(child.identity);
                out.push(child);
            }
        }
        out
    }

    /// Tokens of `identity` and everyone below it.
    pub fn scope_tokens(&self, identity: &WorkerIdentity) -> HashSet<String> {
        std::iter::once(identity.token())
            .chain(self.descendants_of(identity).iter().map(|m| m.token()))
            .collect()
    }

    pub fn managers(&self) -> impl Iterator<Item = &OrgMember> {
        self.members.iter().filter(|m| m.identity.is_manager())
    }

    pub fn max_uid(&self) -> Option<u32> {
        self.members.iter().map(|m| m.identity.uid).max()
    }
}

/// Create the directory tree for `hierarchy` under `org_dir`.
///
/// An existing organization is reused as-is (uids observed into `uids`), so a
/// resumed session keeps its identities.
#[instrument(skip_all, fields(org_dir = %org_dir.display()))]
pub fn materialize_org(
    org_dir: &Path,
    hierarchy: &OrgNode,
    uids: &UidCounter,
) -> Result<Organization> {
    let existing = scan_org(org_dir)?;
    if !existing.members.is_empty() {
        if let Some(max) = existing.max_uid() {
            uids.observe(max);
        }
        info!(workers = existing.members.len(), "reusing existing organization");
        return Ok(existing);
    }

    let planned = plan_org(hierarchy, uids).context("plan organization")?;
    let mut members: Vec<OrgMember> = Vec::with_capacity(planned.len());
    for worker in planned {
        let (parent_dir, parent) = match worker.parent {
            Some(index) => (members[index].dir.clone(), Some(members[index].identity)),
            None => (org_dir.to_path_buf(), None),
        };
        let dir = parent_dir.join(worker.identity.token());
        fs::create_dir_all(&dir).with_context(|| format!("create worker dir {}", dir.display()))?;
        members.push(OrgMember {
            identity: worker.identity,
            dir,
            parent,
        });
    }
    info!(workers = members.len(), "organization materialized");
    Ok(Organization { members })
}

/// Rebuild the organization from directory names.
///
/// Directories whose names are not identity tokens are ignored (they hold
/// worker files such as reports). Parent/child rules are re-validated.
pub fn scan_org(org_dir: &Path) -> Result<Organization> {
    let mut org = Organization::default();
    if !org_dir.exists() {
        return Ok(org);
    }

    let roots = token_dirs(org_dir)?;
    if roots.len() > 1 {
        bail!("{} holds {} root workers, expected one", org_dir.display(), roots.len());
    }
    let mut frontier: Vec<(PathBuf, WorkerIdentity, Option<WorkerIdentity>)> = roots
        .into_iter()
        .map(|(dir, identity)| (dir, identity, None))
        .collect();

    while let Some((dir, identity, parent)) = frontier.pop() {
        if parent.is_none() && !identity.role.is_root() {
            return Err(anyhow!("root worker {} does not have a root role", identity));
        }
        let children = token_dirs(&dir)?;
        let child_ids: Vec<WorkerIdentity> = children.iter().map(|(_, id)| *id).collect();
        validate_children(&identity, &child_ids)
            .with_context(|| format!("validate workers under {}", dir.display()))?;
        debug!(worker = %identity, children = children.len(), "scanned worker");

        org.members.push(OrgMember {
            identity,
            dir,
            parent,
        });
        for (child_dir, child) in children.into_iter().rev() {
            frontier.push((child_dir, child, Some(identity)));
        }
    }
    Ok(org)
}

fn token_dirs(dir: &Path) -> Result<Vec<(PathBuf, WorkerIdentity)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        // Non-token names are worker files; a token with a bad shape is an error.
        if decode(name).is_err() {
            continue;
        }
        let identity = decode_strict(name)
            .with_context(|| format!("worker directory {}", entry.path().display()))?;
        out.push((entry.path(), identity));
    }
    out.sort_by_key(|(_, identity)| identity.uid);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Role;
    use crate::core::org::default_org;

    #[test]
    fn materialize_then_scan_agree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let uids = UidCounter::new();
        let org = materialize_org(temp.path(), &default_org(), &uids).expect("materialize");
        assert_eq!(org.members.len(), 6);
        assert!(
            temp.path()
                .join("HIVE_CEO_W1_S1_U00001")
                .join("HIVE_CTO_W1_S1_U00002")
                .join("HIVE_LEAD_W3_S1_U00003")
                .join("HIVE_QA_W0_S1_U00006")
                .is_dir()
        );

        let scanned = scan_org(temp.path()).expect("scan");
        assert_eq!(scanned, org);
    }

    #[test]
    fn existing_org_is_reused_and_uids_observed() {
        let temp = tempfile::tempdir().expect("tempdir");
        materialize_org(temp.path(), &default_org(), &UidCounter::new()).expect("first");

        let fresh = UidCounter::new();
        let again = materialize_org(temp.path(), &default_org(), &fresh).expect("second");
        assert_eq!(again.members.len(), 6);
        assert_eq!(fresh.peek(), 7);
    }

    #[test]
    fn scope_covers_the_subtree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let org = materialize_org(temp.path(), &default_org(), &UidCounter::new()).expect("org");
        let lead = org
            .members
            .iter()
            .find(|m| m.identity.role == Role::Lead)
            .expect("lead");

        let scope = org.scope_tokens(&lead.identity);
        assert_eq!(scope.len(), 4);
        assert!(scope.contains("HIVE_DEV_W0_S2_U00005"));
        assert_eq!(org.managers().count(), 3);
        assert_eq!(org.root().expect("root").identity.role, Role::Ceo);
    }

    #[test]
    fn scan_rejects_invalid_nesting() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(
            temp.path()
                .join("HIVE_CEO_W1_S1_U00001")
                .join("HIVE_DEV_W0_S1_U00002"),
        )
        .expect("mkdir");
        assert!(scan_org(temp.path()).is_err());
    }

    #[test]
    fn non_token_directories_are_ignored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("HIVE_CEO_W0_S1_U00001");
        fs::create_dir_all(root.join("history")).expect("mkdir");
        let org = scan_org(temp.path()).expect("scan");
        assert_eq!(org.members.len(), 1);
        assert!(org.members[0].identity.is_leaf());
    }

    #[test]
    fn scan_rejects_a_worker_with_an_impossible_shape() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("HIVE_DEV_W5_S1_U00001")).expect("mkdir");
        let err = scan_org(temp.path()).expect_err("leaf with subordinates");
        assert!(format!("{err:#}").contains("HIVE_DEV_W5_S1_U00001"));
    }
}
