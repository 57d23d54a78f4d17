use std::collections::BTreeSet;

use serde::Deserialize;
use thiserror::Error;

use super::{Student, SupervisionDirectory};

pub const PERMISSION_ADMIN_WILDCARD: &str = "admin:*";
pub const PERMISSION_FULL_WILDCARD: &str = "*:*";
pub const PERMISSION_LOCATION_READ: &str = "location:read";

/// Verified claims of whoever sent the request. Token verification happens
/// in the host; we only see the result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    #[serde(default)]
    pub staff_id: Option<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Requester {
    pub fn is_admin(&self) -> bool {
        self.permissions.contains(PERMISSION_ADMIN_WILDCARD)
            || self.permissions.contains(PERMISSION_FULL_WILDCARD)
    }

    fn has_location_read(&self) -> bool {
        self.permissions.contains(PERMISSION_LOCATION_READ)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessReason {
    Administrator,
    LocationRead,
    GroupSupervisor,
    NoGroup,
    NotSupervisor,
    SupervisionUnavailable,
}

impl AccessReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Administrator => "administrator",
            Self::LocationRead => "location_read",
            Self::GroupSupervisor => "group_supervisor",
            Self::NoGroup => "no_group",
            Self::NotSupervisor => "not_supervisor",
            Self::SupervisionUnavailable => "supervision_unavailable",
        }
    }
}

/// Per-request access verdict for one student.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub full_access: bool,
    pub reason: AccessReason,
    /// Groups the requester supervises. Empty when the directory was never
    /// consulted (admin shortcut, groupless student) or the lookup failed.
    pub supervised_groups: BTreeSet<String>,
}

impl AccessGrant {
    fn new(full_access: bool, reason: AccessReason) -> Self {
        Self {
            full_access,
            reason,
            supervised_groups: BTreeSet::new(),
        }
    }

    /// Only administrators and supervisors of the student's group may write.
    /// `location:read` is a read-only elevation.
    pub fn may_modify(&self) -> bool {
        matches!(
            self.reason,
            AccessReason::Administrator | AccessReason::GroupSupervisor
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessDenied {
    #[error("administrator permission required to modify a student without a group")]
    AdministratorRequired,
    #[error("only supervisors of this student's group may modify this student")]
    NotGroupSupervisor,
    #[error("only supervisors of this group may run a session for it")]
    NotSessionSupervisor,
    #[error("administrator permission required")]
    AdminOnly,
    #[error("request carries no requester")]
    Unauthenticated,
}

pub fn resolve(
    requester: &Requester,
    student: &Student,
    directory: &dyn SupervisionDirectory,
) -> AccessGrant {
    let grant = resolve_for_group(requester, student.group_id.as_deref(), directory);
    tracing::debug!(
        student_id = %student.id,
        full_access = grant.full_access,
        reason = grant.reason.as_str(),
        supervised = grant.supervised_groups.len(),
        "access resolved"
    );
    grant
}

fn resolve_for_group(
    requester: &Requester,
    group_id: Option<&str>,
    directory: &dyn SupervisionDirectory,
) -> AccessGrant {
    if requester.is_admin() {
        return AccessGrant::new(true, AccessReason::Administrator);
    }
    let grant = supervision_grant(requester, group_id, directory);
    // location:read widens reads only; a supervisor keeps the write reason.
    if !grant.full_access && requester.has_location_read() {
        return AccessGrant {
            full_access: true,
            reason: AccessReason::LocationRead,
            ..grant
        };
    }
    grant
}

fn supervision_grant(
    requester: &Requester,
    group_id: Option<&str>,
    directory: &dyn SupervisionDirectory,
) -> AccessGrant {
    let Some(group_id) = group_id else {
        return AccessGrant::new(false, AccessReason::NoGroup);
    };
    let Some(staff_id) = requester.staff_id.as_deref() else {
        return AccessGrant::new(false, AccessReason::SupervisionUnavailable);
    };

    match directory.supervised_group_ids(staff_id) {
        Ok(groups) => {
            let full = groups.contains(group_id);
            AccessGrant {
                full_access: full,
                reason: if full {
                    AccessReason::GroupSupervisor
                } else {
                    AccessReason::NotSupervisor
                },
                supervised_groups: groups,
            }
        }
        Err(e) => {
            tracing::warn!(staff_id, error = %e, "supervision lookup failed; limiting access");
            AccessGrant::new(false, AccessReason::SupervisionUnavailable)
        }
    }
}

/// Gate for update/delete on an existing student.
pub fn authorize_mutation(grant: &AccessGrant, student: &Student) -> Result<(), AccessDenied> {
    if grant.may_modify() {
        return Ok(());
    }
    if student.group_id.is_none() {
        Err(AccessDenied::AdministratorRequired)
    } else {
        Err(AccessDenied::NotGroupSupervisor)
    }
}

/// Gate for creating a student in `group_id` (or without a group).
pub fn authorize_create(
    requester: &Requester,
    group_id: Option<&str>,
    directory: &dyn SupervisionDirectory,
) -> Result<(), AccessDenied> {
    let grant = resolve_for_group(requester, group_id, directory);
    if grant.may_modify() {
        return Ok(());
    }
    if group_id.is_none() {
        Err(AccessDenied::AdministratorRequired)
    } else {
        Err(AccessDenied::NotGroupSupervisor)
    }
}
