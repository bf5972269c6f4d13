//! Registry file format
//!
//! ```text
//! # tenantgate hostname registry v1
//! alpha alpha
//! #@ alpha owner=alpha_owner members=alpha_ro:readonly status=live
//! #@ gamma owner=gamma_owner status=tearing-down mode=drop stage=dependency-walk subdomain=gamma
//! ```
//!
//! Mapping lines (`<tenantId> <subdomain>`) exist only for live tenants, so plain consumers
//! that skip `#` lines see exactly the reachable set. `#@` annotations carry the rest of the
//! tenant record. A mapping line without an annotation is a live tenant with the conventional
//! owner role and no members.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::{
    identity::{NameError, RoleName, Subdomain, TenantId},
    registry::models::{
        MemberAccess, MemberRole, TeardownMode, TeardownStage, Tenant, TenantStatus,
    },
};

/// First line of every registry file written by the engine.
pub const HEADER: &str = "# tenantgate hostname registry v1";

const ANNOTATION_PREFIX: &str = "#@";

/// Structural problem in a registry file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {reason}")]
pub struct DocumentError {
    /// 1-based line number.
    pub line: usize,

    /// What was wrong.
    pub reason: String,
}

impl DocumentError {
    fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            line,
            reason: reason.into(),
        }
    }
}

/// Identity claimed by another tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    /// Which identity collided: `id`, `subdomain` or `role`.
    pub field: &'static str,

    /// Colliding value.
    pub value: String,

    /// Tenant already holding it.
    pub owner: TenantId,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    tenants: BTreeMap<TenantId, Tenant>,
}

impl RegistrySnapshot {
    /// Tenant by id.
    #[must_use]
    pub fn get(&self, id: &TenantId) -> Option<&Tenant> {
        self.tenants.get(id)
    }

    /// Live tenant reachable through `subdomain`.
    #[must_use]
    pub fn resolve_by_subdomain(&self, subdomain: &Subdomain) -> Option<&TenantId> {
        self.tenants
            .values()
            .find(|tenant| tenant.is_live() && tenant.subdomain == *subdomain)
            .map(|tenant| &tenant.id)
    }

    /// Tenants ordered by id.
    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    /// Whether the registry has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    /// First identity of `candidate` already claimed by a different tenant.
    ///
    /// Only live and tearing-down tenants claim their subdomain and role names.
    #[must_use]
    pub fn find_collision(&self, candidate: &Tenant) -> Option<Collision> {
        let candidate_roles = candidate.roles();

        for other in self.tenants.values() {
            if other.id == candidate.id || !other.holds_identity() {
                continue;
            }

            if other.subdomain == candidate.subdomain {
                return Some(Collision {
                    field: "subdomain",
                    value: candidate.subdomain.to_string(),
                    owner: other.id.clone(),
                });
            }

            if let Some(role) = other
                .roles()
                .into_iter()
                .find(|role| candidate_roles.contains(role))
            {
                return Some(Collision {
                    field: "role",
                    value: role.to_string(),
                    owner: other.id.clone(),
                });
            }
        }

        None
    }

    pub(crate) fn upsert(&mut self, tenant: Tenant) {
        self.tenants.insert(tenant.id.clone(), tenant);
    }

    pub(crate) fn remove(&mut self, id: &TenantId) -> Option<Tenant> {
        self.tenants.remove(id)
    }

    /// Parse a registry file.
    ///
    /// # Errors
    ///
    /// Returns a [`DocumentError`] for malformed lines, annotations contradicting the mapping
    /// lines, and duplicate ids, subdomains or role names.
    pub fn parse(contents: &str) -> Result<Self, DocumentError> {
        let mut mappings: Vec<(usize, TenantId, Subdomain)> = Vec::new();
        let mut annotations: FxHashMap<TenantId, (usize, Annotation)> = FxHashMap::default();

        for (index, raw) in contents.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();

            if let Some(body) = trimmed.strip_prefix(ANNOTATION_PREFIX) {
                let (id, annotation) = parse_annotation(line, body)?;

                if annotations.insert(id.clone(), (line, annotation)).is_some() {
                    return Err(DocumentError::new(
                        line,
                        format!("duplicate annotation for tenant {id}"),
                    ));
                }

                continue;
            }

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut fields = trimmed.split_whitespace();

            let (Some(id), Some(subdomain), None) = (fields.next(), fields.next(), fields.next())
            else {
                return Err(DocumentError::new(
                    line,
                    "expected `<tenantId> <subdomain>`",
                ));
            };

            let invalid = |error: NameError| DocumentError::new(line, error.to_string());

            mappings.push((
                line,
                TenantId::parse(id).map_err(invalid)?,
                Subdomain::parse(subdomain).map_err(invalid)?,
            ));
        }

        let mut snapshot = Self::default();
        let mut subdomains: FxHashSet<Subdomain> = FxHashSet::default();
        let mut roles: FxHashSet<RoleName> = FxHashSet::default();

        for (line, id, subdomain) in mappings {
            let tenant = match annotations.remove(&id) {
                Some((_, annotation)) => annotation.into_live_tenant(line, id, subdomain)?,
                None => Tenant::new(id, subdomain),
            };

            snapshot.claim(line, tenant, &mut subdomains, &mut roles)?;
        }

        let mut orphans: Vec<_> = annotations.into_iter().collect();
        orphans.sort_by_key(|(_, (line, _))| *line);

        for (id, (line, annotation)) in orphans {
            let tenant = annotation.into_unmapped_tenant(line, id)?;

            snapshot.claim(line, tenant, &mut subdomains, &mut roles)?;
        }

        Ok(snapshot)
    }

    fn claim(
        &mut self,
        line: usize,
        tenant: Tenant,
        subdomains: &mut FxHashSet<Subdomain>,
        roles: &mut FxHashSet<RoleName>,
    ) -> Result<(), DocumentError> {
        if self.tenants.contains_key(&tenant.id) {
            return Err(DocumentError::new(
                line,
                format!("duplicate tenant id {}", tenant.id),
            ));
        }

        if tenant.holds_identity() {
            if !subdomains.insert(tenant.subdomain.clone()) {
                return Err(DocumentError::new(
                    line,
                    format!("duplicate subdomain {}", tenant.subdomain),
                ));
            }

            for role in tenant.roles() {
                if !roles.insert(role.clone()) {
                    return Err(DocumentError::new(line, format!("duplicate role {role}")));
                }
            }
        }

        self.upsert(tenant);

        Ok(())
    }

    /// Serialize to the registry file format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(HEADER);
        out.push('\n');
        out.push_str("# <tenantId> <subdomain>; `#@` lines hold tenant state\n");

        for tenant in self.tenants.values() {
            if let Some(mapping) = tenant.mapping() {
                out.push_str(&format!("{} {}\n", mapping.tenant_id, mapping.subdomain));
            }

            out.push_str(&render_annotation(tenant));
            out.push('\n');
        }

        out
    }
}

fn render_annotation(tenant: &Tenant) -> String {
    let mut fields = vec![
        format!("{ANNOTATION_PREFIX} {}", tenant.id),
        format!("owner={}", tenant.owner_role),
    ];

    if !tenant.member_roles.is_empty() {
        let members: Vec<String> = tenant
            .member_roles
            .iter()
            .map(|member| format!("{}:{}", member.name, member.access.as_str()))
            .collect();

        fields.push(format!("members={}", members.join(",")));
    }

    fields.push(format!("status={}", tenant.status.as_str()));

    match &tenant.status {
        TenantStatus::Live => {}
        TenantStatus::TearingDown { mode, stage } => {
            fields.push(format!("mode={mode}"));
            fields.push(format!("stage={stage}"));
            fields.push(format!("subdomain={}", tenant.subdomain));
        }
        TenantStatus::DestroyedQuarantined { quarantined } => {
            fields.push(format!("subdomain={}", tenant.subdomain));

            if !quarantined.is_empty() {
                fields.push(format!("quarantined={}", quarantined.join(",")));
            }
        }
    }

    fields.join(" ")
}

#[derive(Debug, Default)]
struct Annotation {
    owner: Option<RoleName>,
    members: Vec<MemberRole>,
    status: Option<String>,
    mode: Option<TeardownMode>,
    stage: Option<TeardownStage>,
    subdomain: Option<Subdomain>,
    quarantined: Vec<String>,
}

fn parse_annotation(line: usize, body: &str) -> Result<(TenantId, Annotation), DocumentError> {
    let invalid = |reason: String| DocumentError::new(line, reason);

    let mut tokens = body.split_whitespace();

    let id = tokens
        .next()
        .ok_or_else(|| invalid("annotation without tenant id".to_string()))?;
    let id = TenantId::parse(id).map_err(|error| invalid(error.to_string()))?;

    let mut annotation = Annotation::default();

    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected key=value, found {token:?}")))?;

        match key {
            "owner" => {
                annotation.owner =
                    Some(RoleName::parse(value).map_err(|error| invalid(error.to_string()))?);
            }
            "members" => {
                for member in value.split(',').filter(|member| !member.is_empty()) {
                    let (name, access) = member.split_once(':').ok_or_else(|| {
                        invalid(format!("member {member:?} lacks an access level"))
                    })?;

                    annotation.members.push(MemberRole {
                        name: RoleName::parse(name).map_err(|error| invalid(error.to_string()))?,
                        access: access
                            .parse::<MemberAccess>()
                            .map_err(|error| invalid(error.to_string()))?,
                    });
                }
            }
            "status" => annotation.status = Some(value.to_string()),
            "mode" => {
                annotation.mode = Some(
                    value
                        .parse::<TeardownMode>()
                        .map_err(|error| invalid(error.to_string()))?,
                );
            }
            "stage" => {
                annotation.stage = Some(
                    value
                        .parse::<TeardownStage>()
                        .map_err(|error| invalid(error.to_string()))?,
                );
            }
            "subdomain" => {
                annotation.subdomain =
                    Some(Subdomain::parse(value).map_err(|error| invalid(error.to_string()))?);
            }
            "quarantined" => {
                annotation.quarantined = value
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(String::from)
                    .collect();
            }
            other => return Err(invalid(format!("unknown annotation key {other:?}"))),
        }
    }

    Ok((id, annotation))
}

impl Annotation {
    fn into_live_tenant(
        self,
        line: usize,
        id: TenantId,
        subdomain: Subdomain,
    ) -> Result<Tenant, DocumentError> {
        match self.status.as_deref() {
            None | Some("live") => {}
            Some(other) => {
                return Err(DocumentError::new(
                    line,
                    format!("tenant {id} has a mapping but status {other}"),
                ));
            }
        }

        if self.subdomain.as_ref().is_some_and(|annotated| *annotated != subdomain) {
            return Err(DocumentError::new(
                line,
                format!("annotation subdomain for {id} contradicts its mapping"),
            ));
        }

        let mut tenant = Tenant::new(id, subdomain);

        if let Some(owner) = self.owner {
            tenant.owner_role = owner;
        }

        tenant.member_roles = self.members;

        Ok(tenant)
    }

    fn into_unmapped_tenant(self, line: usize, id: TenantId) -> Result<Tenant, DocumentError> {
        let subdomain = self.subdomain.ok_or_else(|| {
            DocumentError::new(line, format!("tenant {id} has neither mapping nor subdomain"))
        })?;

        let status = match self.status.as_deref() {
            Some("tearing-down") => TenantStatus::TearingDown {
                mode: self.mode.ok_or_else(|| {
                    DocumentError::new(line, format!("tearing-down tenant {id} lacks a mode"))
                })?,
                stage: self.stage.ok_or_else(|| {
                    DocumentError::new(line, format!("tearing-down tenant {id} lacks a stage"))
                })?,
            },
            Some("destroyed-quarantined") => TenantStatus::DestroyedQuarantined {
                quarantined: self.quarantined,
            },
            Some("live") | None => {
                return Err(DocumentError::new(
                    line,
                    format!("live tenant {id} has no mapping line"),
                ));
            }
            Some(other) => {
                return Err(DocumentError::new(
                    line,
                    format!("unknown status {other:?} for tenant {id}"),
                ));
            }
        };

        let owner_role = self.owner.unwrap_or_else(|| id.owner_role());

        Ok(Tenant {
            id,
            subdomain,
            owner_role,
            member_roles: self.members,
            status,
        })
    }
}
