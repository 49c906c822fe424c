use crate::id::OrganizationId;

/// Organization scope for reads that may span tenants.
///
/// - `Any`: every organization (the scheduler and worker run cross-tenant).
/// - `Organization`: restrict to a single organization (admin dashboards).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum OrganizationScope {
    #[default]
    Any,
    Organization(OrganizationId),
}

impl OrganizationScope {
    pub fn allows(&self, organization_id: OrganizationId) -> bool {
        match self {
            OrganizationScope::Any => true,
            OrganizationScope::Organization(o) => *o == organization_id,
        }
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        match self {
            OrganizationScope::Any => None,
            OrganizationScope::Organization(o) => Some(*o),
        }
    }
}

impl From<Option<OrganizationId>> for OrganizationScope {
    fn from(value: Option<OrganizationId>) -> Self {
        value.map_or(OrganizationScope::Any, OrganizationScope::Organization)
    }
}
