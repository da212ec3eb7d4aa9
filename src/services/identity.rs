//! Cross-collection identity resolution.
//!
//! The same opaque ID can denote an auth-account ID or a role-scoped profile
//! ID depending on call site, and stale clients sometimes claim the wrong
//! role. The resolver tries the claimed collection first (by auth back
//! reference, then by profile ID), falls back across the other collections in
//! a fixed order, and degrades to a sentinel identity instead of failing.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{ProfileRef, ProfileRow, ResolvedProfile, Role},
};

/// Fallback order when the claimed collection misses.
const FALLBACK_ORDER: [Role; 3] = [Role::Employee, Role::Hr, Role::Admin];

pub struct IdentityService {
    db: PgPool,
}

impl IdentityService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Resolves `id` (auth-account ID or profile ID) to a canonical profile.
    /// A hit in a different collection overrides the claimed role. Never
    /// fails on a miss; callers needing a hard 404 branch on
    /// [`ResolvedProfile::is_unknown`].
    pub async fn resolve(&self, id: Uuid, claimed_role: Role) -> AppResult<ResolvedProfile> {
        if let Some(profile) = self.lookup(claimed_role, id).await? {
            return Ok(profile);
        }

        for role in FALLBACK_ORDER {
            if role == claimed_role {
                continue;
            }
            if let Some(profile) = self.lookup(role, id).await? {
                return Ok(profile);
            }
        }

        Ok(ResolvedProfile::unknown(id, claimed_role))
    }

    pub async fn resolve_ref(&self, profile: ProfileRef) -> AppResult<ResolvedProfile> {
        self.resolve(profile.id(), profile.role()).await
    }

    /// Two-step lookup in one collection: by auth back reference, then
    /// treating the ID as the profile ID itself.
    async fn lookup(&self, role: Role, id: Uuid) -> AppResult<Option<ResolvedProfile>> {
        let table = table_for(role);

        let by_auth: Option<ProfileRow> = sqlx::query_as(&format!(
            "SELECT * FROM {} WHERE auth_id = $1",
            table
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        let row = match by_auth {
            Some(row) => Some(row),
            None => {
                sqlx::query_as(&format!("SELECT * FROM {} WHERE id = $1", table))
                    .bind(id)
                    .fetch_optional(&self.db)
                    .await?
            }
        };

        Ok(row.map(|row| ResolvedProfile {
            profile: ProfileRef::new(role, row.id),
            name: row.name,
            email: row.email,
            department: row.department,
        }))
    }
}

fn table_for(role: Role) -> &'static str {
    match role {
        Role::Admin => "admin_profiles",
        Role::Hr => "hr_profiles",
        Role::Employee => "employee_profiles",
    }
}
