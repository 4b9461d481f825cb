use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::AppError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const USER_HEADER: &str = "x-user-id";

/// Tenant the call is scoped to, plus the acting user for audit fields.
///
/// Resolution of the tenant (and authentication of the user) happens upstream;
/// by the time a request reaches this service both are plain headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub actor_id: Option<Uuid>,
}

impl TenantContext {
    pub fn new(tenant_id: Uuid) -> Self {
        Self {
            tenant_id,
            actor_id: None,
        }
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Context used by background jobs acting on behalf of a tenant
    pub fn system(tenant_id: Uuid) -> Self {
        Self::new(tenant_id)
    }
}

fn header_uuid(parts: &Parts, name: &str) -> Option<Uuid> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

#[async_trait]
impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant_id =
            header_uuid(parts, TENANT_HEADER).ok_or_else(|| AppError::MissingTenant.into_response())?;

        Ok(TenantContext {
            tenant_id,
            actor_id: header_uuid(parts, USER_HEADER),
        })
    }
}
