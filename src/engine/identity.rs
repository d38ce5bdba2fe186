//! Identity Hooks (C7): user/group/site resolution injected by the host.
//!
//! Three resolver functions invoked per request; a missing lookup means "no
//! scoping by this dimension" (`spec.md` §4.6). Modeled as a narrow trait
//! rather than an inheritance hierarchy, per the REDESIGN FLAGS guidance on
//! "dynamic dispatch → capability interfaces".

/// Raw request data available to identity hooks: whatever the HTTP layer
/// can hand over before a [`crate::session::Session`] exists.
pub struct IdentityRequest<'a> {
    pub client_id: &'a str,
    pub headers: &'a axum::http::HeaderMap,
}

/// Resolved identity for one request, carried by the [`crate::session::Session`].
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub group_ids: Vec<String>,
    pub client_id: String,
    pub site_id: Option<String>,
}

/// Injected at engine construction; each method may return "unknown" to
/// mean "this dimension does not scope delivery".
pub trait IdentityHooks: Send + Sync {
    fn user_id(&self, req: &IdentityRequest<'_>) -> Option<String>;
    fn group_ids(&self, req: &IdentityRequest<'_>) -> Vec<String>;
    fn site_id(&self, req: &IdentityRequest<'_>) -> Option<String>;

    fn resolve(&self, req: &IdentityRequest<'_>) -> Identity {
        Identity {
            user_id: self.user_id(req),
            group_ids: self.group_ids(req),
            client_id: req.client_id.to_string(),
            site_id: self.site_id(req),
        }
    }
}

/// Default hooks: no scoping by any dimension. The host application
/// delegates authentication/authorization via its own [`IdentityHooks`]
/// implementation (`spec.md` §1 Non-goals).
pub struct NoopIdentityHooks;

impl IdentityHooks for NoopIdentityHooks {
    fn user_id(&self, _req: &IdentityRequest<'_>) -> Option<String> {
        None
    }

    fn group_ids(&self, _req: &IdentityRequest<'_>) -> Vec<String> {
        Vec::new()
    }

    fn site_id(&self, _req: &IdentityRequest<'_>) -> Option<String> {
        None
    }
}
