//! Middleware. Authentication and session handling are an external
//! concern this crate assumes rather than owns — a real deployment
//! sits its own auth/session middleware in front of `build_route` and
//! injects a `RequestUser` extension ahead of this crate's handlers.
//! `AuthStub` exists only so the handlers have something to extract
//! against during local development and in tests.

use poem::{Endpoint, Middleware, Request, Result};

#[derive(Debug, Clone)]
pub struct RequestUser {
    pub id: String,
    pub role: String,
    pub assigned_instances: Option<Vec<u64>>,
}

impl RequestUser {
    pub fn allows(&self, instance_id: u64) -> bool {
        match &self.assigned_instances {
            Some(ids) => ids.contains(&instance_id),
            None => true,
        }
    }
}

pub struct AuthStub;

impl<E: Endpoint> Middleware<E> for AuthStub {
    type Output = AuthStubEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        AuthStubEndpoint { ep }
    }
}

pub struct AuthStubEndpoint<E> {
    ep: E,
}

impl<E: Endpoint> Endpoint for AuthStubEndpoint<E> {
    type Output = E::Output;

    async fn call(&self, mut req: Request) -> Result<Self::Output> {
        req.extensions_mut().insert(RequestUser {
            id: "dev-operator".to_string(),
            role: "admin".to_string(),
            assigned_instances: None,
        });
        self.ep.call(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_user_allows_any_instance() {
        let user = RequestUser {
            id: "u".to_string(),
            role: "admin".to_string(),
            assigned_instances: None,
        };
        assert!(user.allows(42));
    }

    #[test]
    fn restricted_user_only_allows_assigned_instances() {
        let user = RequestUser {
            id: "u".to_string(),
            role: "operator".to_string(),
            assigned_instances: Some(vec![1, 2]),
        };
        assert!(user.allows(1));
        assert!(!user.allows(3));
    }
}
