use std::collections::HashMap;

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
}

/// Session resolution is an external collaborator; this is the contract the
/// chat routes depend on.
#[async_trait::async_trait]
pub trait SessionAuth: Send + Sync {
    /// Resolve a bearer token to a session, or `None` for anonymous callers.
    async fn authenticate(&self, bearer: Option<&str>) -> Option<Session>;
}

/// Reference implementation: a static token-to-user table from the
/// `AUTH_TOKENS` env var (`token:user` pairs, comma separated).
#[derive(Default)]
pub struct StaticTokenAuth {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuth {
    #[must_use]
    pub fn from_env() -> Self {
        let tokens = std::env::var("AUTH_TOKENS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|pair| {
                let (token, user) = pair.trim().split_once(':')?;
                if token.is_empty() || user.is_empty() {
                    return None;
                }
                Some((token.to_string(), user.to_string()))
            })
            .collect();
        Self { tokens }
    }
}

#[async_trait::async_trait]
impl SessionAuth for StaticTokenAuth {
    async fn authenticate(&self, bearer: Option<&str>) -> Option<Session> {
        let token = bearer?;
        self.tokens.get(token).map(|user_id| Session {
            user_id: user_id.clone(),
        })
    }
}
