//! HTTP Basic authentication.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;

use crate::context::{RequestContext, ServerContext, vars};
use crate::error::{ConfigError, RequestError};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::module::{Hook, Module};

struct Protected {
    uri: Regex,
    realm: String,
    credentials: BTreeMap<String, String>,
}

/// Decodes an `Authorization: Basic ...` header into user and password.
pub fn decode_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[derive(Default)]
pub struct AuthenticationModule {
    protected: Vec<Protected>,
}

impl AuthenticationModule {
    pub const NAME: &'static str = "authentication";
}

#[async_trait]
impl Module for AuthenticationModule {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn init(&mut self, server: Arc<ServerContext>) -> Result<(), ConfigError> {
        self.protected = server
            .config
            .authentications
            .iter()
            .map(|auth| {
                let uri = Regex::new(&auth.uri).map_err(|source| ConfigError::InvalidPattern {
                    pattern: auth.uri.clone(),
                    source,
                })?;
                Ok(Protected {
                    uri,
                    realm: auth.realm.clone(),
                    credentials: auth.credentials.clone(),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(())
    }

    async fn process(
        &mut self,
        request: &mut Request,
        response: &mut Response,
        ctx: &mut RequestContext,
        hook: Hook,
    ) -> Result<(), RequestError> {
        if hook != Hook::RequestPost {
            return Ok(());
        }

        let uri = ctx.server_var(vars::X_REQUEST_URI).unwrap_or(&request.path);
        let Some(protected) = self.protected.iter().find(|p| p.uri.is_match(uri)) else {
            return Ok(());
        };

        let user = request
            .header("Authorization")
            .and_then(decode_basic)
            .filter(|(user, password)| {
                protected.credentials.get(user).is_some_and(|p| p == password)
            })
            .map(|(user, _)| user);

        match user {
            Some(user) => {
                ctx.set_server_var(vars::AUTH_TYPE, "Basic");
                ctx.set_server_var(vars::REMOTE_USER, user);
                Ok(())
            }
            None => {
                response.set_header(
                    "WWW-Authenticate",
                    format!("Basic realm=\"{}\"", protected.realm),
                );
                Err(RequestError::unauthorized(
                    "This resource requires valid credentials",
                ))
            }
        }
    }
}
