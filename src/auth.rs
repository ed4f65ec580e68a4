use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Cleartext password check against the single shared server password.
/// Identity inside the scheduling domain is the `user_id` each statement
/// carries, not the login role.
#[derive(Debug)]
pub struct SharedPasswordAuth {
    password: String,
}

impl SharedPasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuth {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!("login attempt by {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
