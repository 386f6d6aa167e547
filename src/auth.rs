use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::sasl::scram::{SCRAM_ITERATIONS, gen_salted_password};
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::tenant::{DEFAULT_TENANT, TenantManager};

/// Login name for unauthenticated browsing and student self sign-up.
pub const ANONYMOUS_USER: &str = "anonymous";
/// The anonymous login's password is public; it only unlocks sign-up and the catalog.
pub const ANONYMOUS_PASSWORD: &str = "anonymous";

/// Who a pgwire login user name stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Login {
    Operator,
    Anonymous,
    User(Ulid),
}

impl Login {
    /// `None` when the name is neither a reserved login nor a user id.
    pub fn parse(user: &str, operator_user: &str) -> Option<Self> {
        if user == operator_user {
            Some(Login::Operator)
        } else if user == ANONYMOUS_USER {
            Some(Login::Anonymous)
        } else {
            Ulid::from_string(user).ok().map(Login::User)
        }
    }
}

/// SCRAM-SHA-256 verifier: a random salt and the salted password derived from it.
/// The cleartext password is never stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    salt: Vec<u8>,
    salted_password: Vec<u8>,
}

impl Credential {
    pub fn new(password: &str) -> Self {
        let salt: [u8; 16] = rand::random();
        Self::with_salt(password, salt.to_vec())
    }

    fn with_salt(password: &str, salt: Vec<u8>) -> Self {
        let salted_password = gen_salted_password(password, &salt, SCRAM_ITERATIONS);
        Self { salt, salted_password }
    }

    #[cfg(test)]
    pub fn verify(&self, password: &str) -> bool {
        gen_salted_password(password, &self.salt, SCRAM_ITERATIONS) == self.salted_password
    }

    fn to_password(&self) -> Password {
        Password::new(Some(self.salt.clone()), self.salted_password.clone())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// Serves SCRAM verifiers: the operator's configured secret, the public
/// anonymous password, or the credential a user registered with in the
/// tenant named by the connection's database.
pub struct LessonbookAuthSource {
    tenant_manager: Arc<TenantManager>,
    operator_user: String,
    operator: Credential,
    anonymous: Credential,
}

impl LessonbookAuthSource {
    pub fn new(tenant_manager: Arc<TenantManager>, operator_user: String, operator_password: &str) -> Self {
        Self {
            tenant_manager,
            operator_user,
            operator: Credential::new(operator_password),
            anonymous: Credential::new(ANONYMOUS_PASSWORD),
        }
    }
}

impl fmt::Debug for LessonbookAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LessonbookAuthSource")
            .field("operator_user", &self.operator_user)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for LessonbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().ok_or(PgWireError::UserNameRequired)?;
        let rejected = || {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            PgWireError::InvalidPassword(user.to_string())
        };
        match Login::parse(user, &self.operator_user) {
            Some(Login::Operator) => Ok(self.operator.to_password()),
            Some(Login::Anonymous) => Ok(self.anonymous.to_password()),
            Some(Login::User(id)) => {
                let tenant = login.database().unwrap_or(DEFAULT_TENANT);
                let engine = self.tenant_manager.get_or_create(tenant).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "FATAL".into(),
                        "08006".into(),
                        format!("tenant error: {e}"),
                    )))
                })?;
                match engine.credential(id).await {
                    Some(credential) => Ok(credential.to_password()),
                    None => Err(rejected()),
                }
            }
            None => Err(rejected()),
        }
    }
}
