use serde::{Deserialize, Serialize};

use crate::close::CloseCode;

/// JWT claims carried by the identity token. Shared by the gateway (which
/// verifies them) and tooling that issues tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// JSON body returned with a rejected upgrade request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub status: u16,
    pub code: u16,
    pub reason: String,
}

impl Rejection {
    pub fn new(status: u16, code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            code: code.as_u16(),
            reason: reason.into(),
        }
    }
}
