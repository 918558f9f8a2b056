//! Capabilities granted to a run, and the identity token minted for deploys

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long a deploy identity token stays valid
pub const TOKEN_LIFETIME_MINUTES: i64 = 10;

/// Access level for one capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    None,
    Read,
    Write,
}

/// Capabilities declared by the pipeline.
///
/// Exactly three are known: reading source content, writing pages, and
/// minting an identity token for the deploy step. Unknown keys are rejected
/// when parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permissions {
    #[serde(default)]
    pub contents: Access,

    #[serde(default)]
    pub pages: Access,

    #[serde(default, rename = "id-token")]
    pub id_token: Access,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            contents: Access::Read,
            pages: Access::Write,
            id_token: Access::Write,
        }
    }
}

impl Permissions {
    /// Check the declared set is exactly what the pipeline needs
    pub fn validate(&self) -> Result<(), String> {
        match self.contents {
            Access::Read => {}
            Access::None => return Err("contents: read is required to check out sources".to_string()),
            Access::Write => return Err("contents: write is broader than the pipeline needs".to_string()),
        }
        self.check_publish()
    }

    /// Check the capabilities the deploy job relies on
    pub fn check_publish(&self) -> Result<(), String> {
        if self.pages != Access::Write {
            return Err("pages: write is required to publish".to_string());
        }
        if self.id_token != Access::Write {
            return Err("id-token: write is required to mint a deploy token".to_string());
        }
        Ok(())
    }

    /// Mint a short-lived identity token for the deploy step of `run_id`
    pub fn mint_identity_token(&self, run_id: Uuid, audience: &str) -> Result<IdentityToken, String> {
        self.mint_identity_token_for(run_id, audience, Duration::minutes(TOKEN_LIFETIME_MINUTES))
    }

    /// Mint an identity token valid for `lifetime`
    pub fn mint_identity_token_for(
        &self,
        run_id: Uuid,
        audience: &str,
        lifetime: Duration,
    ) -> Result<IdentityToken, String> {
        if self.id_token != Access::Write {
            return Err("id-token: write is not granted".to_string());
        }
        let issued_at = Utc::now();
        Ok(IdentityToken {
            value: Uuid::new_v4().simple().to_string(),
            audience: audience.to_string(),
            run_id,
            issued_at,
            expires_at: issued_at + lifetime,
        })
    }
}

/// Opaque token handed to the deploy target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityToken {
    pub value: String,
    pub audience: String,
    pub run_id: Uuid,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdentityToken {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}
