// ABOUTME: Runner identity bootstrap: identity.json with runner id and bearer token
// ABOUTME: Created once on first start, reused afterwards; 0600 on unix

use std::path::Path;

use anyhow::Context;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub runner_id: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
}

/// Generate a cryptographically random bearer token (32 bytes, url-safe base64).
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Load `identity.json` from the state directory, creating it on first start.
pub async fn load_or_create(state_dir: &Path) -> anyhow::Result<Identity> {
    let path = state_dir.join("identity.json");
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            serde_json::from_slice(&bytes).context("identity.json is corrupt")
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let identity = Identity {
                runner_id: format!("runner-{}", nanoid::nanoid!(10)),
                token: generate_token(),
                created_at: Utc::now(),
            };
            let json = serde_json::to_vec_pretty(&identity)?;
            tokio::fs::write(&path, json)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let permissions = std::fs::Permissions::from_mode(0o600);
                tokio::fs::set_permissions(&path, permissions).await.ok();
            }
            info!(runner_id = %identity.runner_id, "created runner identity");
            Ok(identity)
        }
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
