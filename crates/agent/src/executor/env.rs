//! FUSE helper environment composition and log redaction.

use std::collections::HashMap;
use std::path::Path;

use common::message::BackupTarget;

use crate::secrets::Credentials;

/// Environment keys whose values never appear in logs.
pub const REDACTED_ENV_KEYS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// Compose the environment for one FUSE helper invocation. The bucket
/// falls back to the target id when the secret store does not name one.
pub fn fuse_environment(
    target: &BackupTarget,
    credentials: &Credentials,
    mount_path: &Path,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    env.insert(
        "DMS_FUSE_BUCKET".to_string(),
        credentials
            .bucket
            .clone()
            .unwrap_or_else(|| target.id.clone()),
    );
    env.insert(
        "DMS_FUSE_MOUNT_PATH".to_string(),
        mount_path.display().to_string(),
    );
    env.insert(
        "AWS_ACCESS_KEY_ID".to_string(),
        credentials.access_key.clone(),
    );
    env.insert(
        "AWS_SECRET_ACCESS_KEY".to_string(),
        credentials.secret_key.clone(),
    );
    if let Some(session_token) = &credentials.session_token {
        env.insert("AWS_SESSION_TOKEN".to_string(), session_token.clone());
    }
    if let Some(endpoint) = &credentials.endpoint {
        env.insert("AWS_ENDPOINT_URL".to_string(), endpoint.clone());
    }
    if let Some(region) = &credentials.region {
        env.insert("AWS_REGION".to_string(), region.clone());
    }
    if credentials.no_ssl {
        env.insert("DMS_FUSE_NO_SSL".to_string(), "1".to_string());
    }

    env
}

/// Render an environment for logging, masking secret-bearing keys.
pub fn redacted_env(env: &HashMap<String, String>) -> Vec<String> {
    let mut rendered: Vec<String> = env
        .iter()
        .map(|(key, value)| {
            if REDACTED_ENV_KEYS.contains(&key.as_str()) {
                format!("{key}=***")
            } else {
                format!("{key}={value}")
            }
        })
        .collect();
    rendered.sort();
    rendered
}
