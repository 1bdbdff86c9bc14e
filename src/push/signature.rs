//! Webhook signature validation.
//!
//! Providers listed in `webhook_validation_enabled_providers` must sign their
//! webhooks with HMAC-SHA1, sent as `sha1=<hex>` in the configured header.
//! The secret is looked up by `(repo, org, provider)`, then by the
//! `default-webhook-secret` pseudo-repo of the same org and provider.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha1::Sha1;

use crate::config::{Settings, WebhookValidation};
use crate::constants::DEFAULT_WEBHOOK_SECRET_REPO;
use crate::core::DinghyError;

type HmacSha1 = Hmac<Sha1>;

/// The validation record that applies to a repository, if any.
pub fn find_validation<'s>(
    settings: &'s Settings,
    provider: &str,
    org: &str,
    repo: &str,
) -> Option<&'s WebhookValidation> {
    let lookup = |repo: &str| {
        settings
            .webhook_validations
            .iter()
            .find(|v| v.provider == provider && v.org == org && v.repo == repo)
    };
    lookup(repo).or_else(|| lookup(DEFAULT_WEBHOOK_SECRET_REPO))
}

/// Check the signature of a webhook for `org/repo` on `provider`.
///
/// `body` is the request body and `parsed` its decoded form; when the body
/// carries a `raw_payload` string, that string is what was signed.
pub fn validate_signature(
    settings: &Settings,
    provider: &str,
    org: &str,
    repo: &str,
    body: &[u8],
    parsed: &Value,
    signature: Option<&str>,
) -> Result<(), DinghyError> {
    if !settings.webhook_validation_enabled_providers.iter().any(|p| p == provider) {
        return Ok(());
    }
    let invalid = || DinghyError::SignatureInvalid {
        provider: provider.to_string(),
        org: org.to_string(),
        repo: repo.to_string(),
    };

    let validation = find_validation(settings, provider, org, repo).ok_or_else(|| {
        tracing::warn!("no webhook secret configured for {} {}/{}", provider, org, repo);
        invalid()
    })?;
    if !validation.enabled {
        return Ok(());
    }

    let signed = parsed.get("raw_payload").and_then(Value::as_str).map_or(body, str::as_bytes);
    let expected = signature
        .and_then(|s| s.trim().strip_prefix("sha1="))
        .and_then(|hex_digest| hex::decode(hex_digest).ok())
        .ok_or_else(invalid)?;

    let mut mac = HmacSha1::new_from_slice(validation.secret.as_bytes()).map_err(|_| invalid())?;
    mac.update(signed);
    mac.verify_slice(&expected).map_err(|_| invalid())
}

/// `sha1=<hex>` signature of `payload` under `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> String {
    let mut mac = match HmacSha1::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length.
        Err(_) => return String::new(),
    };
    mac.update(payload);
    format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings() -> Settings {
        Settings {
            webhook_validation_enabled_providers: vec!["github".to_string()],
            webhook_validations: vec![
                WebhookValidation {
                    enabled: true,
                    provider: "github".to_string(),
                    org: "armory".to_string(),
                    repo: "svc".to_string(),
                    secret: "repo-secret".to_string(),
                },
                WebhookValidation {
                    enabled: true,
                    provider: "github".to_string(),
                    org: "armory".to_string(),
                    repo: DEFAULT_WEBHOOK_SECRET_REPO.to_string(),
                    secret: "org-secret".to_string(),
                },
                WebhookValidation {
                    enabled: false,
                    provider: "github".to_string(),
                    org: "open".to_string(),
                    repo: DEFAULT_WEBHOOK_SECRET_REPO.to_string(),
                    secret: String::new(),
                },
            ],
            ..Settings::default()
        }
    }

    fn check(
        org: &str,
        repo: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(), DinghyError> {
        let parsed: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        validate_signature(&settings(), "github", org, repo, body, &parsed, signature)
    }

    #[test]
    fn test_repo_secret_then_org_default() {
        let body = br#"{"ref": "refs/heads/master"}"#;
        assert!(check("armory", "svc", body, Some(&sign("repo-secret", body))).is_ok());
        assert!(check("armory", "svc", body, Some(&sign("org-secret", body))).is_err());
        assert!(check("armory", "other", body, Some(&sign("org-secret", body))).is_ok());
    }

    #[test]
    fn test_missing_or_garbled_signature() {
        let body = br#"{}"#;
        assert!(matches!(
            check("armory", "svc", body, None),
            Err(DinghyError::SignatureInvalid { .. })
        ));
        assert!(check("armory", "svc", body, Some("sha1=zz")).is_err());
        assert!(check("armory", "svc", body, Some("md5=abc")).is_err());
    }

    #[test]
    fn test_unknown_org_is_rejected_and_disabled_accepts() {
        let body = br#"{}"#;
        assert!(check("elsewhere", "svc", body, Some(&sign("repo-secret", body))).is_err());
        assert!(check("open", "anything", body, None).is_ok());
    }

    #[test]
    fn test_raw_payload_field_is_signed() {
        let inner = r#"{"eventKey":"repo:refs_changed"}"#;
        let body = serde_json::to_vec(&json!({"raw_payload": inner})).unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        let signature = sign("repo-secret", inner.as_bytes());
        let settings = settings();
        let signature = Some(signature.as_str());
        let result =
            validate_signature(&settings, "github", "armory", "svc", &body, &parsed, signature);
        assert!(result.is_ok());
    }

    #[test]
    fn test_providers_not_enabled_are_accepted() {
        let settings = settings();
        let result =
            validate_signature(&settings, "gitlab", "armory", "svc", b"{}", &Value::Null, None);
        assert!(result.is_ok());
    }
}
