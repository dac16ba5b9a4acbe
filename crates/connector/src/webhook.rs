//! Best-effort webhook provisioning. Webhook failures never block a connect
//! or disconnect; they surface as warnings on the outcome.

use rand::Rng;

use gh_client::{HostClient, WebhookRequest};

pub const WEBHOOK_EVENTS: [&str; 3] = ["push", "pull_request", "issues"];

#[derive(Debug, Clone, Default)]
pub struct WebhookOutcome {
    pub hook_id: Option<i64>,
    pub warning: Option<String>,
}

/// 64-char hex secret used to sign webhook deliveries.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub async fn provision(
    client: &dyn HostClient,
    owner: &str,
    name: &str,
    url: &str,
    secret: &str,
) -> WebhookOutcome {
    let request = WebhookRequest {
        url: url.to_string(),
        secret: secret.to_string(),
        events: WEBHOOK_EVENTS.iter().map(|e| e.to_string()).collect(),
    };
    match client.create_webhook(owner, name, &request).await {
        Ok(hook) => WebhookOutcome {
            hook_id: Some(hook.id),
            warning: None,
        },
        Err(err) => WebhookOutcome {
            hook_id: None,
            warning: Some(format!("webhook creation failed: {err}")),
        },
    }
}

pub async fn remove(client: &dyn HostClient, owner: &str, name: &str, hook_id: i64) -> WebhookOutcome {
    match client.delete_webhook(owner, name, hook_id).await {
        Ok(()) => WebhookOutcome {
            hook_id: Some(hook_id),
            warning: None,
        },
        // Already gone on the host side; nothing left to clean up.
        Err(err) if err.is_not_found() => WebhookOutcome::default(),
        Err(err) => WebhookOutcome {
            hook_id: None,
            warning: Some(format!("webhook deletion failed: {err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_64_hex_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn secrets_are_unique() {
        assert_ne!(generate_secret(), generate_secret());
    }
}
