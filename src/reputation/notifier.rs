use crate::config::EdgeBanConfig;
use crate::error::GateError;
use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Pushes a ban out to a network edge firewall.
#[async_trait]
pub trait EdgeBanNotifier: Send + Sync {
    async fn notify_external_ban(&self, origin_id: &str) -> Result<(), GateError>;
    fn name(&self) -> &str;
}

/// Fire-and-forget: run the notification on the current tokio runtime and
/// only log the outcome.
pub fn spawn_edge_ban(notifier: Arc<dyn EdgeBanNotifier>, origin_id: String) {
    tokio::spawn(async move {
        match notifier.notify_external_ban(&origin_id).await {
            Ok(()) => info!("{}: edge ban placed for {}", notifier.name(), origin_id),
            Err(e) => error!("{}: {}", notifier.name(), e),
        }
    });
}

/// Creates a `block` IP access rule in a Cloudflare zone.
pub struct CloudflareNotifier {
    client: reqwest::Client,
    api_base: String,
    zone_id: String,
    api_token: String,
    notes: String,
}

impl CloudflareNotifier {
    pub fn new(zone_id: &str, api_token: &str, notes: &str) -> Result<Self, GateError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GateError::Notify(e.to_string()))?;

        Ok(Self {
            client,
            api_base: CLOUDFLARE_API_BASE.to_string(),
            zone_id: zone_id.to_string(),
            api_token: api_token.to_string(),
            notes: notes.to_string(),
        })
    }

    /// Credentials are read from the environment variables the config names.
    /// Returns `Ok(None)` when edge bans are disabled, and also (with a
    /// warning) when a variable is unset.
    pub fn from_config(config: &EdgeBanConfig) -> Result<Option<Self>, GateError> {
        if !config.enabled {
            return Ok(None);
        }

        let (zone_id, api_token) = match (
            std::env::var(&config.zone_id_env),
            std::env::var(&config.api_token_env),
        ) {
            (Ok(zone_id), Ok(api_token)) => (zone_id, api_token),
            _ => {
                warn!(
                    "Edge bans enabled but {} / {} not set, edge propagation disabled",
                    config.zone_id_env, config.api_token_env
                );
                return Ok(None);
            }
        };

        let mut notifier = Self::new(&zone_id, &api_token, &config.notes)?;
        if let Some(base) = &config.api_base {
            notifier.api_base = base.trim_end_matches('/').to_string();
        }
        Ok(Some(notifier))
    }

    pub fn rules_url(&self) -> String {
        format!(
            "{}/zones/{}/firewall/access_rules/rules",
            self.api_base, self.zone_id
        )
    }

    pub fn rule_body(&self, origin_id: &str) -> serde_json::Value {
        let target = if origin_id.contains(':') { "ip6" } else { "ip" };
        json!({
            "mode": "block",
            "configuration": { "target": target, "value": origin_id },
            "notes": self.notes,
        })
    }
}

#[async_trait]
impl EdgeBanNotifier for CloudflareNotifier {
    async fn notify_external_ban(&self, origin_id: &str) -> Result<(), GateError> {
        let response = self
            .client
            .post(self.rules_url())
            .bearer_auth(&self.api_token)
            .json(&self.rule_body(origin_id))
            .send()
            .await
            .map_err(|e| GateError::Notify(format!("request for {} failed: {}", origin_id, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GateError::Notify(format!(
                "ban of {} rejected with {}: {}",
                origin_id, status, body
            )));
        }

        Ok(())
    }

    fn name(&self) -> &str {
        "Cloudflare"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingNotifier {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EdgeBanNotifier for RecordingNotifier {
        async fn notify_external_ban(&self, origin_id: &str) -> Result<(), GateError> {
            self.calls.lock().push(origin_id.to_string());
            Err(GateError::Notify("edge unavailable".to_string()))
        }

        fn name(&self) -> &str {
            "Recording"
        }
    }

    #[test]
    fn test_rule_body() {
        let notifier = CloudflareNotifier::new("zone", "token", "XSS tester").unwrap();
        let body = notifier.rule_body("1.2.3.4");
        assert_eq!(body["mode"], "block");
        assert_eq!(body["configuration"]["target"], "ip");
        assert_eq!(body["configuration"]["value"], "1.2.3.4");
        assert_eq!(body["notes"], "XSS tester");

        assert_eq!(notifier.rule_body("2001:db8::1")["configuration"]["target"], "ip6");
    }

    #[test]
    fn test_rules_url() {
        let notifier = CloudflareNotifier::new("abc123", "token", "").unwrap();
        assert_eq!(
            notifier.rules_url(),
            "https://api.cloudflare.com/client/v4/zones/abc123/firewall/access_rules/rules"
        );
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let config = EdgeBanConfig::default();
        assert!(CloudflareNotifier::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_missing_credentials_disable_propagation() {
        let config = EdgeBanConfig {
            enabled: true,
            zone_id_env: "GATE_TEST_UNSET_ZONE".to_string(),
            api_token_env: "GATE_TEST_UNSET_TOKEN".to_string(),
            ..EdgeBanConfig::default()
        };
        assert!(CloudflareNotifier::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawned_failure_does_not_escalate() {
        let notifier = Arc::new(RecordingNotifier {
            calls: Mutex::new(Vec::new()),
        });
        spawn_edge_ban(notifier.clone(), "1.2.3.4".to_string());

        for _ in 0..50 {
            if !notifier.calls.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*notifier.calls.lock(), vec!["1.2.3.4".to_string()]);
    }
}
