//! GitHub webhook ingestion
//!
//! A webhook is registered per project (and optionally per service). A
//! successful workflow job triggers a rollout of that target; pings are
//! answered; everything else is ignored.

use crate::error::{Error, Result};
use crate::store::RegistryStore;
use crate::upstream::Reconciler;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Webhook event type, from the `X-GitHub-Event` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    Ping,
    WorkflowJob,
}

impl std::fmt::Display for WebhookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WebhookEvent::Ping => write!(f, "ping"),
            WebhookEvent::WorkflowJob => write!(f, "workflow_job"),
        }
    }
}

impl std::str::FromStr for WebhookEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ping" => Ok(WebhookEvent::Ping),
            "workflow_job" => Ok(WebhookEvent::WorkflowJob),
            _ => Err(format!("Unsupported webhook event: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingPayload {
    pub zen: String,
    #[serde(default)]
    pub hook_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    #[serde(default)]
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobPayload {
    pub workflow_job: WorkflowJob,
}

/// What a webhook is registered for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTarget {
    pub project: String,
    pub service: Option<String>,
}

impl WebhookTarget {
    pub fn new(project: &str, service: Option<&str>) -> Self {
        Self {
            project: project.to_string(),
            service: service.map(str::to_string),
        }
    }
}

/// Outcome of a webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Answer to a ping, carrying its zen line
    Pong(String),
    /// Redeploy the target
    Rollout {
        project: String,
        service: Option<String>,
    },
    /// Nothing to do, with the reason
    Ignore(String),
}

pub struct WebhookHandler {
    secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret }
    }

    /// Verify an `X-Hub-Signature-256` value. Without a configured secret
    /// every delivery is accepted.
    pub fn verify_signature(&self, payload: &[u8], signature: Option<&str>) -> bool {
        let secret = match &self.secret {
            Some(s) => s,
            None => {
                debug!("No webhook secret configured, skipping verification");
                return true;
            }
        };

        let signature = match signature {
            Some(s) => s,
            None => {
                warn!("Missing webhook signature");
                return false;
            }
        };

        // GitHub signature format: sha256=<hex>
        let provided = match signature.strip_prefix("sha256=") {
            Some(hex) => hex,
            None => {
                warn!("Invalid webhook signature format");
                return false;
            }
        };

        let valid = verify_hmac_sha256(secret, payload, provided);
        if !valid {
            warn!("Webhook signature verification failed");
        }
        valid
    }

    /// Decide what a delivery asks for, without side effects
    pub fn decide(
        &self,
        event: WebhookEvent,
        target: &WebhookTarget,
        payload: &[u8],
    ) -> Result<Decision> {
        match event {
            WebhookEvent::Ping => {
                let ping: PingPayload = serde_json::from_slice(payload)?;
                Ok(Decision::Pong(ping.zen))
            }
            WebhookEvent::WorkflowJob => {
                let job = serde_json::from_slice::<WorkflowJobPayload>(payload)?.workflow_job;
                let conclusion = job.conclusion.as_deref().unwrap_or("none");

                if job.status == "completed" && conclusion == "success" {
                    info!(
                        project = %target.project,
                        service = ?target.service,
                        job = %job.name,
                        "Workflow job succeeded, rolling out"
                    );
                    Ok(Decision::Rollout {
                        project: target.project.clone(),
                        service: target.service.clone(),
                    })
                } else {
                    Ok(Decision::Ignore(format!(
                        "workflow job '{}' is {} ({})",
                        job.name, job.status, conclusion
                    )))
                }
            }
        }
    }

    /// Verify and decide
    pub fn handle(
        &self,
        event: WebhookEvent,
        target: &WebhookTarget,
        payload: &[u8],
        signature: Option<&str>,
    ) -> Result<Decision> {
        if !self.verify_signature(payload, signature) {
            return Err(Error::InvalidSignature);
        }
        self.decide(event, target, payload)
    }
}

/// Carry out a decision against the upstream stacks
pub async fn apply<S: RegistryStore>(decision: &Decision, reconciler: &Reconciler<S>) -> Result<()> {
    match decision {
        Decision::Rollout { project, service } => {
            reconciler
                .update_upstream(project, service.as_deref(), true)
                .await
        }
        Decision::Pong(_) | Decision::Ignore(_) => Ok(()),
    }
}

/// Generate a random webhook secret
pub fn generate_webhook_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    hex::encode(bytes)
}

/// Verify HMAC-SHA256 signature
fn verify_hmac_sha256(secret: &str, payload: &[u8], signature_hex: &str) -> bool {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    let expected_hex = hex::encode(mac.finalize().into_bytes());
    constant_time_compare(&expected_hex, &signature_hex.to_lowercase())
}

/// Constant-time string comparison
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn job(status: &str, conclusion: Option<&str>) -> Vec<u8> {
        serde_json::json!({
            "action": status,
            "workflow_job": {
                "name": "build",
                "status": status,
                "conclusion": conclusion,
            }
        })
        .to_string()
        .into_bytes()
    }

    fn target() -> WebhookTarget {
        WebhookTarget::new("whoami", Some("web"))
    }

    #[test]
    fn test_event_parsing() {
        assert_eq!("ping".parse::<WebhookEvent>().unwrap(), WebhookEvent::Ping);
        assert_eq!("Workflow_Job".parse::<WebhookEvent>().unwrap(), WebhookEvent::WorkflowJob);
        assert!("push".parse::<WebhookEvent>().is_err());
        assert_eq!(WebhookEvent::WorkflowJob.to_string(), "workflow_job");
    }

    #[test]
    fn test_signature_verification() {
        let handler = WebhookHandler::new(Some("test-secret".to_string()));
        let payload = b"test payload";

        assert!(handler.verify_signature(payload, Some(&sign("test-secret", payload))));
        assert!(!handler.verify_signature(payload, Some(&sign("other", payload))));
        assert!(!handler.verify_signature(payload, Some("sha256=invalid")));
        assert!(!handler.verify_signature(payload, Some("sha1=abc")));
        assert!(!handler.verify_signature(payload, None));
    }

    #[test]
    fn test_no_secret_accepts_everything() {
        let handler = WebhookHandler::new(None);
        assert!(handler.verify_signature(b"x", None));
    }

    #[test]
    fn test_ping_gets_pong() {
        let handler = WebhookHandler::new(None);
        let payload = br#"{"zen": "Keep it logically awesome.", "hook_id": 1}"#;

        let decision = handler.decide(WebhookEvent::Ping, &target(), payload).unwrap();
        assert_eq!(decision, Decision::Pong("Keep it logically awesome.".to_string()));
    }

    #[test]
    fn test_successful_job_rolls_out() {
        let handler = WebhookHandler::new(None);

        let decision = handler
            .decide(WebhookEvent::WorkflowJob, &target(), &job("completed", Some("success")))
            .unwrap();

        assert_eq!(
            decision,
            Decision::Rollout {
                project: "whoami".to_string(),
                service: Some("web".to_string()),
            }
        );
    }

    #[test]
    fn test_other_jobs_are_ignored() {
        let handler = WebhookHandler::new(None);

        for payload in [
            job("queued", None),
            job("in_progress", None),
            job("completed", Some("failure")),
            job("completed", Some("cancelled")),
        ] {
            let decision = handler
                .decide(WebhookEvent::WorkflowJob, &target(), &payload)
                .unwrap();
            assert!(matches!(decision, Decision::Ignore(_)));
        }
    }

    #[test]
    fn test_malformed_payload() {
        let handler = WebhookHandler::new(None);
        let err = handler
            .decide(WebhookEvent::WorkflowJob, &target(), b"{}")
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_handle_rejects_bad_signature() {
        let handler = WebhookHandler::new(Some("secret".to_string()));
        let payload = job("completed", Some("success"));

        let err = handler
            .handle(WebhookEvent::WorkflowJob, &target(), &payload, Some("sha256=00"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSignature));

        let signature = sign("secret", &payload);
        let decision = handler
            .handle(WebhookEvent::WorkflowJob, &target(), &payload, Some(&signature))
            .unwrap();
        assert!(matches!(decision, Decision::Rollout { .. }));
    }

    #[test]
    fn test_generate_webhook_secret() {
        let secret = generate_webhook_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_webhook_secret());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("abc", "abc"));
        assert!(!constant_time_compare("abc", "abd"));
        assert!(!constant_time_compare("abc", "ab"));
    }
}
