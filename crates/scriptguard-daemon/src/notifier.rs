//! Chat webhook notifier (DingTalk / WeCom robots).

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use scriptguard_core::config::NotifyConfig;
use scriptguard_core::{format_timestamp, SharedClock};
use scriptguard_scheduler::{FailureNotice, Notifier, NotifyError};
use serde_json::json;
use tracing::{debug, warn};

/// Response bodies quoted in errors are cut to this many bytes.
const MAX_ERROR_BODY_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WebhookKind {
    #[value(name = "dingtalk")]
    DingTalk,
    #[value(name = "wecom")]
    WeCom,
}

impl WebhookKind {
    fn label(self) -> &'static str {
        match self {
            WebhookKind::DingTalk => "dingtalk",
            WebhookKind::WeCom => "wecom",
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Webhooks {
    dingtalk: Option<String>,
    wecom: Option<String>,
}

/// Posts failure notices as plain-text robot messages. Both robots accept
/// the same `{"msgtype":"text"}` payload.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhooks: RwLock<Webhooks>,
    clock: SharedClock,
}

impl WebhookNotifier {
    pub fn new(config: &NotifyConfig, clock: SharedClock) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotifyError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            webhooks: RwLock::new(Webhooks {
                dingtalk: non_blank(config.dingtalk_webhook.as_deref()),
                wecom: non_blank(config.wecom_webhook.as_deref()),
            }),
            clock,
        })
    }

    /// Replace one webhook URL. `None` disables that target.
    pub fn set_webhook(&self, kind: WebhookKind, url: Option<String>) {
        let url = non_blank(url.as_deref());
        let mut hooks = self.webhooks.write().unwrap_or_else(PoisonError::into_inner);
        match kind {
            WebhookKind::DingTalk => hooks.dingtalk = url,
            WebhookKind::WeCom => hooks.wecom = url,
        }
        debug!(target_kind = kind.label(), "webhook reloaded");
    }

    pub fn webhook(&self, kind: WebhookKind) -> Option<String> {
        let hooks = self.webhooks.read().unwrap_or_else(PoisonError::into_inner);
        match kind {
            WebhookKind::DingTalk => hooks.dingtalk.clone(),
            WebhookKind::WeCom => hooks.wecom.clone(),
        }
    }

    /// Post a test message to `kind`, or to `override_url` when given.
    pub async fn send_test(
        &self,
        kind: WebhookKind,
        override_url: Option<&str>,
    ) -> Result<(), NotifyError> {
        let url = match non_blank(override_url) {
            Some(url) => url,
            None => self
                .webhook(kind)
                .ok_or_else(|| NotifyError::NotConfigured(kind.label().to_string()))?,
        };
        let message = format!(
            "[ScriptGuard] test notification\nTime: {}\n\nIf you can read this, alerts are configured correctly.",
            format_timestamp(&self.clock.now())
        );
        self.post(&url, &message).await
    }

    async fn post(&self, url: &str, message: &str) -> Result<(), NotifyError> {
        let body = json!({
            "msgtype": "text",
            "text": { "content": message },
        });
        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: truncate_body(text.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    /// Sends to every configured target. Each failure is logged; the last
    /// one is returned. No webhook configured is not an error.
    async fn notify_failure(&self, notice: &FailureNotice) -> Result<(), NotifyError> {
        let hooks = self
            .webhooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let message = notice.message();
        let mut outcome = Ok(());

        let targets = [
            (WebhookKind::DingTalk, hooks.dingtalk),
            (WebhookKind::WeCom, hooks.wecom),
        ];
        for (kind, url) in targets {
            let Some(url) = url else { continue };
            if let Err(e) = self.post(&url, &message).await {
                warn!(
                    target_kind = kind.label(),
                    task_id = %notice.task_id,
                    execution_id = %notice.execution_id,
                    "failure notification failed: {e}"
                );
                outcome = Err(e);
            }
        }
        outcome
    }
}

fn non_blank(url: Option<&str>) -> Option<String> {
    url.map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptguard_core::{Clock, Execution, FixedOffsetClock, Task};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn clock() -> SharedClock {
        Arc::new(FixedOffsetClock::from_offset_str("+08:00").unwrap())
    }

    fn notifier(dingtalk: Option<String>, wecom: Option<String>) -> WebhookNotifier {
        let config = NotifyConfig {
            dingtalk_webhook: dingtalk,
            wecom_webhook: wecom,
            timeout_secs: 2,
        };
        WebhookNotifier::new(&config, clock()).unwrap()
    }

    fn notice() -> FailureNotice {
        let clock = clock();
        let task = Task::new(
            "nightly-export",
            "/jobs/export.py",
            "etl",
            vec!["0 0 2 * * *".into()],
            clock.now(),
        );
        let mut execution = Execution::start(task.id.clone(), clock.now());
        execution.fail(clock.now(), 1, "script exited with status 1");
        FailureNotice::new(&task, &execution, "script exited with status 1")
    }

    #[tokio::test]
    async fn failure_is_posted_as_text_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/robot/send"))
            .and(header("content-type", "application/json"))
            .and(body_partial_json(json!({ "msgtype": "text" })))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"errcode\":0}"))
            .expect(1)
            .mount(&server)
            .await;

        let n = notifier(Some(format!("{}/robot/send", server.uri())), None);
        n.notify_failure(&notice()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let content = body["text"]["content"].as_str().unwrap();
        assert!(content.contains("nightly-export"));
        assert!(content.contains("/jobs/export.py"));
        assert!(content.contains("status 1"));
    }

    #[tokio::test]
    async fn both_targets_receive_the_notice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let n = notifier(
            Some(format!("{}/ding", server.uri())),
            Some(format!("{}/wecom", server.uri())),
        );
        n.notify_failure(&notice()).await.unwrap();
    }

    #[tokio::test]
    async fn non_2xx_reports_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("x".repeat(10_000)))
            .mount(&server)
            .await;

        let n = notifier(None, Some(server.uri()));
        match n.notify_failure(&notice()).await {
            Err(NotifyError::Rejected { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), MAX_ERROR_BODY_BYTES);
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nothing_configured_is_quiet() {
        let n = notifier(None, Some("   ".into()));
        n.notify_failure(&notice()).await.unwrap();
        assert!(matches!(
            n.send_test(WebhookKind::WeCom, None).await,
            Err(NotifyError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn reload_and_override_pick_the_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/override"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let n = notifier(Some("http://127.0.0.1:9/old".into()), None);
        n.set_webhook(WebhookKind::DingTalk, Some(format!("{}/new", server.uri())));
        n.send_test(WebhookKind::DingTalk, None).await.unwrap();

        let url = format!("{}/override", server.uri());
        n.send_test(WebhookKind::WeCom, Some(&url)).await.unwrap();

        n.set_webhook(WebhookKind::DingTalk, None);
        assert!(n.webhook(WebhookKind::DingTalk).is_none());
    }

    #[test]
    fn body_truncation_respects_char_boundaries() {
        let body = "é".repeat(MAX_ERROR_BODY_BYTES);
        let cut = truncate_body(&body);
        assert!(cut.len() <= MAX_ERROR_BODY_BYTES);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
