//! Scheduled-stop hook - Tells the landing side a campaign has ended

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hookline_common::{Error, Result};
use hookline_storage::models::Campaign;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Called for each campaign whose scheduled stop date has passed, before the
/// campaign is completed. An error leaves the campaign running so the stop is
/// retried on the next cycle.
#[async_trait]
pub trait StopHook: Send + Sync {
    async fn stop(&self, campaign: &Campaign) -> Result<()>;
}

/// Hook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStopHook;

#[async_trait]
impl StopHook for NoopStopHook {
    async fn stop(&self, _campaign: &Campaign) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StopRequest<'a> {
    campaign_id: Uuid,
    user_id: Uuid,
    name: &'a str,
    scheduled_stop_date: Option<DateTime<Utc>>,
}

/// Hook that POSTs the stopped campaign as JSON
#[derive(Debug, Clone)]
pub struct HttpStopHook {
    client: Client,
    endpoint: String,
}

impl HttpStopHook {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl StopHook for HttpStopHook {
    async fn stop(&self, campaign: &Campaign) -> Result<()> {
        let request = StopRequest {
            campaign_id: campaign.id,
            user_id: campaign.user_id,
            name: &campaign.name,
            scheduled_stop_date: campaign.scheduled_stop_date,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Stop hook request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "Stop hook returned status {}",
                response.status()
            )));
        }

        debug!(campaign_id = %campaign.id, "Stop hook acknowledged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn campaign() -> Campaign {
        let now = Utc::now();
        Campaign {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Q3 awareness".to_string(),
            status: "in_progress".to_string(),
            channel: "email".to_string(),
            attack_objective: String::new(),
            redirect_url: String::new(),
            url: "https://track.example.net".to_string(),
            landing_url: String::new(),
            qr_size: String::new(),
            template_id: Uuid::new_v4(),
            page_id: None,
            smtp_id: None,
            sms_id: None,
            created_date: now,
            launch_date: now,
            send_by_date: None,
            scheduled_stop_date: Some(now),
            completed_date: None,
        }
    }

    #[tokio::test]
    async fn test_http_stop_hook_posts_campaign() {
        let server = MockServer::start().await;
        let campaign = campaign();
        Mock::given(method("POST"))
            .and(path("/stop"))
            .and(body_partial_json(serde_json::json!({
                "campaign_id": campaign.id,
                "name": "Q3 awareness",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let hook =
            HttpStopHook::new(format!("{}/stop", server.uri()), Duration::from_secs(5)).unwrap();
        hook.stop(&campaign).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_stop_hook_reports_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let hook = HttpStopHook::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = hook.stop(&campaign()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
