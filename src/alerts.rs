use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument};

use crate::config::{Alert, Webhook};
use crate::discord::DiscordManager;

/// Sink for incident notices raised by a sweep
#[async_trait]
pub trait IncidentReporter: Send + Sync {
    async fn report_incident(&self, message: &str);
}

#[derive(Debug, Clone)]
pub struct AlertManager {
    client: Client,
    monitor: String,
    alerts: Vec<Alert>,
    discord_manager: DiscordManager,
}

impl AlertManager {
    pub fn new(monitor: impl ToString, alerts: Vec<Alert>) -> Self {
        let client = Client::new();
        let monitor = monitor.to_string();
        Self {
            discord_manager: DiscordManager::new(client.clone(), &monitor),
            client,
            monitor,
            alerts,
        }
    }

    pub fn monitor(&self) -> &str {
        &self.monitor
    }

    #[instrument(skip(self, webhook))]
    async fn send_webhook_alert(&self, webhook: &Webhook, message: &str) {
        let payload = json!({
            "message": message,
            "monitor": self.monitor,
            "timestamp": Utc::now().to_rfc3339()
        });

        match self.client.post(&webhook.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent webhook alert");
                } else {
                    error!("Webhook alert failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send webhook alert: {}", e);
            }
        }
    }
}

#[async_trait]
impl IncidentReporter for AlertManager {
    #[instrument(skip(self))]
    async fn report_incident(&self, message: &str) {
        if self.alerts.is_empty() {
            error!("{message}");
            return;
        }

        for alert in &self.alerts {
            match alert {
                Alert::Discord(discord) => {
                    let discord_message =
                        self.discord_manager.build_incident_message(discord, message);
                    self.discord_manager
                        .send_message(discord, &discord_message)
                        .await;
                }
                Alert::Webhook(webhook) => {
                    self.send_webhook_alert(webhook, message).await;
                }
            }
        }
    }
}
