use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::config::Discord;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

const INCIDENT_COLOR: u32 = 15158332; // Red

#[derive(Debug, Clone)]
pub struct DiscordManager {
    client: Client,
    monitor: String,
}

impl DiscordManager {
    pub fn new(client: Client, monitor: impl ToString) -> Self {
        Self {
            client,
            monitor: monitor.to_string(),
        }
    }

    pub fn build_incident_embed(&self, message: &str) -> Embed {
        Embed {
            title: Some("🔴 Pulsar Latency Incident".to_string()),
            description: Some(message.to_string()),
            color: Some(INCIDENT_COLOR),
            footer: Some(EmbedFooter {
                text: format!("Monitor: {}", self.monitor),
            }),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    /// Full message for one incident, pinging `user_id` when configured
    pub fn build_incident_message(&self, discord: &Discord, message: &str) -> Message {
        let mut message_builder =
            MessageBuilder::new().add_embed(self.build_incident_embed(message));
        if let Some(user_id) = &discord.user_id {
            message_builder = message_builder.content(format!("📡 ({}) <@{user_id}>", self.monitor));
        }
        message_builder.build()
    }

    #[instrument(skip(self, discord, message))]
    pub async fn send_message(&self, discord: &Discord, message: &Message) {
        match self.client.post(&discord.url).json(message).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent Discord message");
                } else {
                    error!("Discord message failed with status: {}", response.status());
                    if let Ok(error_text) = response.text().await {
                        error!("Discord API error response: {}", error_text);
                    }
                }
            }
            Err(e) => {
                error!("Failed to send Discord message: {}", e);
            }
        }
    }
}
