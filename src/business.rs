//! WhatsApp Business API (Graph API) client
//!
//! Stateless request/response transport: text, template, and media sends via
//! `POST {base}/{version}/{phone_number_id}/messages`, and a credential check
//! via `GET {base}/{version}/{phone_number_id}`.

use crate::config::{resolve_credential, BusinessApiConfig};
use crate::error::{ChannelError, Result};
use crate::message::{TemplateComponent, TemplateMessage};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Media category for business API sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaKind {
    /// Pick the media category from a file extension
    pub fn from_path(path: &str) -> Self {
        let ext = path
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "webp" => MediaKind::Image,
            "mp3" | "ogg" | "aac" | "amr" => MediaKind::Audio,
            "mp4" | "3gp" => MediaKind::Video,
            _ => MediaKind::Document,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "document",
        }
    }
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    messaging_product: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<TemplateBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<MediaBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<MediaBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video: Option<MediaBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    document: Option<MediaBody<'a>>,
}

impl<'a> MessageRequest<'a> {
    fn new(to: &'a str, kind: &'static str) -> Self {
        Self {
            messaging_product: "whatsapp",
            to,
            kind,
            text: None,
            template: None,
            image: None,
            audio: None,
            video: None,
            document: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct TemplateBody<'a> {
    name: &'a str,
    language: Language<'a>,
    #[serde(skip_serializing_if = "no_components")]
    components: &'a [TemplateComponent],
}

fn no_components(components: &&[TemplateComponent]) -> bool {
    components.is_empty()
}

#[derive(Debug, Serialize)]
struct Language<'a> {
    code: &'a str,
}

#[derive(Debug, Serialize)]
struct MediaBody<'a> {
    link: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caption: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    error_subcode: Option<i64>,
    #[serde(default)]
    fbtrace_id: Option<String>,
}

/// Strip the leading `+` the Graph API does not accept
pub fn normalize_recipient(to: &str) -> &str {
    to.strip_prefix('+').unwrap_or(to)
}

/// Business API client
pub struct BusinessApiClient {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    phone_number_id: String,
    access_token: String,
}

impl BusinessApiClient {
    /// Build a client, resolving the access token reference
    pub fn new(config: &BusinessApiConfig) -> Result<Self> {
        config.validate()?;
        let access_token = resolve_credential(&config.access_token)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            phone_number_id: config.phone_number_id.clone(),
            access_token,
        })
    }

    pub fn phone_number_id(&self) -> &str {
        &self.phone_number_id
    }

    fn phone_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.base_url, self.api_version, self.phone_number_id
        )
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.phone_url())
    }

    /// Fetch the phone number resource; anything but 200, or no response
    /// at all, is fatal
    pub async fn validate_credentials(&self) -> Result<()> {
        let response = self
            .client
            .get(self.phone_url())
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| ChannelError::CredentialValidationFailed {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ChannelError::CredentialValidationFailed {
                status: Some(status.as_u16()),
                body,
            });
        }

        tracing::debug!(
            phone_number_id = %self.phone_number_id,
            "Business API credentials validated"
        );
        Ok(())
    }

    /// Send a text message, returning the API message ID
    pub async fn send_text(&self, to: &str, body: &str) -> Result<String> {
        let to = normalize_recipient(to);
        let mut request = MessageRequest::new(to, "text");
        request.text = Some(TextBody { body });
        self.send_request(&request).await
    }

    /// Send a template message, returning the API message ID
    pub async fn send_template(&self, to: &str, template: &TemplateMessage) -> Result<String> {
        let to = normalize_recipient(to);
        let mut request = MessageRequest::new(to, "template");
        request.template = Some(TemplateBody {
            name: &template.name,
            language: Language {
                code: &template.language,
            },
            components: &template.components,
        });
        self.send_request(&request).await
    }

    /// Send a media message by link, returning the API message ID
    pub async fn send_media(
        &self,
        to: &str,
        kind: MediaKind,
        link: &str,
        caption: Option<&str>,
    ) -> Result<String> {
        let to = normalize_recipient(to);
        let mut request = MessageRequest::new(to, kind.as_str());
        let body = Some(MediaBody {
            link,
            caption: caption.filter(|c| !c.is_empty()),
        });
        match kind {
            MediaKind::Image => request.image = body,
            MediaKind::Audio => request.audio = body,
            MediaKind::Video => request.video = body,
            MediaKind::Document => request.document = body,
        }
        self.send_request(&request).await
    }

    async fn send_request(&self, request: &MessageRequest<'_>) -> Result<String> {
        let response = self
            .client
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status != reqwest::StatusCode::OK && status != reqwest::StatusCode::CREATED {
            return Err(match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => {
                    tracing::warn!(
                        status = status.as_u16(),
                        code = err.error.code,
                        subcode = ?err.error.error_subcode,
                        fbtrace_id = ?err.error.fbtrace_id,
                        "Business API rejected message"
                    );
                    ChannelError::Api {
                        status: status.as_u16(),
                        message: err.error.message,
                        kind: err.error.kind,
                        code: err.error.code,
                        subcode: err.error.error_subcode,
                    }
                }
                Err(_) => ChannelError::Api {
                    status: status.as_u16(),
                    message: body,
                    kind: "unknown".to_string(),
                    code: 0,
                    subcode: None,
                },
            });
        }

        let parsed: MessageResponse = serde_json::from_str(&body)?;
        Ok(parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .unwrap_or_default())
    }
}
