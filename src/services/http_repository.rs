use crate::core::config::BackendConfig;
use crate::core::error::ContentError;
use crate::core::model::{AudioRef, EventSpec, GenerationStatus, Hero, Illustration, Story};
use crate::services::repository::ContentRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

/// `ContentRepository` backed by the story generation REST API.
pub struct HttpContentRepository {
    base_url: Url,
    api_key: Option<String>,
    client: Client,
}

#[derive(Serialize)]
struct GenerateStoryRequest<'a> {
    hero_id: &'a str,
    hero_name: &'a str,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
    language: &'a str,
}

#[derive(Serialize)]
struct GenerateAudioRequest<'a> {
    language: &'a str,
    voice: &'a str,
}

#[derive(Deserialize)]
struct AudioResponse {
    audio_url: String,
}

#[derive(Serialize)]
struct UpdateStoryRequest<'a> {
    title: &'a str,
    content: &'a str,
    is_favorite: bool,
}

#[derive(Deserialize)]
struct StoryResponse {
    id: String,
    title: String,
    content: String,
    #[serde(default)]
    audio_url: Option<String>,
    #[serde(default)]
    estimated_duration: Option<f64>,
    #[serde(default)]
    illustrations: Vec<IllustrationResponse>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct IllustrationResponse {
    display_order: u32,
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

impl From<IllustrationResponse> for Illustration {
    fn from(r: IllustrationResponse) -> Self {
        let generation_status = match (r.status.as_deref(), r.image_url.is_some()) {
            (Some("failed"), _) | (Some("placeholder"), _) => GenerationStatus::Placeholder,
            (Some("pending"), _) => GenerationStatus::Pending,
            (_, true) => GenerationStatus::Generated,
            (_, false) => GenerationStatus::Pending,
        };
        Illustration {
            generation_status,
            image_ref: r.image_url,
            ..Illustration::new(r.display_order, r.timestamp)
        }
    }
}

impl From<StoryResponse> for Story {
    fn from(r: StoryResponse) -> Self {
        let mut story = Story::new(r.title, r.content);
        story.backend_id = Some(r.id);
        story.audio_ref = r.audio_url;
        story.estimated_duration = r.estimated_duration.unwrap_or(0.0);
        if let Some(created_at) = r.created_at {
            story.created_at = created_at;
        }
        story.set_illustrations(r.illustrations.into_iter().map(Illustration::from).collect());
        story
    }
}

impl HttpContentRepository {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut base_url = config.url()?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid endpoint path: {}", path))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let resp = self.authorize(request).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!("Backend returned {}: {}", status, body);
            return Err(ContentError::from_status(status, &body).into());
        }
        Ok(resp)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = self.send(request).await?;
        let text = resp.text().await?;
        parse_body(&text)
    }
}

/// The raw body only goes to the debug log, never into the error message.
fn parse_body<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text)
        .map_err(|e| {
            debug!("Unparseable backend response ({}): {}", e, text);
            e
        })
        .context("Failed to parse backend response")
}

#[async_trait]
impl ContentRepository for HttpContentRepository {
    async fn generate_story(
        &self,
        hero: &Hero,
        event: &EventSpec,
        language: &str,
    ) -> Result<Story> {
        let url = self.endpoint("stories/generate")?;
        let body = GenerateStoryRequest {
            hero_id: &hero.id,
            hero_name: &hero.name,
            event: &event.event,
            details: event.details.as_deref(),
            language,
        };
        let story: StoryResponse = self.send_json(self.client.post(url).json(&body)).await?;
        Ok(story.into())
    }

    async fn generate_audio(
        &self,
        story_id: &str,
        language: &str,
        voice: &str,
    ) -> Result<AudioRef> {
        let url = self.endpoint(&format!("stories/{}/audio", story_id))?;
        let body = GenerateAudioRequest { language, voice };
        let resp: AudioResponse = self.send_json(self.client.post(url).json(&body)).await?;
        Ok(resp.audio_url)
    }

    async fn generate_illustrations(&self, story_id: &str) -> Result<Story> {
        let url = self.endpoint(&format!("stories/{}/illustrations", story_id))?;
        let story: StoryResponse = self.send_json(self.client.post(url)).await?;
        Ok(story.into())
    }

    async fn regenerate_illustration(
        &self,
        story_id: &str,
        display_order: u32,
    ) -> Result<Illustration> {
        let url = self.endpoint(&format!(
            "stories/{}/illustrations/{}/regenerate",
            story_id, display_order
        ))?;
        let illustration: IllustrationResponse = self.send_json(self.client.post(url)).await?;
        Ok(illustration.into())
    }

    async fn update_story(&self, story: &Story) -> Result<()> {
        let story_id = story
            .backend_id
            .as_deref()
            .ok_or_else(|| ContentError::invariant(format!("Story {} has no backend id", story.id)))?;
        let url = self.endpoint(&format!("stories/{}", story_id))?;
        let body = UpdateStoryRequest {
            title: &story.title,
            content: &story.content,
            is_favorite: story.is_favorite,
        };
        self.send(self.client.put(url).json(&body)).await?;
        Ok(())
    }

    async fn delete_story(&self, story_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("stories/{}", story_id))?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}
