//! Vision inputs: image attachments and image links turned into inline data URIs.

use std::{sync::OnceLock, time::Duration};

use anyhow::{bail, Context, Result};
use base64::Engine;
use parley_ai::ContentPart;
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::warn;

use crate::discord_gateway::InboundMessage;

pub const DEFAULT_IMAGE_FETCH_TIMEOUT_MS: u64 = 15_000;
/// Largest image body downloaded for one attachment or link.
pub const DEFAULT_IMAGE_MAX_BYTES: usize = 8 * 1024 * 1024;

fn image_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)https?://[^\s]+?\.(png|jpe?g|gif|webp)(\?[^\s]*)?")
            .expect("image url pattern is valid")
    })
}

/// Image links in `text`, first occurrence order, without duplicates.
pub(crate) fn image_urls_in(text: &str) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for found in image_url_pattern().find_iter(text) {
        let url = found.as_str();
        if !urls.iter().any(|existing| existing == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

fn is_image_attachment(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|value| value.starts_with("image/"))
}

/// True when the message carries something the relay could turn into an
/// image part, before anything is downloaded.
pub(crate) fn has_image_input(message: &InboundMessage) -> bool {
    message
        .attachments
        .iter()
        .any(|attachment| is_image_attachment(attachment.content_type.as_deref()))
        || image_url_pattern().is_match(&message.content)
}

/// Reads the body of `response`, refusing anything above `max_bytes` either
/// by declared length or while streaming.
async fn read_capped(mut response: reqwest::Response, max_bytes: usize) -> Result<Vec<u8>> {
    if let Some(length) = response.content_length() {
        if length > u64::try_from(max_bytes).unwrap_or(u64::MAX) {
            bail!("image body of {length} bytes exceeds the {max_bytes} byte limit");
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.context("failed to read image body")? {
        if body.len() + chunk.len() > max_bytes {
            bail!("image body exceeds the {max_bytes} byte limit");
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn data_uri(mime: &str, bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{mime};base64,{encoded}")
}

#[derive(Clone)]
pub(crate) struct ImageFetcher {
    http: reqwest::Client,
    max_bytes: usize,
}

impl ImageFetcher {
    pub(crate) fn new(timeout_ms: u64, max_bytes: usize) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .context("failed to create image fetch client")?;
        Ok(Self { http, max_bytes })
    }

    /// Downloads every image input of `message`. Individual failures are
    /// logged and skipped.
    pub(crate) async fn collect(&self, message: &InboundMessage) -> Vec<ContentPart> {
        let mut parts = Vec::new();
        for attachment in &message.attachments {
            let Some(content_type) = attachment.content_type.as_deref() else {
                continue;
            };
            if !is_image_attachment(Some(content_type)) {
                continue;
            }
            match self.fetch_attachment(&attachment.url, content_type).await {
                Ok(uri) => parts.push(ContentPart::image(uri)),
                Err(error) => warn!(url = %attachment.url, %error, "failed to read image attachment"),
            }
        }
        for url in image_urls_in(&message.content) {
            match self.fetch_linked_image(&url).await {
                Ok(Some(uri)) => parts.push(ContentPart::image(uri)),
                Ok(None) => {}
                Err(error) => warn!(%url, %error, "failed to download linked image"),
            }
        }
        parts
    }

    async fn fetch_attachment(&self, url: &str, content_type: &str) -> Result<String> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("attachment request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("attachment download returned status {}", status.as_u16());
        }
        let bytes = read_capped(response, self.max_bytes)
            .await
            .context("failed to read attachment body")?;
        Ok(data_uri(content_type, &bytes))
    }

    /// Links only count when they answer 200 with an image content type.
    async fn fetch_linked_image(&self, url: &str) -> Result<Option<String>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .context("image link request failed")?;
        if response.status() != StatusCode::OK {
            return Ok(None);
        }
        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default();
        if !mime.contains("image") {
            return Ok(None);
        }
        let bytes = read_capped(response, self.max_bytes)
            .await
            .context("failed to read linked image body")?;
        Ok(Some(data_uri(&mime, &bytes)))
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use parley_ai::ContentPart;

    use super::{has_image_input, image_urls_in, ImageFetcher, DEFAULT_IMAGE_MAX_BYTES};
    use crate::discord_gateway::{InboundAttachment, InboundMessage};

    fn message(content: &str, attachments: Vec<InboundAttachment>) -> InboundMessage {
        InboundMessage {
            message_id: 1,
            channel_id: 2,
            author_id: 3,
            author_is_bot: false,
            content: content.to_string(),
            attachments,
        }
    }

    #[test]
    fn unit_image_urls_in_deduplicates_and_keeps_query() {
        let urls = image_urls_in(
            "see https://x.example/a.PNG and https://x.example/b.jpg?size=2 then https://x.example/a.PNG",
        );
        assert_eq!(
            urls,
            vec![
                "https://x.example/a.PNG".to_string(),
                "https://x.example/b.jpg?size=2".to_string(),
            ]
        );
        assert!(image_urls_in("https://x.example/readme.txt").is_empty());
    }

    #[test]
    fn unit_has_image_input_checks_attachments_and_links() {
        assert!(!has_image_input(&message("just text", Vec::new())));
        assert!(has_image_input(&message("look https://x.example/c.webp", Vec::new())));
        assert!(has_image_input(&message(
            "",
            vec![InboundAttachment {
                url: "https://cdn.example/p.gif".to_string(),
                content_type: Some("image/gif".to_string()),
            }]
        )));
        assert!(!has_image_input(&message(
            "",
            vec![InboundAttachment {
                url: "https://cdn.example/notes.txt".to_string(),
                content_type: Some("text/plain".to_string()),
            }]
        )));
    }

    #[tokio::test]
    async fn functional_collect_encodes_attachments_and_links_as_data_uris() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/attachments/photo.png");
            then.status(200).body("abc");
        });
        server.mock(|when, then| {
            when.method(GET).path("/linked/cat.jpg");
            then.status(200).header("content-type", "image/jpeg").body("xyz");
        });

        let inbound = message(
            &format!("what is this {}", server.url("/linked/cat.jpg")),
            vec![
                InboundAttachment {
                    url: server.url("/attachments/photo.png"),
                    content_type: Some("image/png".to_string()),
                },
                InboundAttachment {
                    url: server.url("/attachments/notes.txt"),
                    content_type: Some("text/plain".to_string()),
                },
            ],
        );
        let parts = ImageFetcher::new(2_000, DEFAULT_IMAGE_MAX_BYTES)
            .expect("fetcher")
            .collect(&inbound)
            .await;
        assert_eq!(
            parts,
            vec![
                ContentPart::image("data:image/png;base64,YWJj"),
                ContentPart::image("data:image/jpeg;base64,eHl6"),
            ]
        );
    }

    #[tokio::test]
    async fn regression_collect_skips_links_without_image_content_type_or_ok_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/page.png");
            then.status(200).header("content-type", "text/html").body("<html>");
        });
        server.mock(|when, then| {
            when.method(GET).path("/gone.png");
            then.status(404);
        });

        let inbound = message(
            &format!("{} {}", server.url("/page.png"), server.url("/gone.png")),
            Vec::new(),
        );
        let parts = ImageFetcher::new(2_000, DEFAULT_IMAGE_MAX_BYTES)
            .expect("fetcher")
            .collect(&inbound)
            .await;
        assert!(parts.is_empty());
    }

    #[tokio::test]
    async fn regression_collect_skips_images_above_the_size_limit() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/attachments/huge.png");
            then.status(200).body("0123456789abcdef");
        });
        server.mock(|when, then| {
            when.method(GET).path("/linked/huge.jpg");
            then.status(200)
                .header("content-type", "image/jpeg")
                .body("0123456789abcdef");
        });
        server.mock(|when, then| {
            when.method(GET).path("/attachments/small.png");
            then.status(200).body("abc");
        });

        let inbound = message(
            &server.url("/linked/huge.jpg"),
            vec![
                InboundAttachment {
                    url: server.url("/attachments/huge.png"),
                    content_type: Some("image/png".to_string()),
                },
                InboundAttachment {
                    url: server.url("/attachments/small.png"),
                    content_type: Some("image/png".to_string()),
                },
            ],
        );
        let parts = ImageFetcher::new(2_000, 8)
            .expect("fetcher")
            .collect(&inbound)
            .await;
        assert_eq!(parts, vec![ContentPart::image("data:image/png;base64,YWJj")]);
    }
}
