//! Text recognition over HTTP.
//!
//! [`VisionClient`] talks to the Cloud Vision `images:annotate` endpoint. The
//! pipeline only depends on the [`Recognizer`] trait, so another service or a
//! local engine can stand in for it.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    util::{offset_vertices, vertex_center},
    Error, ExportedCrop, OcrResult, Position, RecognitionError, Result, TextBlock, Vertex,
};

/// One recognized text region, in crop-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub text: String,
    pub vertices: Vec<Vertex>,
}

/// Raw recognizer output. When present, the first annotation covers the whole
/// recognized text and the rest are individual words.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizedText {
    pub annotations: Vec<Annotation>,
}

impl RecognizedText {
    pub fn full_text(&self) -> &str {
        self.annotations
            .first()
            .map(|it| it.text.as_str())
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, image: Vec<u8>) -> Result<RecognizedText, RecognitionError>;
}

#[derive(Debug, Clone, Deserialize)]
struct CredentialsFile {
    api_key: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone)]
enum Auth {
    ApiKey(String),
    Bearer(String),
}

impl Auth {
    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            Error::config(format!("cannot read credentials {}: {err}", path.display()))
        })?;
        let credentials: CredentialsFile = serde_json::from_str(&content).map_err(|err| {
            Error::config(format!("invalid credentials {}: {err}", path.display()))
        })?;
        match credentials {
            CredentialsFile {
                api_key: Some(key), ..
            } if !key.is_empty() => Ok(Auth::ApiKey(key)),
            CredentialsFile {
                access_token: Some(token),
                ..
            } if !token.is_empty() => Ok(Auth::Bearer(token)),
            _ => Err(Error::config(format!(
                "credentials {} contain neither api_key nor access_token",
                path.display()
            ))),
        }
    }
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: [AnnotateImageRequest<'a>; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageRequest<'a> {
    image: ImageContent,
    features: [Feature; 1],
    image_context: ImageContext<'a>,
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext<'a> {
    language_hints: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    text_annotations: Vec<EntityAnnotation>,
    error: Option<Status>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityAnnotation {
    #[serde(default)]
    description: String,
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<WireVertex>,
}

// The service omits zero coordinates.
#[derive(Debug, Deserialize)]
struct WireVertex {
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
}

#[derive(Debug, Deserialize)]
struct Status {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Status,
}

pub struct VisionClient {
    client: Client,
    endpoint: String,
    auth: Auth,
    language_hints: Vec<String>,
}

impl VisionClient {
    /// Fails with a configuration error when the credentials are unusable.
    pub fn new(
        endpoint: &str,
        credentials_path: &Path,
        language_hints: Vec<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let auth = Auth::from_file(credentials_path)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::config(format!("cannot build HTTP client: {err}")))?;
        log::info!("Recognition endpoint: {endpoint}");
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            auth,
            language_hints,
        })
    }
}

#[async_trait]
impl Recognizer for VisionClient {
    #[instrument(level = "debug", skip(self, image), fields(bytes = image.len()))]
    async fn recognize(&self, image: Vec<u8>) -> Result<RecognizedText, RecognitionError> {
        let body = AnnotateRequest {
            requests: [AnnotateImageRequest {
                image: ImageContent {
                    content: STANDARD.encode(&image),
                },
                features: [Feature {
                    kind: "TEXT_DETECTION",
                }],
                image_context: ImageContext {
                    language_hints: &self.language_hints,
                },
            }],
        };

        let request = self.client.post(&self.endpoint).json(&body);
        let request = match &self.auth {
            Auth::ApiKey(key) => request.query(&[("key", key)]),
            Auth::Bearer(token) => request.bearer_auth(token),
        };
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|it| it.error.message)
                .unwrap_or(text);
            return Err(RecognitionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let response: AnnotateResponse = response
            .json()
            .await
            .map_err(|err| RecognitionError::InvalidResponse(err.to_string()))?;
        parse_response(response)
    }
}

fn parse_response(response: AnnotateResponse) -> Result<RecognizedText, RecognitionError> {
    let response = response
        .responses
        .into_iter()
        .next()
        .ok_or_else(|| RecognitionError::InvalidResponse("empty responses array".to_string()))?;
    if let Some(status) = response.error {
        if !status.message.is_empty() {
            return Err(RecognitionError::Api {
                code: status.code,
                message: status.message,
            });
        }
    }
    Ok(RecognizedText {
        annotations: response
            .text_annotations
            .into_iter()
            .map(|annotation| Annotation {
                text: annotation.description,
                vertices: annotation
                    .bounding_poly
                    .map(|poly| {
                        poly.vertices
                            .into_iter()
                            .map(|v| Vertex(v.x, v.y))
                            .collect()
                    })
                    .unwrap_or_default(),
            })
            .collect(),
    })
}

pub(crate) fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Entry for a crop whose recognition failed or produced nothing.
pub fn empty_result(crop: &ExportedCrop) -> OcrResult {
    OcrResult {
        reading_index: Some(crop.reading_index),
        image_name: crop.file_name.clone(),
        timestamp: timestamp(),
        image_size: crop.size,
        original_crop_coords: Some(crop.coords),
        full_text: String::new(),
        text_blocks: Vec::new(),
    }
}

/// Maps recognizer output from crop space into source image space.
pub fn reconcile(crop: &ExportedCrop, recognized: RecognizedText) -> OcrResult {
    let (dx, dy) = (crop.coords.x1, crop.coords.y1);
    let full_text = recognized.full_text().to_string();
    let text_blocks = recognized
        .annotations
        .into_iter()
        .map(|annotation| {
            let vertices = offset_vertices(&annotation.vertices, dx, dy);
            TextBlock {
                text: annotation.text,
                position: Position {
                    center: vertex_center(&vertices),
                    vertices,
                    relative_vertices: annotation.vertices,
                },
            }
        })
        .collect();

    OcrResult {
        full_text,
        text_blocks,
        ..empty_result(crop)
    }
}

/// Reads a crop from disk and recognizes it within `timeout`.
#[instrument(level = "debug", skip(recognizer, crop), fields(crop = %crop.file_name))]
pub async fn recognize_crop(
    recognizer: &dyn Recognizer,
    crop: &ExportedCrop,
    timeout: Duration,
) -> Result<OcrResult, RecognitionError> {
    let bytes = tokio::fs::read(&crop.path)
        .await
        .map_err(|err| RecognitionError::Input(format!("{}: {err}", crop.path.display())))?;
    let recognized = tokio::time::timeout(timeout, recognizer.recognize(bytes))
        .await
        .map_err(|_| RecognitionError::Timeout(timeout))??;
    Ok(reconcile(crop, recognized))
}
