//! Documents returned by the content backend.
//!
//! A query yields a [`QueryResult`] holding changelog [`Entry`] documents.
//! Entries may carry a modal of slides whose images are either references
//! to backend assets or, after media resolution, the embedded bytes.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use crate::constants::DEFAULT_CDN_BASE;

/// Result of one query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    #[serde(default)]
    pub result: Vec<Entry>,
}

impl QueryResult {
    pub fn new(result: Vec<Entry>) -> Self {
        Self { result }
    }

    /// True when the query matched no documents.
    pub fn is_empty(&self) -> bool {
        self.result.is_empty()
    }

    pub fn len(&self) -> usize {
        self.result.len()
    }

    /// Iterate over every slide image that still points at a backend asset.
    pub fn image_references(&self) -> impl Iterator<Item = &JsonValue> {
        self.result
            .iter()
            .filter_map(|entry| entry.modal.as_ref())
            .flat_map(|modal| modal.slides.iter())
            .filter_map(|slide| match &slide.slide_image {
                Some(SlideImage::Reference { slide_image }) => Some(slide_image),
                _ => None,
            })
    }
}

/// One changelog document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub title: String,
    /// Rich-text block content, passed through untouched.
    #[serde(default)]
    pub description: JsonValue,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub link_attributes: Option<LinkAttributes>,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub seen_forced: bool,
    #[serde(default)]
    pub forced_modal: Option<bool>,
    #[serde(default, deserialize_with = "deserialize_modal")]
    pub modal: Option<Modal>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default = "default_api_host")]
    pub api_host: String,
}

fn default_api_host() -> String {
    DEFAULT_CDN_BASE.to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkAttributes {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub link_text: Option<String>,
}

/// Modal shown with an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modal {
    pub title: String,
    pub forced_modal: bool,
    pub slides: Vec<Slide>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    #[serde(default)]
    pub slide_header: String,
    #[serde(default)]
    pub slide_description: Option<JsonValue>,
    #[serde(default, deserialize_with = "deserialize_slide_image")]
    pub slide_image: Option<SlideImage>,
    #[serde(default)]
    pub alt_text: Option<String>,
}

/// Image attached to a slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SlideImage {
    /// Backend asset object, resolved lazily by id.
    #[serde(rename = "json", rename_all = "camelCase")]
    Reference { slide_image: JsonValue },
    /// Raw image bytes fetched from the media endpoint.
    #[serde(rename = "dl", rename_all = "camelCase")]
    Embedded { slide_image: Vec<u8> },
}

impl SlideImage {
    /// The backend asset id (`asset._ref`) of a reference image.
    pub fn asset_ref(&self) -> Option<&str> {
        match self {
            Self::Reference { slide_image } => asset_ref_of(slide_image),
            Self::Embedded { .. } => None,
        }
    }
}

/// Read `asset._ref` out of an image object.
pub fn asset_ref_of(image: &JsonValue) -> Option<&str> {
    image.get("asset")?.get("_ref")?.as_str()
}

/// Slides in backend documents hold the raw asset object; a cached
/// document may already carry the tagged form.
fn deserialize_slide_image<'de, D>(deserializer: D) -> Result<Option<SlideImage>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(JsonValue::Null) => None,
        Some(value) if value.get("type").is_some() => {
            match serde_json::from_value::<SlideImage>(value.clone()) {
                Ok(image) => Some(image),
                Err(_) => Some(SlideImage::Reference { slide_image: value }),
            }
        }
        Some(value) => Some(SlideImage::Reference { slide_image: value }),
    })
}

/// The backend stores a modal as `numSlides`, `modalHeader`, `forcedModal`
/// and `modalSlide1..N`. A modal with fewer than one slide is absent.
fn deserialize_modal<'de, D>(deserializer: D) -> Result<Option<Modal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    let Some(JsonValue::Object(obj)) = raw else {
        return Ok(None);
    };

    if let Some(slides) = obj.get("slides") {
        let modal = Modal {
            title: obj
                .get("title")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            forced_modal: obj
                .get("forcedModal")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false),
            slides: serde_json::from_value(slides.clone()).map_err(serde::de::Error::custom)?,
        };
        return Ok(Some(modal));
    }

    let num_slides = match obj.get("numSlides").and_then(JsonValue::as_i64) {
        Some(n) if n >= 1 => n,
        _ => return Ok(None),
    };

    let title = obj
        .get("modalHeader")
        .and_then(JsonValue::as_str)
        .unwrap_or("Ny oppdatering")
        .to_string();
    let forced_modal = obj
        .get("forcedModal")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    // Walk the slide keys actually present, so the work is bounded by the
    // object's size and not by `numSlides`.
    let mut numbered: Vec<(i64, &JsonValue)> = obj
        .iter()
        .filter_map(|(field, slide)| {
            let suffix = field.strip_prefix("modalSlide")?;
            let n = suffix.parse::<i64>().ok()?;
            (n >= 1 && n <= num_slides && n.to_string() == suffix).then_some((n, slide))
        })
        .collect();
    numbered.sort_unstable_by_key(|(n, _)| *n);

    let mut slides = Vec::with_capacity(numbered.len());
    for (_, slide) in numbered {
        slides.push(serde_json::from_value(slide.clone()).map_err(serde::de::Error::custom)?);
    }

    Ok(Some(Modal {
        title,
        forced_modal,
        slides,
    }))
}
