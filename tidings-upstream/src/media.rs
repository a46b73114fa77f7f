//! Media resolution for the embedded-media result variant.

use futures_util::future::try_join_all;
use tidings_core::{MediaRef, QueryKey, QueryResult, SlideImage, UpstreamError};
use tracing::debug;

use crate::client::ContentFetcher;

/// Fetch `key` and replace every slide image reference with its bytes.
///
/// One media fetch is issued per reference. Any failed sub-fetch fails the
/// whole operation; no partially resolved result is returned.
pub async fn fetch_with_media<F>(fetcher: &F, key: &QueryKey) -> Result<QueryResult, UpstreamError>
where
    F: ContentFetcher + ?Sized,
{
    let mut result = fetcher.fetch_query(key).await?;

    let mut targets = Vec::new();
    for (entry_idx, entry) in result.result.iter().enumerate() {
        let Some(modal) = entry.modal.as_ref() else {
            continue;
        };
        for (slide_idx, slide) in modal.slides.iter().enumerate() {
            if let Some(image @ SlideImage::Reference { .. }) = slide.slide_image.as_ref() {
                let asset_ref = image.asset_ref().ok_or_else(|| {
                    UpstreamError::decode(format!(
                        "Slide {} of entry {} has an image without asset._ref",
                        slide_idx, entry.id
                    ))
                })?;
                targets.push((entry_idx, slide_idx, MediaRef::from_asset_ref(asset_ref)));
            }
        }
    }

    if targets.is_empty() {
        return Ok(result);
    }

    debug!(query = %key, images = targets.len(), "Resolving embedded media");
    let images = try_join_all(
        targets
            .iter()
            .map(|(_, _, media)| fetcher.fetch_media(media, &key.dataset)),
    )
    .await?;

    for ((entry_idx, slide_idx, _), bytes) in targets.into_iter().zip(images) {
        if let Some(modal) = result.result[entry_idx].modal.as_mut() {
            modal.slides[slide_idx].slide_image = Some(SlideImage::Embedded { slide_image: bytes });
        }
    }

    Ok(result)
}
