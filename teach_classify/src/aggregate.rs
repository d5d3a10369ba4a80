//! Composition of analysis records.
use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use common::{AnalysisResult, ClassCounts, PredictionEntry};
use image::{codecs::jpeg::JpegEncoder, ColorType, RgbImage};

use crate::Result;

/// Compose a record stamped with the current time.
pub fn compose(
    project: &str,
    source: &str,
    topk: Vec<PredictionEntry>,
    counts: Option<ClassCounts>,
    preview: &RgbImage,
    quality: u8,
) -> Result<AnalysisResult> {
    compose_at(Utc::now(), project, source, topk, counts, preview, quality)
}

pub fn compose_at(
    timestamp: DateTime<Utc>,
    project: &str,
    source: &str,
    topk: Vec<PredictionEntry>,
    counts: Option<ClassCounts>,
    preview: &RgbImage,
    quality: u8,
) -> Result<AnalysisResult> {
    Ok(AnalysisResult {
        timestamp,
        project: project.to_owned(),
        source: source.to_owned(),
        topk,
        counts,
        preview_data_url: jpeg_data_url(preview, quality)?,
    })
}

/// Lossy JPEG preview as a `data:image/jpeg;base64,…` URL.
pub fn jpeg_data_url(image: &RgbImage, quality: u8) -> Result<String> {
    let mut buf = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode(
        image.as_raw(),
        image.width(),
        image.height(),
        ColorType::Rgb8,
    )?;

    Ok(format!(
        "data:image/jpeg;base64,{}",
        STANDARD.encode(buf.into_inner())
    ))
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use image::Rgb;

    use super::*;

    #[test]
    fn record_keeps_its_parts() -> Result<()> {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let preview = RgbImage::from_pixel(16, 16, Rgb([40, 80, 120]));
        let counts = ClassCounts::from([("apple".to_owned(), 3)]);

        let result = compose_at(
            at,
            "fruit",
            "photo:bowl.jpg",
            vec![PredictionEntry::new("apple", 0.8)],
            Some(counts.clone()),
            &preview,
            60,
        )?;

        assert_eq!(result.timestamp, at);
        assert_eq!(result.project, "fruit");
        assert_eq!(result.source, "photo:bowl.jpg");
        assert_eq!(result.counts, Some(counts));
        assert_eq!(result.best().map(|p| p.class_name.as_str()), Some("apple"));

        Ok(())
    }

    #[test]
    fn empty_parts_are_allowed() -> Result<()> {
        let preview = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));

        let result = compose("p", "camera", Vec::new(), None, &preview, 60)?;

        assert!(result.topk.is_empty());
        assert_eq!(result.total_count(), 0);

        Ok(())
    }

    #[test]
    fn preview_is_a_decodable_jpeg() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let preview = RgbImage::from_pixel(24, 12, Rgb([200, 10, 10]));

        let url = jpeg_data_url(&preview, 60)?;
        let payload = url
            .strip_prefix("data:image/jpeg;base64,")
            .ok_or("missing data URL prefix")?;
        let decoded = image::load_from_memory(&STANDARD.decode(payload)?)?;

        assert_eq!((decoded.width(), decoded.height()), (24, 12));

        Ok(())
    }
}
