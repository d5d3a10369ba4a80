//! Annotation of accepted grid tiles on a copy of the analyzed image.
use std::path::Path;

use common::TileDetection;
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use rusttype::{Font, Scale};

use crate::{config::RenderConfig, Error, Result};

/// Load a TrueType font for tile labels.
pub fn load_font(path: impl AsRef<Path>) -> Result<Font<'static>> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;

    Font::try_from_vec(data)
        .ok_or_else(|| Error::mismatch(format!("{} is not a usable font", path.display())))
}

/// Draw a translucent box per detection, labelled `"<class> <pct>%"` when a font is given.
pub fn annotate(
    canvas: &mut RgbImage,
    detections: &[TileDetection],
    style: &RenderConfig,
    font: Option<&Font>,
) {
    let color = Rgb(style.box_color);

    for detection in detections {
        // Coordinate frame basis is on the top left corner
        let [ymin, xmin, ymax, xmax] = detection.bbox;
        let (width, height) = (xmax.saturating_sub(xmin), ymax.saturating_sub(ymin));
        if width == 0 || height == 0 {
            continue;
        }

        blend_rect(canvas, xmin, ymin, width, height, color, style.fill_alpha);
        let tile_rect = Rect::at(xmin as i32, ymin as i32).of_size(width, height);
        draw_hollow_rect_mut(canvas, tile_rect, color);

        if let Some(font) = font {
            let label = format!(
                "{} {:.0}%",
                detection.class_name,
                detection.score * 100.0
            );
            let scale = Scale::uniform(style.font_size);
            let (text_w, text_h) = text_size(scale, font, &label);
            let label_rect = Rect::at(xmin as i32 + 1, ymin as i32 + 1)
                .of_size((text_w + 6).max(1) as u32, (text_h + 4).max(1) as u32);

            draw_filled_rect_mut(canvas, label_rect, color);
            draw_text_mut(
                canvas,
                Rgb(style.label_fg),
                xmin as i32 + 4,
                ymin as i32 + 3,
                scale,
                font,
                &label,
            );
        }
    }
}

/// Alpha-blend `color` over the rectangle, clipped to the canvas.
fn blend_rect(canvas: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: Rgb<u8>, alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    let x_end = x.saturating_add(w).min(canvas.width());
    let y_end = y.saturating_add(h).min(canvas.height());

    for py in y..y_end {
        for px in x..x_end {
            let pixel = canvas.get_pixel_mut(px, py);
            for (channel, &over) in pixel.0.iter_mut().zip(color.0.iter()) {
                let blended = *channel as f32 * (1.0 - alpha) + over as f32 * alpha;
                *channel = blended.round() as u8;
            }
        }
    }
}
