// THEORY:
// The overlay renderer turns a frozen list of tracked objects into a transparent
// RGBA layer the size of the video viewport. It never sees the simulator's live
// set, only the objects carried by a published frame.
//
// Key architectural principles:
// 1.  **Full Repaint**: Every paint clears the whole canvas first. There is no
//     incremental damage tracking; a slot has a few dozen boxes at most.
// 2.  **Theme At Paint Time**: Class colors have a light and a dark variant. The
//     variant is picked when painting, so a theme switch shows up on the next paint.
// 3.  **Gated Output**: While the slot's gate is not open (or inferencing is off) a
//     paint only clears. A connecting slot never shows stale boxes.
// 4.  **Host-Agnostic Text**: Glyphs are rasterized only when a font is supplied.
//     The label backgrounds are always drawn and every painted label is returned,
//     so a host with its own text stack can draw the strings itself.

use crate::core_modules::tracker::TrackedObject;
use crate::core_modules::vehicle::VehicleClass;
use crate::stream_manager::SlotFrame;
use ab_glyph::{FontArc, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const LABEL_HEIGHT: u32 = 18;
const LABEL_PADDING: u32 = 4;
const LABEL_FONT_PX: f32 = 12.0;
/// Average advance of a bold 12px sans glyph, used when no font is loaded.
const FALLBACK_GLYPH_WIDTH: u32 = 7;
const LABEL_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 153]);
const LABEL_TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

/// Box color for a class under the given theme.
pub fn class_color(class: VehicleClass, theme: Theme) -> Rgba<u8> {
    let hex = match (class, theme) {
        (VehicleClass::Car, Theme::Light) => 0x2563eb,
        (VehicleClass::Car, Theme::Dark) => 0x60a5fa,
        (VehicleClass::Truck, Theme::Light) => 0xdc2626,
        (VehicleClass::Truck, Theme::Dark) => 0xf87171,
        (VehicleClass::Bus, Theme::Light) => 0x16a34a,
        (VehicleClass::Bus, Theme::Dark) => 0x4ade80,
        (VehicleClass::Motorcycle, Theme::Light) => 0xd97706,
        (VehicleClass::Motorcycle, Theme::Dark) => 0xfacc15,
    };
    Rgba([(hex >> 16) as u8, (hex >> 8) as u8, hex as u8, 255])
}

/// Label text shown above a box, e.g. `Truck 87%`.
pub fn label_for(obj: &TrackedObject) -> String {
    format!("{} {:.0}%", obj.class, obj.confidence * 100.0)
}

/// Where a label was painted, in canvas pixels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelPlacement {
    pub object_id: u64,
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Clone, Default)]
pub struct OverlayRenderer {
    font: Option<FontArc>,
}

impl OverlayRenderer {
    pub fn new() -> Self {
        Self { font: None }
    }

    pub fn with_font(font: FontArc) -> Self {
        Self { font: Some(font) }
    }

    /// Loads a TTF/OTF font from raw bytes.
    pub fn with_font_bytes(bytes: Vec<u8>) -> Result<Self, ab_glyph::InvalidFont> {
        Ok(Self::with_font(FontArc::try_from_vec(bytes)?))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Clears `canvas` and, when `visible`, paints one box and label per object.
    pub fn paint(
        &self,
        canvas: &mut RgbaImage,
        objects: &[TrackedObject],
        visible: bool,
        theme: Theme,
    ) -> Vec<LabelPlacement> {
        canvas.pixels_mut().for_each(|p| *p = TRANSPARENT);
        if !visible || canvas.width() == 0 || canvas.height() == 0 {
            return Vec::new();
        }

        let (cw, ch) = (canvas.width() as f64, canvas.height() as f64);
        let mut labels = Vec::with_capacity(objects.len());

        for obj in objects {
            let color = class_color(obj.class, theme);
            let x = (obj.bbox.x * cw) as i32;
            let y = (obj.bbox.y * ch) as i32;
            let w = ((obj.bbox.w * cw) as u32).max(1);
            let h = ((obj.bbox.h * ch) as u32).max(1);

            // 2px stroke
            draw_hollow_rect_mut(canvas, Rect::at(x, y).of_size(w, h), color);
            if w > 2 && h > 2 {
                draw_hollow_rect_mut(canvas, Rect::at(x + 1, y + 1).of_size(w - 2, h - 2), color);
            }

            let text = label_for(obj);
            let width = self.text_width(&text) + LABEL_PADDING * 2;
            let label_y = y - LABEL_HEIGHT as i32;
            draw_filled_rect_mut(canvas, Rect::at(x, label_y).of_size(width, LABEL_HEIGHT), LABEL_BACKGROUND);
            if let Some(font) = &self.font {
                draw_text_mut(
                    canvas,
                    LABEL_TEXT,
                    x + LABEL_PADDING as i32,
                    label_y + 3,
                    PxScale::from(LABEL_FONT_PX),
                    font,
                    &text,
                );
            }

            labels.push(LabelPlacement {
                object_id: obj.id,
                text,
                x,
                y: label_y,
                width,
                height: LABEL_HEIGHT,
            });
        }
        labels
    }

    fn text_width(&self, text: &str) -> u32 {
        match &self.font {
            Some(font) => text_size(PxScale::from(LABEL_FONT_PX), font, text).0,
            None => text.chars().count() as u32 * FALLBACK_GLYPH_WIDTH,
        }
    }
}

/// A slot's overlay layer, kept in sync with the video viewport size.
pub struct OverlayCanvas {
    renderer: OverlayRenderer,
    image: RgbaImage,
    theme: Theme,
    objects: Arc<[TrackedObject]>,
    visible: bool,
    labels: Vec<LabelPlacement>,
}

impl OverlayCanvas {
    pub fn new(renderer: OverlayRenderer, width: u32, height: u32, theme: Theme) -> Self {
        Self {
            renderer,
            image: RgbaImage::new(width, height),
            theme,
            objects: Arc::from(Vec::new()),
            visible: false,
            labels: Vec::new(),
        }
    }

    /// Repaints from a published slot frame.
    pub fn apply(&mut self, frame: &SlotFrame) {
        self.update(frame.objects.clone(), frame.overlay_visible());
    }

    pub fn update(&mut self, objects: Arc<[TrackedObject]>, visible: bool) {
        self.objects = objects;
        self.visible = visible;
        self.repaint();
    }

    /// Matches the canvas to the viewport and repaints the current objects.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.image.dimensions() == (width, height) {
            return;
        }
        self.image = RgbaImage::new(width, height);
        self.repaint();
    }

    /// Takes effect on the next paint.
    pub fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn labels(&self) -> &[LabelPlacement] {
        &self.labels
    }

    fn repaint(&mut self) {
        self.labels = self
            .renderer
            .paint(&mut self.image, &self.objects, self.visible, self.theme);
    }
}

/// Alpha-blends an overlay layer onto a video frame of the same size.
pub fn compose_onto(frame: &mut RgbaImage, overlay: &RgbaImage) {
    image::imageops::overlay(frame, overlay, 0, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::tracker::BoundingBox;

    fn object(id: u64, class: VehicleClass, x: f64, y: f64) -> TrackedObject {
        TrackedObject {
            id,
            class,
            bbox: BoundingBox { x, y, w: 0.2, h: 0.2 },
            confidence: 0.873,
        }
    }

    #[test]
    fn hidden_overlay_only_clears() {
        let renderer = OverlayRenderer::new();
        let mut canvas = RgbaImage::from_pixel(64, 36, Rgba([9, 9, 9, 255]));
        let labels = renderer.paint(&mut canvas, &[object(1, VehicleClass::Car, 0.5, 0.5)], false, Theme::Light);
        assert!(labels.is_empty());
        assert!(canvas.pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn paints_box_in_theme_color() {
        let renderer = OverlayRenderer::new();
        let mut canvas = RgbaImage::new(100, 100);
        let obj = object(7, VehicleClass::Truck, 0.5, 0.5);
        let labels = renderer.paint(&mut canvas, &[obj], true, Theme::Dark);

        assert_eq!(*canvas.get_pixel(50, 60), class_color(VehicleClass::Truck, Theme::Dark));
        assert_eq!(*canvas.get_pixel(51, 60), class_color(VehicleClass::Truck, Theme::Dark));
        assert_eq!(*canvas.get_pixel(60, 60), TRANSPARENT);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].text, "Truck 87%");
        assert_eq!(labels[0].y, 50 - LABEL_HEIGHT as i32);
        assert_eq!(*canvas.get_pixel(52, 40), LABEL_BACKGROUND);
    }

    #[test]
    fn resize_repaints_at_new_scale() {
        let mut canvas = OverlayCanvas::new(OverlayRenderer::new(), 100, 100, Theme::Light);
        canvas.update(Arc::from(vec![object(1, VehicleClass::Bus, 0.5, 0.5)]), true);
        canvas.resize(200, 100);
        assert_eq!(canvas.image().dimensions(), (200, 100));
        assert_eq!(*canvas.image().get_pixel(100, 60), class_color(VehicleClass::Bus, Theme::Light));
        assert_eq!(canvas.labels()[0].x, 100);
    }

    #[test]
    fn theme_switch_applies_on_next_paint() {
        let mut canvas = OverlayCanvas::new(OverlayRenderer::new(), 100, 100, Theme::Light);
        assert!(!canvas.renderer.has_font());
        let objects: Arc<[TrackedObject]> = Arc::from(vec![object(1, VehicleClass::Car, 0.5, 0.5)]);
        canvas.update(objects.clone(), true);
        canvas.set_theme(Theme::Dark);
        assert_eq!(*canvas.image().get_pixel(50, 60), class_color(VehicleClass::Car, Theme::Light));
        canvas.update(objects, true);
        assert_eq!(*canvas.image().get_pixel(50, 60), class_color(VehicleClass::Car, Theme::Dark));
    }

    #[test]
    fn light_and_dark_palettes_differ() {
        for class in VehicleClass::ALL {
            assert_ne!(class_color(class, Theme::Light), class_color(class, Theme::Dark));
        }
        assert_eq!(class_color(VehicleClass::Car, Theme::Light), Rgba([0x25, 0x63, 0xeb, 255]));
    }
}
