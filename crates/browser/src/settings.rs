//! Page and capture settings
//!
//! Dimensions are inches, as `Page.printToPDF` expects them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Standard paper sizes, portrait orientation (width, height) in inches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperFormat {
    Letter,
    Legal,
    Tabloid,
    Ledger,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
}

impl PaperFormat {
    pub fn dimensions(self) -> (f64, f64) {
        match self {
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
            PaperFormat::Ledger => (17.0, 11.0),
            PaperFormat::A0 => (33.1, 46.8),
            PaperFormat::A1 => (23.4, 33.1),
            PaperFormat::A2 => (16.54, 23.4),
            PaperFormat::A3 => (11.7, 16.54),
            PaperFormat::A4 => (8.27, 11.7),
            PaperFormat::A5 => (5.83, 8.27),
            PaperFormat::A6 => (4.13, 5.83),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSettings {
    pub landscape: bool,
    pub display_header_footer: bool,
    pub print_background: bool,
    pub scale: f64,
    pub paper_width: f64,
    pub paper_height: f64,
    pub margin_top: f64,
    pub margin_bottom: f64,
    pub margin_left: f64,
    pub margin_right: f64,
    /// e.g. `1-5, 8, 11-13`; empty prints everything
    pub page_ranges: String,
    pub header_template: Option<String>,
    pub footer_template: Option<String>,
    pub prefer_css_page_size: bool,
    pub generate_tagged_pdf: bool,
    pub generate_outline: bool,
}

impl Default for PageSettings {
    fn default() -> Self {
        let (paper_width, paper_height) = PaperFormat::Letter.dimensions();
        Self {
            landscape: false,
            display_header_footer: false,
            print_background: false,
            scale: 1.0,
            paper_width,
            paper_height,
            margin_top: 0.4,
            margin_bottom: 0.4,
            margin_left: 0.4,
            margin_right: 0.4,
            page_ranges: String::new(),
            header_template: None,
            footer_template: None,
            prefer_css_page_size: false,
            generate_tagged_pdf: false,
            generate_outline: false,
        }
    }
}

impl PageSettings {
    pub fn with_paper_format(mut self, format: PaperFormat) -> Self {
        let (width, height) = format.dimensions();
        self.paper_width = width;
        self.paper_height = height;
        self
    }

    /// Portrait-oriented (width, height). The protocol rotates on its own
    /// when `landscape` is set, so landscape dimensions are swapped back.
    pub fn portrait_dimensions(&self) -> (f64, f64) {
        if self.landscape && self.paper_width > self.paper_height {
            (self.paper_height, self.paper_width)
        } else {
            (self.paper_width, self.paper_height)
        }
    }

    /// Parameters for `Page.printToPDF`, always in stream mode.
    pub fn to_print_params(&self) -> Value {
        let (paper_width, paper_height) = self.portrait_dimensions();
        let mut params = json!({
            "landscape": self.landscape,
            "displayHeaderFooter": self.display_header_footer,
            "printBackground": self.print_background,
            "scale": self.scale,
            "paperWidth": paper_width,
            "paperHeight": paper_height,
            "marginTop": self.margin_top,
            "marginBottom": self.margin_bottom,
            "marginLeft": self.margin_left,
            "marginRight": self.margin_right,
            "pageRanges": self.page_ranges,
            "preferCSSPageSize": self.prefer_css_page_size,
            "generateTaggedPDF": self.generate_tagged_pdf,
            "generateDocumentOutline": self.generate_outline,
            "transferMode": "ReturnAsStream",
        });
        if let Some(map) = params.as_object_mut() {
            insert_some(map, "headerTemplate", &self.header_template);
            insert_some(map, "footerTemplate", &self.footer_template);
        }
        params
    }
}

fn insert_some(map: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::String(value.clone()));
    }
}

/// Region of the page to capture, in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub scale: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotOptions {
    pub clip: Option<Clip>,
    pub capture_beyond_viewport: bool,
}

impl ScreenshotOptions {
    pub fn to_capture_params(&self) -> Value {
        let mut params = json!({
            "format": "png",
            "captureBeyondViewport": self.capture_beyond_viewport,
        });
        if let (Some(clip), Some(map)) = (self.clip, params.as_object_mut()) {
            map.insert(
                "clip".to_string(),
                json!({
                    "x": clip.x,
                    "y": clip.y,
                    "width": clip.width,
                    "height": clip.height,
                    "scale": clip.scale,
                }),
            );
        }
        params
    }
}
