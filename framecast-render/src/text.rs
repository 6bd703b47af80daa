//! Word-wrapped, alignment-aware text layout and glyph drawing.
//!
//! Layout is computed against abstract font metrics so it stays fully
//! testable without a font on disk. Glyph ink comes from a `fontdue`
//! face loaded at startup; with no font configured, layout still runs
//! and ink is skipped.

use framecast_core::layer::{Color, TextAlign, TextSpec};

use crate::error::{RenderError, RenderResult};
use crate::raster::{mul_div255, Raster};

pub const ELLIPSIS: &str = "...";

/// A rasterized glyph: a coverage mask positioned relative to the pen
/// and baseline.
pub struct GlyphBitmap {
    pub width: usize,
    pub height: usize,
    pub xmin: i32,
    pub ymin: i32,
    pub coverage: Vec<u8>,
}

pub trait GlyphSource: Send + Sync {
    fn advance(&self, ch: char, size: f32) -> f32;
    fn line_height(&self, size: f32) -> f32;
    fn ascent(&self, size: f32) -> f32;
    /// None when the source has no ink for this glyph.
    fn rasterize(&self, ch: char, size: f32) -> Option<GlyphBitmap>;
}

/// Metrics-only source: fixed advance, no ink. Backs headless tests
/// and deployments without a configured font.
pub struct FixedGlyphSource {
    pub advance_em: f32,
}

impl Default for FixedGlyphSource {
    fn default() -> Self {
        Self { advance_em: 0.6 }
    }
}

impl GlyphSource for FixedGlyphSource {
    fn advance(&self, _ch: char, size: f32) -> f32 {
        size * self.advance_em
    }

    fn line_height(&self, size: f32) -> f32 {
        size * 1.2
    }

    fn ascent(&self, size: f32) -> f32 {
        size * 0.8
    }

    fn rasterize(&self, _ch: char, _size: f32) -> Option<GlyphBitmap> {
        None
    }
}

/// fontdue-backed glyph source.
pub struct FontGlyphSource {
    font: fontdue::Font,
}

impl FontGlyphSource {
    pub fn from_path(path: &str) -> RenderResult<Self> {
        let bytes = std::fs::read(path)?;
        let font = fontdue::Font::from_bytes(bytes, fontdue::FontSettings::default())
            .map_err(|e| RenderError::Font(format!("failed to parse font '{path}': {e}")))?;
        Ok(Self { font })
    }
}

impl GlyphSource for FontGlyphSource {
    fn advance(&self, ch: char, size: f32) -> f32 {
        self.font.metrics(ch, size).advance_width
    }

    fn line_height(&self, size: f32) -> f32 {
        self.font
            .horizontal_line_metrics(size)
            .map_or(size * 1.2, |m| m.new_line_size)
    }

    fn ascent(&self, size: f32) -> f32 {
        self.font
            .horizontal_line_metrics(size)
            .map_or(size * 0.8, |m| m.ascent)
    }

    fn rasterize(&self, ch: char, size: f32) -> Option<GlyphBitmap> {
        let (metrics, coverage) = self.font.rasterize(ch, size);
        if metrics.width == 0 || metrics.height == 0 {
            return None;
        }
        Some(GlyphBitmap {
            width: metrics.width,
            height: metrics.height,
            xmin: metrics.xmin,
            ymin: metrics.ymin,
            coverage,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutLine {
    pub text: String,
    pub width: f32,
    /// Horizontal offset inside the layout box, per alignment.
    pub x: f32,
}

#[derive(Debug, Clone)]
pub struct TextLayout {
    pub lines: Vec<LayoutLine>,
    pub line_height: f32,
    pub truncated: bool,
}

impl TextLayout {
    #[must_use]
    pub fn height(&self) -> f32 {
        self.lines.len() as f32 * self.line_height
    }
}

fn measure(text: &str, size: f32, glyphs: &dyn GlyphSource) -> f32 {
    text.chars().map(|c| glyphs.advance(c, size)).sum()
}

/// Compute a word-wrapped layout for `spec` within `spec.max_width`.
///
/// Words longer than a full line break at character granularity.
/// Exceeding `max_lines` truncates the final line with an ellipsis.
#[must_use]
pub fn layout_text(spec: &TextSpec, glyphs: &dyn GlyphSource) -> TextLayout {
    let max_lines = spec.max_lines.max(1);
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut truncated = false;

    'words: for word in spec.text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };

        if measure(&candidate, spec.size, glyphs) <= spec.max_width {
            current = candidate;
            continue;
        }

        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
            if lines.len() == max_lines {
                truncated = true;
                break;
            }
        }

        // The word alone exceeds the line: hard-break it.
        if measure(word, spec.size, glyphs) > spec.max_width {
            for ch in word.chars() {
                let mut attempt = current.clone();
                attempt.push(ch);
                if measure(&attempt, spec.size, glyphs) > spec.max_width && !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                    if lines.len() == max_lines {
                        truncated = true;
                        break 'words;
                    }
                }
                current.push(ch);
            }
        } else {
            current = word.to_string();
        }
    }

    if !current.is_empty() && lines.len() < max_lines {
        lines.push(current);
    } else if !current.is_empty() {
        truncated = true;
    }

    if truncated {
        if let Some(last) = lines.last_mut() {
            let ellipsis_width = measure(ELLIPSIS, spec.size, glyphs);
            while !last.is_empty()
                && measure(last, spec.size, glyphs) + ellipsis_width > spec.max_width
            {
                last.pop();
            }
            last.push_str(ELLIPSIS);
        }
    }

    let line_height = glyphs.line_height(spec.size);
    let layout_lines = lines
        .into_iter()
        .map(|text| {
            let width = measure(&text, spec.size, glyphs);
            let x = match spec.align {
                TextAlign::Left => 0.0,
                TextAlign::Center => ((spec.max_width - width) / 2.0).max(0.0),
                TextAlign::Right => (spec.max_width - width).max(0.0),
            };
            LayoutLine { text, width, x }
        })
        .collect();

    TextLayout {
        lines: layout_lines,
        line_height,
        truncated,
    }
}

/// Draw a computed layout onto `raster` with its box origin at
/// (origin_x, origin_y).
pub fn draw_text(
    raster: &mut Raster,
    layout: &TextLayout,
    size: f32,
    color: Color,
    opacity: f32,
    glyphs: &dyn GlyphSource,
    origin_x: f32,
    origin_y: f32,
) {
    let ascent = glyphs.ascent(size);
    for (line_idx, line) in layout.lines.iter().enumerate() {
        let baseline = origin_y + line_idx as f32 * layout.line_height + ascent;
        let mut pen_x = origin_x + line.x;
        for ch in line.text.chars() {
            if let Some(glyph) = glyphs.rasterize(ch, size) {
                draw_glyph(raster, &glyph, pen_x, baseline, color, opacity);
            }
            pen_x += glyphs.advance(ch, size);
        }
    }
}

fn draw_glyph(
    raster: &mut Raster,
    glyph: &GlyphBitmap,
    pen_x: f32,
    baseline: f32,
    color: Color,
    opacity: f32,
) {
    let left = pen_x as i64 + i64::from(glyph.xmin);
    let top = baseline as i64 - glyph.height as i64 - i64::from(glyph.ymin);
    let mut cover_src = Raster {
        width: glyph.width as u32,
        height: glyph.height as u32,
        data: vec![0u8; glyph.width * glyph.height * 4],
    };
    for (i, &cov) in glyph.coverage.iter().enumerate() {
        if cov == 0 {
            continue;
        }
        let a = mul_div255(u16::from(color.a), u16::from(cov));
        let px = [
            mul_div255(u16::from(color.r), u16::from(a)),
            mul_div255(u16::from(color.g), u16::from(a)),
            mul_div255(u16::from(color.b), u16::from(a)),
            a,
        ];
        cover_src.data[i * 4..i * 4 + 4].copy_from_slice(&px);
    }
    raster.blit_over(&cover_src, left, top, opacity);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(text: &str, max_width: f32, max_lines: usize, align: TextAlign) -> TextSpec {
        TextSpec {
            text: text.to_string(),
            size: 10.0,
            color: Color::WHITE,
            align,
            max_width,
            max_lines,
        }
    }

    // FixedGlyphSource advance: 6.0 per char at size 10.

    #[test]
    fn short_text_stays_on_one_line() {
        let glyphs = FixedGlyphSource::default();
        let layout = layout_text(&spec("hello", 100.0, 4, TextAlign::Left), &glyphs);
        assert_eq!(layout.lines.len(), 1);
        assert_eq!(layout.lines[0].text, "hello");
        assert!(!layout.truncated);
    }

    #[test]
    fn words_wrap_at_max_width() {
        let glyphs = FixedGlyphSource::default();
        // "aaaa bbbb" at 6px/char: each word 24px, joined 54px.
        let layout = layout_text(&spec("aaaa bbbb", 30.0, 4, TextAlign::Left), &glyphs);
        assert_eq!(layout.lines.len(), 2);
        assert_eq!(layout.lines[0].text, "aaaa");
        assert_eq!(layout.lines[1].text, "bbbb");
    }

    #[test]
    fn long_word_breaks_at_char_level() {
        let glyphs = FixedGlyphSource::default();
        let layout = layout_text(&spec("aaaaaaaaaa", 30.0, 4, TextAlign::Left), &glyphs);
        // 10 chars at 6px into 30px lines: 5 per line.
        assert_eq!(layout.lines.len(), 2);
        assert_eq!(layout.lines[0].text, "aaaaa");
        assert_eq!(layout.lines[1].text, "aaaaa");
    }

    #[test]
    fn overflow_truncates_with_ellipsis() {
        let glyphs = FixedGlyphSource::default();
        let layout = layout_text(&spec("aa bb cc dd ee", 12.0, 2, TextAlign::Left), &glyphs);
        assert_eq!(layout.lines.len(), 2);
        assert!(layout.truncated);
        assert!(layout.lines[1].text.ends_with(ELLIPSIS));
    }

    #[test]
    fn center_alignment_offsets_line() {
        let glyphs = FixedGlyphSource::default();
        let layout = layout_text(&spec("ab", 100.0, 1, TextAlign::Center), &glyphs);
        // Line width 12, box 100: centered at 44.
        assert!((layout.lines[0].x - 44.0).abs() < 0.01);
    }

    #[test]
    fn right_alignment_flushes_line() {
        let glyphs = FixedGlyphSource::default();
        let layout = layout_text(&spec("ab", 100.0, 1, TextAlign::Right), &glyphs);
        assert!((layout.lines[0].x - 88.0).abs() < 0.01);
    }

    #[test]
    fn draw_without_ink_is_noop() {
        let glyphs = FixedGlyphSource::default();
        let layout = layout_text(&spec("hello", 100.0, 1, TextAlign::Left), &glyphs);
        let mut raster = Raster::new(100, 20).expect("raster");
        draw_text(&mut raster, &layout, 10.0, Color::WHITE, 1.0, &glyphs, 0.0, 0.0);
        assert!(raster.data.iter().all(|&b| b == 0));
    }
}
