//! Chat panel rendering: last N messages, bottom-up, with age fade and
//! highlight tint.

use chrono::{DateTime, Utc};

use framecast_core::chat::ChatMessage;
use framecast_core::layer::{Color, TextAlign, TextSpec};

use crate::error::RenderResult;
use crate::raster::Raster;
use crate::text::{layout_text, draw_text, GlyphSource};

#[derive(Debug, Clone)]
pub struct PanelStyle {
    pub width: u32,
    pub height: u32,
    pub font_size: f32,
    pub padding: f32,
    pub message_gap: f32,
    pub text_color: Color,
    pub highlight_tint: Color,
    /// Wrapped lines per message before ellipsis.
    pub max_lines_per_message: usize,
}

impl Default for PanelStyle {
    fn default() -> Self {
        Self {
            width: 360,
            height: 480,
            font_size: 14.0,
            padding: 8.0,
            message_gap: 6.0,
            text_color: Color::WHITE,
            highlight_tint: Color { r: 255, g: 214, b: 0, a: 64 },
            max_lines_per_message: 3,
        }
    }
}

/// Render the panel. Only the last `max_messages` entries are
/// considered; newest sits at the bottom and rendering walks upward
/// until the panel is full.
pub fn render_chat(
    messages: &[ChatMessage],
    max_messages: usize,
    style: &PanelStyle,
    glyphs: &dyn GlyphSource,
    now: DateTime<Utc>,
) -> RenderResult<Raster> {
    let mut panel = Raster::new(style.width, style.height)?;
    let max_messages = max_messages.max(1);
    let visible = &messages[messages.len().saturating_sub(max_messages)..];

    let text_width = style.width as f32 - style.padding * 2.0;
    let mut bottom = style.height as f32 - style.padding;

    for message in visible.iter().rev() {
        let opacity = message.opacity_at(now);
        if opacity <= 0.0 {
            continue;
        }

        let spec = TextSpec {
            text: format!("{}: {}", message.username, message.text),
            size: style.font_size,
            color: style.text_color,
            align: TextAlign::Left,
            max_width: text_width,
            max_lines: style.max_lines_per_message,
        };
        let layout = layout_text(&spec, glyphs);
        let block_height = layout.height();
        let top = bottom - block_height;
        if top < style.padding {
            break;
        }

        if message.highlighted {
            panel.fill_rect(
                style.padding / 2.0,
                top - style.message_gap / 2.0,
                style.width as f32 - style.padding,
                block_height + style.message_gap,
                style.highlight_tint,
                1.0,
            );
        }

        draw_text(
            &mut panel,
            &layout,
            style.font_size,
            style.text_color,
            opacity,
            glyphs,
            style.padding,
            top,
        );

        bottom = top - style.message_gap;
    }

    Ok(panel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::FixedGlyphSource;
    use chrono::Duration;

    fn message(id: &str, secs_old: i64, highlighted: bool, now: DateTime<Utc>) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            username: "viewer".to_string(),
            text: "hello there".to_string(),
            timestamp: now - Duration::seconds(secs_old),
            highlighted,
        }
    }

    #[test]
    fn panel_matches_style_dimensions() {
        let now = Utc::now();
        let glyphs = FixedGlyphSource::default();
        let style = PanelStyle::default();
        let panel = render_chat(&[message("a", 1, false, now)], 10, &style, &glyphs, now)
            .expect("render");
        assert_eq!((panel.width, panel.height), (style.width, style.height));
    }

    #[test]
    fn highlighted_message_tints_background() {
        let now = Utc::now();
        let glyphs = FixedGlyphSource::default();
        let style = PanelStyle::default();

        let plain = render_chat(&[message("a", 1, false, now)], 10, &style, &glyphs, now)
            .expect("render");
        let tinted = render_chat(&[message("a", 1, true, now)], 10, &style, &glyphs, now)
            .expect("render");

        assert!(plain.data.iter().all(|&b| b == 0));
        assert!(tinted.data.iter().any(|&b| b != 0));
    }

    #[test]
    fn expired_messages_leave_no_ink() {
        let now = Utc::now();
        let glyphs = FixedGlyphSource::default();
        let style = PanelStyle::default();
        // Highlighted but fully faded: skipped before tinting.
        let panel = render_chat(&[message("a", 40, true, now)], 10, &style, &glyphs, now)
            .expect("render");
        assert!(panel.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn only_last_max_messages_render() {
        let now = Utc::now();
        let glyphs = FixedGlyphSource::default();
        let style = PanelStyle::default();
        let messages: Vec<_> = (0..20)
            .map(|i| message(&format!("m{i}"), 1, i < 15, now))
            .collect();

        // max_messages = 5 keeps only the newest five, none highlighted.
        let panel = render_chat(&messages, 5, &style, &glyphs, now).expect("render");
        assert!(panel.data.iter().all(|&b| b == 0));
    }
}
