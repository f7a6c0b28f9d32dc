//! Segment Rendering
//!
//! Turning segments into displayed text is an external concern; the
//! controller only needs a `render` function. Two stock renderers ship with
//! the engine:
//!
//! - [`FencedRenderer`]: re-emits markdown fences, so displayed text reads like
//!   the raw reply (default, suited to terminals)
//! - [`HtmlRenderer`]: wraps code in `<pre><code class="language-..">` for a
//!   highlighter running in a web view

use crate::segmenter::{Segment, SegmentKind};

/// Converts segments into displayed markup
pub trait Renderer: Send + Sync {
    /// Render one segment
    ///
    /// Called for finalized segments once, and for the provisional tail on
    /// every chunk (`segment.closed == false` for an open code block).
    fn render(&self, segment: &Segment) -> String;

    /// Render a run of segments
    fn render_all(&self, segments: &[Segment]) -> String {
        segments.iter().map(|s| self.render(s)).collect()
    }
}

/// Markdown-preserving renderer
#[derive(Clone, Copy, Debug, Default)]
pub struct FencedRenderer;

impl Renderer for FencedRenderer {
    fn render(&self, segment: &Segment) -> String {
        match segment.kind {
            SegmentKind::Prose => segment.content.clone(),
            SegmentKind::Code => {
                let mut out = segment.opener.clone();
                out.push_str(&segment.content);
                if segment.closed {
                    if segment.closer.is_empty() {
                        if !out.ends_with('\n') {
                            out.push('\n');
                        }
                        out.push_str("```");
                    } else {
                        out.push_str(&segment.closer);
                    }
                }
                out
            }
        }
    }
}

/// HTML renderer for web surfaces
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmlRenderer;

impl Renderer for HtmlRenderer {
    fn render(&self, segment: &Segment) -> String {
        match segment.kind {
            SegmentKind::Prose => segment.content.clone(),
            SegmentKind::Code => {
                let language = segment
                    .language
                    .as_deref()
                    .unwrap_or(crate::segmenter::DEFAULT_LANGUAGE);
                format!(
                    "<pre><code class=\"language-{language}\">{}</code></pre>",
                    escape_html(&segment.content)
                )
            }
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
