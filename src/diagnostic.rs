use std::fmt;
use std::ops::Range;

use ariadne::{Color, Config, Label, Report, ReportKind, Source};

/// A positioned error produced while reading IR text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    /// Byte range into the source text.
    pub span: Range<usize>,
}

impl Diagnostic {
    pub fn error(message: String, span: Range<usize>) -> Self {
        Self { message, span }
    }

    /// 1-based line and column of the span start.
    pub fn line_col(&self, source: &str) -> (usize, usize) {
        let offset = self.span.start.min(source.len());
        let before = &source[..offset];
        let line = before.matches('\n').count() + 1;
        let col = offset - before.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1;
        (line, col)
    }

    fn report<'a>(&self, filename: &'a str, source: &str, color: bool) -> Report<'static, (&'a str, Range<usize>)> {
        let len = source.len();
        let start = self.span.start.min(len);
        let span = start..self.span.end.clamp(start, len);
        let mut label = Label::new((filename, span)).with_message(&self.message);
        if color {
            label = label.with_color(Color::Red);
        }
        Report::build(ReportKind::Error, filename, start)
            .with_config(Config::default().with_color(color))
            .with_message(&self.message)
            .with_label(label)
            .finish()
    }

    /// Render with ariadne, without colors.
    pub fn render_to_string(&self, filename: &str, source: &str) -> String {
        let mut out = Vec::new();
        if self
            .report(filename, source, false)
            .write((filename, Source::from(source)), &mut out)
            .is_err()
        {
            return self.to_string();
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Render to stderr with ariadne.
    pub fn render(&self, filename: &str, source: &str) {
        if self
            .report(filename, source, true)
            .eprint((filename, Source::from(source)))
            .is_err()
        {
            eprintln!("{}", self);
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (at bytes {}..{})",
            self.message, self.span.start, self.span.end
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let src = "abc\ndef\nghi";
        let d = Diagnostic::error("x".to_string(), 5..6);
        assert_eq!(d.line_col(src), (2, 2));
    }

    #[test]
    fn test_display_names_span() {
        let d = Diagnostic::error("expected type".to_string(), 10..15);
        assert_eq!(d.to_string(), "expected type (at bytes 10..15)");
    }

    #[test]
    fn test_render_clamps_span_past_end() {
        let src = "define void @k( {\n";
        let d = Diagnostic::error("expected type".to_string(), 16..400);
        let text = d.render_to_string("k.ir", src);
        assert!(text.contains("expected type"));
        assert!(text.contains("k.ir"));
    }
}
