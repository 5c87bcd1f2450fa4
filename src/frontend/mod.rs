use std::path::PathBuf;

use colored::Colorize;

use self::lexer::Span;

pub mod ast;
pub mod intern;
pub mod lexer;
pub mod parser;

#[derive(Debug)]
pub struct SourceFile {
    pub contents: String,
    pub origin: SourceFileOrigin,
}

impl SourceFile {
    pub fn value_of_span(&self, span: Span) -> &str {
        &self.contents[span.start..span.end]
    }

    /// Zero-based line number containing `position`
    pub fn row_for_position(&self, position: usize) -> usize {
        self.contents[..position.min(self.contents.len())]
            .chars()
            .filter(|c| *c == '\n')
            .count()
    }

    /// Zero-based column of `position` within its line
    pub fn column_for_position(&self, position: usize) -> usize {
        let clamped = position.min(self.contents.len());

        match self.contents[..clamped].rfind('\n') {
            Some(newline) => clamped - newline - 1,
            None => clamped,
        }
    }

    /// Prints the line containing the span with the offending range underlined
    pub fn highlight_span(&self, span: Span) {
        let row = self.row_for_position(span.start);
        let column = self.column_for_position(span.start);

        let Some(line) = self.contents.lines().nth(row) else {
            return;
        };

        let width = (span.end - span.start).clamp(1, line.len().saturating_sub(column).max(1));

        eprintln!("{line}");
        eprintln!("{}{}", " ".repeat(column), "^".repeat(width).red().bold());
    }

    /// Reports an unrecoverable user-facing diagnostic and terminates
    pub fn report_fatal_error(&self, offending_span: Span, message: &str) -> ! {
        eprintln!(
            "{}: {} ({}:{}:{})",
            "error".red().bold(),
            message,
            self.origin,
            self.row_for_position(offending_span.start) + 1,
            self.column_for_position(offending_span.start) + 1
        );
        self.highlight_span(offending_span);
        std::process::exit(1);
    }
}

#[derive(Debug)]
pub enum SourceFileOrigin {
    Memory,
    File(PathBuf),
}

impl core::fmt::Display for SourceFileOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceFileOrigin::Memory => f.write_str("<memory>"),
            SourceFileOrigin::File(path) => f.write_fmt(format_args!("{}", path.display())),
        }
    }
}
