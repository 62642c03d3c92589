//! Colored diagnostics for conversions.
//!
//! Everything here writes to stderr; stdout is reserved for the JSON
//! conversion result.

use std::io::Write;
use termcolor::{BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

/// Colored stderr reporter.
#[derive(Debug)]
pub struct OutputManager {
    bufwtr: BufferWriter,
    verbose: bool,
}

/// Marker printed before a message, and how to color it.
#[derive(Clone, Copy)]
struct Marker {
    symbol: &'static str,
    color: Color,
    bold: bool,
    /// Color the message text as well as the symbol
    tint_message: bool,
}

const INFO: Marker = Marker {
    symbol: "ℹ",
    color: Color::Cyan,
    bold: false,
    tint_message: false,
};
const SUCCESS: Marker = Marker {
    symbol: "✓",
    color: Color::Green,
    bold: true,
    tint_message: false,
};
const WARN: Marker = Marker {
    symbol: "⚠",
    color: Color::Yellow,
    bold: true,
    tint_message: true,
};
const ERROR: Marker = Marker {
    symbol: "✗",
    color: Color::Red,
    bold: true,
    tint_message: true,
};
const VERBOSE: Marker = Marker {
    symbol: "→",
    color: Color::Blue,
    bold: false,
    tint_message: false,
};

impl OutputManager {
    /// Reporter; `verbose` enables [`verbose`](Self::verbose) lines.
    pub fn new(verbose: bool) -> Self {
        Self {
            bufwtr: BufferWriter::stderr(ColorChoice::Auto),
            verbose,
        }
    }

    fn marked(&self, marker: Marker, message: &str) -> std::io::Result<()> {
        let mut buffer = self.bufwtr.buffer();
        buffer.set_color(ColorSpec::new().set_fg(Some(marker.color)).set_bold(marker.bold))?;
        write!(&mut buffer, "{}", marker.symbol)?;
        buffer.reset()?;
        if marker.tint_message {
            buffer.set_color(ColorSpec::new().set_fg(Some(marker.color)))?;
        }
        writeln!(&mut buffer, " {message}")?;
        buffer.reset()?;
        self.bufwtr.print(&buffer)
    }

    /// Progress message.
    pub fn info(&self, message: &str) -> std::io::Result<()> {
        self.marked(INFO, message)
    }

    /// Completed step.
    pub fn success(&self, message: &str) -> std::io::Result<()> {
        self.marked(SUCCESS, message)
    }

    /// Non-fatal problem, such as a skipped candidate image.
    pub fn warn(&self, message: &str) -> std::io::Result<()> {
        self.marked(WARN, message)
    }

    /// Fatal error. Never fails; falls back to plain `eprintln!`.
    pub fn error(&self, message: &str) {
        if self.marked(ERROR, message).is_err() {
            eprintln!("✗ {message}");
        }
    }

    /// Detail shown only with `--verbose`.
    pub fn verbose(&self, message: &str) -> std::io::Result<()> {
        if !self.verbose {
            return Ok(());
        }
        self.marked(VERBOSE, message)
    }

    /// Sub-item under the previous line.
    pub fn indent(&self, message: &str) -> std::io::Result<()> {
        self.println(&format!("    {message}"))
    }

    /// Plain line.
    pub fn println(&self, message: &str) -> std::io::Result<()> {
        let mut buffer = self.bufwtr.buffer();
        writeln!(&mut buffer, "{message}")?;
        self.bufwtr.print(&buffer)
    }
}
