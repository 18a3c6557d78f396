//! Output format module implementation

mod dot;
mod json;

pub use self::dot::*;
pub use self::json::*;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;

use crate::blocks::FunctionGraph;
use crate::TraceError;

/// Supported output formats for the block-level graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Graphviz DOT, one strict digraph per rendered function (default)
    Dot,
    /// JSON (hierarchical)
    Json,
    /// Plain text dump
    Text,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Dot => write!(f, "dot"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dot" | "gv" => Ok(OutputFormat::Dot),
            "json" => Ok(OutputFormat::Json),
            "text" => Ok(OutputFormat::Text),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[OutputFormat::Dot, OutputFormat::Json, OutputFormat::Text]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn GraphFormatter> {
        match self {
            OutputFormat::Dot => Box::new(DotFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::Text => Box::new(TextFormatter),
        }
    }
}

/// Formatter trait over synthesized block graphs
pub trait GraphFormatter {
    /// Render the given function graphs into one output document.
    fn format(&self, functions: &[FunctionGraph]) -> Result<String, TraceError>;
}

/// Format block graphs as Graphviz DOT
pub struct DotFormatter;

/// Format block graphs as JSON
pub struct JsonFormatter;

/// Format block graphs as plain text
pub struct TextFormatter;

impl GraphFormatter for TextFormatter {
    fn format(&self, functions: &[FunctionGraph]) -> Result<String, TraceError> {
        let mut output = String::new();

        for f in functions {
            output.push_str(&format!(
                "Function {} at 0x{:x}: {} blocks\n\n",
                f.function,
                f.root,
                f.graph.len()
            ));

            for (id, label) in f.graph.blocks() {
                output.push_str(&format!("Block b{}:\n", id));
                for line in label.lines() {
                    output.push_str(&format!("  {}\n", line));
                }

                let succs: Vec<String> = f
                    .graph
                    .edges()
                    .iter()
                    .filter(|(from, _)| *from == id)
                    .map(|(_, to)| format!("b{}", to))
                    .collect();
                if succs.is_empty() {
                    output.push_str("  No successors (terminal block)\n");
                } else {
                    output.push_str(&format!("  Successors: {}\n", succs.join(", ")));
                }
                output.push('\n');
            }
        }

        Ok(output)
    }
}
