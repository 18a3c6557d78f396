//! Graphviz DOT output formatter

use std::fmt::Write as _;

use super::GraphFormatter;
use crate::blocks::FunctionGraph;
use crate::TraceError;

impl GraphFormatter for super::DotFormatter {
    fn format(&self, functions: &[FunctionGraph]) -> Result<String, TraceError> {
        let mut out = String::new();

        for f in functions {
            // Strict digraph: the renderer elides any edge a cycle re-adds.
            let _ = writeln!(out, "strict digraph \"fn{}_0x{:x}\" {{", f.function, f.root);
            let _ = writeln!(out, "  node [shape=box];");
            for (id, label) in f.graph.blocks() {
                let _ = writeln!(out, "  b{} [label=\"{}\"];", id, escape_label(label));
            }
            for (from, to) in f.graph.edges() {
                let _ = writeln!(out, "  b{} -> b{};", from, to);
            }
            let _ = writeln!(out, "}}");
        }

        Ok(out)
    }
}

/// Escape a block label for a quoted DOT string. Each instruction line ends
/// in `\l` so listings come out left-justified.
fn escape_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len() + 8);
    for line in label.split('\n') {
        for ch in line.chars() {
            match ch {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                _ => out.push(ch),
            }
        }
        out.push_str("\\l");
    }
    out
}
