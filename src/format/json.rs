//! JSON output formatter

use serde::{Deserialize, Serialize};

use super::GraphFormatter;
use crate::blocks::FunctionGraph;
use crate::TraceError;

/// Serializable block for JSON output
#[derive(Serialize, Deserialize)]
struct BlockJson {
    /// Block id within its function graph
    id: usize,
    /// Newline-joined instruction display lines
    label: String,
    /// Ids of successor blocks
    successors: Vec<usize>,
}

/// Serializable function graph for JSON output
#[derive(Serialize, Deserialize)]
struct FunctionJson {
    /// Discovery-order function index
    function: u16,
    /// Root instruction address as hex string
    root: String,
    /// Blocks of this function
    blocks: Vec<BlockJson>,
}

/// Serializable document for JSON output
#[derive(Serialize, Deserialize)]
struct GraphJson {
    functions: Vec<FunctionJson>,
}

impl GraphFormatter for super::JsonFormatter {
    fn format(&self, functions: &[FunctionGraph]) -> Result<String, TraceError> {
        let functions = functions.iter().map(function_to_json).collect();
        let result = GraphJson { functions };

        serde_json::to_string_pretty(&result)
            .map_err(|e| TraceError::Generic(format!("JSON serialization error: {}", e)))
    }
}

fn function_to_json(f: &FunctionGraph) -> FunctionJson {
    let blocks = f
        .graph
        .blocks()
        .map(|(id, label)| BlockJson {
            id,
            label: label.to_string(),
            successors: f
                .graph
                .edges()
                .iter()
                .filter(|(from, _)| *from == id)
                .map(|(_, to)| *to)
                .collect(),
        })
        .collect();

    FunctionJson {
        function: f.function,
        root: format!("0x{:x}", f.root),
        blocks,
    }
}
