//! Workflow graph model and its two physical encodings.

pub mod api_format;
pub mod graph;
pub mod node_types;
pub mod ui_format;

pub use graph::{GraphFormat, Input, Link, Node, WorkflowGraph};

use serde_json::Value;

use crate::error::CoreError;

/// Decode a workflow in either encoding, detected from its shape.
pub fn decode(json: &Value) -> Result<WorkflowGraph, CoreError> {
    if ui_format::is_ui_format(json) {
        ui_format::decode(json)
    } else {
        api_format::decode(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatches_on_shape() {
        let api = json!({ "1": { "class_type": "SaveImage", "inputs": { "filename_prefix": "x" } } });
        assert_eq!(decode(&api).unwrap().format(), GraphFormat::Api);

        let ui = json!({
            "nodes": [{ "id": 1, "type": "SaveImage", "widgets_values": ["x"] }],
            "links": []
        });
        let graph = decode(&ui).unwrap();
        assert_eq!(graph.format(), GraphFormat::Ui);
        assert_eq!(graph.node("1").unwrap().value("filename_prefix"), Some(&json!("x")));
    }

    #[test]
    fn ui_graph_encodes_as_api() {
        let ui = json!({
            "nodes": [
                { "id": 1, "type": "CheckpointLoaderSimple", "widgets_values": ["m.safetensors"] },
                { "id": 2, "type": "VAEDecode", "inputs": [{ "name": "vae", "link": 3 }] }
            ],
            "links": [[3, 1, 2, 2, 1, "VAE"]]
        });
        let encoded = decode(&ui).unwrap().to_api_json();
        assert_eq!(encoded["2"]["class_type"], "VAEDecode");
        assert_eq!(encoded["2"]["inputs"]["vae"], json!(["1", 2]));
        assert_eq!(encoded["1"]["inputs"]["ckpt_name"], "m.safetensors");
    }
}
