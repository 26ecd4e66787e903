//! The editor-export ("UI") workflow encoding.
//!
//! ```json
//! {
//!   "nodes": [
//!     { "id": 3, "type": "KSampler", "title": "Sampler",
//!       "inputs": [{ "name": "model", "type": "MODEL", "link": 1 }],
//!       "widgets_values": [42, "randomize", 20, 7.5, "euler", "normal", 1.0] }
//!   ],
//!   "links": [[1, 4, 0, 3, 0, "MODEL"]]
//! }
//! ```
//!
//! Widget values are positional. They are named from a per-type widget
//! table, then from the node's `inputs[].widget.name` entries, and
//! otherwise given placeholder names (`widget_0`, ...). Editor-only
//! widgets and virtual nodes never reach the decoded graph.

use std::collections::HashMap;

use serde_json::Value;

use super::graph::{GraphFormat, Input, Link, Node, WorkflowGraph};
use super::node_types as nt;
use crate::error::CoreError;

/// Widgets that exist only in the editor and are not engine inputs.
const EDITOR_ONLY_WIDGETS: &[&str] = &["control_after_generate", "upload"];

/// Node types with no backend counterpart.
const VIRTUAL_NODES: &[&str] = &["Note", "MarkdownNote"];

const REROUTE: &str = "Reroute";
const PRIMITIVE: &str = "PrimitiveNode";

/// Editor node mode for muted ("never") nodes.
const MODE_MUTED: u64 = 2;

/// Editor node mode for bypassed nodes. A bypassed node is removed and
/// each consumer is wired to the node's input of the same type.
const MODE_BYPASS: u64 = 4;

/// Positional widget order for the node types the bridge edits.
const WIDGET_ORDER: &[(&str, &[&str])] = &[
    (nt::KSAMPLER, &["seed", "control_after_generate", "steps", "cfg", "sampler_name", "scheduler", "denoise"]),
    (
        nt::KSAMPLER_ADVANCED,
        &[
            "add_noise",
            "noise_seed",
            "control_after_generate",
            "steps",
            "cfg",
            "sampler_name",
            "scheduler",
            "start_at_step",
            "end_at_step",
            "return_with_leftover_noise",
        ],
    ),
    (nt::SAMPLER_CUSTOM, &["add_noise", "noise_seed", "control_after_generate", "cfg"]),
    (nt::RANDOM_NOISE, &["noise_seed", "control_after_generate"]),
    (nt::KSAMPLER_SELECT, &["sampler_name"]),
    (nt::BASIC_SCHEDULER, &["scheduler", "steps", "denoise"]),
    (nt::CFG_GUIDER, &["cfg"]),
    ("FluxGuidance", &["guidance"]),
    (nt::CLIP_TEXT_ENCODE, &["text"]),
    (
        nt::CLIP_TEXT_ENCODE_SDXL,
        &["width", "height", "crop_w", "crop_h", "target_width", "target_height", "text_g", "text_l"],
    ),
    (nt::CLIP_TEXT_ENCODE_FLUX, &["clip_l", "t5xxl", "guidance"]),
    (nt::EMPTY_LATENT_IMAGE, &["width", "height", "batch_size"]),
    (nt::EMPTY_SD3_LATENT_IMAGE, &["width", "height", "batch_size"]),
    (nt::EMPTY_HUNYUAN_LATENT_VIDEO, &["width", "height", "length", "batch_size"]),
    (nt::EMPTY_MOCHI_LATENT_VIDEO, &["width", "height", "length", "batch_size"]),
    (nt::EMPTY_LTXV_LATENT_VIDEO, &["width", "height", "length", "batch_size"]),
    (nt::WAN_IMAGE_TO_VIDEO, &["width", "height", "length", "batch_size"]),
    (nt::LOAD_IMAGE, &["image", "upload"]),
    (nt::CHECKPOINT_LOADER, &["ckpt_name"]),
    ("UNETLoader", &["unet_name", "weight_dtype"]),
    (nt::VAE_LOADER, &["vae_name"]),
    ("CLIPLoader", &["clip_name", "type"]),
    ("LoraLoader", &["lora_name", "strength_model", "strength_clip"]),
    (nt::SAVE_IMAGE, &["filename_prefix"]),
    (nt::SAVE_ANIMATED_WEBP, &["filename_prefix", "fps", "lossless", "quality", "method"]),
    (nt::SAVE_WEBM, &["filename_prefix", "codec", "fps", "crf"]),
    (nt::SAVE_VIDEO, &["filename_prefix", "format", "codec"]),
    (nt::CREATE_VIDEO, &["fps"]),
];

/// Whether `json` looks like an editor export rather than an API map.
pub fn is_ui_format(json: &Value) -> bool {
    json.get("nodes").is_some_and(Value::is_array) && json.get("links").is_some_and(Value::is_array)
}

/// One row of the `links` table.
#[derive(Debug, Clone)]
struct UiLink {
    origin: String,
    origin_slot: u32,
    link_type: Option<String>,
}

/// Decode an editor export.
pub fn decode(json: &Value) -> Result<WorkflowGraph, CoreError> {
    let raw_nodes = json
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::MalformedWorkflow("UI workflow must have a 'nodes' array".to_string()))?;
    let links = parse_links(json.get("links"))?;

    let by_id: HashMap<String, &Value> = raw_nodes
        .iter()
        .filter_map(|n| node_id(n).map(|id| (id, n)))
        .collect();

    let mut graph = WorkflowGraph::new(GraphFormat::Ui);

    for raw in raw_nodes {
        let id = node_id(raw)
            .ok_or_else(|| CoreError::MalformedWorkflow("UI node is missing an 'id'".to_string()))?;
        let class_type = raw.get("type").and_then(Value::as_str).ok_or_else(|| {
            CoreError::MalformedWorkflow(format!("Node '{id}' is missing required 'type' field"))
        })?;

        if VIRTUAL_NODES.contains(&class_type) || class_type == REROUTE || class_type == PRIMITIVE {
            continue;
        }
        match raw.get("mode").and_then(Value::as_u64) {
            Some(MODE_MUTED) => {
                tracing::debug!(node_id = %id, class_type, "Skipping muted node");
                continue;
            }
            Some(MODE_BYPASS) => {
                tracing::debug!(node_id = %id, class_type, "Splicing out bypassed node");
                continue;
            }
            _ => {}
        }

        let mut node = Node::new(id.clone(), class_type);
        node.title = raw.get("title").and_then(Value::as_str).map(str::to_string);

        decode_widgets(&mut node, raw);

        for input in raw.get("inputs").and_then(Value::as_array).into_iter().flatten() {
            let Some(name) = input.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(link_id) = input.get("link").and_then(Value::as_u64) else {
                continue;
            };
            match resolve_link(link_id, &links, &by_id)? {
                Some(resolved) => {
                    node.inputs.insert(name.to_string(), resolved);
                }
                None => {
                    tracing::debug!(node_id = %id, input = name, "Bypassed upstream has no matching input");
                }
            }
        }

        graph.insert(node);
    }

    if graph.is_empty() {
        return Err(CoreError::MalformedWorkflow(
            "Workflow JSON must contain at least one node".to_string(),
        ));
    }

    graph.validate_links()?;
    Ok(graph)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn node_id(raw: &Value) -> Option<String> {
    match raw.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse the `links` table. Both the legacy array rows
/// `[id, origin, origin_slot, target, target_slot, type]` and the newer
/// object rows are accepted.
fn parse_links(raw: Option<&Value>) -> Result<HashMap<u64, UiLink>, CoreError> {
    let mut out = HashMap::new();
    for row in raw.and_then(Value::as_array).into_iter().flatten() {
        let (id, origin, slot, link_type) = match row {
            Value::Array(cols) if cols.len() >= 5 => (
                cols[0].as_u64(),
                id_string(&cols[1]),
                cols[2].as_u64(),
                cols.get(5).and_then(Value::as_str),
            ),
            Value::Object(obj) => (
                obj.get("id").and_then(Value::as_u64),
                obj.get("origin_id").and_then(id_string),
                obj.get("origin_slot").and_then(Value::as_u64),
                obj.get("type").and_then(Value::as_str),
            ),
            _ => (None, None, None, None),
        };
        match (id, origin, slot) {
            (Some(id), Some(origin), Some(slot)) => {
                let origin_slot = u32::try_from(slot)
                    .map_err(|_| CoreError::MalformedWorkflow(format!("Link {id} has an invalid slot")))?;
                out.insert(
                    id,
                    UiLink {
                        origin,
                        origin_slot,
                        link_type: link_type.map(str::to_string),
                    },
                );
            }
            _ => {
                return Err(CoreError::MalformedWorkflow(format!("Malformed link row: {row}")));
            }
        }
    }
    Ok(out)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Name positional widget values and store them as literal inputs.
fn decode_widgets(node: &mut Node, raw: &Value) {
    match raw.get("widgets_values") {
        // Some custom nodes (e.g. VHS) export widgets as a name -> value map.
        Some(Value::Object(map)) => {
            for (name, value) in map {
                if !EDITOR_ONLY_WIDGETS.contains(&name.as_str()) {
                    node.inputs.insert(name.clone(), Input::Value(value.clone()));
                }
            }
        }
        Some(Value::Array(values)) => {
            let names = widget_names(&node.class_type, raw, values.len());
            for (name, value) in names.into_iter().zip(values) {
                if !EDITOR_ONLY_WIDGETS.contains(&name.as_str()) {
                    node.inputs.insert(name, Input::Value(value.clone()));
                }
            }
        }
        _ => {}
    }
}

fn widget_names(class_type: &str, raw: &Value, count: usize) -> Vec<String> {
    if let Some((_, names)) = WIDGET_ORDER.iter().find(|(class, _)| *class == class_type) {
        return names.iter().map(|s| s.to_string()).collect();
    }

    let declared: Vec<String> = raw
        .get("inputs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|i| i.pointer("/widget/name").and_then(Value::as_str))
        .map(str::to_string)
        .collect();
    if declared.len() == count {
        return declared;
    }

    tracing::warn!(
        class_type,
        widget_count = count,
        "Unknown widget layout, using positional names",
    );
    (0..count).map(|i| format!("widget_{i}")).collect()
}

/// Resolve a link id into an input, following reroutes and bypassed nodes
/// back to their origin and inlining primitive-node values as literals.
///
/// `None` means the link ends at a bypassed node with no input of the
/// link's type, so the consumer's input is left unconnected.
fn resolve_link(
    link_id: u64,
    links: &HashMap<u64, UiLink>,
    by_id: &HashMap<String, &Value>,
) -> Result<Option<Input>, CoreError> {
    let mut current = link_id;
    // Bounded by the number of links so a reroute cycle cannot spin forever.
    for _ in 0..=links.len() {
        let link = links
            .get(&current)
            .ok_or_else(|| CoreError::MalformedWorkflow(format!("Input references unknown link {current}")))?;
        let origin = by_id.get(&link.origin).copied();
        if let Some(raw) = origin.filter(|o| o.get("mode").and_then(Value::as_u64) == Some(MODE_BYPASS)) {
            match bypass_input(raw, link) {
                Some(upstream) => {
                    current = upstream;
                    continue;
                }
                None => return Ok(None),
            }
        }
        match origin.and_then(|o| o.get("type")).and_then(Value::as_str) {
            Some(REROUTE) => {
                let upstream = origin
                    .and_then(|o| o.pointer("/inputs/0/link"))
                    .and_then(Value::as_u64)
                    .ok_or_else(|| {
                        CoreError::MalformedWorkflow(format!("Reroute '{}' has no input", link.origin))
                    })?;
                current = upstream;
            }
            Some(PRIMITIVE) => {
                let value = origin
                    .and_then(|o| o.pointer("/widgets_values/0"))
                    .cloned()
                    .unwrap_or(Value::Null);
                return Ok(Some(Input::Value(value)));
            }
            _ => return Ok(Some(Input::Link(Link::new(link.origin.clone(), link.origin_slot)))),
        }
    }
    Err(CoreError::MalformedWorkflow(format!("Reroute cycle through link {link_id}")))
}

/// The upstream link a bypassed node passes through for `link`: the
/// connected input at the same slot when its type matches, otherwise the
/// first connected input of that type.
fn bypass_input(raw: &Value, link: &UiLink) -> Option<u64> {
    let wanted = link.link_type.as_deref()?;
    let inputs = raw.get("inputs").and_then(Value::as_array)?;
    let matching = |input: &&Value| input.get("type").and_then(Value::as_str) == Some(wanted);

    inputs
        .get(link.origin_slot as usize)
        .filter(matching)
        .into_iter()
        .chain(inputs.iter().filter(matching))
        .find_map(|input| input.get("link").and_then(Value::as_u64))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ui_workflow() -> Value {
        json!({
            "last_node_id": 9,
            "nodes": [
                { "id": 4, "type": "CheckpointLoaderSimple",
                  "widgets_values": ["sdxl.safetensors"] },
                { "id": 6, "type": "CLIPTextEncode", "title": "Positive Prompt",
                  "inputs": [{ "name": "clip", "type": "CLIP", "link": 3 }],
                  "widgets_values": ["a castle"] },
                { "id": 5, "type": "EmptyLatentImage",
                  "widgets_values": [512, 768, 1] },
                { "id": 3, "type": "KSampler",
                  "inputs": [
                      { "name": "model", "type": "MODEL", "link": 1 },
                      { "name": "positive", "type": "CONDITIONING", "link": 4 },
                      { "name": "latent_image", "type": "LATENT", "link": 2 }
                  ],
                  "widgets_values": [42, "randomize", 20, 7.5, "euler", "normal", 1.0] },
                { "id": 8, "type": "Note", "widgets_values": ["remember to pick a model"] }
            ],
            "links": [
                [1, 4, 0, 3, 0, "MODEL"],
                [2, 5, 0, 3, 3, "LATENT"],
                [3, 4, 1, 6, 0, "CLIP"],
                [4, 6, 0, 3, 1, "CONDITIONING"]
            ]
        })
    }

    #[test]
    fn detects_ui_format() {
        assert!(is_ui_format(&ui_workflow()));
        assert!(!is_ui_format(&json!({ "3": { "class_type": "KSampler" } })));
    }

    #[test]
    fn names_known_widgets_and_drops_editor_only_ones() {
        let graph = decode(&ui_workflow()).unwrap();
        let sampler = graph.node("3").unwrap();
        assert_eq!(sampler.value("seed"), Some(&json!(42)));
        assert_eq!(sampler.value("steps"), Some(&json!(20)));
        assert_eq!(sampler.value("scheduler"), Some(&json!("normal")));
        assert!(!sampler.inputs.contains_key("control_after_generate"));
    }

    #[test]
    fn resolves_links_through_table() {
        let graph = decode(&ui_workflow()).unwrap();
        let sampler = graph.node("3").unwrap();
        assert_eq!(sampler.link("model"), Some(&Link::new("4", 0)));
        assert_eq!(sampler.link("latent_image"), Some(&Link::new("5", 0)));
        assert_eq!(graph.node("6").unwrap().link("clip"), Some(&Link::new("4", 1)));
    }

    #[test]
    fn skips_virtual_nodes_and_keeps_titles() {
        let graph = decode(&ui_workflow()).unwrap();
        assert!(graph.node("8").is_none());
        assert_eq!(graph.node("6").unwrap().title.as_deref(), Some("Positive Prompt"));
    }

    #[test]
    fn reroutes_are_followed_to_their_origin() {
        let json = json!({
            "nodes": [
                { "id": 1, "type": "CheckpointLoaderSimple", "widgets_values": ["m.safetensors"] },
                { "id": 2, "type": "Reroute", "inputs": [{ "name": "", "link": 10 }] },
                { "id": 3, "type": "VAEDecode", "inputs": [{ "name": "vae", "link": 11 }] }
            ],
            "links": [[10, 1, 2, 2, 0, "VAE"], [11, 2, 0, 3, 1, "VAE"]]
        });
        let graph = decode(&json).unwrap();
        assert_eq!(graph.node("3").unwrap().link("vae"), Some(&Link::new("1", 2)));
        assert!(graph.node("2").is_none());
    }

    #[test]
    fn primitive_values_are_inlined() {
        let json = json!({
            "nodes": [
                { "id": 1, "type": "PrimitiveNode", "widgets_values": [1234, "fixed"] },
                { "id": 2, "type": "RandomNoise",
                  "inputs": [{ "name": "noise_seed", "link": 7, "widget": { "name": "noise_seed" } }],
                  "widgets_values": [0, "randomize"] }
            ],
            "links": [[7, 1, 0, 2, 0, "INT"]]
        });
        let graph = decode(&json).unwrap();
        assert_eq!(graph.node("2").unwrap().value("noise_seed"), Some(&json!(1234)));
    }

    #[test]
    fn object_links_and_object_widgets_are_accepted() {
        let json = json!({
            "nodes": [
                { "id": 1, "type": "VAEDecode" },
                { "id": 2, "type": "VHS_VideoCombine",
                  "inputs": [{ "name": "images", "link": 5 }],
                  "widgets_values": { "frame_rate": 16, "filename_prefix": "AnimateDiff" } }
            ],
            "links": [{ "id": 5, "origin_id": 1, "origin_slot": 0, "target_id": 2, "target_slot": 0 }]
        });
        let graph = decode(&json).unwrap();
        let combine = graph.node("2").unwrap();
        assert_eq!(combine.value("frame_rate"), Some(&json!(16)));
        assert_eq!(combine.link("images"), Some(&Link::new("1", 0)));
    }

    #[test]
    fn unknown_widget_layout_uses_declared_names_or_placeholders() {
        let json = json!({
            "nodes": [
                { "id": 1, "type": "CustomA",
                  "inputs": [{ "name": "strength", "widget": { "name": "strength" }, "link": null }],
                  "widgets_values": [0.5] },
                { "id": 2, "type": "CustomB", "widgets_values": ["x", 2] }
            ],
            "links": []
        });
        let graph = decode(&json).unwrap();
        assert_eq!(graph.node("1").unwrap().value("strength"), Some(&json!(0.5)));
        assert_eq!(graph.node("2").unwrap().value("widget_1"), Some(&json!(2)));
    }

    #[test]
    fn muted_nodes_are_skipped() {
        let json = json!({
            "nodes": [
                { "id": 1, "type": "SaveImage", "widgets_values": ["a"] },
                { "id": 2, "type": "SaveImage", "mode": 2, "widgets_values": ["b"] }
            ],
            "links": []
        });
        let graph = decode(&json).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn bypassed_nodes_are_spliced_out_by_type() {
        let json = json!({
            "nodes": [
                { "id": 1, "type": "CheckpointLoaderSimple", "widgets_values": ["m.safetensors"] },
                { "id": 2, "type": "LoraLoader", "mode": 4,
                  "inputs": [
                      { "name": "model", "type": "MODEL", "link": 10 },
                      { "name": "clip", "type": "CLIP", "link": 11 }
                  ],
                  "widgets_values": ["style.safetensors", 1.0, 1.0] },
                { "id": 3, "type": "KSampler",
                  "inputs": [{ "name": "model", "type": "MODEL", "link": 12 }],
                  "widgets_values": [1, "fixed", 20, 7.0, "euler", "normal", 1.0] },
                { "id": 4, "type": "CLIPTextEncode",
                  "inputs": [{ "name": "clip", "type": "CLIP", "link": 13 }],
                  "widgets_values": ["a castle"] }
            ],
            "links": [
                [10, 1, 0, 2, 0, "MODEL"],
                [11, 1, 1, 2, 1, "CLIP"],
                [12, 2, 0, 3, 0, "MODEL"],
                [13, 2, 1, 4, 0, "CLIP"]
            ]
        });
        let graph = decode(&json).unwrap();
        assert!(graph.node("2").is_none());
        assert_eq!(graph.node("3").unwrap().link("model"), Some(&Link::new("1", 0)));
        assert_eq!(graph.node("4").unwrap().link("clip"), Some(&Link::new("1", 1)));
    }

    #[test]
    fn bypassed_node_without_matching_input_leaves_consumer_unconnected() {
        let json = json!({
            "nodes": [
                { "id": 1, "type": "CheckpointLoaderSimple", "widgets_values": ["m.safetensors"] },
                { "id": 2, "type": "UpscaleModelLoader", "mode": 4, "widgets_values": ["4x.pth"] },
                { "id": 3, "type": "ImageUpscaleWithModel",
                  "inputs": [{ "name": "upscale_model", "type": "UPSCALE_MODEL", "link": 20 }] }
            ],
            "links": [[20, 2, 0, 3, 0, "UPSCALE_MODEL"]]
        });
        let graph = decode(&json).unwrap();
        assert_eq!(graph.len(), 2);
        assert!(graph.node("3").unwrap().link("upscale_model").is_none());
    }

    #[test]
    fn unknown_link_is_rejected() {
        let json = json!({
            "nodes": [{ "id": 1, "type": "VAEDecode", "inputs": [{ "name": "vae", "link": 99 }] }],
            "links": []
        });
        assert!(decode(&json).is_err());
    }
}
