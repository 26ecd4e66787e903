//! ComfyUI node class types the bridge recognises, grouped by the role the
//! compiler gives them.

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

pub const KSAMPLER: &str = "KSampler";
pub const KSAMPLER_ADVANCED: &str = "KSamplerAdvanced";
pub const SAMPLER_CUSTOM: &str = "SamplerCustom";
pub const SAMPLER_CUSTOM_ADVANCED: &str = "SamplerCustomAdvanced";
pub const RANDOM_NOISE: &str = "RandomNoise";
pub const KSAMPLER_SELECT: &str = "KSamplerSelect";
pub const BASIC_SCHEDULER: &str = "BasicScheduler";
pub const CFG_GUIDER: &str = "CFGGuider";

/// Nodes that carry sampling parameters (seed, steps, cfg, sampler,
/// scheduler, denoise). Split samplers spread these over several nodes.
pub const SAMPLERS: &[&str] = &[
    KSAMPLER,
    KSAMPLER_ADVANCED,
    SAMPLER_CUSTOM,
    RANDOM_NOISE,
    KSAMPLER_SELECT,
    BASIC_SCHEDULER,
    CFG_GUIDER,
];

/// Nodes with a `latent_image` input that the img2img rewrite re-targets.
pub const LATENT_CONSUMERS: &[&str] = &[
    KSAMPLER,
    KSAMPLER_ADVANCED,
    SAMPLER_CUSTOM,
    SAMPLER_CUSTOM_ADVANCED,
];

// ---------------------------------------------------------------------------
// Prompt encoding
// ---------------------------------------------------------------------------

pub const CLIP_TEXT_ENCODE: &str = "CLIPTextEncode";
pub const CLIP_TEXT_ENCODE_SDXL: &str = "CLIPTextEncodeSDXL";
pub const CLIP_TEXT_ENCODE_FLUX: &str = "CLIPTextEncodeFlux";

/// Prompt encoders and the text fields each exposes.
pub const PROMPT_ENCODERS: &[(&str, &[&str])] = &[
    (CLIP_TEXT_ENCODE, &["text"]),
    (CLIP_TEXT_ENCODE_SDXL, &["text_g", "text_l"]),
    (CLIP_TEXT_ENCODE_FLUX, &["clip_l", "t5xxl"]),
];

// ---------------------------------------------------------------------------
// Canvas / latent size
// ---------------------------------------------------------------------------

pub const EMPTY_LATENT_IMAGE: &str = "EmptyLatentImage";
pub const EMPTY_SD3_LATENT_IMAGE: &str = "EmptySD3LatentImage";
pub const EMPTY_HUNYUAN_LATENT_VIDEO: &str = "EmptyHunyuanLatentVideo";
pub const EMPTY_MOCHI_LATENT_VIDEO: &str = "EmptyMochiLatentVideo";
pub const EMPTY_LTXV_LATENT_VIDEO: &str = "EmptyLTXVLatentVideo";
pub const WAN_IMAGE_TO_VIDEO: &str = "WanImageToVideo";

/// Empty-canvas nodes for still images; the img2img rewrite replaces these.
pub const EMPTY_IMAGE_LATENTS: &[&str] = &[EMPTY_LATENT_IMAGE, EMPTY_SD3_LATENT_IMAGE];

/// Nodes exposing `width` / `height` (and for video, `length`).
pub const SIZE_NODES: &[&str] = &[
    EMPTY_LATENT_IMAGE,
    EMPTY_SD3_LATENT_IMAGE,
    EMPTY_HUNYUAN_LATENT_VIDEO,
    EMPTY_MOCHI_LATENT_VIDEO,
    EMPTY_LTXV_LATENT_VIDEO,
    WAN_IMAGE_TO_VIDEO,
];

/// Size nodes that make a graph a video graph.
pub const VIDEO_LENGTH_NODES: &[&str] = &[
    EMPTY_HUNYUAN_LATENT_VIDEO,
    EMPTY_MOCHI_LATENT_VIDEO,
    EMPTY_LTXV_LATENT_VIDEO,
    WAN_IMAGE_TO_VIDEO,
];

// ---------------------------------------------------------------------------
// Image input / VAE
// ---------------------------------------------------------------------------

pub const LOAD_IMAGE: &str = "LoadImage";
pub const VAE_ENCODE: &str = "VAEEncode";
pub const VAE_DECODE: &str = "VAEDecode";
pub const VAE_LOADER: &str = "VAELoader";
pub const REPEAT_LATENT_BATCH: &str = "RepeatLatentBatch";

// ---------------------------------------------------------------------------
// Model loading
// ---------------------------------------------------------------------------

pub const CHECKPOINT_LOADER: &str = "CheckpointLoaderSimple";

/// Loader nodes and the field naming the model file.
pub const MODEL_LOADERS: &[(&str, &str)] = &[
    (CHECKPOINT_LOADER, "ckpt_name"),
    ("UNETLoader", "unet_name"),
    (VAE_LOADER, "vae_name"),
    ("CLIPLoader", "clip_name"),
    ("LoraLoader", "lora_name"),
];

/// Model filenames shipped in template exports that are not real models.
pub const PLACEHOLDER_MODEL_NAMES: &[&str] = &[
    "",
    "model.safetensors",
    "put_model_here",
    "put_checkpoints_here",
    "example.safetensors",
];

/// `CheckpointLoaderSimple` output slot carrying the VAE.
pub const CHECKPOINT_VAE_SLOT: u32 = 2;

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub const SAVE_IMAGE: &str = "SaveImage";
pub const SAVE_VIDEO: &str = "SaveVideo";
pub const SAVE_ANIMATED_WEBP: &str = "SaveAnimatedWEBP";
pub const SAVE_WEBM: &str = "SaveWEBM";
pub const VHS_VIDEO_COMBINE: &str = "VHS_VideoCombine";
pub const CREATE_VIDEO: &str = "CreateVideo";

/// Nodes exposing `filename_prefix`.
pub const OUTPUT_NODES: &[&str] = &[
    SAVE_IMAGE,
    SAVE_VIDEO,
    SAVE_ANIMATED_WEBP,
    SAVE_WEBM,
    VHS_VIDEO_COMBINE,
];

/// Nodes exposing a frame-rate field, with the field name.
pub const FPS_NODES: &[(&str, &str)] = &[
    (CREATE_VIDEO, "fps"),
    (SAVE_ANIMATED_WEBP, "fps"),
    (SAVE_WEBM, "fps"),
    (VHS_VIDEO_COMBINE, "frame_rate"),
];

// ---------------------------------------------------------------------------
// Lookup helpers
// ---------------------------------------------------------------------------

pub fn is_sampler(class_type: &str) -> bool {
    SAMPLERS.contains(&class_type)
}

pub fn prompt_fields(class_type: &str) -> Option<&'static [&'static str]> {
    PROMPT_ENCODERS
        .iter()
        .find(|(class, _)| *class == class_type)
        .map(|(_, fields)| *fields)
}

pub fn is_size_node(class_type: &str) -> bool {
    SIZE_NODES.contains(&class_type)
}

pub fn is_output_node(class_type: &str) -> bool {
    OUTPUT_NODES.contains(&class_type)
}

pub fn fps_field(class_type: &str) -> Option<&'static str> {
    FPS_NODES
        .iter()
        .find(|(class, _)| *class == class_type)
        .map(|(_, field)| *field)
}

pub fn model_field(class_type: &str) -> Option<&'static str> {
    MODEL_LOADERS
        .iter()
        .find(|(class, _)| *class == class_type)
        .map(|(_, field)| *field)
}

/// Whether the compiler has anything to do with this node type.
pub fn is_recognized(class_type: &str) -> bool {
    is_sampler(class_type)
        || prompt_fields(class_type).is_some()
        || is_size_node(class_type)
        || class_type == LOAD_IMAGE
        || is_output_node(class_type)
        || fps_field(class_type).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_each_role() {
        assert!(is_recognized(KSAMPLER));
        assert!(is_recognized(CLIP_TEXT_ENCODE_SDXL));
        assert!(is_recognized(EMPTY_LATENT_IMAGE));
        assert!(is_recognized(LOAD_IMAGE));
        assert!(is_recognized(SAVE_IMAGE));
        assert!(is_recognized(CREATE_VIDEO));
    }

    #[test]
    fn loaders_and_decoders_are_not_recognized() {
        assert!(!is_recognized(CHECKPOINT_LOADER));
        assert!(!is_recognized(VAE_DECODE));
        assert!(!is_recognized("IPAdapterApply"));
    }

    #[test]
    fn field_lookups() {
        assert_eq!(prompt_fields(CLIP_TEXT_ENCODE_FLUX), Some(&["clip_l", "t5xxl"][..]));
        assert_eq!(fps_field(VHS_VIDEO_COMBINE), Some("frame_rate"));
        assert_eq!(model_field(CHECKPOINT_LOADER), Some("ckpt_name"));
        assert_eq!(model_field(KSAMPLER), None);
    }
}
