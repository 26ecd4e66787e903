//! Translation of queue sampler names into ComfyUI sampler names.
//!
//! The queue speaks the k-diffusion vocabulary (`k_euler_a`,
//! `k_dpmpp_2m`, ...). ComfyUI uses the bare names with `_ancestral`
//! spelled out.

/// Scheduler selected when the job asks for Karras sigmas.
pub const KARRAS_SCHEDULER: &str = "karras";

/// Names that do not follow the prefix/suffix rules.
const SAMPLER_ALIASES: &[(&str, &str)] = &[
    ("ddim", "ddim"),
    ("dpmsolver", "dpmpp_2m"),
    ("lcm", "lcm"),
    ("dpm_adaptive", "dpm_adaptive"),
    ("dpm_fast", "dpm_fast"),
];

/// Translate a queue sampler name into its canonical ComfyUI form.
///
/// - The `k_` vendor prefix is stripped.
/// - A trailing `_a` becomes `_ancestral`.
/// - Names are lower-cased.
///
/// Names that are already canonical pass through unchanged.
pub fn canonical_sampler_name(name: &str) -> String {
    let lower = name.trim().to_ascii_lowercase();
    let bare = lower.strip_prefix("k_").unwrap_or(&lower);

    if let Some((_, canonical)) = SAMPLER_ALIASES.iter().find(|(alias, _)| *alias == bare) {
        return canonical.to_string();
    }

    match bare.strip_suffix("_a") {
        Some(stem) => format!("{stem}_ancestral"),
        None => bare.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_vendor_prefix() {
        assert_eq!(canonical_sampler_name("k_euler"), "euler");
        assert_eq!(canonical_sampler_name("k_dpmpp_2m"), "dpmpp_2m");
        assert_eq!(canonical_sampler_name("k_lms"), "lms");
    }

    #[test]
    fn expands_ancestral_suffix() {
        assert_eq!(canonical_sampler_name("k_euler_a"), "euler_ancestral");
        assert_eq!(canonical_sampler_name("k_dpm_2_a"), "dpm_2_ancestral");
        assert_eq!(canonical_sampler_name("k_dpmpp_2s_a"), "dpmpp_2s_ancestral");
    }

    #[test]
    fn applies_aliases() {
        assert_eq!(canonical_sampler_name("DDIM"), "ddim");
        assert_eq!(canonical_sampler_name("dpmsolver"), "dpmpp_2m");
        assert_eq!(canonical_sampler_name("k_dpm_fast"), "dpm_fast");
    }

    #[test]
    fn canonical_names_pass_through() {
        assert_eq!(canonical_sampler_name("euler_ancestral"), "euler_ancestral");
        assert_eq!(canonical_sampler_name("uni_pc"), "uni_pc");
    }
}
