//! Rendition profiles.
//!
//! A profile names the renditions to produce for an asset: which variants,
//! in which codecs, under which object-key prefix. Profiles are parsed once
//! at startup and immutable afterwards.

use serde::Deserialize;
use std::collections::HashMap;

use crate::db::models::ImageCodec;
use crate::error::{AppError, Result};

/// Raw profile shape as it appears in the bootstrap file.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileConfig {
    pub prefix: String,
    #[serde(default)]
    pub keep_original: bool,
    #[serde(default = "default_max_original_long_edge")]
    pub max_original_long_edge: u32,
    #[serde(default)]
    pub codecs: Vec<String>,
    /// Kept as a raw JSON map so variant iteration order follows the file.
    #[serde(default)]
    pub variants: serde_json::Map<String, serde_json::Value>,
}

fn default_max_original_long_edge() -> u32 {
    2048
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    Cover,
    Contain,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct VariantDef {
    #[serde(rename = "w")]
    pub width: u32,
    #[serde(rename = "h")]
    pub height: u32,
    #[serde(default = "default_fit")]
    pub fit: FitMode,
}

fn default_fit() -> FitMode {
    FitMode::Cover
}

/// Immutable, validated profile record.
#[derive(Clone, Debug)]
pub struct Profile {
    pub name: String,
    pub prefix: String,
    pub keep_original: bool,
    pub max_original_long_edge: u32,
    codecs: Vec<ImageCodec>,
    variants: Vec<(String, VariantDef)>,
}

impl Profile {
    /// Rendering order: JPEG always leads, then the configured codecs.
    pub fn codecs(&self) -> &[ImageCodec] {
        &self.codecs
    }

    /// Variants in configuration order.
    pub fn variants(&self) -> &[(String, VariantDef)] {
        &self.variants
    }
}

pub struct ProfileRegistry {
    profiles: HashMap<String, Profile>,
}

impl ProfileRegistry {
    pub fn from_config(raw: &HashMap<String, ProfileConfig>) -> Result<Self> {
        let mut profiles = HashMap::with_capacity(raw.len());
        for (name, config) in raw {
            profiles.insert(name.clone(), build_profile(name, config)?);
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .get(name)
            .ok_or_else(|| AppError::ProfileUnknown(name.to_string()))
    }
}

fn build_profile(name: &str, config: &ProfileConfig) -> Result<Profile> {
    // Unknown codec names are dropped silently; JPEG is always rendered
    // first regardless of whether the file lists it.
    let mut codecs = vec![ImageCodec::Jpeg];
    for raw in &config.codecs {
        if let Some(codec) = ImageCodec::from_name(raw) {
            if !codecs.contains(&codec) {
                codecs.push(codec);
            }
        }
    }

    let mut variants = Vec::with_capacity(config.variants.len());
    for (variant_name, value) in &config.variants {
        let def: VariantDef = serde_json::from_value(value.clone()).map_err(|e| {
            AppError::Internal(format!(
                "profile {name}: invalid variant {variant_name}: {e}"
            ))
        })?;
        if def.width == 0 || def.height == 0 {
            return Err(AppError::Internal(format!(
                "profile {name}: variant {variant_name} has a zero dimension"
            )));
        }
        variants.push((variant_name.clone(), def));
    }

    Ok(Profile {
        name: name.to_string(),
        prefix: config.prefix.clone(),
        keep_original: config.keep_original,
        max_original_long_edge: config.max_original_long_edge,
        codecs,
        variants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(json: &str) -> ProfileRegistry {
        let raw: HashMap<String, ProfileConfig> = serde_json::from_str(json).unwrap();
        ProfileRegistry::from_config(&raw).unwrap()
    }

    #[test]
    fn unknown_codecs_filtered_jpeg_leads() {
        let registry = registry(
            r#"{ "p": {
                "prefix": "p",
                "codecs": ["webp", "tiff", "bmp", "png", "jpeg"],
                "variants": {}
            }}"#,
        );
        let profile = registry.get("p").unwrap();
        assert_eq!(
            profile.codecs(),
            &[ImageCodec::Jpeg, ImageCodec::Webp, ImageCodec::Png]
        );
    }

    #[test]
    fn variant_order_follows_configuration() {
        let registry = registry(
            r#"{ "p": {
                "prefix": "p",
                "variants": {
                    "zebra": { "w": 10, "h": 10 },
                    "alpha": { "w": 20, "h": 20, "fit": "contain" },
                    "mid":   { "w": 30, "h": 30, "fit": "cover" }
                }
            }}"#,
        );
        let profile = registry.get("p").unwrap();
        let names: Vec<&str> = profile.variants().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["zebra", "alpha", "mid"]);
        assert_eq!(profile.variants()[1].1.fit, FitMode::Contain);
    }

    #[test]
    fn unknown_profile_lookup_fails() {
        let registry = registry(r#"{}"#);
        assert!(matches!(
            registry.get("missing"),
            Err(AppError::ProfileUnknown(_))
        ));
    }

    #[test]
    fn zero_dimension_variant_rejected() {
        let raw: HashMap<String, ProfileConfig> = serde_json::from_str(
            r#"{ "p": { "prefix": "p", "variants": { "bad": { "w": 0, "h": 10 } } } }"#,
        )
        .unwrap();
        assert!(ProfileRegistry::from_config(&raw).is_err());
    }
}
