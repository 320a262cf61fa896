//! Persistent records: assets, renditions, and polymorphic owner links.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[sqlx(type_name = "media_asset_status", rename_all = "lowercase")]
pub enum AssetStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

#[derive(sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[sqlx(type_name = "media_source", rename_all = "lowercase")]
pub enum SourceKind {
    Upload,
    Remote,
}

#[derive(sqlx::Type, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[sqlx(type_name = "media_format", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ImageCodec {
    Jpeg,
    Webp,
    Avif,
    Png,
}

impl ImageCodec {
    /// Parse a configured codec name; unknown names yield None so the
    /// profile layer can drop them silently.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn ext(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
            Self::Png => "image/png",
        }
    }
}

/// One logical image plus the metadata of all its derived renditions.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct MediaAsset {
    pub id: i64,
    pub profile: String,
    pub source: SourceKind,
    pub source_url: Option<String>,
    pub original_jpeg_key: Option<String>,
    pub original_webp_key: Option<String>,
    pub original_avif_key: Option<String>,
    pub original_png_key: Option<String>,
    pub original_width: Option<i32>,
    pub original_height: Option<i32>,
    pub checksum_sha1: Option<String>,
    pub status: AssetStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaAsset {
    /// Every original object key that exists for this asset.
    pub fn original_keys(&self) -> Vec<&str> {
        [
            self.original_jpeg_key.as_deref(),
            self.original_webp_key.as_deref(),
            self.original_avif_key.as_deref(),
            self.original_png_key.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct MediaVariant {
    pub id: i64,
    pub asset_id: i64,
    pub variant: String,
    pub format: ImageCodec,
    pub object_key: String,
    pub width: i32,
    pub height: i32,
    pub byte_size: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct MediaOwnerLink {
    pub id: i64,
    pub owner_type: String,
    pub owner_id: i64,
    pub asset_id: i64,
    pub role: String,
    pub sort: i32,
    pub created_at: DateTime<Utc>,
}

/// Owning side of a link, as supplied by callers.
#[derive(Clone, Debug)]
pub struct Owner {
    pub owner_type: String,
    pub owner_id: i64,
    pub role: String,
    pub sort: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_names_parse_case_insensitively() {
        assert_eq!(ImageCodec::from_name("JPEG"), Some(ImageCodec::Jpeg));
        assert_eq!(ImageCodec::from_name("jpg"), Some(ImageCodec::Jpeg));
        assert_eq!(ImageCodec::from_name("WebP"), Some(ImageCodec::Webp));
        assert_eq!(ImageCodec::from_name("tiff"), None);
    }

    #[test]
    fn original_keys_collects_present_codecs() {
        let asset = MediaAsset {
            id: 1,
            profile: "p".into(),
            source: SourceKind::Upload,
            source_url: None,
            original_jpeg_key: Some("a/original.jpg".into()),
            original_webp_key: None,
            original_avif_key: Some("a/original.avif".into()),
            original_png_key: None,
            original_width: Some(10),
            original_height: Some(10),
            checksum_sha1: None,
            status: AssetStatus::Ready,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(asset.original_keys(), ["a/original.jpg", "a/original.avif"]);
    }
}
