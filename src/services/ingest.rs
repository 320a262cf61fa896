//! Ingestion orchestration.
//!
//! Validates sources, persists asset rows, renders the rendition set,
//! fans the uploads out to the object store, and commits. Errors from
//! validation, rendering, or uploading are never caught here; they bubble
//! so the surrounding transaction rolls back. Only deletion-time per-object
//! failures are swallowed.

use bytes::Bytes;
use image::ImageFormat;
use sha1::{Digest, Sha1};
use sqlx::{Postgres, Transaction};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::lookup_host;
use tracing::{info, warn};
use url::Url;

use crate::db::asset_repo::{AssetStore, NewAsset, NewVariant, OriginalKeys};
use crate::db::models::{AssetStatus, ImageCodec, MediaAsset, Owner, SourceKind};
use crate::error::{AppError, Result};
use crate::profiles::{Profile, ProfileRegistry};
use crate::services::bus::{ProcessMessage, Publisher};
use crate::services::download::Downloader;
use crate::services::image::{default_quality, ImageEngine, ALT_DEFAULT_QUALITY, JPEG_DEFAULT_QUALITY};
use crate::services::object_store::{ObjectStore, UploadFile, DEFAULT_UPLOAD_CONCURRENCY};
use crate::services::spool::TempSpool;

/// Hard cap on a single source payload.
pub const MAX_UPLOAD_BYTES: u64 = 50 * 1024 * 1024;

/// Structured result of one worker processing cycle.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub success: bool,
    pub exceeded_retries: bool,
    pub error: Option<String>,
    pub attempts: i32,
}

impl ProcessOutcome {
    fn success(attempts: i32) -> Self {
        Self {
            success: true,
            exceeded_retries: false,
            error: None,
            attempts,
        }
    }
}

pub struct Ingestor {
    profiles: Arc<ProfileRegistry>,
    engine: Arc<ImageEngine>,
    store: ObjectStore,
    downloader: Downloader,
    bus: Option<Arc<Publisher>>,
    spool: Option<Arc<TempSpool>>,
}

impl Ingestor {
    pub fn new(
        profiles: Arc<ProfileRegistry>,
        engine: Arc<ImageEngine>,
        store: ObjectStore,
        downloader: Downloader,
        bus: Option<Arc<Publisher>>,
        spool: Option<Arc<TempSpool>>,
    ) -> Self {
        Self {
            profiles,
            engine,
            store,
            downloader,
            bus,
            spool,
        }
    }

    /// Synchronous local upload: validate, persist, render, fan-out upload,
    /// link, commit. The asset returns READY or the transaction never lands.
    pub async fn upload_local(
        &self,
        db: &AssetStore,
        bytes: Bytes,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        validate_image_bytes(&bytes)?;
        self.ingest_sync(db, bytes, profile_name, SourceKind::Upload, None, owner)
            .await
    }

    /// Synchronous remote ingestion: SSRF-validate, download, then proceed
    /// exactly like a local upload.
    pub async fn upload_remote(
        &self,
        db: &AssetStore,
        url: &str,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        let _ = self.profiles.get(profile_name)?;
        let url = validate_url(url).await?;
        let download = self.downloader.fetch(&url).await?;
        validate_image_bytes(&download.body)?;
        self.ingest_sync(
            db,
            download.body,
            profile_name,
            SourceKind::Remote,
            Some(url.as_str()),
            owner,
        )
        .await
    }

    /// Persist a QUEUED remote asset and hand it to the bus. The DB commit
    /// precedes the publish; a failed publish leaves the asset QUEUED for a
    /// later re-queue pass.
    pub async fn enqueue_remote(
        &self,
        db: &AssetStore,
        url: &str,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        let bus = self.require_bus()?;
        let _ = self.profiles.get(profile_name)?;
        let url = validate_url(url).await?;

        let mut tx = db.begin().await?;
        let asset = db
            .insert_asset(
                &mut *tx,
                NewAsset {
                    profile: profile_name,
                    source: SourceKind::Remote,
                    source_url: Some(url.as_str()),
                    status: AssetStatus::Queued,
                },
            )
            .await?;
        db.insert_owner_link(&mut *tx, asset.id, owner).await?;
        tx.commit().await?;

        let message = ProcessMessage {
            asset_id: asset.id,
            temp_file_path: None,
        };
        if let Err(e) = bus.publish_process(&message).await {
            warn!(
                asset_id = asset.id,
                error = %e,
                "publish after commit failed; asset stays queued for recovery"
            );
        }
        Ok(asset)
    }

    /// Async local upload: spool the bytes, persist a QUEUED asset, publish
    /// the job with the spool path. Anything failing after the spool write
    /// removes the spool file again.
    pub async fn enqueue_local(
        &self,
        db: &AssetStore,
        bytes: Bytes,
        name: &str,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        let bus = self.require_bus()?;
        let spool = self
            .spool
            .as_ref()
            .ok_or_else(|| AppError::Spool("no temp spool configured".to_string()))?;
        let _ = self.profiles.get(profile_name)?;
        validate_image_bytes(&bytes)?;

        let path = spool.save_upload(&bytes, name)?;
        let persisted = async {
            let mut tx = db.begin().await?;
            let asset = db
                .insert_asset(
                    &mut *tx,
                    NewAsset {
                        profile: profile_name,
                        source: SourceKind::Upload,
                        source_url: None,
                        status: AssetStatus::Queued,
                    },
                )
                .await?;
            db.insert_owner_link(&mut *tx, asset.id, owner).await?;
            tx.commit().await?;
            Ok::<MediaAsset, AppError>(asset)
        }
        .await;

        let asset = match persisted {
            Ok(asset) => asset,
            Err(e) => {
                spool.delete(&path);
                return Err(e);
            }
        };

        let message = ProcessMessage {
            asset_id: asset.id,
            temp_file_path: Some(path.to_string_lossy().into_owned()),
        };
        if let Err(e) = bus.publish_process(&message).await {
            spool.delete(&path);
            return Err(e);
        }
        Ok(asset)
    }

    /// One worker processing cycle. Loads, screens the retry budget, claims,
    /// and dispatches by source kind; any failure inside the claimed section
    /// marks the asset FAILED and increments its attempt counter.
    pub async fn process_asset(
        &self,
        db: &AssetStore,
        asset_id: i64,
        retry_max: i32,
        temp_file_path: Option<&str>,
    ) -> Result<ProcessOutcome> {
        let Some(asset) = db.find_asset(db.pool(), asset_id).await? else {
            info!(asset_id, "asset no longer exists, dropping job");
            return Ok(ProcessOutcome::success(0));
        };
        if asset.status == AssetStatus::Ready {
            return Ok(ProcessOutcome::success(asset.attempts));
        }
        if asset.attempts >= retry_max {
            return Ok(ProcessOutcome {
                success: false,
                exceeded_retries: true,
                error: asset.last_error.clone(),
                attempts: asset.attempts,
            });
        }
        if !db.claim(db.pool(), asset_id).await? {
            info!(asset_id, "claim lost to a concurrent worker");
            return Ok(ProcessOutcome::success(asset.attempts));
        }

        let asset = db
            .find_asset(db.pool(), asset_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("asset {asset_id} vanished after claim")))?;

        match self.process_claimed(db, &asset, temp_file_path).await {
            Ok(()) => {
                info!(asset_id, "asset processed");
                Ok(ProcessOutcome::success(asset.attempts))
            }
            Err(e) => {
                let message = e.to_string();
                warn!(asset_id, error = %message, "asset processing failed");
                let attempts = db.mark_failed(db.pool(), asset_id, &message).await?;
                Ok(ProcessOutcome {
                    success: false,
                    exceeded_retries: attempts >= retry_max,
                    error: Some(message),
                    attempts,
                })
            }
        }
    }

    async fn process_claimed(
        &self,
        db: &AssetStore,
        asset: &MediaAsset,
        temp_file_path: Option<&str>,
    ) -> Result<()> {
        let profile = self.profiles.get(&asset.profile)?;

        match asset.source {
            SourceKind::Remote => {
                let raw = asset.source_url.as_deref().ok_or_else(|| {
                    AppError::Validation("remote asset is missing its source url".to_string())
                })?;
                let url = validate_url(raw).await?;
                let download = self.downloader.fetch(&url).await?;
                validate_image_bytes(&download.body)?;

                // Multiple owners may exist by now, so the owner path is not
                // reconstructed for async remote processing.
                let base_key = orphan_base_key(&profile.prefix, asset.id);
                let mut tx = db.begin().await?;
                self.render_and_store(db, &mut tx, asset.id, download.body, profile, &base_key)
                    .await?;
                db.mark_ready(&mut *tx, asset.id).await?;
                tx.commit().await?;
            }
            SourceKind::Upload => {
                let path = temp_file_path.ok_or_else(|| {
                    AppError::Validation("upload job delivered without a temp file path".to_string())
                })?;
                let bytes = Bytes::from(tokio::fs::read(path).await.map_err(|e| {
                    AppError::Spool(format!("cannot read spool file {path}: {e}"))
                })?);
                validate_image_bytes(&bytes)?;

                let link = db.first_owner_link(db.pool(), asset.id).await?;
                let base_key = match &link {
                    Some(link) => {
                        base_key(&profile.prefix, &link.owner_type, link.owner_id, asset.id)
                    }
                    None => orphan_base_key(&profile.prefix, asset.id),
                };

                let mut tx = db.begin().await?;
                self.render_and_store(db, &mut tx, asset.id, bytes, profile, &base_key)
                    .await?;
                db.mark_ready(&mut *tx, asset.id).await?;
                tx.commit().await?;

                // The spool file goes last, once everything is durable.
                match &self.spool {
                    Some(spool) => spool.delete(Path::new(path)),
                    None => {
                        if let Err(e) = tokio::fs::remove_file(path).await {
                            warn!(path, error = %e, "spool delete failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove an asset and every object it owns. Per-object store failures
    /// are logged and skipped; the row delete cascades renditions and links.
    pub async fn delete_asset(&self, db: &AssetStore, asset_id: i64) -> Result<()> {
        let Some(asset) = db.find_asset(db.pool(), asset_id).await? else {
            return Ok(());
        };
        let variants = db.list_variants(db.pool(), asset_id).await?;

        let mut keys: Vec<String> = asset
            .original_keys()
            .into_iter()
            .map(str::to_string)
            .collect();
        keys.extend(variants.into_iter().map(|v| v.object_key));

        for key in &keys {
            if let Err(e) = self.store.delete(key).await {
                warn!(key = %key, error = %e, "object delete failed, continuing");
            }
        }
        db.delete_asset(db.pool(), asset_id).await?;
        info!(asset_id, objects = keys.len(), "asset deleted");
        Ok(())
    }

    /// A READY asset with this content hash, if one exists.
    pub async fn find_duplicate(&self, db: &AssetStore, sha1: &str) -> Result<Option<MediaAsset>> {
        db.find_ready_by_checksum(db.pool(), sha1).await
    }

    /// Dedup wrapper: byte-identical content links the existing asset for
    /// the new owner instead of rendering again.
    pub async fn upload_local_with_dedup(
        &self,
        db: &AssetStore,
        bytes: Bytes,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        validate_image_bytes(&bytes)?;
        if let Some(existing) = self.link_duplicate(db, &bytes, owner).await? {
            return Ok(existing);
        }
        self.ingest_sync(db, bytes, profile_name, SourceKind::Upload, None, owner)
            .await
    }

    pub async fn upload_remote_with_dedup(
        &self,
        db: &AssetStore,
        url: &str,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        let _ = self.profiles.get(profile_name)?;
        let url = validate_url(url).await?;
        let download = self.downloader.fetch(&url).await?;
        validate_image_bytes(&download.body)?;
        if let Some(existing) = self.link_duplicate(db, &download.body, owner).await? {
            return Ok(existing);
        }
        self.ingest_sync(
            db,
            download.body,
            profile_name,
            SourceKind::Remote,
            Some(url.as_str()),
            owner,
        )
        .await
    }

    pub async fn enqueue_remote_with_dedup(
        &self,
        db: &AssetStore,
        url: &str,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        let _ = self.profiles.get(profile_name)?;
        let parsed = validate_url(url).await?;
        let download = self.downloader.fetch(&parsed).await?;
        validate_image_bytes(&download.body)?;
        if let Some(existing) = self.link_duplicate(db, &download.body, owner).await? {
            return Ok(existing);
        }
        self.enqueue_remote(db, url, profile_name, owner).await
    }

    pub async fn enqueue_local_with_dedup(
        &self,
        db: &AssetStore,
        bytes: Bytes,
        name: &str,
        profile_name: &str,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        validate_image_bytes(&bytes)?;
        if let Some(existing) = self.link_duplicate(db, &bytes, owner).await? {
            return Ok(existing);
        }
        self.enqueue_local(db, bytes, name, profile_name, owner).await
    }

    async fn link_duplicate(
        &self,
        db: &AssetStore,
        bytes: &[u8],
        owner: &Owner,
    ) -> Result<Option<MediaAsset>> {
        let sha1 = sha1_hex(bytes);
        let Some(existing) = self.find_duplicate(db, &sha1).await? else {
            return Ok(None);
        };
        info!(asset_id = existing.id, checksum = %sha1, "dedup hit, linking existing asset");
        db.insert_owner_link(db.pool(), existing.id, owner).await?;
        Ok(Some(existing))
    }

    async fn ingest_sync(
        &self,
        db: &AssetStore,
        bytes: Bytes,
        profile_name: &str,
        source: SourceKind,
        source_url: Option<&str>,
        owner: &Owner,
    ) -> Result<MediaAsset> {
        let profile = self.profiles.get(profile_name)?;

        let mut tx = db.begin().await?;
        let asset = db
            .insert_asset(
                &mut *tx,
                NewAsset {
                    profile: profile_name,
                    source,
                    source_url,
                    status: AssetStatus::Processing,
                },
            )
            .await?;

        let base_key = base_key(&profile.prefix, &owner.owner_type, owner.owner_id, asset.id);
        self.render_and_store(db, &mut tx, asset.id, bytes, profile, &base_key)
            .await?;
        db.mark_ready(&mut *tx, asset.id).await?;
        db.insert_owner_link(&mut *tx, asset.id, owner).await?;
        tx.commit().await?;

        let asset = db
            .find_asset(db.pool(), asset.id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("asset {} vanished after commit", asset.id)))?;
        info!(asset_id = asset.id, profile = profile_name, "asset ingested");
        Ok(asset)
    }

    /// The render-and-upload pipeline: compute the rendition set off the
    /// async runtime, fan the batch out, then persist what the batch made
    /// durable. A failed batch has already rolled its objects back, so the
    /// bubbling error leaves no trace in either store.
    async fn render_and_store(
        &self,
        db: &AssetStore,
        tx: &mut Transaction<'static, Postgres>,
        asset_id: i64,
        bytes: Bytes,
        profile: &Profile,
        base_key: &str,
    ) -> Result<()> {
        let existing: HashSet<(String, ImageCodec)> = db
            .list_variants(&mut **tx, asset_id)
            .await?
            .into_iter()
            .map(|v| (v.variant, v.format))
            .collect();

        let engine = Arc::clone(&self.engine);
        let profile = profile.clone();
        let base_key = base_key.to_string();
        let set = tokio::task::spawn_blocking(move || {
            build_render_set(&engine, &bytes, &profile, &base_key, asset_id, &existing)
        })
        .await
        .map_err(|e| AppError::Internal(format!("render task panicked: {e}")))??;

        self.store
            .put_multiple(set.uploads, DEFAULT_UPLOAD_CONCURRENCY)
            .await?;

        db.set_rendered(
            &mut **tx,
            asset_id,
            set.original.as_ref().map(|o| (&o.keys, o.width, o.height)),
            &set.sha1,
        )
        .await?;
        for rendition in &set.renditions {
            db.insert_variant(&mut **tx, rendition).await?;
        }
        Ok(())
    }

    fn require_bus(&self) -> Result<&Arc<Publisher>> {
        self.bus
            .as_ref()
            .ok_or_else(|| AppError::BusUnavailable("no message bus configured".to_string()))
    }
}

/// Everything one render pass produces: the batch to upload and the rows to
/// persist once the batch lands.
struct RenderSet {
    sha1: String,
    original: Option<OriginalUpdate>,
    uploads: Vec<UploadFile>,
    renditions: Vec<NewVariant>,
}

struct OriginalUpdate {
    keys: OriginalKeys,
    width: i32,
    height: i32,
}

fn build_render_set(
    engine: &ImageEngine,
    bytes: &[u8],
    profile: &Profile,
    base_key: &str,
    asset_id: i64,
    existing: &HashSet<(String, ImageCodec)>,
) -> Result<RenderSet> {
    let sha1 = sha1_hex(bytes);
    let mut uploads = Vec::new();
    let mut renditions = Vec::new();
    let mut original = None;

    if profile.keep_original {
        let rendered = engine.render_original(
            bytes,
            profile.max_original_long_edge,
            profile.codecs(),
            JPEG_DEFAULT_QUALITY,
            ALT_DEFAULT_QUALITY,
        )?;
        let mut keys = OriginalKeys::default();
        for codec in [
            ImageCodec::Jpeg,
            ImageCodec::Webp,
            ImageCodec::Avif,
            ImageCodec::Png,
        ] {
            let Some(body) = rendered.body_for(codec) else {
                continue;
            };
            let key = format!("{base_key}/original.{}", codec.ext());
            uploads.push(UploadFile {
                key: key.clone(),
                body: body.clone(),
                content_type: codec.content_type(),
            });
            match codec {
                ImageCodec::Jpeg => keys.jpeg = Some(key),
                ImageCodec::Webp => keys.webp = Some(key),
                ImageCodec::Avif => keys.avif = Some(key),
                ImageCodec::Png => keys.png = Some(key),
            }
        }
        original = Some(OriginalUpdate {
            keys,
            width: rendered.width as i32,
            height: rendered.height as i32,
        });
    }

    for (variant_name, def) in profile.variants() {
        for codec in profile.codecs() {
            if !engine.is_supported(*codec) {
                continue;
            }
            let result = engine.render_variant(bytes, def, *codec, default_quality(*codec))?;
            let key = format!("{base_key}/{variant_name}.{}", codec.ext());
            uploads.push(UploadFile {
                key: key.clone(),
                body: result.body.clone(),
                content_type: result.content_type,
            });
            // Re-runs after a partial failure only add missing rows; rows
            // that already exist are never rewritten.
            if !existing.contains(&(variant_name.clone(), *codec)) {
                renditions.push(NewVariant {
                    asset_id,
                    variant: variant_name.clone(),
                    format: *codec,
                    object_key: key,
                    width: result.width as i32,
                    height: result.height as i32,
                    byte_size: result.body.len() as i64,
                });
            }
        }
    }

    Ok(RenderSet {
        sha1,
        original,
        uploads,
        renditions,
    })
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Non-empty, within the size cap, and carrying a recognizable image header.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(AppError::Validation("empty image payload".to_string()));
    }
    if bytes.len() as u64 > MAX_UPLOAD_BYTES {
        return Err(AppError::Validation(format!(
            "payload of {} bytes exceeds the {MAX_UPLOAD_BYTES} byte cap",
            bytes.len()
        )));
    }
    let format = image::guess_format(bytes)
        .map_err(|_| AppError::Validation("payload is not a recognizable image".to_string()))?;
    match format {
        ImageFormat::Jpeg
        | ImageFormat::Png
        | ImageFormat::Gif
        | ImageFormat::WebP
        | ImageFormat::Avif => Ok(()),
        other => Err(AppError::Validation(format!(
            "unsupported image format {other:?}"
        ))),
    }
}

/// SSRF screening: scheme, literal-host blocklist, and (for host names) the
/// resolved addresses, all checked before any request goes out.
pub async fn validate_url(raw: &str) -> Result<Url> {
    let (url, literal_ip) = validate_url_syntax(raw)?;
    if literal_ip.is_some() {
        return Ok(url);
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("url has no host".to_string()))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = lookup_host((host.as_str(), port))
        .await
        .map_err(|e| AppError::Validation(format!("cannot resolve {host}: {e}")))?;
    for addr in addrs {
        if is_forbidden_ip(addr.ip()) {
            return Err(AppError::Validation(format!(
                "host {host} resolves to a blocked address {}",
                addr.ip()
            )));
        }
    }
    Ok(url)
}

/// The synchronous part of URL validation. Returns the parsed URL and the
/// literal host IP when the host is an address (already screened).
pub fn validate_url_syntax(raw: &str) -> Result<(Url, Option<IpAddr>)> {
    let url = Url::parse(raw).map_err(|e| AppError::Validation(format!("invalid url: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AppError::Validation(format!(
                "unsupported url scheme: {other}"
            )))
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("url has no host".to_string()))?;
    let bare = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();

    if matches!(bare.as_str(), "localhost" | "127.0.0.1" | "::1") {
        return Err(AppError::Validation(format!("blocked host: {host}")));
    }

    let literal_ip = bare.parse::<IpAddr>().ok();
    if let Some(ip) = literal_ip {
        if is_forbidden_ip(ip) {
            return Err(AppError::Validation(format!("blocked address: {ip}")));
        }
    }
    Ok((url, literal_ip))
}

fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local and fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Object-key prefix for one asset: `prefix/ownerType/ownerId/assetId`,
/// with the owner-type segment sanitized and omitted when empty or "_".
pub fn base_key(prefix: &str, owner_type: &str, owner_id: i64, asset_id: i64) -> String {
    let prefix = prefix.trim_end_matches('/');
    let sanitized = sanitize_owner_type(owner_type);
    if sanitized.is_empty() || sanitized == "_" {
        format!("{prefix}/{owner_id}/{asset_id}")
    } else {
        format!("{prefix}/{sanitized}/{owner_id}/{asset_id}")
    }
}

/// Prefix for async processing when no owner path is reconstructed.
fn orphan_base_key(prefix: &str, asset_id: i64) -> String {
    format!("{}/_asset/{asset_id}", prefix.trim_end_matches('/'))
}

fn sanitize_owner_type(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::profiles::ProfileConfig;
    use image::ImageOutputFormat;
    use std::collections::HashMap;
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([10, 120, 200]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    fn profile(json: &str) -> Profile {
        let raw: HashMap<String, ProfileConfig> =
            serde_json::from_str(&format!(r#"{{ "p": {json} }}"#)).unwrap();
        ProfileRegistry::from_config(&raw)
            .unwrap()
            .get("p")
            .unwrap()
            .clone()
    }

    #[test]
    fn sha1_matches_known_vector() {
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn base_key_sanitizes_owner_type() {
        assert_eq!(
            base_key("products/", "App\\Entity\\Product", 7, 12),
            "products/App_Entity_Product/7/12"
        );
        assert_eq!(base_key("p", "Post", 2, 3), "p/Post/2/3");
    }

    #[test]
    fn base_key_omits_empty_or_placeholder_owner_type() {
        assert_eq!(base_key("p", "", 7, 12), "p/7/12");
        assert_eq!(base_key("p", "_", 7, 12), "p/7/12");
        assert_eq!(base_key("p", ".", 7, 12), "p/7/12");
    }

    #[test]
    fn orphan_base_key_shape() {
        assert_eq!(orphan_base_key("p/", 9), "p/_asset/9");
    }

    #[test]
    fn image_bytes_validation() {
        assert!(matches!(
            validate_image_bytes(b""),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            validate_image_bytes(b"plain text"),
            Err(AppError::Validation(_))
        ));
        assert!(validate_image_bytes(&png_bytes(4, 4)).is_ok());
    }

    #[test]
    fn oversized_payload_rejected() {
        let huge = vec![0u8; (MAX_UPLOAD_BYTES + 1) as usize];
        assert!(matches!(
            validate_image_bytes(&huge),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn url_validation_rejects_ssrf_vectors() {
        for bad in [
            "http://127.0.0.1",
            "http://localhost/",
            "http://10.0.0.1/",
            "http://[::1]/",
            "ftp://example.com/",
            "http://192.168.1.5/a.jpg",
            "http://169.254.169.254/latest/meta-data",
        ] {
            assert!(
                matches!(validate_url(bad).await, Err(AppError::Validation(_))),
                "expected rejection for {bad}"
            );
        }
    }

    #[test]
    fn url_syntax_accepts_public_https() {
        let (url, literal) = validate_url_syntax("https://example.com/a.jpg").unwrap();
        assert_eq!(url.as_str(), "https://example.com/a.jpg");
        assert!(literal.is_none());
    }

    #[tokio::test]
    async fn url_validation_accepts_public_literal_address() {
        assert!(validate_url("https://93.184.216.34/a.jpg").await.is_ok());
    }

    #[test]
    fn render_set_single_codec_contain() {
        let engine = ImageEngine::new(&EngineConfig::default());
        let profile = profile(
            r#"{
                "prefix": "p",
                "keepOriginal": false,
                "codecs": ["jpeg"],
                "variants": { "t": { "w": 100, "h": 100, "fit": "contain" } }
            }"#,
        );
        let bytes = png_bytes(400, 200);
        let set =
            build_render_set(&engine, &bytes, &profile, "p/T/7/1", 1, &HashSet::new()).unwrap();

        assert_eq!(set.sha1, sha1_hex(&bytes));
        assert!(set.original.is_none());
        assert_eq!(set.uploads.len(), 1);
        assert_eq!(set.uploads[0].key, "p/T/7/1/t.jpg");
        assert_eq!(set.renditions.len(), 1);
        let rendition = &set.renditions[0];
        assert_eq!(rendition.format, ImageCodec::Jpeg);
        assert_eq!((rendition.width, rendition.height), (100, 50));
    }

    #[test]
    fn render_set_keep_original_adds_original_files() {
        let engine = ImageEngine::new(&EngineConfig::default());
        let profile = profile(
            r#"{
                "prefix": "p",
                "keepOriginal": true,
                "maxOriginalLongEdge": 100,
                "codecs": ["jpeg", "png"],
                "variants": { "t": { "w": 50, "h": 50, "fit": "cover" } }
            }"#,
        );
        let bytes = png_bytes(400, 200);
        let set =
            build_render_set(&engine, &bytes, &profile, "p/7/1", 1, &HashSet::new()).unwrap();

        let keys: Vec<&str> = set.uploads.iter().map(|u| u.key.as_str()).collect();
        assert!(keys.contains(&"p/7/1/original.jpg"));
        assert!(keys.contains(&"p/7/1/original.png"));
        assert!(keys.contains(&"p/7/1/t.jpg"));
        assert!(keys.contains(&"p/7/1/t.png"));

        let original = set.original.as_ref().unwrap();
        assert_eq!((original.width, original.height), (100, 50));
        assert!(original.keys.jpeg.is_some());
        assert!(original.keys.png.is_some());
        assert!(original.keys.webp.is_none());
    }

    #[test]
    fn render_set_skips_rows_for_existing_renditions() {
        let engine = ImageEngine::new(&EngineConfig::default());
        let profile = profile(
            r#"{
                "prefix": "p",
                "codecs": ["jpeg"],
                "variants": { "t": { "w": 10, "h": 10, "fit": "contain" } }
            }"#,
        );
        let mut existing = HashSet::new();
        existing.insert(("t".to_string(), ImageCodec::Jpeg));

        let set = build_render_set(&engine, &png_bytes(40, 20), &profile, "p/1/1", 1, &existing)
            .unwrap();
        // The object is still re-uploaded, but no duplicate row is queued.
        assert_eq!(set.uploads.len(), 1);
        assert!(set.renditions.is_empty());
    }
}
