//! Persistence for assets, renditions, and owner links.
//!
//! Every query takes an executor so the caller picks the transactional
//! scope: pass the pool for auto-commit reads, or a live transaction for
//! the ingestion flows.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};

use crate::db::models::{
    AssetStatus, ImageCodec, MediaAsset, MediaOwnerLink, MediaVariant, Owner, SourceKind,
};
use crate::error::Result;

#[derive(Clone)]
pub struct AssetStore {
    pool: PgPool,
}

/// Asset row as inserted at ingestion time.
#[derive(Debug)]
pub struct NewAsset<'a> {
    pub profile: &'a str,
    pub source: SourceKind,
    pub source_url: Option<&'a str>,
    pub status: AssetStatus,
}

/// Rendition row captured during the render/upload pipeline.
#[derive(Debug)]
pub struct NewVariant {
    pub asset_id: i64,
    pub variant: String,
    pub format: ImageCodec,
    pub object_key: String,
    pub width: i32,
    pub height: i32,
    pub byte_size: i64,
}

/// Original keys written once a render succeeds.
#[derive(Debug, Default)]
pub struct OriginalKeys {
    pub jpeg: Option<String>,
    pub webp: Option<String>,
    pub avif: Option<String>,
    pub png: Option<String>,
}

impl AssetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn insert_asset<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        new: NewAsset<'_>,
    ) -> Result<MediaAsset> {
        let asset = sqlx::query_as::<_, MediaAsset>(
            r#"
            INSERT INTO media_asset (profile, source, source_url, status)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(new.profile)
        .bind(new.source)
        .bind(new.source_url)
        .bind(new.status)
        .fetch_one(exec)
        .await?;
        Ok(asset)
    }

    pub async fn find_asset<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        id: i64,
    ) -> Result<Option<MediaAsset>> {
        let asset = sqlx::query_as::<_, MediaAsset>("SELECT * FROM media_asset WHERE id = $1")
            .bind(id)
            .fetch_optional(exec)
            .await?;
        Ok(asset)
    }

    /// The optimistic claim. Exactly one concurrent caller observes `true`
    /// for a QUEUED or FAILED row; everyone else sees `false`.
    pub async fn claim<'e>(&self, exec: impl PgExecutor<'e>, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_asset
               SET status = 'processing', updated_at = now()
             WHERE id = $1 AND status IN ('queued', 'failed')
            "#,
        )
        .bind(id)
        .execute(exec)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_ready<'e>(&self, exec: impl PgExecutor<'e>, id: i64) -> Result<()> {
        sqlx::query("UPDATE media_asset SET status = 'ready', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(exec)
            .await?;
        Ok(())
    }

    /// Increments the attempt counter and records the error. Returns the
    /// counter after the increment.
    pub async fn mark_failed<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        id: i64,
        error: &str,
    ) -> Result<i32> {
        let attempts: i32 = sqlx::query_scalar(
            r#"
            UPDATE media_asset
               SET status = 'failed', attempts = attempts + 1,
                   last_error = $2, updated_at = now()
             WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_one(exec)
        .await?;
        Ok(attempts)
    }

    /// Stamps the post-render metadata: original keys and dimensions when
    /// the profile keeps an original, the checksum always.
    pub async fn set_rendered<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        id: i64,
        original: Option<(&OriginalKeys, i32, i32)>,
        checksum_sha1: &str,
    ) -> Result<()> {
        match original {
            Some((keys, width, height)) => {
                sqlx::query(
                    r#"
                    UPDATE media_asset
                       SET original_jpeg_key = $2, original_webp_key = $3,
                           original_avif_key = $4, original_png_key = $5,
                           original_width = $6, original_height = $7,
                           checksum_sha1 = $8, updated_at = now()
                     WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(keys.jpeg.as_deref())
                .bind(keys.webp.as_deref())
                .bind(keys.avif.as_deref())
                .bind(keys.png.as_deref())
                .bind(width)
                .bind(height)
                .bind(checksum_sha1)
                .execute(exec)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE media_asset SET checksum_sha1 = $2, updated_at = now() WHERE id = $1",
                )
                .bind(id)
                .bind(checksum_sha1)
                .execute(exec)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn delete_asset<'e>(&self, exec: impl PgExecutor<'e>, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM media_asset WHERE id = $1")
            .bind(id)
            .execute(exec)
            .await?;
        Ok(())
    }

    pub async fn find_ready_by_checksum<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        sha1: &str,
    ) -> Result<Option<MediaAsset>> {
        let asset = sqlx::query_as::<_, MediaAsset>(
            "SELECT * FROM media_asset WHERE checksum_sha1 = $1 AND status = 'ready' LIMIT 1",
        )
        .bind(sha1)
        .fetch_optional(exec)
        .await?;
        Ok(asset)
    }

    pub async fn find_failed_older_than<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MediaAsset>> {
        let assets = sqlx::query_as::<_, MediaAsset>(
            "SELECT * FROM media_asset WHERE status = 'failed' AND updated_at < $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(exec)
        .await?;
        Ok(assets)
    }

    pub async fn insert_variant<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        new: &NewVariant,
    ) -> Result<MediaVariant> {
        let variant = sqlx::query_as::<_, MediaVariant>(
            r#"
            INSERT INTO media_variant
                (asset_id, variant, format, object_key, width, height, byte_size)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(new.asset_id)
        .bind(&new.variant)
        .bind(new.format)
        .bind(&new.object_key)
        .bind(new.width)
        .bind(new.height)
        .bind(new.byte_size)
        .fetch_one(exec)
        .await?;
        Ok(variant)
    }

    pub async fn list_variants<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        asset_id: i64,
    ) -> Result<Vec<MediaVariant>> {
        let variants = sqlx::query_as::<_, MediaVariant>(
            "SELECT * FROM media_variant WHERE asset_id = $1 ORDER BY id",
        )
        .bind(asset_id)
        .fetch_all(exec)
        .await?;
        Ok(variants)
    }

    pub async fn count_variants<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        asset_id: i64,
    ) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM media_variant WHERE asset_id = $1")
                .bind(asset_id)
                .fetch_one(exec)
                .await?;
        Ok(count)
    }

    pub async fn insert_owner_link<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        asset_id: i64,
        owner: &Owner,
    ) -> Result<MediaOwnerLink> {
        let link = sqlx::query_as::<_, MediaOwnerLink>(
            r#"
            INSERT INTO media_owner_link (owner_type, owner_id, asset_id, role, sort)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&owner.owner_type)
        .bind(owner.owner_id)
        .bind(asset_id)
        .bind(&owner.role)
        .bind(owner.sort)
        .fetch_one(exec)
        .await?;
        Ok(link)
    }

    /// First link by insertion order; async local uploads use it to rebuild
    /// the object-key prefix.
    pub async fn first_owner_link<'e>(
        &self,
        exec: impl PgExecutor<'e>,
        asset_id: i64,
    ) -> Result<Option<MediaOwnerLink>> {
        let link = sqlx::query_as::<_, MediaOwnerLink>(
            "SELECT * FROM media_owner_link WHERE asset_id = $1 ORDER BY id LIMIT 1",
        )
        .bind(asset_id)
        .fetch_optional(exec)
        .await?;
        Ok(link)
    }
}
