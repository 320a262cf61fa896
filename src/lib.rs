//! Media asset ingestion and transcoding pipeline.
//!
//! Takes an uploaded image payload or a remote image URL, renders a
//! profile-defined family of resized renditions in multiple codecs,
//! persists them to S3-compatible storage with all-or-nothing semantics,
//! and records assets, renditions, and polymorphic owner links in
//! Postgres. Ingestion runs inline or through an AMQP-backed worker with
//! content-hash deduplication and bounded retry with dead-letter routing.

pub mod config;
pub mod db;
pub mod error;
pub mod profiles;
pub mod services;
