//! Mizuchi Transfer Library
//!
//! Client core for S3-compatible object storage: multipart upload
//! orchestration and cursor-paginated listing.
//!
//! # Features
//!
//! - **Planned Uploads**: Part size and count chosen to fit the 10 000 part limit
//! - **Parallel Parts**: Bounded worker pool with a strictly sequential reader
//! - **Checksums**: CRC32C per part plus a whole-object aggregate
//! - **Clean Failure**: Every failed session is aborted before the error returns
//! - **Lazy Listings**: One page in flight, cancellable at any hand-off
//!
//! # Example
//!
//! ```no_run
//! use mizuchi_transfer::{Client, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let client = Client::from_config(&config)?;
//!     let file = tokio::fs::File::open("backup.tar").await?;
//!     let size = file.metadata().await?.len();
//!     let result = client
//!         .put_object("backups", "backup.tar", file, Some(size), &client.upload_defaults())
//!         .await?;
//!     println!("{} ({} parts)", result.etag, result.parts);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod list;
pub mod logging;
pub mod metrics;
pub mod s3;
pub mod upload;

// Re-export commonly used types
pub use client::Client;
pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
