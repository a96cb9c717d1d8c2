//! Mizuchi Transfer - S3 upload and listing CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use mizuchi_transfer::list::{Entry, ListObjectsOptions};
use mizuchi_transfer::{logging, Client, Config};
use std::path::PathBuf;
use tracing::info;

/// Mizuchi Transfer - multipart uploads and paginated listings against S3
#[derive(Parser, Debug)]
#[command(name = "mizuchi-transfer")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file, or stdin when FILE is "-"
    Put {
        bucket: String,
        key: String,
        file: PathBuf,
        /// Part size in bytes (0 picks the minimum)
        #[arg(long)]
        part_size: Option<u64>,
        /// Parallel part uploads
        #[arg(long)]
        threads: Option<usize>,
        /// Upload stdin parts concurrently
        #[arg(long)]
        parallel: bool,
        /// Send Content-MD5 instead of CRC32C
        #[arg(long)]
        md5: bool,
    },
    /// List objects
    Ls {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(short, long)]
        recursive: bool,
        /// Include every version and delete marker
        #[arg(long)]
        versions: bool,
        /// Force the v1 listing protocol
        #[arg(long)]
        v1: bool,
        #[arg(long)]
        max_keys: Option<u32>,
    },
    /// List incomplete multipart uploads
    Uploads {
        bucket: String,
        #[arg(long, default_value = "")]
        prefix: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// List the parts stored for an upload
    Parts {
        bucket: String,
        key: String,
        upload_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load configuration from {:?}", path))?,
        None => Config::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.to_lowercase();
    }
    if args.json {
        config.logging.json = true;
    }
    config.validate()?;

    logging::init_logging(&config.logging)?;
    info!("Starting Mizuchi Transfer v{}", mizuchi_transfer::VERSION);

    let client = Client::from_config(&config)?;

    match args.command {
        Command::Put {
            bucket,
            key,
            file,
            part_size,
            threads,
            parallel,
            md5,
        } => {
            let mut opts = client.upload_defaults();
            if let Some(part_size) = part_size {
                opts.part_size = part_size;
            }
            if let Some(threads) = threads {
                opts.num_threads = threads;
            }
            opts.concurrent_stream_parts |= parallel;
            opts.send_content_md5 |= md5;

            let result = if file.as_os_str() == "-" {
                client
                    .put_object(&bucket, &key, tokio::io::stdin(), None, &opts)
                    .await?
            } else {
                let source = tokio::fs::File::open(&file)
                    .await
                    .with_context(|| format!("cannot open {:?}", file))?;
                let size = source.metadata().await?.len();
                client
                    .put_object(&bucket, &key, source, Some(size), &opts)
                    .await?
            };

            println!(
                "{}\t{} bytes\t{} parts\t{}",
                result.etag,
                result.bytes_written,
                result.parts,
                result.strategy.as_str()
            );
        }
        Command::Ls {
            bucket,
            prefix,
            recursive,
            versions,
            v1,
            max_keys,
        } => {
            let defaults = client.listing_defaults();
            let opts = ListObjectsOptions {
                prefix,
                recursive,
                with_versions: versions,
                use_v1: v1 || defaults.use_v1,
                max_keys: max_keys.unwrap_or(defaults.max_keys),
                ..defaults
            };
            let mut listing = client.list_objects(&bucket, opts);
            while let Some(entry) = listing.recv().await {
                print_entry(&entry?);
            }
        }
        Command::Uploads {
            bucket,
            prefix,
            recursive,
        } => {
            let mut listing = client.list_incomplete_uploads(&bucket, &prefix, recursive);
            while let Some(entry) = listing.recv().await {
                print_entry(&entry?);
            }
        }
        Command::Parts {
            bucket,
            key,
            upload_id,
        } => {
            let parts = client.list_object_parts(&bucket, &key, &upload_id).await?;
            for part in parts.values() {
                println!("{}\t{}\t{}", part.part_number, part.size, part.etag);
            }
        }
    }

    Ok(())
}

fn print_entry(entry: &Entry) {
    match entry {
        Entry::Object(o) => {
            let modified = o.last_modified.map(|t| t.to_rfc3339()).unwrap_or_default();
            println!("{}\t{}\t{}", modified, o.size, o.key);
        }
        Entry::Version(v) => {
            let kind = if v.is_delete_marker { "DEL" } else { "PUT" };
            let latest = if v.is_latest { "latest" } else { "" };
            println!("{}\t{}\t{}\t{}\t{}", kind, v.version_id, v.size, v.key, latest);
        }
        Entry::Upload(u) => {
            let initiated = u.initiated.map(|t| t.to_rfc3339()).unwrap_or_default();
            println!("{}\t{}\t{}", initiated, u.upload_id, u.key);
        }
        Entry::Part(p) => println!("{}\t{}\t{}", p.part_number, p.size, p.etag),
        Entry::Prefix(prefix) => println!("PRE\t{}", prefix),
    }
}
