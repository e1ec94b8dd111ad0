//! Iamages Lock - CLI
//!
//! Local operations over the filesystem blob store and SQLite record store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

use iamages_lock::lifecycle::{derived_key_pair, passphrase_pair};
use iamages_lock::store::{FsBlobStore, SqliteRecordStore};
use iamages_lock::thumbnail::{ResizeCodec, ThumbnailQueue};
use iamages_lock::{
    Caller, CoreConfig, CryptoContext, ImageCodec, ImageId, KeyPair, LockService, Stores,
    ThumbnailResponse, ThumbnailService, ThumbnailWorker, UnlockKey, Upload,
};

#[derive(Parser)]
#[command(name = "iamages-lock")]
#[command(version = iamages_lock::VERSION)]
#[command(about = "Iamages at-rest protection - lock, unlock and rekey stored images")]
struct Cli {
    /// JSON config file (IAMAGES_* environment variables override it)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Act as this user; anonymous when omitted
    #[arg(short, long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload an image
    Upload {
        path: PathBuf,

        #[arg(short, long)]
        description: String,

        /// Declared MIME type; detected from the file when omitted
        #[arg(long)]
        content_type: Option<String>,

        #[arg(long)]
        private: bool,

        /// Lock on upload with this passphrase
        #[arg(long)]
        lock: Option<String>,
    },

    /// Show an image record
    Info { id: ImageId },

    /// Lock an unlocked image
    Lock {
        id: ImageId,

        #[arg(short, long)]
        passphrase: String,

        /// Separate passphrase for the file content
        #[arg(long)]
        file_passphrase: Option<String>,
    },

    /// Unlock a locked image
    Unlock {
        id: ImageId,

        #[command(flatten)]
        keys: KeyArgs,
    },

    /// Replace the passphrase of a locked image
    Rekey {
        id: ImageId,

        #[command(flatten)]
        keys: KeyArgs,

        #[arg(long)]
        new_passphrase: String,
    },

    /// Change the description
    Describe {
        id: ImageId,
        description: String,

        /// Required when the image is locked
        #[arg(short, long)]
        passphrase: Option<String>,
    },

    /// Fetch (generating if needed) the thumbnail
    Thumbnail {
        id: ImageId,
        output: PathBuf,
    },

    /// Write the stored file bytes
    Download {
        id: ImageId,
        output: PathBuf,
    },

    /// Delete an image
    Delete {
        id: ImageId,

        /// Capability issued for an anonymous upload
        #[arg(long)]
        ownerless_key: Option<String>,
    },
}

/// Passphrase, or a pair of client-derived base64 keys
#[derive(clap::Args)]
struct KeyArgs {
    #[arg(short, long, conflicts_with_all = ["metadata_key", "file_key"])]
    passphrase: Option<String>,

    #[arg(long, requires = "file_key")]
    metadata_key: Option<String>,

    #[arg(long, requires = "metadata_key")]
    file_key: Option<String>,
}

impl KeyArgs {
    fn key_pair(&self) -> anyhow::Result<KeyPair> {
        match (&self.passphrase, &self.metadata_key, &self.file_key) {
            (Some(passphrase), _, _) => Ok(passphrase_pair(passphrase)),
            (None, Some(meta), Some(file)) => Ok(derived_key_pair(meta, file)?),
            _ => bail!("give --passphrase or both --metadata-key and --file-key"),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CoreConfig::from_env(cli.config.as_deref()).context("loading config")?;
    let stores = Stores {
        images: Arc::new(FsBlobStore::open(&config.blobs_dir())?),
        thumbnails: Arc::new(FsBlobStore::open(&config.thumbnails_dir())?),
        records: Arc::new(SqliteRecordStore::open(&config.database_path())?),
    };
    let caller = match cli.user {
        Some(name) => Caller::User(name),
        None => Caller::Anonymous,
    };
    let bound = config.thumbnail_bound;
    let service = LockService::new(CryptoContext::default(), config, stores.clone());

    match cli.command {
        Commands::Upload {
            path,
            description,
            content_type,
            private,
            lock,
        } => {
            let bytes =
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            let content_type = match content_type {
                Some(ct) => ct,
                None => ResizeCodec.probe(&bytes)?.content_type,
            };

            let uploaded = service.upload(
                &caller,
                Upload {
                    bytes,
                    content_type,
                    description,
                    is_private: private,
                    lock: lock.map(SecretString::from),
                },
            )?;

            println!("{}", uploaded.image.id);
            if let Some(key) = uploaded.ownerless_key {
                println!("ownerless key: {key}");
                println!("keep it: it is the only way to delete this image");
            }
        }

        Commands::Info { id } => {
            let view = service.record(&id, &caller)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }

        Commands::Lock {
            id,
            passphrase,
            file_passphrase,
        } => {
            let file_passphrase = file_passphrase.unwrap_or_else(|| passphrase.clone());
            let record = service.lock(
                &id,
                &caller,
                &SecretString::from(passphrase),
                &SecretString::from(file_passphrase),
            )?;
            println!("locked {} (version {:?})", record.id, record.lock.version());
        }

        Commands::Unlock { id, keys } => {
            let record = service.unlock(&id, &caller, &keys.key_pair()?)?;
            println!("unlocked {} ({})", record.id, record.content_type);
        }

        Commands::Rekey {
            id,
            keys,
            new_passphrase,
        } => {
            let record = service.rekey(
                &id,
                &caller,
                &keys.key_pair()?,
                &SecretString::from(new_passphrase),
            )?;
            println!("rekeyed {} (version {:?})", record.id, record.lock.version());
        }

        Commands::Describe {
            id,
            description,
            passphrase,
        } => {
            let key = passphrase.as_deref().map(UnlockKey::passphrase);
            service.set_description(&id, &caller, &description, key.as_ref())?;
            println!("updated {id}");
        }

        Commands::Thumbnail { id, output } => {
            let (queue, jobs) = ThumbnailQueue::channel();
            let thumbnails = Arc::new(ThumbnailService::new(stores, bound, queue));
            let mut worker = ThumbnailWorker::new(Arc::clone(&thumbnails), jobs);

            let mut response = thumbnails.get_thumbnail(&id, &caller)?;
            if response == ThumbnailResponse::Original && worker.run_pending() > 0 {
                response = thumbnails.get_thumbnail(&id, &caller)?;
            }

            match response {
                ThumbnailResponse::Thumbnail(blob) => {
                    std::fs::write(&output, &blob.bytes)?;
                    println!("wrote thumbnail to {}", output.display());
                }
                ThumbnailResponse::Original => {
                    let blob = service.download(&id, &caller)?;
                    std::fs::write(&output, &blob.bytes)?;
                    println!("no thumbnail; wrote original to {}", output.display());
                }
                ThumbnailResponse::Unavailable => bail!("image {id} is locked"),
            }
        }

        Commands::Download { id, output } => {
            let blob = service.download(&id, &caller)?;
            std::fs::write(&output, &blob.bytes)?;
            println!("wrote {} bytes to {}", blob.bytes.len(), output.display());
            for (key, value) in blob.metadata.iter() {
                println!("  {key}: {value}");
            }
        }

        Commands::Delete { id, ownerless_key } => {
            service.delete(&id, &caller, ownerless_key.as_deref())?;
            println!("deleted {id}");
        }
    }

    Ok(())
}
