use clap::{Parser, Subcommand};
use glaciersync::{
    part_size_from_mib, split_ranges, tree_hash_file, ArchiveReceipt, ArchiveRecord,
    ArchiveStore, DryRunStore, LocalVault, UploadConfig, Uploader, DEFAULT_MAX_ATTEMPTS,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "glaciersync")]
#[command(about = "Upload files to an archival store in verified parts", long_about = None)]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a file or directory
    Upload {
        /// Path to file or directory to upload
        #[arg(short, long)]
        target: PathBuf,

        /// Directory of the local vault receiving the archives
        #[arg(long, required_unless_present = "dry_run")]
        vault: Option<PathBuf>,

        /// Log what would be uploaded without storing anything
        #[arg(long, conflicts_with = "vault")]
        dry_run: bool,

        /// Part size in MiB (power of two)
        #[arg(long, default_value_t = 1)]
        part_size_mib: u64,

        /// Maximum number of parts uploading at once
        #[arg(short, long, default_value_t = 4)]
        concurrency: usize,

        /// Attempts per part before giving up on it
        #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,

        /// Print receipts as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the tree hash of a file
    TreeHash {
        file: PathBuf,

        /// Leaf size in MiB
        #[arg(long, default_value_t = 1)]
        part_size_mib: u64,
    },

    /// Print the part ranges a file would be uploaded in
    Plan {
        file: PathBuf,

        /// Part size in MiB
        #[arg(long, default_value_t = 1)]
        part_size_mib: u64,
    },

    /// List the archives stored in a local vault
    List {
        /// Directory of the local vault
        #[arg(long)]
        vault: PathBuf,

        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print an inventory of a local vault as JSON
    Inventory {
        /// Directory of the local vault
        #[arg(long)]
        vault: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("glaciersync={}", log_level))
        .init();

    if let Err(e) = run(args.command).await {
        eprintln!("❌ Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Upload {
            target,
            vault,
            dry_run,
            part_size_mib,
            concurrency,
            max_attempts,
            json,
        } => {
            let config = UploadConfig {
                part_size: part_size_from_mib(part_size_mib)?,
                max_active: concurrency,
                max_attempts,
                ..UploadConfig::default()
            };
            match (vault, dry_run) {
                (Some(vault), _) => {
                    upload(config, Arc::new(LocalVault::new(vault)), &target, json).await
                }
                _ => upload(config, Arc::new(DryRunStore::new()), &target, json).await,
            }
        }
        Command::TreeHash {
            file,
            part_size_mib,
        } => {
            let digest = tree_hash_file(&file, part_size_from_mib(part_size_mib)?)?;
            println!("{}  {}", hex::encode(digest), file.display());
            Ok(())
        }
        Command::Plan {
            file,
            part_size_mib,
        } => plan(&file, part_size_from_mib(part_size_mib)?),
        Command::List { vault, json } => list(&LocalVault::new(vault), json).await,
        Command::Inventory { vault } => {
            let inventory = LocalVault::new(vault).inventory().await?;
            println!("{}", serde_json::to_string_pretty(&inventory)?);
            Ok(())
        }
    }
}

async fn upload<S: ArchiveStore>(
    config: UploadConfig,
    store: Arc<S>,
    target: &Path,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let uploader = Uploader::new(config, store);
    let config = uploader.config();
    info!("🚀 GlacierSync");
    info!("Target: {:?}", target);
    info!(
        "Part size: {} bytes, concurrency: {}, attempts: {}",
        config.part_size, config.max_active, config.max_attempts
    );

    let pb = indicatif::ProgressBar::new(0);
    pb.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}")?
            .progress_chars("█▓▒░ "),
    );

    let receipts = match uploader.upload_target(target, &pb).await {
        Ok(receipts) => receipts,
        Err(e) => {
            pb.abandon_with_message("❌ Upload failed!");
            return Err(e.into());
        }
    };
    pb.finish_with_message("✅ All files uploaded successfully!");

    if json {
        println!("{}", serde_json::to_string_pretty(&receipts)?);
    } else {
        for receipt in &receipts {
            print_receipt(receipt);
        }
    }
    Ok(())
}

fn print_receipt(receipt: &ArchiveReceipt) {
    println!("{}", receipt.path.display());
    println!("  archive id: {}", receipt.archive_id);
    println!("  upload id:  {}", receipt.upload_id);
    println!("  size:       {} bytes in {} part(s)", receipt.size, receipt.parts);
    println!("  tree hash:  {}", receipt.tree_hash);
    println!(
        "  elapsed:    {}",
        humantime::format_duration(std::time::Duration::from_millis(
            receipt.elapsed.as_millis() as u64
        ))
    );
}

async fn list(vault: &LocalVault, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let records = vault.list_archives().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!("{}: {} archive(s)", vault.root().display(), records.len());
    for record in &records {
        print_record(record);
    }
    Ok(())
}

fn print_record(record: &ArchiveRecord) {
    println!("{}", record.archive_id);
    println!("  description: {}", record.description);
    println!("  size:        {} bytes", record.size);
    println!("  tree hash:   {}", record.tree_hash);
    println!("  created:     {}", record.created_at);
}

fn plan(file: &Path, part_size: u64) -> Result<(), Box<dyn std::error::Error>> {
    if part_size == 0 {
        return Err("part size must be non-zero".into());
    }
    let size = std::fs::metadata(file)?.len();
    let ranges = split_ranges(part_size, size);
    println!(
        "{}: {} bytes in {} part(s) of {} bytes",
        file.display(),
        size,
        ranges.len(),
        part_size
    );
    for (index, (start, end)) in ranges.iter().enumerate() {
        println!("  #{:<5} bytes {}-{}/*", index, start, end - 1);
    }
    Ok(())
}
