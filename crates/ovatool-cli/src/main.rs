//! ovatool CLI - create and inspect stream-optimized VMDK containers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ovatool_core::vmdk::{self, CreateOptions, FileSourceDisk, Reader, SourceDisk, Writer};

#[derive(Parser)]
#[command(name = "ovatool")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wrap a raw disk image into a new stream-optimized VMDK.
    Create {
        /// Path to the raw (flat) source disk image.
        source: PathBuf,

        /// Output VMDK path.
        output: PathBuf,

        /// Number of parallel copy workers. `1` disables the copy
        /// engine in favor of a single-threaded pass.
        #[arg(short, long, default_value_t = 4)]
        threads: usize,

        /// DEFLATE compression level, 0 (none) to 9 (best).
        #[arg(long, default_value_t = 6)]
        compression_level: u32,
    },

    /// Print header and geometry information about an existing
    /// stream-optimized VMDK.
    Info {
        /// Path to the VMDK file.
        vmdk_file: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create {
            source,
            output,
            threads,
            compression_level,
        } => create_disk(&source, &output, threads, compression_level),
        Commands::Info { vmdk_file } => show_info(&vmdk_file),
    }
}

fn create_disk(source: &std::path::Path, output: &std::path::Path, threads: usize, compression_level: u32) -> Result<()> {
    let source_disk = FileSourceDisk::open(source).with_context(|| format!("opening source disk {}", source.display()))?;
    let capacity = source_disk.capacity();

    let options = CreateOptions {
        compression_level,
        ..CreateOptions::default()
    };
    let mut writer = Writer::create(output, capacity, options).with_context(|| format!("creating {}", output.display()))?;

    let bar = ProgressBar::new(capacity);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let grain_bytes = writer.geometry().grain_size_bytes();
    let progress = |done_grains: u64, _total_grains: u64| {
        bar.set_position((done_grains * grain_bytes).min(capacity));
    };

    match vmdk::copy_disk(&mut writer, &source_disk, threads, Some(&progress)) {
        Ok(()) => {
            bar.finish_and_clear();
            writer.close().context("finalizing VMDK")?;
            println!("wrote {}", output.display());
            Ok(())
        }
        Err(e) => {
            bar.abandon();
            writer.abort();
            Err(e).context("copying source disk into VMDK")
        }
    }
}

fn show_info(vmdk_file: &std::path::Path) -> Result<()> {
    let reader = Reader::open(vmdk_file).with_context(|| format!("opening {}", vmdk_file.display()))?;
    let geometry = reader.geometry();

    println!("path:            {}", vmdk_file.display());
    println!("capacity:        {} bytes", reader.capacity());
    println!("grain size:      {} bytes", geometry.grain_size_bytes());
    println!("total grains:    {}", geometry.total_grains);
    println!("grain tables:    {}", geometry.num_gts);

    Ok(())
}
