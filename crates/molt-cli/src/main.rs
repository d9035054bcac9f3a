#![forbid(unsafe_code)]
//! The `molt` binary: convert a FAT32 volume to ext4 in place.

use anyhow::{bail, Context, Result};
use clap::Parser;
use molt_convert::{convert, ConvertOptions, Report};
use molt_error::MoltError;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser)]
#[command(
    name = "molt",
    about = "moltfs — in-place FAT32 to ext4 conversion",
    after_help = "DANGER: the conversion rewrites the volume in place. A failure after the\n\
                  read phase leaves the filesystem corrupt. Keep a backup."
)]
struct Cli {
    /// Block device or image file holding a FAT32 filesystem.
    image: PathBuf,

    /// Owner uid for the converted files (defaults to the effective uid).
    #[arg(long)]
    owner_uid: Option<u32>,

    /// Owner gid for the converted files (defaults to the effective gid).
    #[arg(long)]
    owner_gid: Option<u32>,

    /// Print the conversion report as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("MOLT_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .downcast_ref::<MoltError>()
            .map_or(1, MoltError::exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.image)
        .with_context(|| format!("failed to open {}", cli.image.display()))?;

    let mut image = Vec::new();
    file.read_to_end(&mut image)
        .with_context(|| format!("failed to read {}", cli.image.display()))?;
    if image.len() < 512 {
        bail!("{} is too small to hold a FAT32 filesystem", cli.image.display());
    }

    let options = ConvertOptions {
        owner_uid: cli.owner_uid.unwrap_or_else(process_uid),
        owner_gid: cli.owner_gid.unwrap_or_else(process_gid),
        now: unix_now(),
        uuid: random_uuid(),
    };

    let report = convert(&mut image, &options)?;

    // Write back only after a fully successful conversion; an error that
    // struck before the destructive phase leaves the file untouched.
    file.seek(SeekFrom::Start(0)).context("seek for write-back")?;
    file.write_all(&image)
        .with_context(|| format!("failed to write {}", cli.image.display()))?;
    file.sync_all().context("sync")?;

    print_report(&report, cli.json)?;
    Ok(())
}

fn print_report(report: &Report, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serialize report")?
        );
    } else {
        println!("moltfs: conversion complete");
        println!("volume_name: {}", report.volume_name);
        println!(
            "geometry: {} blocks of {} bytes in {} group(s)",
            report.block_count, report.block_size, report.block_groups
        );
        println!(
            "tree: {} file(s), {} directorie(s)",
            report.files, report.directories
        );
        println!("relocated_clusters: {}", report.relocated_clusters);
        println!("archive_pages: {}", report.archive_pages);
        println!(
            "free: {} blocks, {} of {} inodes",
            report.free_blocks, report.free_inodes, report.inode_count
        );
    }
    Ok(())
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Random RFC 4122 v4 UUID bytes for `s_uuid`.
fn random_uuid() -> [u8; 16] {
    let mut uuid: [u8; 16] = rand::random();
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    uuid
}

/// Effective uid without unsafe code: `/proc/self` is owned by the
/// process's effective ids on Linux. Falls back to root elsewhere.
#[cfg(target_os = "linux")]
fn process_uid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map_or(0, |meta| meta.uid())
}

#[cfg(target_os = "linux")]
fn process_gid() -> u32 {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").map_or(0, |meta| meta.gid())
}

#[cfg(not(target_os = "linux"))]
fn process_uid() -> u32 {
    0
}

#[cfg(not(target_os = "linux"))]
fn process_gid() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_has_version_and_variant_bits() {
        for _ in 0..32 {
            let uuid = random_uuid();
            assert_eq!(uuid[6] >> 4, 4);
            assert_eq!(uuid[8] >> 6, 0b10);
        }
    }

    #[test]
    fn now_is_past_2023() {
        assert!(unix_now() > 1_672_531_200);
    }
}
