//! Statistics report (`--stats`)
//!
//! Reads the metadata store and content cache for a mount without mounting
//! it, and prints the aggregate view: status counts, cache usage, upload
//! queue state, database size, cursor presence, the offline flag, and the
//! directory/extension/size/age histograms.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use chrono::Utc;

use onemount_core::config::Config;
use onemount_core::domain::{FileStatus, Inode, ItemId};
use onemount_cache::ContentCache;
use onemount_store::MetadataStore;

/// Size histogram bucket boundaries (bytes).
const SIZE_BUCKETS: &[(u64, &str)] = &[
    (4 * 1024, "<= 4 KiB"),
    (64 * 1024, "<= 64 KiB"),
    (1024 * 1024, "<= 1 MiB"),
    (10 * 1024 * 1024, "<= 10 MiB"),
    (100 * 1024 * 1024, "<= 100 MiB"),
    (u64::MAX, "> 100 MiB"),
];

/// Age histogram bucket boundaries (days).
const AGE_BUCKETS: &[(i64, &str)] = &[
    (1, "<= 1 day"),
    (7, "<= 1 week"),
    (30, "<= 30 days"),
    (365, "<= 1 year"),
    (i64::MAX, "> 1 year"),
];

/// Prints the full statistics report for a mountpoint's cache.
pub async fn print_stats(config: &Config, mountpoint: &Path) -> anyhow::Result<()> {
    let db_path = config.database_path(mountpoint);
    if !db_path.exists() {
        anyhow::bail!(
            "no metadata database at {} (was this mountpoint ever mounted?)",
            db_path.display()
        );
    }
    let store = MetadataStore::open(&db_path)
        .await
        .context("opening metadata store")?;
    let cache = ContentCache::new(&config.mount_cache_dir(mountpoint))
        .context("opening content cache")?;

    let inodes = store.iter_inodes().await?;

    println!("onemount statistics for {}", mountpoint.display());
    println!();

    // --- status counts ---
    println!("items by status:");
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for status in FileStatus::all() {
        counts.insert(status.to_string(), 0);
    }
    for inode in &inodes {
        *counts.entry(inode.status.to_string()).or_insert(0) += 1;
    }
    for (status, count) in &counts {
        println!("  {status:<16} {count}");
    }
    println!("  total items: {}", inodes.len());
    println!();

    // --- cache ---
    let (cache_bytes, cache_files) = cache.usage();
    println!("content cache: {cache_files} files, {cache_bytes} bytes");

    // --- uploads ---
    let sessions = store.iter_uploads().await?;
    let mut by_state: BTreeMap<String, u64> = BTreeMap::new();
    let mut by_queue: BTreeMap<String, u64> = BTreeMap::new();
    for session in &sessions {
        *by_state
            .entry(format!("{:?}", session.state).to_lowercase())
            .or_insert(0) += 1;
        *by_queue
            .entry(format!("{:?}", session.priority).to_lowercase())
            .or_insert(0) += 1;
    }
    println!("upload sessions: {}", sessions.len());
    for (state, count) in &by_state {
        println!("  state {state:<18} {count}");
    }
    for (queue, count) in &by_queue {
        println!("  queue {queue:<18} {count}");
    }
    for session in &sessions {
        if session.retry_count > 0 || session.error.is_some() {
            println!(
                "  {} retries={} offset={} error={}",
                session.id,
                session.retry_count,
                session.next_offset,
                session.error.as_deref().unwrap_or("-")
            );
        }
    }
    println!();

    // --- database ---
    let (pages, page_size) = store.page_info().await?;
    let db_bytes = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);
    println!("database: {db_bytes} bytes on disk, {pages} pages x {page_size} bytes");
    println!(
        "delta cursor: {}",
        if store.get_cursor().await?.is_some() {
            "present"
        } else {
            "absent (initial sync pending)"
        }
    );
    let offline = matches!(
        store.get_config("offline").await?.as_deref(),
        Some(b"1")
    );
    println!("offline: {offline}");
    println!(
        "pending journal entries: {}",
        store.journal_len().await?
    );
    println!();

    // --- directories ---
    let dir_stats = directory_stats(&inodes);
    println!(
        "directories: {} total, max depth {}, {} empty",
        dir_stats.count, dir_stats.max_depth, dir_stats.empty
    );
    println!();

    // --- extensions ---
    println!("file extensions:");
    let mut extensions: Vec<(String, u64)> = extension_histogram(&inodes).into_iter().collect();
    extensions.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (ext, count) in extensions.iter().take(15) {
        println!("  {ext:<12} {count}");
    }
    println!();

    // --- sizes and ages ---
    println!("file sizes:");
    for (label, count) in size_histogram(&inodes) {
        println!("  {label:<12} {count}");
    }
    println!();
    println!("file ages:");
    for (label, count) in age_histogram(&inodes) {
        println!("  {label:<12} {count}");
    }

    Ok(())
}

struct DirStats {
    count: u64,
    max_depth: u64,
    empty: u64,
}

fn directory_stats(inodes: &[Inode]) -> DirStats {
    let by_id: HashMap<&str, &Inode> = inodes
        .iter()
        .map(|inode| (inode.id().as_str(), inode))
        .collect();

    let mut count = 0u64;
    let mut max_depth = 0u64;
    let mut empty = 0u64;

    for inode in inodes {
        if !inode.is_dir() {
            continue;
        }
        count += 1;
        if inode.children.is_empty() {
            empty += 1;
        }
        max_depth = max_depth.max(depth_of(inode, &by_id));
    }

    DirStats {
        count,
        max_depth,
        empty,
    }
}

fn depth_of(inode: &Inode, by_id: &HashMap<&str, &Inode>) -> u64 {
    let mut depth = 0u64;
    let mut current: Option<ItemId> = inode.parent_id().cloned();
    while let Some(parent) = current {
        if parent.is_root() || depth > 256 {
            break;
        }
        depth += 1;
        current = by_id
            .get(parent.as_str())
            .and_then(|p| p.parent_id().cloned());
    }
    depth + 1
}

fn extension_histogram(inodes: &[Inode]) -> HashMap<String, u64> {
    let mut histogram = HashMap::new();
    for inode in inodes {
        if inode.is_dir() {
            continue;
        }
        let ext = match inode.name().rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => ext.to_lowercase(),
            _ => "(none)".to_string(),
        };
        *histogram.entry(ext).or_insert(0) += 1;
    }
    histogram
}

fn size_histogram(inodes: &[Inode]) -> Vec<(&'static str, u64)> {
    let mut buckets: Vec<(&'static str, u64)> =
        SIZE_BUCKETS.iter().map(|(_, label)| (*label, 0)).collect();
    for inode in inodes {
        if inode.is_dir() {
            continue;
        }
        for (i, (bound, _)) in SIZE_BUCKETS.iter().enumerate() {
            if inode.item.size <= *bound {
                buckets[i].1 += 1;
                break;
            }
        }
    }
    buckets
}

fn age_histogram(inodes: &[Inode]) -> Vec<(&'static str, u64)> {
    let mut buckets: Vec<(&'static str, u64)> =
        AGE_BUCKETS.iter().map(|(_, label)| (*label, 0)).collect();
    let now = Utc::now();
    for inode in inodes {
        if inode.is_dir() {
            continue;
        }
        let age_days = inode
            .item
            .last_modified_date_time
            .map(|t| (now - t).num_days())
            .unwrap_or(0);
        for (i, (bound, _)) in AGE_BUCKETS.iter().enumerate() {
            if age_days <= *bound {
                buckets[i].1 += 1;
                break;
            }
        }
    }
    buckets
}
