use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::cache::{CacheStore, EntryInfo};
use crate::cli::config::{Config, Overrides};
use crate::cli::{CacheDeleteArgs, CachePruneArgs};
use crate::key::SessionKey;

/// Ten years; anything larger prunes nothing anyway.
const MAX_AGE_HOURS: u64 = 24 * 365 * 10;

fn describe_key(key: &SessionKey) -> String {
    let drivers = key
        .drivers()
        .map(|d| d.iter().collect::<Vec<_>>().join(","))
        .unwrap_or_else(|| "all".to_string());
    format!(
        "{} round {:>2}  skip {:>3}  drivers {}",
        key.season(),
        key.round(),
        key.frame_skip(),
        drivers
    )
}

fn open_store(mut config: Config, cache_dir: Option<std::path::PathBuf>) -> impl CacheStore {
    config.apply(Overrides {
        cache_dir,
        ..Default::default()
    });
    let root = config.storage_root();
    eprintln!("Cache root: {}", root.display());
    config.cache_store(&root)
}

pub async fn execute_cache_list(
    config: Config,
    cache_dir: Option<std::path::PathBuf>,
) -> Result<()> {
    let store = open_store(config, cache_dir);
    let entries = store.list_entries().await?;
    if entries.is_empty() {
        eprintln!("No cached artifacts.");
        return Ok(());
    }

    let mut total = 0u64;
    for entry in &entries {
        total += entry.size;
        println!(
            "{}  {:>10} bytes  {}",
            describe_key(&entry.key),
            entry.size,
            entry.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    eprintln!("\n{} artifacts, {} bytes", entries.len(), total);
    Ok(())
}

pub async fn execute_cache_delete(
    config: Config,
    cache_dir: Option<std::path::PathBuf>,
    args: CacheDeleteArgs,
) -> Result<()> {
    let store = open_store(config, cache_dir);
    let mut deleted = 0;
    for entry in store.list_entries().await? {
        let key = &entry.key;
        let matches = key.season() == args.season
            && key.round() == args.round
            && args.frame_skip.map_or(true, |n| key.frame_skip() == n);
        if matches && store.delete(key).await? {
            println!("Deleted {}", describe_key(key));
            deleted += 1;
        }
    }

    if deleted == 0 {
        eprintln!("Nothing cached for {} round {}", args.season, args.round);
    }
    Ok(())
}

/// Deletes (or with `dry_run`, only reports) entries written before `cutoff`.
pub async fn prune_older_than(
    store: &dyn CacheStore,
    cutoff: DateTime<Utc>,
    dry_run: bool,
) -> Result<Vec<EntryInfo>> {
    let mut pruned = Vec::new();
    for entry in store.list_entries().await? {
        if entry.created_at >= cutoff {
            continue;
        }
        if dry_run || store.delete(&entry.key).await? {
            pruned.push(entry);
        }
    }
    Ok(pruned)
}

pub async fn execute_cache_prune(
    config: Config,
    cache_dir: Option<std::path::PathBuf>,
    args: CachePruneArgs,
) -> Result<()> {
    let store = open_store(config, cache_dir);
    let hours = args.older_than_hours.min(MAX_AGE_HOURS) as i64;
    let cutoff = Utc::now() - Duration::hours(hours);

    let pruned = prune_older_than(&store, cutoff, args.dry_run).await?;
    let verb = if args.dry_run { "Would delete" } else { "Deleted" };
    for entry in &pruned {
        println!("{} {}", verb, describe_key(&entry.key));
    }
    eprintln!(
        "{} {} artifacts older than {}h",
        verb,
        pruned.len(),
        args.older_than_hours
    );
    Ok(())
}
