//! Human-readable rendering of [`CoordinatorStats`].
//!
//! Used by `dix stats` and `dix status` to give a quick picture of what is
//! indexed, how the cache is doing, and whether any circuit is open.

use crate::coordinator::CoordinatorStats;
use crate::file_manager::format_bytes;
use crate::models::VectorIndex;
use crate::query_engine::IndexStatus;

/// Print the full stats overview to stdout.
pub fn print_stats(stats: &CoordinatorStats) {
    println!("docindex stats");
    println!("==============");
    println!();
    println!("  Storage root: {}", stats.storage.root.display());
    println!(
        "  Accessible:   {}",
        if stats.storage.accessible { "yes" } else { "NO" }
    );
    println!("  On disk:      {}", format_bytes(stats.storage.total_bytes));
    println!();
    println!("  Documents:    {}", stats.documents);
    println!(
        "  Indexes:      {} registered, {} directories",
        stats.indexes, stats.storage.index_count
    );

    let b = &stats.builder;
    println!();
    println!("  Builds:       {} ok, {} failed", b.builds, b.failures);
    println!("  Chunks:       {}", b.chunks_indexed);
    if let Some(ms) = b.last_build_ms {
        println!("  Last build:   {} ms", ms);
    }

    let q = &stats.query;
    let lookups = q.cache_hits + q.cache_misses;
    println!();
    println!(
        "  Cache:        {} / {} loaded, {}% hit rate",
        q.loaded_documents.len(),
        q.capacity,
        if lookups > 0 {
            (q.cache_hits * 100) / lookups
        } else {
            0
        }
    );
    println!(
        "  Loads:        {} ok, {} failed, {} evicted",
        q.loads, q.load_failures, q.evictions
    );
    println!(
        "  Queries:      {} ok, {} failed",
        q.queries, q.query_failures
    );

    let r = &stats.recovery;
    println!();
    println!(
        "  Recovery:     {} runs ({} verified, {} reconciled, {} repaired, {} rebuilt, {} failed)",
        r.recoveries,
        r.verifications,
        r.reconciliations,
        r.partial_repairs,
        r.rebuilds,
        r.failures
    );
    println!("  Orphans:      {} removed", r.orphans_removed);

    let rt = &stats.retry;
    println!(
        "  Retry:        {} calls, {} attempts, {} exhausted",
        rt.calls, rt.attempts, rt.exhausted
    );

    if !stats.breakers.is_empty() {
        println!();
        println!(
            "  {:<10} {:<10} {:>8} {:>6} {:>9}   {}",
            "CIRCUIT", "STATE", "FAILURES", "TRIPS", "REJECTED", "LAST FAILURE"
        );
        println!("  {}", "-".repeat(64));
        for s in &stats.breakers {
            let last = match s.last_failure_secs_ago {
                Some(secs) => format_ts_relative(stats.generated_at - secs as i64),
                None => "never".to_string(),
            };
            println!(
                "  {:<10} {:<10} {:>8} {:>6} {:>9}   {}",
                s.name,
                s.state.as_str(),
                s.failure_count,
                s.trips,
                s.rejected,
                last
            );
        }
    }

    println!();
}

/// Print one row per registered index.
pub fn print_index_table(indexes: &[VectorIndex]) {
    if indexes.is_empty() {
        println!("No indexes built yet.");
        return;
    }
    println!(
        "  {:>6} {:>7}   {:<16} {:<20}   {}",
        "DOC", "CHUNKS", "HASH", "BUILT", "PATH"
    );
    println!("  {}", "-".repeat(90));
    for idx in indexes {
        println!(
            "  {:>6} {:>7}   {:<16} {:<20}   {}",
            idx.document_id,
            idx.chunk_count,
            short_hash(&idx.index_hash),
            format_ts_relative(idx.created_at),
            idx.index_path.display()
        );
    }
}

pub fn print_index_status(status: &IndexStatus) {
    println!("Document {}", status.document_id);
    if !status.exists {
        println!("  No index built.");
        return;
    }
    if let Some(path) = &status.index_path {
        println!("  Path:     {}", path.display());
    }
    println!("  Chunks:   {}", status.chunk_count);
    if let Some(ts) = status.created_at {
        println!("  Built:    {} ({})", format_ts_iso(ts), format_ts_relative(ts));
    }
    println!(
        "  Verified: {}",
        if status.verified { "yes" } else { "no" }
    );
    println!("  Loaded:   {}", if status.loaded { "yes" } else { "no" });
}

fn short_hash(hash: &str) -> &str {
    hash.get(..16).unwrap_or(hash)
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
