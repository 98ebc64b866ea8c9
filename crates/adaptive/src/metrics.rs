use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Counters of one playback session.
///
/// All counters use relaxed atomics; they are read for reporting only.
#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    // Transfer metrics
    /// Completed media chunk transfers (init, index and segment chunks)
    pub transfers_total: AtomicU64,
    pub transfer_bytes_total: AtomicU64,
    /// Sum of transfer durations in milliseconds
    pub transfer_time_sum_ms: AtomicU64,
    /// Sum of time-to-first-byte in milliseconds
    pub latency_sum_ms: AtomicU64,
    pub transfer_errors: AtomicU64,
    pub transfers_cancelled: AtomicU64,
    /// Segments skipped after a 404
    pub segments_not_found: AtomicU64,

    // Playlist metrics
    pub playlist_updates: AtomicU64,
    pub playlist_update_failures: AtomicU64,

    // Key and decryption metrics
    pub key_fetches: AtomicU64,
    pub key_cache_hits: AtomicU64,
    pub decryptions_total: AtomicU64,
    pub decryption_bytes_total: AtomicU64,
    pub decryption_time_sum_ms: AtomicU64,

    // Adaptation metrics
    pub representation_switches: AtomicU64,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Transfer metrics recording ---

    pub fn record_transfer(&self, bytes: u64, elapsed_ms: u64, latency_ms: u64) {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
        self.transfer_bytes_total
            .fetch_add(bytes, Ordering::Relaxed);
        self.transfer_time_sum_ms
            .fetch_add(elapsed_ms, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    pub fn record_transfer_error(&self) {
        self.transfer_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.transfers_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_not_found(&self) {
        self.segments_not_found.fetch_add(1, Ordering::Relaxed);
    }

    // --- Playlist metrics recording ---

    pub fn record_playlist_update(&self, success: bool) {
        if success {
            self.playlist_updates.fetch_add(1, Ordering::Relaxed);
        } else {
            self.playlist_update_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    // --- Key metrics recording ---

    pub fn record_key_fetch(&self) {
        self.key_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_key_cache_hit(&self) {
        self.key_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decryption(&self, bytes: u64, duration_ms: u64) {
        self.decryptions_total.fetch_add(1, Ordering::Relaxed);
        self.decryption_bytes_total
            .fetch_add(bytes, Ordering::Relaxed);
        self.decryption_time_sum_ms
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    // --- Adaptation metrics recording ---

    pub fn record_switch(&self) {
        self.representation_switches
            .fetch_add(1, Ordering::Relaxed);
    }

    // --- Helper methods for computed metrics ---

    /// Average time-to-first-byte, `None` before the first transfer.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let total = self.transfers_total.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        let sum = self.latency_sum_ms.load(Ordering::Relaxed);
        Some(sum as f64 / total as f64)
    }

    /// Average throughput in bytes per second
    pub fn average_throughput(&self) -> Option<f64> {
        let total_bytes = self.transfer_bytes_total.load(Ordering::Relaxed);
        let total_ms = self.transfer_time_sum_ms.load(Ordering::Relaxed);

        if total_ms == 0 {
            return None;
        }

        Some(total_bytes as f64 / (total_ms as f64 / 1000.0))
    }

    /// Share of key lookups served from the keyring (0.0 to 1.0)
    pub fn key_cache_hit_rate(&self) -> f64 {
        let hits = self.key_cache_hits.load(Ordering::Relaxed);
        let total = hits + self.key_fetches.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn log_summary(&self) {
        let snapshot = self.snapshot();

        let avg_latency = self
            .average_latency_ms()
            .map(|l| format!("{:.2}ms", l))
            .unwrap_or_else(|| "N/A".to_string());

        let avg_throughput = self
            .average_throughput()
            .map(format_bytes_per_sec)
            .unwrap_or_else(|| "N/A".to_string());

        info!(
            transfers = snapshot.transfers_total,
            transfer_bytes = snapshot.transfer_bytes_total,
            transfer_errors = snapshot.transfer_errors,
            cancelled = snapshot.transfers_cancelled,
            not_found = snapshot.segments_not_found,
            avg_latency = %avg_latency,
            avg_throughput = %avg_throughput,
            playlist_updates = snapshot.playlist_updates,
            playlist_update_failures = snapshot.playlist_update_failures,
            key_fetches = snapshot.key_fetches,
            key_cache_hit_rate = format!("{:.1}%", self.key_cache_hit_rate() * 100.0),
            decryptions = snapshot.decryptions_total,
            decryption_bytes = snapshot.decryption_bytes_total,
            switches = snapshot.representation_switches,
            "Adaptive session summary"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfer_bytes_total: self.transfer_bytes_total.load(Ordering::Relaxed),
            transfer_time_sum_ms: self.transfer_time_sum_ms.load(Ordering::Relaxed),
            latency_sum_ms: self.latency_sum_ms.load(Ordering::Relaxed),
            transfer_errors: self.transfer_errors.load(Ordering::Relaxed),
            transfers_cancelled: self.transfers_cancelled.load(Ordering::Relaxed),
            segments_not_found: self.segments_not_found.load(Ordering::Relaxed),
            playlist_updates: self.playlist_updates.load(Ordering::Relaxed),
            playlist_update_failures: self.playlist_update_failures.load(Ordering::Relaxed),
            key_fetches: self.key_fetches.load(Ordering::Relaxed),
            key_cache_hits: self.key_cache_hits.load(Ordering::Relaxed),
            decryptions_total: self.decryptions_total.load(Ordering::Relaxed),
            decryption_bytes_total: self.decryption_bytes_total.load(Ordering::Relaxed),
            decryption_time_sum_ms: self.decryption_time_sum_ms.load(Ordering::Relaxed),
            representation_switches: self.representation_switches.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transfers_total: u64,
    pub transfer_bytes_total: u64,
    pub transfer_time_sum_ms: u64,
    pub latency_sum_ms: u64,
    pub transfer_errors: u64,
    pub transfers_cancelled: u64,
    pub segments_not_found: u64,
    pub playlist_updates: u64,
    pub playlist_update_failures: u64,
    pub key_fetches: u64,
    pub key_cache_hits: u64,
    pub decryptions_total: u64,
    pub decryption_bytes_total: u64,
    pub decryption_time_sum_ms: u64,
    pub representation_switches: u64,
}

fn format_bytes_per_sec(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1_000_000_000.0 {
        format!("{:.2} GB/s", bytes_per_sec / 1_000_000_000.0)
    } else if bytes_per_sec >= 1_000_000.0 {
        format!("{:.2} MB/s", bytes_per_sec / 1_000_000.0)
    } else if bytes_per_sec >= 1_000.0 {
        format!("{:.2} KB/s", bytes_per_sec / 1_000.0)
    } else {
        format!("{:.2} B/s", bytes_per_sec)
    }
}
