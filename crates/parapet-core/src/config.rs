use serde::{Deserialize, Serialize};

/// Content-defined chunking parameters. Persisted in the repository manifest
/// at init time; a repository stays chunk-compatible across software versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Rolling-hash window width in bytes.
    #[serde(default = "default_window")]
    pub window: u32,
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    /// Target average chunk size; must be a power of two (the boundary mask
    /// is `avg_size - 1`).
    #[serde(default = "default_avg_size")]
    pub avg_size: u32,
    #[serde(default = "default_max_size")]
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            min_size: default_min_size(),
            avg_size: default_avg_size(),
            max_size: default_max_size(),
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> parapet_types::Result<()> {
        if !self.avg_size.is_power_of_two() {
            return Err(parapet_types::ParapetError::Config(format!(
                "chunker avg_size ({}) must be a power of two",
                self.avg_size
            )));
        }
        if self.min_size == 0 || self.min_size > self.avg_size || self.avg_size > self.max_size {
            return Err(parapet_types::ParapetError::Config(format!(
                "chunker sizes must satisfy 0 < min ({}) <= avg ({}) <= max ({})",
                self.min_size, self.avg_size, self.max_size
            )));
        }
        if self.window == 0 || self.window as u64 > self.min_size as u64 {
            return Err(parapet_types::ParapetError::Config(format!(
                "chunker window ({}) must be nonzero and no larger than min_size",
                self.window
            )));
        }
        Ok(())
    }
}

pub fn default_window() -> u32 {
    48
}

pub fn default_min_size() -> u32 {
    2 * 1024
}

pub fn default_avg_size() -> u32 {
    8 * 1024
}

pub fn default_max_size() -> u32 {
    64 * 1024
}

/// Client-side tunables for the delta engine and committer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Maximum hashes per probe request.
    #[serde(default = "default_probe_batch")]
    pub probe_batch: usize,
    /// Maximum pipelined chunk uploads awaiting acknowledgement.
    #[serde(default = "default_upload_window")]
    pub upload_window: usize,
    /// First retry delay for a failed chunk upload, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Upper bound on the backoff delay, in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// Attempts per chunk before the whole commit is abandoned.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Timeout for control RPCs, in milliseconds.
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    /// Timeout for put_chunk/get_chunk and restore frames, in milliseconds.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    /// Idle window before a path's burst of change events is committed,
    /// in milliseconds.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Capacity of the change-event channel; oldest events for a path are
    /// coalesced away under backpressure.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            probe_batch: default_probe_batch(),
            upload_window: default_upload_window(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            retry_attempts: default_retry_attempts(),
            control_timeout_ms: default_control_timeout_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            debounce_ms: default_debounce_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_probe_batch() -> usize {
    1024
}

fn default_upload_window() -> usize {
    8
}

fn default_retry_base_ms() -> u64 {
    250
}

fn default_retry_cap_ms() -> u64 {
    8_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_control_timeout_ms() -> u64 {
    30_000
}

fn default_chunk_timeout_ms() -> u64 {
    120_000
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_event_capacity() -> usize {
    1024
}

/// Agent-side tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Number of concurrent read-only RPC workers.
    #[serde(default = "default_reader_pool")]
    pub reader_pool: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reader_pool: default_reader_pool(),
        }
    }
}

fn default_reader_pool() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chunker_config_is_valid() {
        ChunkerConfig::default().validate().unwrap();
    }

    #[test]
    fn non_power_of_two_avg_rejected() {
        let cfg = ChunkerConfig {
            avg_size: 6000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn inverted_sizes_rejected() {
        let cfg = ChunkerConfig {
            min_size: 1 << 16,
            avg_size: 1 << 13,
            max_size: 1 << 14,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn window_larger_than_min_rejected() {
        let cfg = ChunkerConfig {
            window: 4096,
            min_size: 1024,
            avg_size: 2048,
            max_size: 8192,
        };
        assert!(cfg.validate().is_err());
    }
}
