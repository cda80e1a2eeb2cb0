use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Connecting,
    HeaderSync,
    BlockDownload,
    Synced,
}

/// Snapshot published by the sync driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub phase: SyncPhase,
    /// Highest block the wallet has processed.
    pub current_height: u32,
    pub header_height: u32,
    /// Best height known from headers or peers.
    pub target_height: u32,
    pub peer_count: usize,
    /// Timestamp of the header chain tip.
    pub tip_time: u32,
}

impl Default for SyncState {
    fn default() -> Self {
        Self { phase: SyncPhase::Idle, current_height: 0, header_height: 0, target_height: 0, peer_count: 0, tip_time: 0 }
    }
}

impl SyncState {
    /// `current / target`, clamped to `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.target_height == 0 {
            return if self.phase == SyncPhase::Synced { 1.0 } else { 0.0 };
        }
        (self.current_height as f64 / self.target_height as f64).clamp(0.0, 1.0)
    }
}
