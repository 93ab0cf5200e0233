use std::time::Duration;

use super::{MediaKind, SelectPolicy};
use crate::error::{ConfigErrorKind, Result, St2110Error};

/// Default wait of a blocking `get_frame` before its single retry.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-slot poll count of `flush_and_close`.
pub const DEFAULT_FLUSH_RETRIES: u32 = 100;

/// Sleep between two flush polls of the same slot.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Time given to the transport to finish an in-flight frame at close.
pub const DEFAULT_FLUSH_GRACE: Duration = Duration::from_millis(50);

/// Creation-time configuration of a [`TxPipeline`](super::TxPipeline).
///
/// Immutable once the pipeline is built, except for the block timeout which
/// can be changed with [`TxPipeline::set_block_timeout`](super::TxPipeline::set_block_timeout).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Session name used in logs and reports. When `None`, a name is derived
    /// from the media kind and session index (e.g. `tx_audio_3`).
    pub name: Option<String>,
    /// Essence carried by the session.
    pub media: MediaKind,
    /// Number of frame slots. Fixed for the pipeline's lifetime.
    pub framebuff_cnt: u16,
    /// Frame selection policy of `next_frame`.
    pub policy: SelectPolicy,
    /// Make `get_frame` wait (bounded) for a free slot instead of returning `None`.
    pub block_get: bool,
    /// Wait of a blocking `get_frame` before its single retry.
    pub block_timeout: Duration,
    /// Copy the application's pacing timestamp to the transport on `next_frame`.
    pub user_pacing: bool,
    /// Let the transport discard the newest Ready frame when an epoch is missed.
    pub drop_when_late: bool,
    /// Per-slot poll count of `flush_and_close`.
    pub flush_retries: u32,
    /// Sleep between two flush polls.
    pub flush_interval: Duration,
    /// Grace given to in-flight frames at close.
    pub flush_grace: Duration,
}

impl PipelineConfig {
    /// Configuration for `media` with its default selection policy.
    pub fn for_media(media: MediaKind, framebuff_cnt: u16) -> Self {
        Self {
            media,
            framebuff_cnt,
            policy: media.default_policy(),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self, supplied: usize) -> Result<()> {
        if self.framebuff_cnt == 0 {
            return Err(St2110Error::config(ConfigErrorKind::NoFrameBuffers));
        }
        if supplied != self.framebuff_cnt as usize {
            return Err(St2110Error::config(ConfigErrorKind::BufferCountMismatch {
                configured: self.framebuff_cnt,
                supplied,
            }));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: None,
            media: MediaKind::Video,
            framebuff_cnt: 3,
            policy: SelectPolicy::RoundRobin,
            block_get: false,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            user_pacing: false,
            drop_when_late: false,
            flush_retries: DEFAULT_FLUSH_RETRIES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            flush_grace: DEFAULT_FLUSH_GRACE,
        }
    }
}

/// Creation-time configuration of an [`RxPipeline`](super::RxPipeline).
#[derive(Debug, Clone)]
pub struct RxPipelineConfig {
    pub name: Option<String>,
    pub media: MediaKind,
    /// Number of received frames the pipeline can hold for the application.
    pub framebuff_cnt: u16,
    pub block_get: bool,
    pub block_timeout: Duration,
    pub flush_retries: u32,
    pub flush_interval: Duration,
}

impl RxPipelineConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.framebuff_cnt == 0 {
            return Err(St2110Error::config(ConfigErrorKind::NoFrameBuffers));
        }
        Ok(())
    }
}

impl Default for RxPipelineConfig {
    fn default() -> Self {
        Self {
            name: None,
            media: MediaKind::Video,
            framebuff_cnt: 3,
            block_get: false,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            flush_retries: DEFAULT_FLUSH_RETRIES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}
