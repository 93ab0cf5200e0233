use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::compliance::{AudioComplianceStat, ComplianceStat, StatHandle};
use crate::error::Result;
use crate::pipeline::{
    MediaKind, PipelineConfig, PipelineStats, RxPipeline, RxPipelineConfig, RxTransport,
    SessionId, TxPipeline,
};

/// Anything the registry can pull periodic stats from.
pub trait StatSource: Send + Sync {
    /// Snapshot of the pipeline counters, resetting them.
    fn drain_stats(&self) -> PipelineStats;
}

impl<T: Send> StatSource for TxPipeline<T> {
    fn drain_stats(&self) -> PipelineStats {
        TxPipeline::drain_stats(self)
    }
}

impl<T: Send> StatSource for RxPipeline<T> {
    fn drain_stats(&self) -> PipelineStats {
        RxPipeline::drain_stats(self)
    }
}

/// Direction of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

/// Timing aggregate attached to a receive session.
#[derive(Debug, Clone)]
pub enum TimingStat {
    Video(StatHandle<ComplianceStat>),
    Audio(StatHandle<AudioComplianceStat>),
}

impl From<StatHandle<ComplianceStat>> for TimingStat {
    fn from(handle: StatHandle<ComplianceStat>) -> Self {
        Self::Video(handle)
    }
}

impl From<StatHandle<AudioComplianceStat>> for TimingStat {
    fn from(handle: StatHandle<AudioComplianceStat>) -> Self {
        Self::Audio(handle)
    }
}

/// Drained timing aggregate of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimingReport {
    Video(ComplianceStat),
    Audio(AudioComplianceStat),
}

/// One session's share of a [`SessionRegistry::dump_stats`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session: SessionId,
    pub direction: Direction,
    pub media: MediaKind,
    pub pipeline: PipelineStats,
    pub timing: Option<TimingReport>,
}

struct Entry {
    direction: Direction,
    media: MediaKind,
    source: Arc<dyn StatSource>,
    timing: Option<TimingStat>,
}

/// Creates pipelines with explicit session indices and drives their stats dump.
///
/// Each new session gets the lowest index not currently in use, so indices
/// are reused after [`remove`](Self::remove). Cloning shares the registry.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<BTreeMap<SessionId, Entry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lowest_free(sessions: &BTreeMap<SessionId, Entry>) -> SessionId {
        let mut idx = 0;
        for id in sessions.keys() {
            if id.0 != idx {
                break;
            }
            idx += 1;
        }
        SessionId(idx)
    }

    /// Creates and registers a transmit pipeline.
    pub fn create_tx<T: Send + 'static>(
        &self,
        config: PipelineConfig,
        buffers: Vec<T>,
    ) -> Result<TxPipeline<T>> {
        let mut sessions = self.sessions.write();
        let id = Self::lowest_free(&sessions);
        let media = config.media;
        let pipeline = TxPipeline::with_session(id, config, buffers)?;
        sessions.insert(
            id,
            Entry {
                direction: Direction::Tx,
                media,
                source: Arc::new(pipeline.clone()),
                timing: None,
            },
        );
        tracing::info!(session = %pipeline.name(), index = id.0, "session registered");
        Ok(pipeline)
    }

    /// Creates and registers a receive pipeline.
    pub fn create_rx<T: Send + 'static>(
        &self,
        config: RxPipelineConfig,
        transport: Arc<dyn RxTransport<T>>,
    ) -> Result<RxPipeline<T>> {
        let mut sessions = self.sessions.write();
        let id = Self::lowest_free(&sessions);
        let media = config.media;
        let pipeline = RxPipeline::with_session(id, config, transport)?;
        sessions.insert(
            id,
            Entry {
                direction: Direction::Rx,
                media,
                source: Arc::new(pipeline.clone()),
                timing: None,
            },
        );
        tracing::info!(session = %pipeline.name(), index = id.0, "session registered");
        Ok(pipeline)
    }

    /// Includes a timing aggregate in the session's stats dump.
    /// Returns `false` if the session is not registered.
    pub fn attach_timing(&self, session: SessionId, timing: impl Into<TimingStat>) -> bool {
        match self.sessions.write().get_mut(&session) {
            Some(entry) => {
                entry.timing = Some(timing.into());
                true
            }
            None => false,
        }
    }

    /// Forgets a session, freeing its index. The pipeline itself lives on in
    /// the caller's handles.
    pub fn remove(&self, session: SessionId) -> bool {
        let removed = self.sessions.write().remove(&session).is_some();
        if removed {
            tracing::info!(index = session.0, "session unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.read().keys().copied().collect()
    }

    /// Drains and logs the stats of every session, in index order.
    pub fn dump_stats(&self) -> Vec<SessionReport> {
        let sessions = self.sessions.read();
        let mut reports = Vec::with_capacity(sessions.len());
        for (&session, entry) in sessions.iter() {
            let pipeline = entry.source.drain_stats();
            tracing::info!("{pipeline}");
            let timing = entry.timing.as_ref().map(|t| match t {
                TimingStat::Video(h) => TimingReport::Video(h.drain()),
                TimingStat::Audio(h) => TimingReport::Audio(h.drain()),
            });
            match &timing {
                Some(TimingReport::Video(stat)) => {
                    tracing::info!(session = %pipeline.name, "video timing {stat}")
                }
                Some(TimingReport::Audio(stat)) => {
                    tracing::info!(session = %pipeline.name, "audio timing {stat}")
                }
                None => {}
            }
            reports.push(SessionReport {
                session,
                direction: entry.direction,
                media: entry.media,
                pipeline,
                timing,
            });
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::{ComplianceEngine, VideoGeometry};
    use crate::pipeline::TxDoneMeta;

    struct Discard;

    impl RxTransport<Vec<u8>> for Discard {
        fn release(&self, _payload: Vec<u8>) {}
    }

    #[test]
    fn indices_are_explicit_and_reused() {
        let registry = SessionRegistry::new();
        let a = registry
            .create_tx(PipelineConfig::for_media(MediaKind::Video, 2), vec![0u8; 2])
            .unwrap();
        let b = registry
            .create_rx::<Vec<u8>>(
                RxPipelineConfig {
                    media: MediaKind::Audio,
                    ..Default::default()
                },
                Arc::new(Discard),
            )
            .unwrap();
        assert_eq!((a.session(), b.session()), (SessionId(0), SessionId(1)));
        assert_eq!(a.name(), "tx_video_0");
        assert_eq!(b.name(), "rx_audio_1");

        assert!(registry.remove(SessionId(0)));
        assert!(!registry.remove(SessionId(0)));
        let c = registry
            .create_tx(PipelineConfig::for_media(MediaKind::Ancillary, 1), vec![()])
            .unwrap();
        assert_eq!(c.session(), SessionId(0));
        assert_eq!(registry.sessions(), [SessionId(0), SessionId(1)]);
    }

    #[test]
    fn rejected_config_registers_nothing() {
        let registry = SessionRegistry::new();
        let err = registry.create_tx(PipelineConfig::default(), vec![0u8; 1]);
        assert!(err.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn dump_drains_counters() {
        let registry = SessionRegistry::new();
        let tx = registry
            .create_tx(PipelineConfig::for_media(MediaKind::Video, 2), vec![0u8; 2])
            .unwrap();
        let f = tx.get_frame().unwrap();
        tx.put_frame(f).unwrap();
        let t = tx.next_frame().unwrap();
        tx.frame_done(t, TxDoneMeta::default()).unwrap();

        let engine = ComplianceEngine::new(&VideoGeometry::default()).unwrap();
        assert!(registry.attach_timing(tx.session(), engine.stat_handle()));
        assert!(!registry.attach_timing(SessionId(7), engine.stat_handle()));

        let first = registry.dump_stats();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].pipeline.put, 1);
        assert_eq!(first[0].direction, Direction::Tx);
        assert!(matches!(first[0].timing, Some(TimingReport::Video(_))));

        let second = registry.dump_stats();
        assert_eq!(second[0].pipeline.put, 0);
        assert_eq!(second[0].pipeline.histogram.free, 2);
    }
}
