use std::future::Future;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::aggregate::{AggregatorConfig, Confirmation, TemporalAggregator};
use crate::classify::Classifier;
use crate::models::{Frame, GestureLabel};
use crate::orchestrator::ConfirmedGesture;
use crate::source::LandmarkSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    pub frames: usize,
    pub alerting_frames: usize,
    pub confirmations: usize,
}

/// Per-frame path: classify, aggregate, hand confirmations to the orchestrator.
///
/// Never waits on delivery; the orchestrator side of the channel does that.
pub struct Monitor {
    classifier: Classifier,
    aggregator: TemporalAggregator,
    confirmations: mpsc::UnboundedSender<ConfirmedGesture>,
    stats: MonitorStats,
}

impl Monitor {
    pub fn new(
        classifier: Classifier,
        aggregator: AggregatorConfig,
        confirmations: mpsc::UnboundedSender<ConfirmedGesture>,
    ) -> Self {
        Self {
            classifier,
            aggregator: TemporalAggregator::new(aggregator),
            confirmations,
            stats: MonitorStats::default(),
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> MonitorStats {
        self.stats
    }

    pub fn process_frame(&mut self, frame: Frame) -> Option<Confirmation> {
        self.stats.frames += 1;
        let sample = self.classifier.classify_frame(&frame);
        if sample.label != GestureLabel::None {
            self.stats.alerting_frames += 1;
        }

        let confirmation = self.aggregator.push(sample);
        debug!(
            label = %sample.label,
            confidence = sample.confidence,
            state = ?self.aggregator.state(),
            window = self.aggregator.window_len(),
            "sample"
        );
        let confirmation = confirmation?;
        self.stats.confirmations += 1;
        info!(
            gesture = %confirmation.label,
            samples = confirmation.samples,
            agreement = confirmation.agreement,
            confidence = confirmation.mean_confidence,
            total = self.stats.confirmations,
            "gesture confirmed"
        );

        let event = ConfirmedGesture {
            confirmation: confirmation.clone(),
            frame,
        };
        if self.confirmations.send(event).is_err() {
            warn!("alert orchestrator is gone; confirmation dropped");
        }
        Some(confirmation)
    }

    /// Drain the source until it ends or `shutdown` resolves.
    pub async fn run<S, F>(mut self, source: &mut S, shutdown: F) -> anyhow::Result<MonitorStats>
    where
        S: LandmarkSource + ?Sized,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let frame = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping frame intake");
                    break;
                }
                frame = source.next_frame() => frame?,
            };
            let Some(frame) = frame else {
                debug!("landmark stream ended");
                break;
            };
            self.process_frame(frame);
        }

        info!(
            frames = self.stats.frames,
            alerting = self.stats.alerting_frames,
            confirmations = self.stats.confirmations,
            "monitor stopped"
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::clock::manual::{ManualClock, TokioClock};
    use crate::evidence::{DirectorySnapshotSink, NoLocation};
    use crate::fixtures::{self, Pose};
    use crate::models::IncidentState;
    use crate::orchestrator::{AlertSettings, Collaborators, Orchestrator};
    use crate::source::{CsvSource, JsonLinesSource};
    use crate::store::{EvidenceStore, MemoryStore};
    use crate::transport::ConsoleTransport;

    fn monitor() -> (Monitor, mpsc::UnboundedReceiver<ConfirmedGesture>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Monitor::new(Classifier::default(), AggregatorConfig::default(), tx),
            rx,
        )
    }

    fn stream(pose: Option<Pose>, until_ms: i64) -> String {
        (0..=until_ms / 50)
            .map(|i| {
                let frame = fixtures::frame(pose, i * 50);
                serde_json::json!({
                    "timestamp_ms": i * 50,
                    "hands": frame.hands.iter().map(|h| serde_json::json!({
                        "handedness": h.handedness,
                        "score": h.score,
                        "landmarks": h.landmarks,
                    })).collect::<Vec<_>>(),
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn held_fist_confirms_once_and_forwards_the_frame() {
        let (mut monitor, mut rx) = monitor();
        let mut confirmed = Vec::new();
        for i in 0..=30 {
            if let Some(c) = monitor.process_frame(fixtures::frame(Some(Pose::Fist), i * 50)) {
                confirmed.push(c);
            }
        }

        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].label, GestureLabel::Sos);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.frame.timestamp, confirmed[0].confirmed_at);
        assert!(rx.try_recv().is_err());

        let stats = monitor.stats();
        assert_eq!(stats.frames, 31);
        assert_eq!(stats.alerting_frames, 31);
        assert_eq!(stats.confirmations, 1);
    }

    #[test]
    fn empty_frames_never_confirm() {
        let (mut monitor, mut rx) = monitor();
        for i in 0..100 {
            assert!(monitor.process_frame(fixtures::frame(None, i * 50)).is_none());
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_intake() {
        let (monitor, _rx) = monitor();
        let input = stream(Some(Pose::Fist), 1500);
        let clock = Arc::new(ManualClock::new(fixtures::base_time()));
        let mut source = JsonLinesSource::new(input.as_bytes(), clock);

        let stats = monitor.run(&mut source, async {}).await.unwrap();
        assert_eq!(stats.frames, 0);
        assert_eq!(stats.confirmations, 0);
    }

    #[tokio::test]
    async fn unreadable_line_does_not_end_the_stream() {
        let (monitor, mut rx) = monitor();
        let input = stream(Some(Pose::Fist), 1500);
        let lines: Vec<&str> = input.lines().collect();
        let mut input = lines[..15].join("\n").into_bytes();
        input.extend_from_slice(b"\n\xff\xfe not a frame\n");
        input.extend_from_slice(lines[15..].join("\n").as_bytes());

        let clock = Arc::new(ManualClock::new(fixtures::base_time()));
        let mut source = JsonLinesSource::new(input.as_slice(), clock);
        let stats = monitor
            .run(&mut source, std::future::pending())
            .await
            .unwrap();

        assert_eq!(stats.frames, 31);
        assert_eq!(stats.confirmations, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stream_of_fists_ends_in_one_delivered_incident() {
        let clock = Arc::new(ManualClock::new(fixtures::base_time()));
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let deps = Collaborators {
            store: store.clone(),
            transport: Arc::new(ConsoleTransport),
            location: Arc::new(NoLocation),
            snapshots: Arc::new(DirectorySnapshotSink::new(dir.path().to_path_buf())),
            clock: clock.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = tokio::spawn(Orchestrator::new(deps, AlertSettings::default()).run(rx));
        let monitor = Monitor::new(Classifier::default(), AggregatorConfig::default(), tx);

        let input = stream(Some(Pose::Fist), 1500);
        let mut source = JsonLinesSource::new(input.as_bytes(), clock);
        let stats = monitor
            .run(&mut source, std::future::pending())
            .await
            .unwrap();
        assert_eq!(stats.frames, 31);
        assert_eq!(stats.confirmations, 1);

        let summary = orchestrator.await.unwrap();
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.delivered, 1);

        let records = store.incidents().await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.incident.state, IncidentState::Delivered);
        assert_eq!(record.incident.confirmed_at, fixtures::at_ms(1000));
        assert!(record.incident.snapshot.as_deref().unwrap().ends_with(".json"));
        assert_eq!(record.attempts.len(), 2);
    }

    fn recording_rows(out: &mut impl Write, frame_no: &mut u64, pose: Pose, from_ms: i64) {
        for i in 0..=30 {
            *frame_no += 1;
            for (point, lm) in fixtures::pose_points(pose).iter().enumerate() {
                writeln!(
                    out,
                    "{},{},0,{point},{},{},{},",
                    frame_no,
                    from_ms + i * 50,
                    lm.x,
                    lm.y,
                    lm.z
                )
                .unwrap();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_incidents_far_apart_are_both_delivered() {
        let mut recording = NamedTempFile::new().unwrap();
        writeln!(recording, "frame,timestamp_ms,hand,point,x,y,z,visibility").unwrap();
        let mut frame_no = 0;
        recording_rows(&mut recording, &mut frame_no, Pose::Fist, 0);
        recording_rows(&mut recording, &mut frame_no, Pose::Kidnap, 300_000);
        recording.flush().unwrap();

        let clock = Arc::new(TokioClock::new(fixtures::base_time()));
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let deps = Collaborators {
            store: store.clone(),
            transport: Arc::new(ConsoleTransport),
            location: Arc::new(NoLocation),
            snapshots: Arc::new(DirectorySnapshotSink::new(dir.path().to_path_buf())),
            clock: clock.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = tokio::spawn(Orchestrator::new(deps, AlertSettings::default()).run(rx));
        let monitor = Monitor::new(Classifier::default(), AggregatorConfig::default(), tx);

        let mut source = CsvSource::from_path(recording.path(), fixtures::base_time()).unwrap();
        let stats = monitor
            .run(&mut source, std::future::pending())
            .await
            .unwrap();
        assert_eq!(stats.confirmations, 2);

        let summary = orchestrator.await.unwrap();
        assert_eq!(summary.dispatched, 2);
        assert_eq!(summary.suppressed, 0);
        assert_eq!(summary.delivered, 2);

        let mut gestures: Vec<GestureLabel> = store
            .incidents()
            .await
            .unwrap()
            .iter()
            .map(|r| r.incident.gesture)
            .collect();
        gestures.sort_by_key(|g| g.to_string());
        assert_eq!(gestures, vec![GestureLabel::KidnapAlert, GestureLabel::Sos]);
    }
}
