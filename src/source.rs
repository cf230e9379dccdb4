//! Landmark sources: where frames of detector output come from.
//!
//! The detector itself (camera plus hand landmark model) runs out of process
//! and writes one JSON object per frame:
//!
//! ```json
//! {"timestamp_ms": 40, "image_path": "frames/000001.jpg",
//!  "hands": [{"handedness": "Right", "score": 0.97,
//!             "landmarks": [{"x": 0.51, "y": 0.62, "z": -0.01}, ...]}]}
//! ```
//!
//! `timestamp_ms` is relative to the start of the stream; frames without one
//! are stamped on arrival.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::{Frame, HandObservation, Landmark};

#[async_trait]
pub trait LandmarkSource: Send {
    /// The next frame, or `None` once the stream has ended.
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>>;
}

/// `origin + ms`, or `None` when the offset leaves the representable range.
fn offset_from(origin: DateTime<Utc>, ms: i64) -> Option<DateTime<Utc>> {
    Duration::try_milliseconds(ms).and_then(|offset| origin.checked_add_signed(offset))
}

fn full_score() -> f32 {
    1.0
}

#[derive(Debug, Deserialize)]
struct WireHand {
    handedness: Option<String>,
    #[serde(default = "full_score")]
    score: f32,
    landmarks: Vec<Landmark>,
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    timestamp_ms: Option<i64>,
    image_path: Option<PathBuf>,
    #[serde(default)]
    hands: Vec<WireHand>,
    #[serde(default)]
    error: Option<String>,
}

/// Reads detector frames, one JSON object per line.
pub struct JsonLinesSource<R> {
    reader: R,
    buf: Vec<u8>,
    clock: Arc<dyn Clock>,
    origin: DateTime<Utc>,
    line_no: usize,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R, clock: Arc<dyn Clock>) -> Self {
        let origin = clock.now();
        Self {
            reader,
            buf: Vec::new(),
            clock,
            origin,
            line_no: 0,
        }
    }

    fn to_frame(&self, wire: WireFrame) -> Frame {
        let timestamp = match wire.timestamp_ms {
            Some(ms) => offset_from(self.origin, ms).unwrap_or_else(|| {
                warn!(line = self.line_no, timestamp_ms = ms, "timestamp out of range, using arrival time");
                self.clock.now()
            }),
            None => self.clock.now(),
        };

        if let Some(error) = wire.error {
            warn!(line = self.line_no, "detector reported an error: {error}");
            return Frame {
                timestamp,
                hands: Vec::new(),
                image_path: wire.image_path,
            };
        }

        Frame {
            timestamp,
            hands: wire
                .hands
                .into_iter()
                .map(|hand| HandObservation {
                    handedness: hand.handedness,
                    score: hand.score,
                    landmarks: hand.landmarks,
                    timestamp,
                })
                .collect(),
            image_path: wire.image_path,
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> LandmarkSource for JsonLinesSource<R> {
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .await
                .context("failed to read detector output")?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<WireFrame>(&self.buf) {
                Ok(wire) => return Ok(Some(self.to_frame(wire))),
                Err(err) => warn!(line = self.line_no, "skipping unreadable detector line: {err}"),
            }
        }
    }
}

/// A detector process whose stdout is a JSON-lines frame stream.
pub struct DetectorSource {
    child: Child,
    frames: JsonLinesSource<BufReader<ChildStdout>>,
}

impl DetectorSource {
    /// Start the detector. With `wait_ready`, the first line it prints must be `READY`.
    pub async fn spawn(
        program: &Path,
        args: &[String],
        wait_ready: bool,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        info!(program = %program.display(), "starting landmark detector");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start detector {}", program.display()))?;

        let stdout = child
            .stdout
            .take()
            .context("detector stdout was not captured")?;
        let mut reader = BufReader::new(stdout);

        if wait_ready {
            let mut ready = String::new();
            reader
                .read_line(&mut ready)
                .await
                .context("failed to read detector handshake")?;
            if ready.trim() != "READY" {
                anyhow::bail!(
                    "detector did not signal ready, got: {:?}",
                    ready.trim()
                );
            }
            info!("landmark detector ready");
        }

        Ok(Self {
            child,
            frames: JsonLinesSource::new(reader, clock),
        })
    }
}

#[async_trait]
impl LandmarkSource for DetectorSource {
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        let frame = self.frames.next_frame().await?;
        if frame.is_none() {
            let status = self.child.wait().await?;
            if status.success() {
                info!("landmark detector finished");
            } else {
                warn!(%status, "landmark detector exited");
            }
        }
        Ok(frame)
    }
}

/// Replays a landmark recording, one CSV row per point.
///
/// Frames are released at their recorded pace so cooldowns and delivery
/// timing behave as they did when the recording was made.
pub struct CsvSource {
    frames: VecDeque<Frame>,
    paced_from: Option<(Instant, DateTime<Utc>)>,
}

impl CsvSource {
    pub fn from_path(path: &Path, origin: DateTime<Utc>) -> anyhow::Result<Self> {
        let reader = csv::Reader::from_path(path)
            .with_context(|| format!("failed to open recording {}", path.display()))?;
        Self::from_reader(reader, origin)
    }

    fn from_reader<R: std::io::Read>(
        mut reader: csv::Reader<R>,
        origin: DateTime<Utc>,
    ) -> anyhow::Result<Self> {
        #[derive(serde::Deserialize)]
        struct CsvRow {
            frame: u64,
            timestamp_ms: i64,
            hand: u32,
            point: usize,
            x: f32,
            y: f32,
            z: f32,
            visibility: Option<f32>,
        }

        struct PendingFrame {
            timestamp: DateTime<Utc>,
            hands: BTreeMap<u32, Vec<(usize, Landmark)>>,
        }

        let mut pending: BTreeMap<u64, PendingFrame> = BTreeMap::new();
        for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
            let row = result.with_context(|| format!("bad recording row {}", index + 1))?;
            let timestamp = offset_from(origin, row.timestamp_ms).with_context(|| {
                format!(
                    "bad recording row {}: timestamp_ms {} out of range",
                    index + 1,
                    row.timestamp_ms
                )
            })?;
            let landmark = Landmark {
                visibility: row.visibility.unwrap_or(1.0),
                ..Landmark::new(row.x, row.y, row.z)
            };
            pending
                .entry(row.frame)
                .or_insert_with(|| PendingFrame {
                    timestamp,
                    hands: BTreeMap::new(),
                })
                .hands
                .entry(row.hand)
                .or_default()
                .push((row.point, landmark));
        }

        let frames: VecDeque<Frame> = pending
            .into_values()
            .map(|frame| Frame {
                timestamp: frame.timestamp,
                hands: frame
                    .hands
                    .into_values()
                    .map(|mut points| {
                        points.sort_by_key(|(point, _)| *point);
                        HandObservation {
                            handedness: None,
                            score: 1.0,
                            landmarks: points.into_iter().map(|(_, lm)| lm).collect(),
                            timestamp: frame.timestamp,
                        }
                    })
                    .collect(),
                image_path: None,
            })
            .collect();

        debug!(frames = frames.len(), "recording loaded");
        Ok(Self {
            frames,
            paced_from: None,
        })
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl LandmarkSource for CsvSource {
    async fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        let Some(frame) = self.frames.pop_front() else {
            return Ok(None);
        };
        let (started, first) = *self
            .paced_from
            .get_or_insert_with(|| (Instant::now(), frame.timestamp));
        let offset = (frame.timestamp - first).to_std().unwrap_or_default();
        tokio::time::sleep_until(started + offset).await;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::manual::ManualClock;
    use crate::fixtures::{self, Pose};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(fixtures::base_time()))
    }

    fn frame_line(pose: Pose, ms: Option<i64>) -> String {
        let landmarks = fixtures::pose_points(pose);
        let mut value = serde_json::json!({
            "hands": [{"handedness": "Left", "score": 0.9, "landmarks": landmarks}],
        });
        if let Some(ms) = ms {
            value["timestamp_ms"] = serde_json::json!(ms);
        }
        value.to_string()
    }

    #[tokio::test]
    async fn json_lines_are_stamped_relative_to_stream_start() {
        let input = format!(
            "{}\n\n{}\n",
            frame_line(Pose::Fist, Some(0)),
            frame_line(Pose::Kidnap, Some(250))
        );
        let mut source = JsonLinesSource::new(input.as_bytes(), clock());

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.timestamp, fixtures::at_ms(0));
        assert_eq!(first.hands.len(), 1);
        assert_eq!(first.hands[0].landmarks.len(), 21);
        assert_eq!(first.hands[0].handedness.as_deref(), Some("Left"));

        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.timestamp, fixtures::at_ms(250));
        assert_eq!(second.hands[0].timestamp, fixtures::at_ms(250));

        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unstamped_frames_use_arrival_time() {
        let clock = clock();
        let input = frame_line(Pose::Fist, None);
        let mut source = JsonLinesSource::new(input.as_bytes(), clock.clone());
        clock.advance(Duration::milliseconds(700));

        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.timestamp, fixtures::at_ms(700));
    }

    #[tokio::test]
    async fn garbage_is_skipped_and_errors_become_empty_frames() {
        let input = format!(
            "not json\n{}\n{}\n",
            r#"{"timestamp_ms": 40, "hands": [], "error": "camera unplugged"}"#,
            frame_line(Pose::Fist, Some(80))
        );
        let mut source = JsonLinesSource::new(input.as_bytes(), clock());

        let empty = source.next_frame().await.unwrap().unwrap();
        assert!(empty.hands.is_empty());
        assert_eq!(empty.timestamp, fixtures::at_ms(40));

        let next = source.next_frame().await.unwrap().unwrap();
        assert_eq!(next.hands.len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_timestamp_is_stamped_on_arrival() {
        let clock = clock();
        let input = format!(
            "{}\n{}\n",
            r#"{"timestamp_ms": 9000000000000000000, "hands": []}"#,
            frame_line(Pose::Fist, Some(40))
        );
        let mut source = JsonLinesSource::new(input.as_bytes(), clock.clone());
        clock.advance(Duration::milliseconds(300));

        let odd = source.next_frame().await.unwrap().unwrap();
        assert_eq!(odd.timestamp, fixtures::at_ms(300));
        let next = source.next_frame().await.unwrap().unwrap();
        assert_eq!(next.timestamp, fixtures::at_ms(40));
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let mut input = frame_line(Pose::Fist, Some(0)).into_bytes();
        input.extend_from_slice(b"\n{\"hands\": \xff\xfe}\n");
        input.extend_from_slice(frame_line(Pose::Kidnap, Some(50)).as_bytes());
        let mut source = JsonLinesSource::new(input.as_slice(), clock());

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.timestamp, fixtures::at_ms(0));
        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.timestamp, fixtures::at_ms(50));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn image_path_and_defaults_are_carried() {
        let input = r#"{"timestamp_ms": 0, "image_path": "frames/1.jpg", "hands": [{"landmarks": [{"x": 0.1, "y": 0.2}]}]}"#;
        let mut source = JsonLinesSource::new(input.as_bytes(), clock());
        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.image_path, Some(PathBuf::from("frames/1.jpg")));
        let hand = &frame.hands[0];
        assert_eq!(hand.score, 1.0);
        assert_eq!(hand.landmarks[0].z, 0.0);
        assert_eq!(hand.landmarks[0].visibility, 1.0);
    }

    #[tokio::test]
    async fn detector_process_with_handshake() {
        let script = format!(
            "echo READY; echo '{}'",
            frame_line(Pose::Kidnap, Some(0))
        );
        let mut source = DetectorSource::spawn(
            Path::new("sh"),
            &["-c".to_string(), script],
            true,
            clock(),
        )
        .await
        .unwrap();

        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.hands.len(), 1);
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detector_without_handshake_is_rejected() {
        let result = DetectorSource::spawn(
            Path::new("sh"),
            &["-c".to_string(), "echo starting".to_string()],
            true,
            clock(),
        )
        .await;
        let err = result.err().unwrap();
        assert!(err.to_string().contains("did not signal ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn csv_rows_are_grouped_into_frames_and_hands() {
        let mut data = String::from("frame,timestamp_ms,hand,point,x,y,z,visibility\n");
        for (frame, ms) in [(2u64, 40i64), (1, 0)] {
            for hand in 0..2 {
                for (point, lm) in fixtures::pose_points(Pose::Fist).iter().enumerate().rev() {
                    data.push_str(&format!(
                        "{frame},{ms},{hand},{point},{},{},{},\n",
                        lm.x, lm.y, lm.z
                    ));
                }
            }
        }

        let reader = csv::Reader::from_reader(data.as_bytes());
        let mut source = CsvSource::from_reader(reader, fixtures::base_time()).unwrap();
        assert_eq!(source.remaining(), 2);

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.timestamp, fixtures::at_ms(0));
        assert_eq!(first.hands.len(), 2);
        assert_eq!(first.hands[0].landmarks, fixtures::pose_points(Pose::Fist));

        let second = source.next_frame().await.unwrap().unwrap();
        assert_eq!(second.timestamp, fixtures::at_ms(40));
        assert!(source.next_frame().await.unwrap().is_none());
    }

    #[test]
    fn bad_csv_row_names_the_row() {
        let data = "frame,timestamp_ms,hand,point,x,y,z,visibility\n1,0,0,0,0.5,nope,0,\n";
        let reader = csv::Reader::from_reader(data.as_bytes());
        let err = CsvSource::from_reader(reader, fixtures::base_time()).err().unwrap();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn out_of_range_csv_timestamp_names_the_row() {
        let data = "frame,timestamp_ms,hand,point,x,y,z,visibility\n\
                    1,0,0,0,0.5,0.5,0,\n\
                    2,9000000000000000000,0,0,0.5,0.5,0,\n";
        let reader = csv::Reader::from_reader(data.as_bytes());
        let err = CsvSource::from_reader(reader, fixtures::base_time()).err().unwrap();
        assert!(err.to_string().contains("row 2"));
        assert!(err.to_string().contains("out of range"));
    }

    #[tokio::test(start_paused = true)]
    async fn recording_is_released_at_its_recorded_pace() {
        let mut data = String::from("frame,timestamp_ms,hand,point,x,y,z,visibility\n");
        for (frame, ms) in [(1u64, 0i64), (2, 40), (3, 2_000)] {
            data.push_str(&format!("{frame},{ms},0,0,0.5,0.5,0,\n"));
        }
        let reader = csv::Reader::from_reader(data.as_bytes());
        let mut source = CsvSource::from_reader(reader, fixtures::base_time()).unwrap();

        let start = Instant::now();
        source.next_frame().await.unwrap().unwrap();
        assert!(start.elapsed() < std::time::Duration::from_millis(40));
        source.next_frame().await.unwrap().unwrap();
        let second = start.elapsed();
        assert!(second >= std::time::Duration::from_millis(40));
        assert!(second < std::time::Duration::from_secs(2));
        let last = source.next_frame().await.unwrap().unwrap();
        assert_eq!(last.timestamp, fixtures::at_ms(2_000));
        assert!(start.elapsed() >= std::time::Duration::from_secs(2));
    }
}
