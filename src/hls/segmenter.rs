//! Transport stream segmenter
//!
//! Cuts the muxed stream into files of roughly the target duration, always
//! starting a segment on a keyframe, and rewrites the playlist after every
//! completed segment. Only completed segments are ever listed.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::graph::BranchSink;
use crate::hls::config::HlsConfig;
use crate::media::Sample;

#[derive(Debug, Clone)]
struct Segment {
    name: String,
    sequence: u64,
    duration: Duration,
}

struct OpenSegment {
    file: File,
    name: String,
    sequence: u64,
    start: Duration,
}

/// Branch sink writing segments and the playlist into the HLS directory
pub struct Segmenter {
    config: HlsConfig,
    current: Option<OpenSegment>,
    next_sequence: u64,
    segments: VecDeque<Segment>,
    last_pts: Duration,
    first_segment: watch::Sender<bool>,
}

impl Segmenter {
    pub fn new(config: HlsConfig) -> Self {
        let (first_segment, _) = watch::channel(false);
        Self {
            config,
            current: None,
            next_sequence: 0,
            segments: VecDeque::new(),
            last_pts: Duration::ZERO,
            first_segment,
        }
    }

    /// Flips to `true` once the first segment is listed in the playlist
    pub fn first_segment(&self) -> watch::Receiver<bool> {
        self.first_segment.subscribe()
    }

    fn path(&self, name: &str) -> PathBuf {
        self.config.directory.join(name)
    }

    async fn open_segment(&mut self, start: Duration) -> io::Result<()> {
        if self.next_sequence == 0 {
            // A playlist left by an earlier run must not be served as ours
            match fs::remove_file(self.path(&self.config.playlist_name)).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let name = self.config.segment_name(sequence);
        let file = File::create(self.path(&name)).await?;
        tracing::trace!(segment = %name, "segment opened");
        self.current = Some(OpenSegment {
            file,
            name,
            sequence,
            start,
        });
        Ok(())
    }

    async fn close_segment(&mut self, end: Duration) -> io::Result<()> {
        let Some(mut open) = self.current.take() else {
            return Ok(());
        };
        open.file.flush().await?;
        drop(open.file);

        let duration = end.saturating_sub(open.start);
        tracing::debug!(segment = %open.name, ?duration, "segment complete");
        self.segments.push_back(Segment {
            name: open.name,
            sequence: open.sequence,
            duration,
        });
        while self.segments.len() > self.config.max_files {
            if let Some(old) = self.segments.pop_front() {
                if let Err(e) = fs::remove_file(self.path(&old.name)).await {
                    tracing::warn!(segment = %old.name, error = %e, "could not remove old segment");
                }
            }
        }
        self.write_playlist().await?;
        self.first_segment.send_replace(true);
        Ok(())
    }

    async fn write_playlist(&self) -> io::Result<()> {
        let listed: Vec<&Segment> = self
            .segments
            .iter()
            .skip(self.segments.len().saturating_sub(self.config.playlist_length))
            .collect();
        let playlist = render_playlist(&listed, self.config.segment_duration);

        let target = self.path(&self.config.playlist_name);
        let tmp = self.path(&format!(".{}.tmp", self.config.playlist_name));
        fs::write(&tmp, playlist).await?;
        fs::rename(&tmp, &target).await
    }
}

fn render_playlist(segments: &[&Segment], target: Duration) -> String {
    let longest = segments
        .iter()
        .map(|s| s.duration)
        .max()
        .unwrap_or(target)
        .max(target);
    let target_secs = longest.as_secs() + u64::from(longest.subsec_nanos() > 0);
    let first = segments.first().map_or(0, |s| s.sequence);

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", first));
    out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target_secs));
    for segment in segments {
        out.push_str(&format!(
            "#EXTINF:{:.3},\n{}\n",
            segment.duration.as_secs_f64(),
            segment.name
        ));
    }
    out
}

#[async_trait]
impl BranchSink for Segmenter {
    async fn render(&mut self, sample: &Sample) -> io::Result<()> {
        let pts = sample.pts.unwrap_or(self.last_pts);
        self.last_pts = pts;

        let start = match &self.current {
            Some(open) => Some(open.start),
            // Wait for a keyframe before the first segment
            None if sample.delta => return Ok(()),
            None => None,
        };
        match start {
            None => self.open_segment(pts).await?,
            Some(start)
                if sample.is_keyframe()
                    && pts.saturating_sub(start) >= self.config.segment_duration =>
            {
                self.close_segment(pts).await?;
                self.open_segment(pts).await?;
            }
            Some(_) => {}
        }
        if let Some(open) = self.current.as_mut() {
            open.file.write_all(&sample.data).await?;
        }
        Ok(())
    }
}
