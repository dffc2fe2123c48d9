use anyhow::{anyhow, Context, Result};
use std::time::Duration;

/// One caption cue with offsets relative to the start of its track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptionSegment {
    pub start: Duration,
    pub end: Duration,
    pub text: String,
}

impl CaptionSegment {
    pub fn new(start: Duration, end: Duration, text: impl Into<String>) -> Self {
        Self {
            start,
            end,
            text: text.into(),
        }
    }

    pub fn shifted(&self, offset: Duration) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
            text: self.text.clone(),
        }
    }
}

/// `HH:MM:SS,mmm`
pub fn format_timestamp(d: Duration) -> String {
    let total_ms = d.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, seconds, millis)
}

pub fn parse_timestamp(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (hms, millis) = s
        .split_once(',')
        .or_else(|| s.split_once('.'))
        .ok_or_else(|| anyhow!("Timestamp '{}' has no millisecond part", s))?;

    let parts: Vec<&str> = hms.split(':').collect();
    if parts.len() != 3 {
        return Err(anyhow!("Timestamp '{}' is not HH:MM:SS,mmm", s));
    }
    let hours: u64 = parts[0].parse().with_context(|| format!("Bad hours in '{}'", s))?;
    let minutes: u64 = parts[1].parse().with_context(|| format!("Bad minutes in '{}'", s))?;
    let seconds: u64 = parts[2].parse().with_context(|| format!("Bad seconds in '{}'", s))?;
    let millis: String = millis.chars().chain(std::iter::repeat('0')).take(3).collect();
    let millis: u64 = millis.parse().with_context(|| format!("Bad millis in '{}'", s))?;

    Ok(Duration::from_millis(
        ((hours * 60 + minutes) * 60 + seconds) * 1000 + millis,
    ))
}

/// Renders segments as SRT, numbering cues from 1.
pub fn to_srt(segments: &[CaptionSegment]) -> String {
    let mut out = String::new();
    for (i, seg) in segments.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_timestamp(seg.start),
            format_timestamp(seg.end),
            seg.text.trim()
        ));
    }
    out
}

/// Parses SRT cues. Cues without text are dropped.
pub fn parse_srt(content: &str) -> Result<Vec<CaptionSegment>> {
    let normalized = content.replace("\r\n", "\n");
    let mut segments = Vec::new();

    for block in normalized.split("\n\n") {
        let mut lines = block.lines().map(str::trim).filter(|l| !l.is_empty());
        let first = match lines.next() {
            Some(line) => line,
            None => continue,
        };
        // The cue number is optional in practice.
        let timing = if first.contains("-->") {
            first
        } else {
            lines
                .next()
                .ok_or_else(|| anyhow!("Caption block '{}' has no timing line", first))?
        };
        let (start, end) = timing
            .split_once("-->")
            .ok_or_else(|| anyhow!("Bad timing line '{}'", timing))?;
        let text = lines.collect::<Vec<_>>().join("\n");
        let (start, end) = (parse_timestamp(start)?, parse_timestamp(end)?);
        if text.is_empty() {
            continue;
        }

        segments.push(CaptionSegment::new(start, end, text));
    }

    Ok(segments)
}

/// Joins per-unit caption tracks onto one timeline.
///
/// `tracks` is in playback order; each entry pairs a unit's audio duration
/// with its captions. A unit's captions are shifted by the sum of the
/// durations of all tracks before it.
pub fn merge_caption_tracks(tracks: &[(Duration, Vec<CaptionSegment>)]) -> Vec<CaptionSegment> {
    let mut offset = Duration::ZERO;
    let mut merged = Vec::new();
    for (duration, segments) in tracks {
        merged.extend(segments.iter().map(|seg| seg.shifted(offset)));
        offset += *duration;
    }
    merged
}
