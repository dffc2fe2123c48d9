use anyhow::{anyhow, Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::Path;
use std::time::Duration;

/// Mono PCM samples in [-1.0, 1.0].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

fn mono_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    }
}

/// Decodes a WAV file held in memory, downmixing to mono.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioClip> {
    let mut reader = WavReader::new(Cursor::new(bytes)).context("Invalid WAV data")?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("Failed to read float samples")?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .context("Failed to read integer samples")?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };

    Ok(AudioClip::new(samples, spec.sample_rate))
}

/// Encodes a clip as 16-bit PCM mono WAV.
pub fn encode_wav(clip: &AudioClip) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, mono_spec(clip.sample_rate))?;
        for &sample in &clip.samples {
            writer.write_sample(to_i16(sample))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

pub fn silence(seconds: f32, sample_rate: u32) -> Vec<f32> {
    let count = (seconds.max(0.0) * sample_rate as f32).round() as usize;
    vec![0.0; count]
}

/// Scales samples so the loudest one reaches `target`.
///
/// Returns false and leaves the buffer untouched when it is entirely silent.
pub fn peak_normalize(samples: &mut [f32], target: f32) -> bool {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak <= f32::EPSILON {
        return false;
    }
    let gain = target / peak;
    for s in samples.iter_mut() {
        *s *= gain;
    }
    true
}

/// Playback length of a WAV file on disk.
pub fn wav_duration(path: &Path) -> Result<Duration> {
    let reader =
        WavReader::open(path).with_context(|| format!("Failed to open WAV {:?}", path))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        return Err(anyhow!("WAV {:?} reports a zero sample rate", path));
    }
    Ok(Duration::from_secs_f64(
        reader.duration() as f64 / spec.sample_rate as f64,
    ))
}

/// Streams several WAV files into one, sample by sample.
///
/// The first appended file fixes the output format; later files with a
/// different format are rejected so the caller can skip them.
pub struct WavConcatenator {
    output: std::path::PathBuf,
    writer: Option<WavWriter<BufWriter<File>>>,
    spec: Option<WavSpec>,
}

impl WavConcatenator {
    pub fn new(output: &Path) -> Self {
        Self {
            output: output.to_path_buf(),
            writer: None,
            spec: None,
        }
    }

    /// Appends `path` and returns its duration.
    pub fn append(&mut self, path: &Path) -> Result<Duration> {
        let mut reader =
            WavReader::open(path).with_context(|| format!("Failed to open WAV {:?}", path))?;
        let spec = reader.spec();
        if spec.sample_rate == 0 {
            return Err(anyhow!("WAV {:?} reports a zero sample rate", path));
        }

        match self.spec {
            Some(expected) if expected != spec => {
                return Err(anyhow!(
                    "WAV format mismatch in {:?}: {} Hz/{} ch/{} bit, expected {} Hz/{} ch/{} bit",
                    path,
                    spec.sample_rate,
                    spec.channels,
                    spec.bits_per_sample,
                    expected.sample_rate,
                    expected.channels,
                    expected.bits_per_sample
                ));
            }
            Some(_) => {}
            None => {
                if let Some(parent) = self.output.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                self.writer = Some(
                    WavWriter::create(&self.output, spec)
                        .with_context(|| format!("Failed to create {:?}", self.output))?,
                );
                self.spec = Some(spec);
            }
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("WAV writer not initialised"))?;
        let frames = reader.duration();
        match spec.sample_format {
            SampleFormat::Int => {
                for sample in reader.samples::<i32>() {
                    writer.write_sample(sample?)?;
                }
            }
            SampleFormat::Float => {
                for sample in reader.samples::<f32>() {
                    writer.write_sample(sample?)?;
                }
            }
        }

        Ok(Duration::from_secs_f64(frames as f64 / spec.sample_rate as f64))
    }

    /// Finalizes the output. Returns false if nothing was appended.
    pub fn finish(self) -> Result<bool> {
        match self.writer {
            Some(writer) => {
                writer.finalize()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
