//! Audio blobs produced by synthesis or upload, and their decoded PCM form.

use std::{fmt, io::Cursor, path::Path, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};

use crate::{AvatarError, Result};

/// Extensions the transcription endpoint accepts.
const TRANSCRIBABLE_EXTENSIONS: &[&str] = &[
    "mp3", "mp4", "mpeg", "mpga", "m4a", "wav", "webm", "ogg", "oga", "flac",
];

/// Encodings the engine can synthesise and play back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Wav,
}

impl AudioFormat {
    /// Lowercase name, as used on the wire and in config.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav => "audio/wav",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// Identifies the format from the leading bytes. Returns `None` when the
    /// bytes match neither container.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WAVE" {
            return Some(Self::Wav);
        }
        if bytes.len() >= 3 && &bytes[0..3] == b"ID3" {
            return Some(Self::Mp3);
        }
        // MPEG audio frame sync: 11 set bits followed by a non-reserved layer.
        if bytes.len() >= 2 && bytes[0] == 0xFF && bytes[1] & 0xE0 == 0xE0 && bytes[1] & 0x06 != 0
        {
            return Some(Self::Mp3);
        }
        None
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = AvatarError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" | "mpeg" => Ok(Self::Mp3),
            "wav" | "wave" => Ok(Self::Wav),
            other => Err(AvatarError::msg(format!("unsupported audio format `{other}`"))),
        }
    }
}

/// Immutable, cheaply cloneable audio blob tagged with its encoding.
#[derive(Clone, PartialEq, Eq)]
pub struct AudioSource {
    bytes: Arc<[u8]>,
    format: AudioFormat,
}

impl AudioSource {
    /// Wraps already-encoded audio bytes.
    pub fn new(bytes: impl Into<Arc<[u8]>>, format: AudioFormat) -> Self {
        Self {
            bytes: bytes.into(),
            format,
        }
    }

    /// Promotes an upload to a playable source when its bytes are mp3 or wav.
    pub fn from_upload(upload: &AudioUpload) -> Result<Self> {
        let format = AudioFormat::sniff(&upload.bytes).ok_or_else(|| {
            AvatarError::decode(format!(
                "`{}` is neither mp3 nor wav and cannot be played",
                upload.file_name
            ))
        })?;
        Ok(Self::new(upload.bytes.clone(), format))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A user supplied audio file destined for transcription.
#[derive(Clone)]
pub struct AudioUpload {
    pub file_name: String,
    pub mime: Option<String>,
    pub bytes: Vec<u8>,
}

impl AudioUpload {
    /// An upload as received, before any validation.
    pub fn new(file_name: impl Into<String>, mime: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime,
            bytes,
        }
    }

    /// Reads a file from disk, guessing nothing beyond its name.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        Ok(Self::new(file_name, None, bytes))
    }

    /// Lowercased file extension, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// An upload is transcribable when it declares an audio MIME type or
    /// carries a known audio extension.
    pub fn is_supported(&self) -> bool {
        if let Some(mime) = &self.mime {
            return mime.starts_with("audio/") || mime == "video/webm" || mime == "video/mp4";
        }
        self.extension()
            .map(|ext| TRANSCRIBABLE_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false)
    }

    /// Declared MIME type, or one guessed from the bytes and extension.
    pub fn content_type(&self) -> String {
        if let Some(mime) = &self.mime {
            return mime.clone();
        }
        if let Some(format) = AudioFormat::sniff(&self.bytes) {
            return format.mime().to_string();
        }
        match self.extension().as_deref() {
            Some("m4a") | Some("mp4") => "audio/mp4",
            Some("ogg") | Some("oga") => "audio/ogg",
            Some("webm") => "audio/webm",
            Some("flac") => "audio/flac",
            _ => "application/octet-stream",
        }
        .to_string()
    }
}

impl fmt::Debug for AudioUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioUpload")
            .field("file_name", &self.file_name)
            .field("mime", &self.mime)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Interleaved PCM samples normalised to `[-1, 1]`.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<f32>,
}

impl DecodedAudio {
    /// Number of sample frames (one sample per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Track length; zero for a zero sample rate.
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Frame index for a playback position, clamped to the track.
    pub fn frame_at(&self, seconds: f64) -> usize {
        let frame = (seconds.max(0.0) * self.sample_rate as f64).floor() as usize;
        frame.min(self.frames())
    }

    /// Fills `out` with the mono mix of the frames ending at `end_frame`.
    /// Positions before the start of the track are zero.
    pub fn mono_window_into(&self, end_frame: usize, out: &mut [f32]) {
        let channels = self.channels.max(1) as usize;
        let end_frame = end_frame.min(self.frames());
        let len = out.len();
        for (i, slot) in out.iter_mut().enumerate() {
            let back = len - i;
            *slot = if back > end_frame {
                0.0
            } else {
                let frame = end_frame - back;
                let base = frame * channels;
                let sum: f32 = self.samples[base..base + channels].iter().sum();
                sum / channels as f32
            };
        }
    }

    /// Interleaved samples for the frame range `[start, end)`, clamped.
    pub fn frame_range(&self, start: usize, end: usize) -> &[f32] {
        let channels = self.channels.max(1) as usize;
        let end = end.min(self.frames());
        let start = start.min(end);
        &self.samples[start * channels..end * channels]
    }
}

/// Decodes a source into PCM. WAV goes through `hound`, everything else
/// through `symphonia`.
pub fn decode(source: &AudioSource) -> Result<DecodedAudio> {
    let decoded = match source.format() {
        AudioFormat::Wav => decode_wav(source.bytes())?,
        AudioFormat::Mp3 => decode_with_symphonia(source.bytes(), source.format())?,
    };

    if decoded.frames() == 0 || decoded.sample_rate == 0 {
        return Err(AvatarError::decode("audio contains no playable frames"));
    }
    Ok(decoded)
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| AvatarError::decode(format!("invalid wav: {e}")))?;
    let spec = reader.spec();

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>(),
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
    }
    .map_err(|e| AvatarError::decode(format!("corrupt wav samples: {e}")))?;

    Ok(DecodedAudio {
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        samples,
    })
}

fn decode_with_symphonia(bytes: &[u8], format: AudioFormat) -> Result<DecodedAudio> {
    let cursor = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    hint.with_extension(format.extension());

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AvatarError::decode(format!("unsupported {format} stream: {e}")))?;
    let mut reader = probed.format;

    let track = reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AvatarError::decode("no decodable audio track"))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AvatarError::decode(format!("unsupported codec: {e}")))?;

    let mut samples = Vec::new();
    let mut buffer: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(AvatarError::decode(format!("error reading packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if sample_rate == 0 {
                    sample_rate = spec.rate;
                }
                if channels == 0 {
                    channels = spec.channels.count() as u16;
                }
                let buf = buffer.get_or_insert_with(|| {
                    SampleBuffer::new(decoded.capacity() as u64, spec)
                });
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(AvatarError::decode(format!("decoder failed: {e}"))),
        }
    }

    Ok(DecodedAudio {
        sample_rate,
        channels: channels.max(1),
        samples,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! PCM fixtures shared by the tests of several modules.

    use std::f32::consts::PI;

    use super::{AudioFormat, AudioSource};

    /// 16-bit mono wav holding a sine tone at `level` for `seconds`.
    pub fn tone_wav(seconds: f32, level: f32, sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            let total = (seconds * sample_rate as f32) as usize;
            for n in 0..total {
                let t = n as f32 / sample_rate as f32;
                let value = (2.0 * PI * 220.0 * t).sin() * level;
                writer.write_sample((value * i16::MAX as f32) as i16).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    pub fn tone_source(seconds: f32, level: f32) -> AudioSource {
        AudioSource::new(tone_wav(seconds, level, 16_000), AudioFormat::Wav)
    }

    /// A run of silent MPEG-1 Layer III frames (128 kbit/s, 44.1 kHz, mono).
    pub fn silent_mp3(frames: usize) -> Vec<u8> {
        const FRAME_LEN: usize = 417;
        let mut bytes = Vec::with_capacity(frames * FRAME_LEN);
        for _ in 0..frames {
            let mut frame = vec![0u8; FRAME_LEN];
            frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0xC4]);
            bytes.extend_from_slice(&frame);
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn sniffs_containers() {
        assert_eq!(AudioFormat::sniff(&tone_wav(0.1, 0.5, 8_000)), Some(AudioFormat::Wav));
        assert_eq!(AudioFormat::sniff(&silent_mp3(1)), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::sniff(b"ID3\x04\x00"), Some(AudioFormat::Mp3));
        assert_eq!(AudioFormat::sniff(b"OggS\x00\x02"), None);
    }

    #[test]
    fn parses_format_names() {
        assert_eq!("MP3".parse::<AudioFormat>().unwrap(), AudioFormat::Mp3);
        assert_eq!("wav".parse::<AudioFormat>().unwrap().mime(), "audio/wav");
        assert!("ogg".parse::<AudioFormat>().is_err());
    }

    #[test]
    fn decodes_wav_duration_and_levels() {
        let decoded = decode(&tone_source(1.5, 0.5)).unwrap();

        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.channels, 1);
        assert!((decoded.duration_seconds() - 1.5).abs() < 1e-3);
        let peak = decoded.samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.5).abs() < 0.01);
    }

    #[test]
    fn decodes_mp3_frames() {
        let source = AudioSource::new(silent_mp3(40), AudioFormat::Mp3);
        let decoded = decode(&source).unwrap();

        assert_eq!(decoded.sample_rate, 44_100);
        assert!(decoded.duration_seconds() > 0.0);
        assert!(decoded.samples.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn rejects_garbage() {
        let source = AudioSource::new(vec![1, 2, 3, 4], AudioFormat::Wav);
        assert!(matches!(decode(&source), Err(AvatarError::Decode(_))));
    }

    #[test]
    fn mono_window_zero_pads_before_start() {
        let audio = DecodedAudio {
            sample_rate: 4,
            channels: 2,
            samples: vec![1.0, 0.0, 1.0, 1.0, 0.5, 0.5],
        };
        let mut out = [9.0_f32; 4];
        audio.mono_window_into(2, &mut out);

        assert_eq!(out, [0.0, 0.0, 0.5, 1.0]);
        assert_eq!(audio.frame_range(1, 10), &[1.0, 1.0, 0.5, 0.5]);
    }

    #[test]
    fn uploads_are_checked_by_mime_or_extension() {
        assert!(AudioUpload::new("clip.M4A", None, vec![1]).is_supported());
        assert!(AudioUpload::new("blob", Some("audio/ogg".into()), vec![1]).is_supported());
        assert!(!AudioUpload::new("notes.txt", None, vec![1]).is_supported());
        assert!(!AudioUpload::new("clip.wav", Some("text/plain".into()), vec![1]).is_supported());

        let upload = AudioUpload::new("take.bin", None, tone_wav(0.1, 0.2, 8_000));
        assert_eq!(upload.content_type(), "audio/wav");
        assert_eq!(AudioSource::from_upload(&upload).unwrap().format(), AudioFormat::Wav);
    }
}
