//! Motion-JPEG + 16-bit PCM AVI muxing and header probing.

use crate::{AvatarError, Result};

const AVIF_HASINDEX: u32 = 0x10;
const AVIF_ISINTERLEAVED: u32 = 0x100;
const AVIIF_KEYFRAME: u32 = 0x10;

const VIDEO_CHUNK: &[u8; 4] = b"00dc";
const AUDIO_CHUNK: &[u8; 4] = b"01wb";

/// PCM layout of the audio stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    fn block_align(&self) -> u32 {
        self.channels as u32 * 2
    }
}

struct IndexEntry {
    id: [u8; 4],
    offset: u32,
    size: u32,
}

/// Collects interleaved chunks in memory and writes the file in one go.
pub struct AviWriter {
    width: u32,
    height: u32,
    fps: u32,
    audio: Option<PcmFormat>,
    movi: Vec<u8>,
    index: Vec<IndexEntry>,
    video_frames: u32,
    audio_frames: u64,
    largest_chunk: u32,
}

impl AviWriter {
    /// An empty container; `audio: None` writes a video-only file.
    pub fn new(width: u32, height: u32, fps: u32, audio: Option<PcmFormat>) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            audio,
            movi: b"movi".to_vec(),
            index: Vec::new(),
            video_frames: 0,
            audio_frames: 0,
            largest_chunk: 0,
        }
    }

    /// Video chunks written so far.
    pub fn video_frames(&self) -> u32 {
        self.video_frames
    }

    /// Appends one JPEG-compressed frame.
    pub fn push_video(&mut self, jpeg: &[u8]) {
        self.push_chunk(*VIDEO_CHUNK, jpeg);
        self.video_frames += 1;
    }

    /// Appends interleaved 16-bit samples. Ignored without an audio stream.
    pub fn push_audio(&mut self, samples: &[i16]) {
        let Some(format) = self.audio else {
            return;
        };
        if samples.is_empty() {
            return;
        }
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        self.push_chunk(*AUDIO_CHUNK, &bytes);
        self.audio_frames += samples.len() as u64 / format.channels.max(1) as u64;
    }

    fn push_chunk(&mut self, id: [u8; 4], data: &[u8]) {
        let size = data.len() as u32;
        self.index.push(IndexEntry {
            id,
            offset: self.movi.len() as u32,
            size,
        });
        write_chunk(&mut self.movi, &id, data);
        self.largest_chunk = self.largest_chunk.max(size);
    }

    /// Serialises the complete RIFF file.
    pub fn finish(self) -> Vec<u8> {
        let streams = if self.audio.is_some() { 2 } else { 1 };

        let mut avih = Vec::with_capacity(56);
        put_u32(&mut avih, 1_000_000 / self.fps);
        put_u32(&mut avih, 0);
        put_u32(&mut avih, 0);
        put_u32(&mut avih, AVIF_HASINDEX | AVIF_ISINTERLEAVED);
        put_u32(&mut avih, self.video_frames);
        put_u32(&mut avih, 0);
        put_u32(&mut avih, streams);
        put_u32(&mut avih, self.largest_chunk);
        put_u32(&mut avih, self.width);
        put_u32(&mut avih, self.height);
        avih.extend_from_slice(&[0; 16]);

        let mut hdrl = b"hdrl".to_vec();
        write_chunk(&mut hdrl, b"avih", &avih);
        write_chunk(&mut hdrl, b"LIST", &self.video_strl());
        if let Some(format) = self.audio {
            write_chunk(&mut hdrl, b"LIST", &self.audio_strl(format));
        }

        let mut idx1 = Vec::with_capacity(self.index.len() * 16);
        for entry in &self.index {
            idx1.extend_from_slice(&entry.id);
            put_u32(&mut idx1, AVIIF_KEYFRAME);
            put_u32(&mut idx1, entry.offset);
            put_u32(&mut idx1, entry.size);
        }

        let mut body = b"AVI ".to_vec();
        write_chunk(&mut body, b"LIST", &hdrl);
        write_chunk(&mut body, b"LIST", &self.movi);
        write_chunk(&mut body, b"idx1", &idx1);

        let mut out = Vec::with_capacity(body.len() + 8);
        write_chunk(&mut out, b"RIFF", &body);
        out
    }

    fn video_strl(&self) -> Vec<u8> {
        let mut strh = Vec::with_capacity(56);
        strh.extend_from_slice(b"vids");
        strh.extend_from_slice(b"MJPG");
        put_u32(&mut strh, 0);
        put_u16(&mut strh, 0);
        put_u16(&mut strh, 0);
        put_u32(&mut strh, 0);
        put_u32(&mut strh, 1);
        put_u32(&mut strh, self.fps);
        put_u32(&mut strh, 0);
        put_u32(&mut strh, self.video_frames);
        put_u32(&mut strh, self.largest_chunk);
        put_u32(&mut strh, u32::MAX);
        put_u32(&mut strh, 0);
        put_rect(&mut strh, self.width, self.height);

        let mut strf = Vec::with_capacity(40);
        put_u32(&mut strf, 40);
        put_u32(&mut strf, self.width);
        put_u32(&mut strf, self.height);
        put_u16(&mut strf, 1);
        put_u16(&mut strf, 24);
        strf.extend_from_slice(b"MJPG");
        put_u32(&mut strf, self.width * self.height * 3);
        strf.extend_from_slice(&[0; 16]);

        strl(&strh, &strf)
    }

    fn audio_strl(&self, format: PcmFormat) -> Vec<u8> {
        let block = format.block_align();
        let mut strh = Vec::with_capacity(56);
        strh.extend_from_slice(b"auds");
        put_u32(&mut strh, 0);
        put_u32(&mut strh, 0);
        put_u16(&mut strh, 0);
        put_u16(&mut strh, 0);
        put_u32(&mut strh, 0);
        put_u32(&mut strh, block);
        put_u32(&mut strh, format.sample_rate * block);
        put_u32(&mut strh, 0);
        put_u32(&mut strh, self.audio_frames as u32);
        put_u32(&mut strh, self.largest_chunk);
        put_u32(&mut strh, u32::MAX);
        put_u32(&mut strh, block);
        put_rect(&mut strh, 0, 0);

        let mut strf = Vec::with_capacity(18);
        put_u16(&mut strf, 1);
        put_u16(&mut strf, format.channels);
        put_u32(&mut strf, format.sample_rate);
        put_u32(&mut strf, format.sample_rate * block);
        put_u16(&mut strf, block as u16);
        put_u16(&mut strf, 16);
        put_u16(&mut strf, 0);

        strl(&strh, &strf)
    }
}

fn strl(strh: &[u8], strf: &[u8]) -> Vec<u8> {
    let mut list = b"strl".to_vec();
    write_chunk(&mut list, b"strh", strh);
    write_chunk(&mut list, b"strf", strf);
    list
}

fn write_chunk(out: &mut Vec<u8>, id: &[u8; 4], data: &[u8]) {
    out.extend_from_slice(id);
    put_u32(out, data.len() as u32);
    out.extend_from_slice(data);
    if data.len() % 2 == 1 {
        out.push(0);
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn put_rect(out: &mut Vec<u8>, width: u32, height: u32) {
    put_u16(out, 0);
    put_u16(out, 0);
    put_u16(out, width.min(u16::MAX as u32) as u16);
    put_u16(out, height.min(u16::MAX as u32) as u16);
}

/// Header summary read back from an AVI file.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: u32,
    pub audio: Option<PcmFormat>,
    /// Audio length in sample frames.
    pub audio_frames: u64,
}

impl ContainerInfo {
    /// Parses the `hdrl` list of an AVI file.
    pub fn probe(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"AVI " {
            return Err(AvatarError::decode("not an AVI file"));
        }
        let hdrl = chunks(&bytes[12..])
            .find(|(id, body)| id == b"LIST" && body.starts_with(b"hdrl"))
            .map(|(_, body)| &body[4..])
            .ok_or_else(|| AvatarError::decode("AVI header list missing"))?;

        let avih = chunks(hdrl)
            .find(|(id, _)| id == b"avih")
            .map(|(_, body)| body)
            .ok_or_else(|| AvatarError::decode("AVI main header missing"))?;
        if avih.len() < 40 {
            return Err(AvatarError::decode("AVI main header truncated"));
        }

        let mut info = ContainerInfo {
            width: read_u32(avih, 32),
            height: read_u32(avih, 36),
            fps: 0.0,
            frames: read_u32(avih, 16),
            audio: None,
            audio_frames: 0,
        };
        let micros = read_u32(avih, 0);
        if micros > 0 {
            info.fps = 1_000_000.0 / micros as f64;
        }

        for (id, body) in chunks(hdrl) {
            if &id != b"LIST" || !body.starts_with(b"strl") {
                continue;
            }
            let mut strh = None;
            let mut strf = None;
            for (id, body) in chunks(&body[4..]) {
                match &id {
                    b"strh" => strh = Some(body),
                    b"strf" => strf = Some(body),
                    _ => {}
                }
            }
            let (Some(strh), Some(strf)) = (strh, strf) else {
                continue;
            };
            if strh.len() < 36 {
                return Err(AvatarError::decode("AVI stream header truncated"));
            }
            match &strh[0..4] {
                b"vids" => {
                    let scale = read_u32(strh, 20);
                    let rate = read_u32(strh, 24);
                    if scale > 0 && rate > 0 {
                        info.fps = rate as f64 / scale as f64;
                    }
                    info.frames = read_u32(strh, 32);
                }
                b"auds" if strf.len() >= 16 => {
                    info.audio = Some(PcmFormat {
                        channels: read_u16(strf, 2),
                        sample_rate: read_u32(strf, 4),
                    });
                    info.audio_frames = read_u32(strh, 32) as u64;
                }
                _ => {}
            }
        }
        Ok(info)
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Video duration in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        if self.fps <= 0.0 {
            return 0.0;
        }
        self.frames as f64 * 1000.0 / self.fps
    }
}

/// Iterates `(fourcc, body)` pairs; stops at the first truncated chunk.
fn chunks(data: &[u8]) -> impl Iterator<Item = ([u8; 4], &[u8])> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 8 > data.len() {
            return None;
        }
        let mut id = [0u8; 4];
        id.copy_from_slice(&data[pos..pos + 4]);
        let size = read_u32(data, pos + 4) as usize;
        let start = pos + 8;
        let end = start.checked_add(size).filter(|end| *end <= data.len())?;
        pos = end + (size & 1);
        Some((id, &data[start..end]))
    })
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    const PCM: PcmFormat = PcmFormat {
        sample_rate: 16_000,
        channels: 1,
    };

    #[test]
    fn probe_reads_back_stream_headers() {
        let mut writer = AviWriter::new(300, 200, 25, Some(PCM));
        for _ in 0..50 {
            writer.push_video(&[0xFF, 0xD8, 0xFF, 0xD9, 0x00]);
            writer.push_audio(&[0i16; 640]);
        }
        let bytes = writer.finish();

        let info = ContainerInfo::probe(&bytes).unwrap();
        assert_eq!((info.width, info.height), (300, 200));
        assert_eq!(info.fps, 25.0);
        assert_eq!(info.frames, 50);
        assert_eq!(info.duration_ms(), 2000.0);
        assert_eq!(info.audio, Some(PCM));
        assert_eq!(info.audio_frames, 32_000);
    }

    #[test]
    fn riff_size_matches_file_and_chunks_are_even() {
        let mut writer = AviWriter::new(2, 2, 30, None);
        writer.push_video(&[1, 2, 3]);
        writer.push_audio(&[5, 6]);
        let bytes = writer.finish();

        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(bytes.len() % 2, 0);
        let info = ContainerInfo::probe(&bytes).unwrap();
        assert!(!info.has_audio());
        assert_eq!(info.frames, 1);
    }

    #[test]
    fn index_points_at_movi_chunks() {
        let mut writer = AviWriter::new(4, 4, 10, Some(PCM));
        writer.push_video(&[9; 7]);
        writer.push_audio(&[1; 3]);
        let bytes = writer.finish();

        let body = &bytes[12..];
        let movi = chunks(body)
            .find(|(id, data)| id == b"LIST" && data.starts_with(b"movi"))
            .map(|(_, data)| data)
            .unwrap();
        let idx1 = chunks(body).find(|(id, _)| id == b"idx1").unwrap().1;
        assert_eq!(idx1.len(), 32);

        let offset = read_u32(idx1, 8) as usize;
        assert_eq!(&movi[offset..offset + 4], b"00dc");
        assert_eq!(read_u32(idx1, 12), 7);
        let offset = read_u32(idx1, 24) as usize;
        assert_eq!(&movi[offset..offset + 4], b"01wb");
    }

    #[test]
    fn rejects_other_containers() {
        assert!(ContainerInfo::probe(b"RIFF\x04\x00\x00\x00WAVE").is_err());
        assert!(ContainerInfo::probe(&[]).is_err());
    }
}
