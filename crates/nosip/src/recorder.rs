//! Frame recorders.
//!
//! One optional recorder per direction and kind ({user, peer} × {audio,
//! video}). The sink format is deliberately minimal: a single JSON header
//! line carrying the codec metadata, then length-prefixed frames exactly
//! as they came off the wire (after SRTP removal). Container formats are
//! the host's business, not the bridge's.

use byteorder::{BigEndian, ByteOrder};
use serde_json::json;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) struct Recorder {
    writer: BufWriter<File>,
    pub(crate) filename: String,
}

impl Recorder {
    /// Create `<base>.rec` and write the metadata header.
    pub(crate) fn create(codec: Option<&str>, video: bool, base: &str) -> io::Result<Recorder> {
        let filename = format!("{base}.rec");
        let file = File::create(&filename)?;
        let mut writer = BufWriter::new(file);

        let header = json!({
            "type": if video { "video" } else { "audio" },
            "codec": codec,
            "created": unix_now(),
        });

        writer.write_all(header.to_string().as_bytes())?;
        writer.write_all(b"\n")?;

        log::info!("opened recording {filename}");

        Ok(Recorder { writer, filename })
    }

    pub(crate) fn save_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let len = u16::try_from(frame.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;

        let mut prefix = [0u8; 2];
        BigEndian::write_u16(&mut prefix, len);

        self.writer.write_all(&prefix)?;
        self.writer.write_all(frame)
    }

    pub(crate) fn close(self) {
        let filename = self.filename;
        let mut writer = self.writer;

        if let Err(e) = writer.flush() {
            log::error!("error flushing recording {filename}: {e}");
        } else {
            log::info!("closed recording {filename}");
        }
    }
}

/// The four per-session recorder slots, guarded by the session's
/// recording mutex.
#[derive(Default)]
pub(crate) struct Recorders {
    pub(crate) audio: Option<Recorder>,
    pub(crate) video: Option<Recorder>,
    pub(crate) peer_audio: Option<Recorder>,
    pub(crate) peer_video: Option<Recorder>,
}

impl Recorders {
    pub(crate) fn close_all(&mut self) {
        for recorder in [
            self.audio.take(),
            self.video.take(),
            self.peer_audio.take(),
            self.peer_video.take(),
        ]
        .into_iter()
        .flatten()
        {
            recorder.close();
        }
    }

    pub(crate) fn any_open(&self) -> bool {
        self.audio.is_some()
            || self.video.is_some()
            || self.peer_audio.is_some()
            || self.peer_video.is_some()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Best effort: a failed write is logged and the frame dropped, recording
/// never interferes with the relay.
pub(crate) fn save_frame(slot: &mut Option<Recorder>, frame: &[u8]) {
    if let Some(recorder) = slot {
        if let Err(e) = recorder.save_frame(frame) {
            log::warn!("error saving frame to {}: {e}", recorder.filename);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn header_and_frames() {
        let dir = std::env::temp_dir().join(format!("nosip-rec-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let base = dir.join("a").to_str().unwrap().to_string();

        let mut recorder = Recorder::create(Some("opus"), false, &base).unwrap();
        recorder.save_frame(&[1, 2, 3]).unwrap();
        recorder.save_frame(&[4, 5]).unwrap();
        let filename = recorder.filename.clone();
        recorder.close();

        let data = fs::read(&filename).unwrap();
        let newline = data.iter().position(|&b| b == b'\n').unwrap();

        let header: serde_json::Value = serde_json::from_slice(&data[..newline]).unwrap();
        assert_eq!(header["codec"], "opus");
        assert_eq!(header["type"], "audio");

        let frames = &data[newline + 1..];
        assert_eq!(BigEndian::read_u16(&frames[0..2]), 3);
        assert_eq!(&frames[2..5], &[1, 2, 3]);
        assert_eq!(BigEndian::read_u16(&frames[5..7]), 2);

        fs::remove_dir_all(&dir).unwrap();
    }
}
