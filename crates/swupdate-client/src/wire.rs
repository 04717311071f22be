//! Binary frames exchanged with the installer.
//!
//! Both layouts are fixed by the installer's C structs: native byte order,
//! no padding, fixed-width NUL-padded string fields. Nothing here validates
//! the magic number on progress frames since the installer never sets it
//! there.

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;

use crate::{Result, SwupdateError};

pub const IPC_MAGIC: u32 = 0x1405_2001;

const IMAGE_LEN: usize = 256;
const HANDLER_LEN: usize = 64;
const INFO_LEN: usize = 2048;
const CONTROL_BUF_LEN: usize = 2048;

/// Size of one progress frame on the wire.
pub const PROGRESS_FRAME_LEN: usize = 6 * 4 + IMAGE_LEN + HANDLER_LEN + 2 * 4 + INFO_LEN;

/// Size of one control frame on the wire.
pub const CONTROL_FRAME_LEN: usize = 6 * 4 + CONTROL_BUF_LEN;

const MSG_SUBPROCESS: i32 = 5;
const SOURCE_SURICATTA: i32 = 2;
const CMD_ENABLE: i32 = 2;

const REPLY_ACK: i32 = 1;
const REPLY_NACK: i32 = 2;

// ─── InstallerStatus ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerStatus {
    Idle,
    Start,
    Run,
    Success,
    Failure,
    Download,
    Done,
    Subprocess,
    /// Not sent by the installer: the process exited with an unexpected code.
    BadCommand,
    Other(i32),
}

impl InstallerStatus {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Idle,
            1 => Self::Start,
            2 => Self::Run,
            3 => Self::Success,
            4 => Self::Failure,
            5 => Self::Download,
            6 => Self::Done,
            7 => Self::Subprocess,
            8 => Self::BadCommand,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Idle => 0,
            Self::Start => 1,
            Self::Run => 2,
            Self::Success => 3,
            Self::Failure => 4,
            Self::Download => 5,
            Self::Done => 6,
            Self::Subprocess => 7,
            Self::BadCommand => 8,
            Self::Other(code) => code,
        }
    }
}

// ─── ProgressRecord ───────────────────────────────────────────────────────

/// The logical content of a progress report, as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub status: InstallerStatus,
    /// Image currently being installed, if any.
    pub image: Option<String>,
    pub info: String,
    /// Set only on synthetic [`InstallerStatus::BadCommand`] records.
    pub exit_code: Option<i32>,
}

impl ProgressRecord {
    pub fn bad_command(exit_code: i32) -> Self {
        Self {
            status: InstallerStatus::BadCommand,
            image: None,
            info: exit_code.to_string(),
            exit_code: Some(exit_code),
        }
    }
}

// ─── ProgressFrame ────────────────────────────────────────────────────────

/// Every field of a progress frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressFrame {
    pub magic: u32,
    pub status: i32,
    pub download_percent: u32,
    pub steps: u32,
    pub current_step: u32,
    pub step_percent: u32,
    pub image: String,
    pub handler: String,
    pub source: i32,
    pub info: String,
}

impl ProgressFrame {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PROGRESS_FRAME_LEN {
            return Err(SwupdateError::ShortFrame {
                expected: PROGRESS_FRAME_LEN,
                actual: buf.len(),
            });
        }
        let mut buf = &buf[..PROGRESS_FRAME_LEN];
        let magic = buf.get_u32_ne();
        let status = buf.get_i32_ne();
        let download_percent = buf.get_u32_ne();
        let steps = buf.get_u32_ne();
        let current_step = buf.get_u32_ne();
        let step_percent = buf.get_u32_ne();
        let image = take_str(&mut buf, IMAGE_LEN, IMAGE_LEN);
        let handler = take_str(&mut buf, HANDLER_LEN, HANDLER_LEN);
        let source = buf.get_i32_ne();
        let info_len = buf.get_u32_ne() as usize;
        let info = take_str(&mut buf, INFO_LEN, info_len);

        Ok(Self {
            magic,
            status,
            download_percent,
            steps,
            current_step,
            step_percent,
            image,
            handler,
            source,
            info,
        })
    }

    /// Encode in the installer's layout. Over-long strings are truncated.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PROGRESS_FRAME_LEN);
        buf.put_u32_ne(self.magic);
        buf.put_i32_ne(self.status);
        buf.put_u32_ne(self.download_percent);
        buf.put_u32_ne(self.steps);
        buf.put_u32_ne(self.current_step);
        buf.put_u32_ne(self.step_percent);
        put_str(&mut buf, &self.image, IMAGE_LEN);
        put_str(&mut buf, &self.handler, HANDLER_LEN);
        buf.put_i32_ne(self.source);
        let info_len = self.info.len().min(INFO_LEN);
        buf.put_u32_ne(info_len as u32);
        put_str(&mut buf, &self.info, INFO_LEN);
        buf
    }

    pub fn record(&self) -> ProgressRecord {
        ProgressRecord {
            status: InstallerStatus::from_code(self.status),
            image: (!self.image.is_empty()).then(|| self.image.clone()),
            info: self.info.clone(),
            exit_code: None,
        }
    }
}

// ─── Control frames ───────────────────────────────────────────────────────

#[derive(Serialize)]
struct EnablePayload {
    enable: bool,
}

/// Frame asking the installer's server client to enable or disable itself.
pub fn encode_enable(enable: bool) -> Result<BytesMut> {
    let payload = serde_json::to_vec(&EnablePayload { enable })?;
    if payload.len() > CONTROL_BUF_LEN {
        return Err(SwupdateError::PayloadTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(CONTROL_FRAME_LEN);
    buf.put_u32_ne(IPC_MAGIC);
    buf.put_i32_ne(MSG_SUBPROCESS);
    buf.put_i32_ne(SOURCE_SURICATTA);
    buf.put_i32_ne(CMD_ENABLE);
    buf.put_i32_ne(0); // timeout
    buf.put_u32_ne(payload.len() as u32);
    buf.put_slice(&payload);
    buf.put_bytes(0, CONTROL_BUF_LEN - payload.len());
    Ok(buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
    Unknown(i32),
}

/// Interpret the header of the installer's answer to a control frame.
pub fn decode_reply(buf: &[u8]) -> Option<Reply> {
    if buf.len() < 8 {
        return None;
    }
    let mut buf = buf;
    let _magic = buf.get_u32_ne();
    Some(match buf.get_i32_ne() {
        REPLY_ACK => Reply::Ack,
        REPLY_NACK => Reply::Nack,
        other => Reply::Unknown(other),
    })
}

// ─── Helpers ──────────────────────────────────────────────────────────────

/// Consume a `width`-byte field, keeping at most `limit` bytes up to the
/// first NUL.
fn take_str(buf: &mut &[u8], width: usize, limit: usize) -> String {
    let field = &buf[..width];
    let field = &field[..limit.min(width)];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let s = String::from_utf8_lossy(&field[..end]).into_owned();
    buf.advance(width);
    s
}

fn put_str(buf: &mut BytesMut, s: &str, width: usize) {
    let bytes = &s.as_bytes()[..s.len().min(width)];
    buf.put_slice(bytes);
    buf.put_bytes(0, width - bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes_match_installer_structs() {
        assert_eq!(PROGRESS_FRAME_LEN, 2400);
        assert_eq!(CONTROL_FRAME_LEN, 2072);
    }

    #[test]
    fn progress_field_offsets() {
        let frame = ProgressFrame {
            status: 3,
            download_percent: 40,
            steps: 2,
            current_step: 1,
            step_percent: 90,
            image: "rootfs.bin".into(),
            handler: "ubivol".into(),
            source: 2,
            info: "done".into(),
            ..Default::default()
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), PROGRESS_FRAME_LEN);
        assert_eq!(&bytes[4..8], &3i32.to_ne_bytes());
        assert_eq!(&bytes[24..34], b"rootfs.bin");
        assert_eq!(bytes[34], 0);
        assert_eq!(&bytes[280..286], b"ubivol");
        assert_eq!(&bytes[344..348], &2i32.to_ne_bytes());
        assert_eq!(&bytes[348..352], &4u32.to_ne_bytes());
        assert_eq!(&bytes[352..356], b"done");

        let decoded = ProgressFrame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn record_trims_padding_and_maps_status() {
        let frame = ProgressFrame {
            status: 1,
            ..Default::default()
        };
        let record = ProgressFrame::decode(&frame.encode()).unwrap().record();
        assert_eq!(record.status, InstallerStatus::Start);
        assert_eq!(record.image, None);
        assert_eq!(record.info, "");

        let frame = ProgressFrame {
            status: 42,
            image: "kernel.itb".into(),
            ..Default::default()
        };
        let record = frame.record();
        assert_eq!(record.status, InstallerStatus::Other(42));
        assert_eq!(record.image.as_deref(), Some("kernel.itb"));
    }

    #[test]
    fn info_is_bounded_by_length_field() {
        let mut bytes = ProgressFrame {
            info: "abcdef".into(),
            ..Default::default()
        }
        .encode();
        bytes[348..352].copy_from_slice(&3u32.to_ne_bytes());
        assert_eq!(ProgressFrame::decode(&bytes).unwrap().info, "abc");

        // A length beyond the buffer is clamped to it.
        bytes[348..352].copy_from_slice(&u32::MAX.to_ne_bytes());
        assert_eq!(ProgressFrame::decode(&bytes).unwrap().info, "abcdef");
    }

    #[test]
    fn short_frame_is_rejected() {
        let err = ProgressFrame::decode(&[0u8; 100]).unwrap_err();
        assert!(matches!(
            err,
            SwupdateError::ShortFrame {
                expected: 2400,
                actual: 100
            }
        ));
    }

    #[test]
    fn enable_frame_layout() {
        let bytes = encode_enable(true).unwrap();
        assert_eq!(bytes.len(), CONTROL_FRAME_LEN);
        assert_eq!(&bytes[0..4], &IPC_MAGIC.to_ne_bytes());
        assert_eq!(&bytes[4..8], &5i32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &2i32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &2i32.to_ne_bytes());
        assert_eq!(&bytes[16..20], &0i32.to_ne_bytes());
        let payload = br#"{"enable":true}"#;
        assert_eq!(&bytes[20..24], &(payload.len() as u32).to_ne_bytes());
        assert_eq!(&bytes[24..24 + payload.len()], payload);
        assert!(bytes[24 + payload.len()..].iter().all(|&b| b == 0));

        let off = encode_enable(false).unwrap();
        assert_eq!(&off[24..40], br#"{"enable":false}"#);
    }

    #[test]
    fn reply_types() {
        let mut ack = IPC_MAGIC.to_ne_bytes().to_vec();
        ack.extend_from_slice(&1i32.to_ne_bytes());
        assert_eq!(decode_reply(&ack), Some(Reply::Ack));

        let mut nack = IPC_MAGIC.to_ne_bytes().to_vec();
        nack.extend_from_slice(&2i32.to_ne_bytes());
        assert_eq!(decode_reply(&nack), Some(Reply::Nack));

        assert_eq!(decode_reply(&[1, 2, 3]), None);
    }

    #[test]
    fn bad_command_carries_exit_code() {
        let record = ProgressRecord::bad_command(2);
        assert_eq!(record.status, InstallerStatus::BadCommand);
        assert_eq!(record.status.code(), 8);
        assert_eq!(record.exit_code, Some(2));
    }
}
