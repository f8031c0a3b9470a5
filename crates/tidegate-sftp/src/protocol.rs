//! SFTP wire protocol (version 3, draft-ietf-secsh-filexfer-02).
//!
//! The protocol runs inside the SSH "sftp" subsystem channel. Every
//! packet is `uint32 length, byte type, payload`; SSH channel data can
//! fragment or coalesce packets arbitrarily, so [`PacketDecoder`]
//! reassembles them before dispatch.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Protocol version spoken by the server
pub const SFTP_VERSION: u32 = 3;

/// Extensions declared in the VERSION reply
pub const SFTP_EXTENSIONS: &[(&str, &str)] = &[("posix-rename@openssh.com", "1")];

/// SFTP message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            201 => Ok(MessageType::ExtendedReply),
            _ => Err(Error::Protocol(format!("unknown message type: {}", value))),
        }
    }
}

/// SFTP status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// File open flags from the OPEN request
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x00000001;
    pub const WRITE: u32 = 0x00000002;
    pub const APPEND: u32 = 0x00000004;
    pub const CREAT: u32 = 0x00000008;
    pub const TRUNC: u32 = 0x00000010;
    pub const EXCL: u32 = 0x00000020;

    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// File attributes as encoded on the wire
#[derive(Debug, Clone, Default)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x00000001;
    const FLAG_UIDGID: u32 = 0x00000002;
    const FLAG_PERMISSIONS: u32 = 0x00000004;
    const FLAG_ACMODTIME: u32 = 0x00000008;

    const S_IFDIR: u32 = 0o040000;
    const S_IFREG: u32 = 0o100000;
    const S_IFLNK: u32 = 0o120000;

    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let (mode, uid, gid) = {
            use std::os::unix::fs::MetadataExt;
            (metadata.mode(), Some(metadata.uid()), Some(metadata.gid()))
        };
        #[cfg(not(unix))]
        let (mode, uid, gid) = {
            let kind = if metadata.is_dir() {
                Self::S_IFDIR | 0o755
            } else {
                Self::S_IFREG | 0o644
            };
            (kind, None, None)
        };
        let times = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32)
        };
        FileAttrs {
            size: Some(metadata.len()),
            uid,
            gid,
            permissions: Some(mode),
            atime: times(metadata.accessed()),
            mtime: times(metadata.modified()),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.permissions
            .map(|m| m & 0o170000 == Self::S_IFDIR)
            .unwrap_or(false)
    }

    pub fn is_symlink(&self) -> bool {
        self.permissions
            .map(|m| m & 0o170000 == Self::S_IFLNK)
            .unwrap_or(false)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("insufficient data for attr flags".into()));
        }

        let flags = buf.get_u32();
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            if buf.remaining() < 8 {
                return Err(Error::Protocol("insufficient data for size".into()));
            }
            attrs.size = Some(buf.get_u64());
        }
        if flags & Self::FLAG_UIDGID != 0 {
            if buf.remaining() < 8 {
                return Err(Error::Protocol("insufficient data for uid/gid".into()));
            }
            attrs.uid = Some(buf.get_u32());
            attrs.gid = Some(buf.get_u32());
        }
        if flags & Self::FLAG_PERMISSIONS != 0 {
            if buf.remaining() < 4 {
                return Err(Error::Protocol("insufficient data for permissions".into()));
            }
            attrs.permissions = Some(buf.get_u32());
        }
        if flags & Self::FLAG_ACMODTIME != 0 {
            if buf.remaining() < 8 {
                return Err(Error::Protocol("insufficient data for times".into()));
            }
            attrs.atime = Some(buf.get_u32());
            attrs.mtime = Some(buf.get_u32());
        }

        Ok(attrs)
    }
}

/// Reassembles SFTP packets from SSH channel data
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: BytesMut,
}

impl PacketDecoder {
    /// Hard cap on a single packet, far above the 32 KiB transfer chunks
    /// real clients use
    pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete packet as (type, payload), or None if more data is
    /// needed
    pub fn next_packet(&mut self) -> Result<Option<(u8, Bytes)>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err(Error::Protocol("zero-length packet".into()));
        }
        if len > Self::MAX_PACKET_SIZE {
            return Err(Error::Protocol(format!("packet too large: {} bytes", len)));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        self.buf.advance(4);
        let msg_type = self.buf[0];
        self.buf.advance(1);
        let payload = self.buf.split_to(len - 1).freeze();
        Ok(Some((msg_type, payload)))
    }
}

/// Prefix a reply body with its length
pub fn frame(body: BytesMut) -> Bytes {
    let mut framed = BytesMut::with_capacity(body.len() + 4);
    framed.put_u32(body.len() as u32);
    framed.extend_from_slice(&body);
    framed.freeze()
}

/// Reply builders. Each returns a complete, framed packet.
pub mod reply {
    use super::*;

    pub fn version() -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Version as u8);
        body.put_u32(SFTP_VERSION);
        for (name, value) in SFTP_EXTENSIONS {
            codec::put_string(&mut body, name);
            codec::put_string(&mut body, value);
        }
        frame(body)
    }

    pub fn status(request_id: u32, code: StatusCode, msg: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Status as u8);
        body.put_u32(request_id);
        body.put_u32(code.into());
        codec::put_string(&mut body, msg);
        codec::put_string(&mut body, "en");
        frame(body)
    }

    pub fn handle(request_id: u32, handle: &str) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Handle as u8);
        body.put_u32(request_id);
        codec::put_string(&mut body, handle);
        frame(body)
    }

    pub fn data(request_id: u32, payload: &[u8]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Data as u8);
        body.put_u32(request_id);
        codec::put_bytes(&mut body, payload);
        frame(body)
    }

    pub fn attrs(request_id: u32, attrs: &FileAttrs) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Attrs as u8);
        body.put_u32(request_id);
        body.put(attrs.encode());
        frame(body)
    }

    pub fn name(request_id: u32, entries: &[(String, FileAttrs)]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u8(MessageType::Name as u8);
        body.put_u32(request_id);
        body.put_u32(entries.len() as u32);
        for (name, attrs) in entries {
            codec::put_string(&mut body, name);
            codec::put_string(&mut body, &format_longname(name, attrs));
            body.put(attrs.encode());
        }
        frame(body)
    }
}

/// `ls -l` style longname for NAME replies
pub fn format_longname(name: &str, attrs: &FileAttrs) -> String {
    let mode = attrs.permissions.unwrap_or(0);
    let kind = match mode & 0o170000 {
        FileAttrs::S_IFDIR => 'd',
        FileAttrs::S_IFLNK => 'l',
        _ => '-',
    };
    let mut perms = String::with_capacity(9);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    format!(
        "{}{} {:>3} {:<8} {:<8} {:>8} {}",
        kind,
        perms,
        1,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        name
    )
}

/// String/byte helpers for the length-prefixed SFTP encoding
pub mod codec {
    use super::{Error, Result};
    use bytes::{Buf, BufMut, BytesMut};

    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    pub fn get_string(buf: &mut &[u8]) -> Result<String> {
        let bytes = get_bytes(buf)?;
        String::from_utf8(bytes).map_err(|e| Error::Protocol(format!("invalid UTF-8: {}", e)))
    }

    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    pub fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("insufficient data for length".into()));
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::Protocol("insufficient data for value".into()));
        }
        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }

    pub fn get_u32(buf: &mut &[u8]) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(Error::Protocol("insufficient data for u32".into()));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(Error::Protocol("insufficient data for u64".into()));
        }
        Ok(buf.get_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packet(msg_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((payload.len() + 1) as u32).to_be_bytes());
        out.push(msg_type);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_decoder_single_packet() {
        let mut decoder = PacketDecoder::new();
        decoder.push(&make_packet(MessageType::Init as u8, &3u32.to_be_bytes()));
        let (ty, payload) = decoder.next_packet().unwrap().unwrap();
        assert_eq!(ty, MessageType::Init as u8);
        assert_eq!(&payload[..], &3u32.to_be_bytes());
        assert!(decoder.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_decoder_fragmented_packet() {
        let packet = make_packet(MessageType::Open as u8, b"payload");
        let mut decoder = PacketDecoder::new();
        decoder.push(&packet[..3]);
        assert!(decoder.next_packet().unwrap().is_none());
        decoder.push(&packet[3..7]);
        assert!(decoder.next_packet().unwrap().is_none());
        decoder.push(&packet[7..]);
        let (ty, payload) = decoder.next_packet().unwrap().unwrap();
        assert_eq!(ty, MessageType::Open as u8);
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn test_decoder_coalesced_packets() {
        let mut bytes = make_packet(MessageType::Init as u8, &3u32.to_be_bytes());
        bytes.extend_from_slice(&make_packet(MessageType::Stat as u8, b"x"));
        let mut decoder = PacketDecoder::new();
        decoder.push(&bytes);
        assert_eq!(
            decoder.next_packet().unwrap().unwrap().0,
            MessageType::Init as u8
        );
        assert_eq!(
            decoder.next_packet().unwrap().unwrap().0,
            MessageType::Stat as u8
        );
        assert!(decoder.next_packet().unwrap().is_none());
    }

    #[test]
    fn test_decoder_rejects_oversize() {
        let mut decoder = PacketDecoder::new();
        decoder.push(&(64u32 * 1024 * 1024).to_be_bytes());
        decoder.push(&[3u8]);
        assert!(decoder.next_packet().is_err());
    }

    #[test]
    fn test_attrs_roundtrip() {
        let attrs = FileAttrs {
            size: Some(12345),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o100644),
            atime: Some(1_600_000_000),
            mtime: Some(1_600_000_001),
        };
        let encoded = attrs.encode();
        let mut slice: &[u8] = &encoded;
        let decoded = FileAttrs::decode(&mut slice).unwrap();
        assert_eq!(decoded.size, attrs.size);
        assert_eq!(decoded.permissions, attrs.permissions);
        assert_eq!(decoded.mtime, attrs.mtime);
        assert!(!decoded.is_dir());
    }

    #[test]
    fn test_version_reply_declares_posix_rename() {
        let reply = reply::version();
        let needle = b"posix-rename@openssh.com";
        assert!(reply
            .windows(needle.len())
            .any(|window| window == needle));
    }

    #[test]
    fn test_string_codec() {
        let mut buf = BytesMut::new();
        codec::put_string(&mut buf, "hello");
        let mut slice: &[u8] = &buf;
        assert_eq!(codec::get_string(&mut slice).unwrap(), "hello");
        assert!(slice.is_empty());

        let mut short: &[u8] = &[0, 0, 0, 9, b'x'];
        assert!(codec::get_string(&mut short).is_err());
    }

    #[test]
    fn test_longname_shape() {
        let attrs = FileAttrs {
            size: Some(42),
            uid: Some(0),
            gid: Some(0),
            permissions: Some(0o040755),
            atime: None,
            mtime: None,
        };
        let longname = format_longname("dir", &attrs);
        assert!(longname.starts_with("drwxr-xr-x"));
        assert!(longname.ends_with("dir"));
    }
}
