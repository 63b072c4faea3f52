//! # Multi-Frame Message Model
//!
//! Every message between clients, coordinator and workers is a sequence of
//! frames. Logical fields are separated by zero-length frames, and a
//! non-empty frame where a separator is expected is a *fatal* protocol
//! violation: the strict separator makes decoding state-machine-free, so a
//! violation can only mean a bug in the counterpart.
//!
//! ## Message Shapes
//!
//! ```text
//! client -> coord:  [client-id][""][request]
//! coord  -> client: [client-id][""][reply]
//!
//! worker -> coord:  [worker-id][""][Ready]
//! worker -> coord:  [worker-id][""][Response][""][client-id][""][reply]
//! worker -> coord:  [worker-id][""][DatasetLockReq]([""][name])*[""][""]
//! worker -> coord:  [worker-id][""][IteratorLockReq][""][name][""]
//! coord  -> worker: [client-id][""][request]
//! coord  -> worker: [worker-id][""][LockOk|LockDenied]
//! ```
//!
//! [`NetAction`] and [`NetLockResp`] are serialized as fixed-width
//! little-endian u32 frames.
//!
//! The transport itself (channels here, sockets elsewhere) is interchangeable;
//! the framing discipline is not.

use crate::error::{Error, Result};

// =============================================================================
// Frames
// =============================================================================

/// One frame of a multipart message: a length-delimited byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// The zero-length separator frame.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Creates a frame from raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Creates a frame carrying a UTF-8 string.
    pub fn from_str(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }

    /// Whether this is a zero-length separator frame.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The raw frame bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decodes the frame as UTF-8.
    ///
    /// String fields (addresses, names, requests) are UTF-8 by contract, so
    /// a decode failure is a protocol violation, not a user error.
    pub fn to_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.0)
            .map_err(|_| Error::Protocol("frame is not valid UTF-8".to_string()))
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

/// A whole multipart message, delivered atomically by the transport.
pub type Multipart = Vec<Frame>;

// =============================================================================
// Frame Reader
// =============================================================================

/// Cursor over a received multipart message.
///
/// All accessors fail with [`Error::Protocol`] when the message is shorter
/// than expected or a separator carries payload. Callers propagate these
/// with `?` and terminate.
#[derive(Debug)]
pub struct FrameReader {
    frames: std::vec::IntoIter<Frame>,
}

impl FrameReader {
    /// Wraps a received message.
    pub fn new(message: Multipart) -> Self {
        Self {
            frames: message.into_iter(),
        }
    }

    /// Pops the next frame.
    pub fn next_frame(&mut self) -> Result<Frame> {
        self.frames
            .next()
            .ok_or_else(|| Error::Protocol("truncated message".to_string()))
    }

    /// Pops the next frame and decodes it as UTF-8.
    pub fn next_str(&mut self) -> Result<String> {
        Ok(self.next_frame()?.to_str()?.to_string())
    }

    /// Pops the next frame and asserts it is a zero-length separator.
    ///
    /// This is the protocol assertion at the heart of the framing
    /// discipline.
    pub fn expect_empty(&mut self) -> Result<()> {
        let frame = self.next_frame()?;
        if !frame.is_empty() {
            return Err(Error::Protocol(
                "expected zero-size frame".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether any frames remain.
    pub fn is_exhausted(&self) -> bool {
        self.frames.len() == 0
    }
}

// =============================================================================
// Action Codes
// =============================================================================

/// Worker-to-coordinator action selector on the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetAction {
    /// Worker is idle and ready for a task.
    Ready,
    /// Worker finished a task; a reply for the client follows.
    Response,
    /// Worker requests an atomic set of dataset locks.
    DatasetLockReq,
    /// Worker requests a single iterator lock.
    IteratorLockReq,
}

impl NetAction {
    /// Encodes the action as a fixed-width little-endian u32 frame.
    pub fn encode(self) -> Frame {
        let code: u32 = match self {
            NetAction::Ready => 0,
            NetAction::Response => 1,
            NetAction::DatasetLockReq => 2,
            NetAction::IteratorLockReq => 3,
        };
        Frame::from_bytes(code.to_le_bytes().to_vec())
    }

    /// Decodes an action frame.
    ///
    /// A wrong frame width or unknown code is a protocol violation.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let bytes: [u8; 4] = frame
            .as_bytes()
            .try_into()
            .map_err(|_| Error::Protocol("malformed action frame".to_string()))?;
        match u32::from_le_bytes(bytes) {
            0 => Ok(NetAction::Ready),
            1 => Ok(NetAction::Response),
            2 => Ok(NetAction::DatasetLockReq),
            3 => Ok(NetAction::IteratorLockReq),
            code => Err(Error::Protocol(format!("unknown action code {}", code))),
        }
    }
}

/// Coordinator-to-worker verdict on a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetLockResp {
    /// Every requested lock was granted, atomically.
    LockOk,
    /// At least one requested name is held by another active task; nothing
    /// was granted.
    LockDenied,
}

impl NetLockResp {
    /// Encodes the verdict as a fixed-width little-endian u32 frame.
    pub fn encode(self) -> Frame {
        let code: u32 = match self {
            NetLockResp::LockOk => 0,
            NetLockResp::LockDenied => 1,
        };
        Frame::from_bytes(code.to_le_bytes().to_vec())
    }

    /// Decodes a verdict frame.
    pub fn decode(frame: &Frame) -> Result<Self> {
        let bytes: [u8; 4] = frame
            .as_bytes()
            .try_into()
            .map_err(|_| Error::Protocol("malformed lock response frame".to_string()))?;
        match u32::from_le_bytes(bytes) {
            0 => Ok(NetLockResp::LockOk),
            1 => Ok(NetLockResp::LockDenied),
            code => Err(Error::Protocol(format!(
                "unknown lock response code {}",
                code
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_roundtrip() {
        for action in [
            NetAction::Ready,
            NetAction::Response,
            NetAction::DatasetLockReq,
            NetAction::IteratorLockReq,
        ] {
            assert_eq!(NetAction::decode(&action.encode()).unwrap(), action);
        }
    }

    #[test]
    fn test_lock_resp_roundtrip() {
        for resp in [NetLockResp::LockOk, NetLockResp::LockDenied] {
            assert_eq!(NetLockResp::decode(&resp.encode()).unwrap(), resp);
        }
    }

    #[test]
    fn test_action_decode_rejects_garbage() {
        // Wrong width
        let err = NetAction::decode(&Frame::from_bytes(vec![1, 2])).unwrap_err();
        assert!(err.is_protocol());

        // Unknown code
        let err = NetAction::decode(&Frame::from_bytes(99u32.to_le_bytes().to_vec())).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_reader_happy_path() {
        let msg: Multipart = vec![
            Frame::from("worker-0"),
            Frame::empty(),
            Frame::from("payload"),
        ];
        let mut reader = FrameReader::new(msg);
        assert_eq!(reader.next_str().unwrap(), "worker-0");
        reader.expect_empty().unwrap();
        assert_eq!(reader.next_str().unwrap(), "payload");
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_reader_nonempty_separator_is_fatal() {
        let msg: Multipart = vec![Frame::from("worker-0"), Frame::from("oops")];
        let mut reader = FrameReader::new(msg);
        reader.next_str().unwrap();
        let err = reader.expect_empty().unwrap_err();
        assert!(err.is_protocol());
        assert!(err.to_string().contains("zero-size"));
    }

    #[test]
    fn test_reader_truncation_is_fatal() {
        let mut reader = FrameReader::new(vec![Frame::from("only")]);
        reader.next_frame().unwrap();
        let err = reader.next_frame().unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_invalid_utf8_is_fatal() {
        let frame = Frame::from_bytes(vec![0xff, 0xfe]);
        assert!(frame.to_str().unwrap_err().is_protocol());
    }
}
