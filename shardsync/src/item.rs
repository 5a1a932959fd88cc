use crate::error::{Result, SyncError};
use crate::types::DataType;

/// One persisted piece of optimizer or training state: raw bytes plus the
/// element type they hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointItem {
    pub name: String,
    pub dtype: DataType,
    pub bytes: Vec<u8>,
}

impl CheckpointItem {
    pub fn new(name: impl Into<String>, dtype: DataType, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dtype,
            bytes,
        }
    }

    /// An item holding `values` as native-endian f32.
    pub fn from_f32(name: impl Into<String>, values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
        Self::new(name, DataType::F32, bytes)
    }

    /// The payload reinterpreted as f32 values.
    pub fn to_f32(&self) -> Vec<f32> {
        self.bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of whole elements in the payload.
    pub fn num_elements(&self) -> usize {
        self.bytes.len() / self.dtype.size_in_bytes()
    }

    /// Concatenate `other`'s payload onto this one.
    pub fn append(&mut self, other: &CheckpointItem) -> Result<()> {
        if other.dtype != self.dtype {
            return Err(SyncError::ItemMismatch {
                reason: format!(
                    "cannot append {} item '{}' to {} item '{}'",
                    other.dtype, other.name, self.dtype, self.name
                ),
            });
        }
        self.bytes.extend_from_slice(&other.bytes);
        Ok(())
    }

    /// Encode as `[dtype: u8][name_len: u32 LE][name][payload]`.
    pub fn to_frame(&self) -> Vec<u8> {
        let name = self.name.as_bytes();
        let mut frame = Vec::with_capacity(1 + 4 + name.len() + self.bytes.len());
        frame.push(self.dtype as u8);
        frame.extend_from_slice(&(name.len() as u32).to_le_bytes());
        frame.extend_from_slice(name);
        frame.extend_from_slice(&self.bytes);
        frame
    }

    /// Decode a frame produced by [`to_frame`](Self::to_frame).
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let malformed = |what: &str| SyncError::messaging(format!("malformed checkpoint frame: {what}"));
        if frame.len() < 5 {
            return Err(malformed("truncated header"));
        }
        let dtype = DataType::from_tag(frame[0]).ok_or_else(|| malformed("unknown dtype tag"))?;
        let name_len = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        let rest = &frame[5..];
        if rest.len() < name_len {
            return Err(malformed("truncated name"));
        }
        let name = String::from_utf8_lossy(&rest[..name_len]).into_owned();
        Ok(Self {
            name,
            dtype,
            bytes: rest[name_len..].to_vec(),
        })
    }
}
