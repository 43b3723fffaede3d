//! Event encoding

use super::header::{EventHeader, EVENT_HEADER_LEN, PARAM_LEN_SIZE};
use super::EventError;

/// Largest value a single parameter can carry
pub const MAX_PARAM_LEN: usize = u16::MAX as usize;

/// Streaming event writer over a caller-owned buffer
///
/// Used wherever events are synthesized into scratch memory (the converter
/// writes every rewritten layout through this). The buffer is cleared on
/// `begin` and reused across events without reallocation.
pub struct EventWriter<'b> {
    out: &'b mut Vec<u8>,
    nparams: usize,
    written: usize,
}

impl<'b> EventWriter<'b> {
    /// Start a new event with room for `nparams` parameters
    pub fn begin(out: &'b mut Vec<u8>, ts: u64, tid: u64, event_type: u16, nparams: u32) -> Self {
        out.clear();
        let header = EventHeader {
            ts,
            tid,
            len: 0,
            event_type,
            nparams,
        };
        out.extend_from_slice(&header.encode());
        out.resize(EVENT_HEADER_LEN + nparams as usize * PARAM_LEN_SIZE, 0);
        Self {
            out,
            nparams: nparams as usize,
            written: 0,
        }
    }

    /// Append the next parameter value
    pub fn push_param(&mut self, value: &[u8]) -> Result<(), EventError> {
        if self.written >= self.nparams {
            return Err(EventError::ParamTableOverrun {
                nparams: self.nparams as u32,
                len: self.out.len(),
            });
        }
        if value.len() > MAX_PARAM_LEN {
            return Err(EventError::ParamTooLong {
                index: self.written,
                len: value.len(),
                max: MAX_PARAM_LEN,
            });
        }

        let at = EVENT_HEADER_LEN + self.written * PARAM_LEN_SIZE;
        self.out[at..at + PARAM_LEN_SIZE].copy_from_slice(&(value.len() as u16).to_le_bytes());
        self.out.extend_from_slice(value);
        self.written += 1;
        Ok(())
    }

    /// Patch the total length into the header
    ///
    /// Fails if fewer parameters were pushed than announced in `begin`.
    pub fn finish(self) -> Result<usize, EventError> {
        if self.written != self.nparams {
            return Err(EventError::ParamTableOverrun {
                nparams: self.nparams as u32,
                len: self.out.len(),
            });
        }
        let len = self.out.len();
        let len32 = u32::try_from(len).map_err(|_| EventError::LengthOverrun {
            declared: len,
            available: u32::MAX as usize,
        })?;
        self.out[16..20].copy_from_slice(&len32.to_le_bytes());
        Ok(len)
    }
}

/// Owned event builder
///
/// Convenience front-end for producers and tests. Parameter values longer
/// than `MAX_PARAM_LEN` are truncated, the way the kernel side clips
/// captured buffers to the snapshot length.
#[derive(Debug, Clone, Default)]
pub struct EventBuilder {
    ts: u64,
    tid: u64,
    event_type: u16,
    params: Vec<Vec<u8>>,
}

impl EventBuilder {
    pub fn new(event_type: u16) -> Self {
        Self {
            event_type,
            ..Default::default()
        }
    }

    pub fn ts(mut self, ts: u64) -> Self {
        self.ts = ts;
        self
    }

    pub fn tid(mut self, tid: u64) -> Self {
        self.tid = tid;
        self
    }

    pub fn param_bytes(mut self, value: &[u8]) -> Self {
        let len = value.len().min(MAX_PARAM_LEN);
        self.params.push(value[..len].to_vec());
        self
    }

    pub fn param_empty(self) -> Self {
        self.param_bytes(&[])
    }

    pub fn param_u32(self, value: u32) -> Self {
        self.param_bytes(&value.to_le_bytes())
    }

    pub fn param_i32(self, value: i32) -> Self {
        self.param_bytes(&value.to_le_bytes())
    }

    pub fn param_u64(self, value: u64) -> Self {
        self.param_bytes(&value.to_le_bytes())
    }

    pub fn param_i64(self, value: i64) -> Self {
        self.param_bytes(&value.to_le_bytes())
    }

    /// Encode the event
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.build_into(&mut out);
        out
    }

    /// Encode the event into `out`, replacing its contents
    pub fn build_into(&self, out: &mut Vec<u8>) {
        out.clear();
        let header = EventHeader {
            ts: self.ts,
            tid: self.tid,
            len: 0,
            event_type: self.event_type,
            nparams: self.params.len() as u32,
        };
        out.extend_from_slice(&header.encode());
        for param in &self.params {
            out.extend_from_slice(&(param.len() as u16).to_le_bytes());
        }
        for param in &self.params {
            out.extend_from_slice(param);
        }
        let len = out.len() as u32;
        out[16..20].copy_from_slice(&len.to_le_bytes());
    }
}
