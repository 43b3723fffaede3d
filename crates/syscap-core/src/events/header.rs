//! Event header and borrowed event view

use super::EventError;

/// Size of the packed event header in bytes
pub const EVENT_HEADER_LEN: usize = 26;

/// Size of one entry in the parameter length table
pub const PARAM_LEN_SIZE: usize = 2;

/// Packed event header
///
/// Layout (little-endian, no padding):
/// - ts: u64 (0..8)
/// - tid: u64 (8..16)
/// - len: u32 (16..20)
/// - event_type: u16 (20..22)
/// - nparams: u32 (22..26)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventHeader {
    /// Timestamp in nanoseconds
    pub ts: u64,
    /// Thread ID (execution context)
    pub tid: u64,
    /// Total event length including header and length table
    pub len: u32,
    /// Event type code
    pub event_type: u16,
    /// Number of parameters
    pub nparams: u32,
}

impl EventHeader {
    /// Decode a header from the first `EVENT_HEADER_LEN` bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, EventError> {
        if bytes.len() < EVENT_HEADER_LEN {
            return Err(EventError::TooShort {
                needed: EVENT_HEADER_LEN,
                available: bytes.len(),
            });
        }

        Ok(Self {
            ts: read_u64(bytes, 0),
            tid: read_u64(bytes, 8),
            len: read_u32(bytes, 16),
            event_type: u16::from_le_bytes([bytes[20], bytes[21]]),
            nparams: read_u32(bytes, 22),
        })
    }

    /// Encode the header
    pub fn encode(&self) -> [u8; EVENT_HEADER_LEN] {
        let mut out = [0u8; EVENT_HEADER_LEN];
        out[0..8].copy_from_slice(&self.ts.to_le_bytes());
        out[8..16].copy_from_slice(&self.tid.to_le_bytes());
        out[16..20].copy_from_slice(&self.len.to_le_bytes());
        out[20..22].copy_from_slice(&self.event_type.to_le_bytes());
        out[22..26].copy_from_slice(&self.nparams.to_le_bytes());
        out
    }

    /// Offset of the first parameter value
    pub fn params_offset(&self) -> Option<usize> {
        (self.nparams as usize)
            .checked_mul(PARAM_LEN_SIZE)
            .and_then(|table| table.checked_add(EVENT_HEADER_LEN))
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

/// A validated, borrowed event
///
/// The view never copies: `as_bytes()` is exactly the `len` bytes the header
/// declares, aliasing whatever memory the event was framed from.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EventView<'a> {
    header: EventHeader,
    bytes: &'a [u8],
}

impl<'a> EventView<'a> {
    /// Validate `bytes` as an event and borrow it
    ///
    /// `bytes` may be longer than the event (trailing padding of the
    /// enclosing record); the view is trimmed to the declared length.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, EventError> {
        let header = EventHeader::parse(bytes)?;
        let len = header.len as usize;

        let params_offset = header
            .params_offset()
            .filter(|offset| *offset <= len)
            .ok_or(EventError::ParamTableOverrun {
                nparams: header.nparams,
                len,
            })?;

        if len > bytes.len() {
            return Err(EventError::LengthOverrun {
                declared: len,
                available: bytes.len(),
            });
        }

        let bytes = &bytes[..len];
        let mut end = params_offset;
        for index in 0..header.nparams as usize {
            let at = EVENT_HEADER_LEN + index * PARAM_LEN_SIZE;
            end += u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize;
            if end > len {
                return Err(EventError::ParamOverrun { index, end, len });
            }
        }

        Ok(Self { header, bytes })
    }

    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    pub fn ts(&self) -> u64 {
        self.header.ts
    }

    pub fn tid(&self) -> u64 {
        self.header.tid
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn event_type(&self) -> u16 {
        self.header.event_type
    }

    pub fn nparams(&self) -> u32 {
        self.header.nparams
    }

    /// The raw event bytes, exactly `len` long
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Length of parameter `index`
    pub fn param_len(&self, index: usize) -> Option<usize> {
        if index >= self.header.nparams as usize {
            return None;
        }
        let at = EVENT_HEADER_LEN + index * PARAM_LEN_SIZE;
        Some(u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as usize)
    }

    /// Value of parameter `index`
    pub fn param(&self, index: usize) -> Option<&'a [u8]> {
        self.params().nth(index)
    }

    /// Iterate over parameter values in order
    pub fn params(&self) -> Params<'a> {
        Params {
            bytes: self.bytes,
            nparams: self.header.nparams as usize,
            index: 0,
            // Validated in parse()
            offset: EVENT_HEADER_LEN + self.header.nparams as usize * PARAM_LEN_SIZE,
        }
    }

    /// Decode parameter `index` as a little-endian signed integer of its
    /// stored width (1, 2, 4 or 8 bytes)
    pub fn param_i64(&self, index: usize) -> Option<i64> {
        let value = self.param(index)?;
        Some(match value.len() {
            1 => value[0] as i8 as i64,
            2 => i16::from_le_bytes([value[0], value[1]]) as i64,
            4 => i32::from_le_bytes([value[0], value[1], value[2], value[3]]) as i64,
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(value);
                i64::from_le_bytes(raw)
            }
            _ => return None,
        })
    }

    /// Decode parameter `index` as a little-endian unsigned integer of its
    /// stored width (1, 2, 4 or 8 bytes)
    pub fn param_u64(&self, index: usize) -> Option<u64> {
        let value = self.param(index)?;
        Some(match value.len() {
            1 => value[0] as u64,
            2 => u16::from_le_bytes([value[0], value[1]]) as u64,
            4 => u32::from_le_bytes([value[0], value[1], value[2], value[3]]) as u64,
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(value);
                u64::from_le_bytes(raw)
            }
            _ => return None,
        })
    }
}

impl std::fmt::Debug for EventView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventView")
            .field("ts", &self.header.ts)
            .field("tid", &self.header.tid)
            .field("len", &self.header.len)
            .field("type", &super::catalog::type_name(self.header.event_type))
            .field("nparams", &self.header.nparams)
            .finish()
    }
}

/// Iterator over the parameter values of an event
pub struct Params<'a> {
    bytes: &'a [u8],
    nparams: usize,
    index: usize,
    offset: usize,
}

impl<'a> Iterator for Params<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.nparams {
            return None;
        }
        let at = EVENT_HEADER_LEN + self.index * PARAM_LEN_SIZE;
        let len = u16::from_le_bytes([self.bytes[at], self.bytes[at + 1]]) as usize;
        let value = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.nparams - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Params<'_> {}
