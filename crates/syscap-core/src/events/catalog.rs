//! Event-type catalog
//!
//! The subset of the syscall event catalog this crate knows by name, with
//! the parameter count of each type's current layout. Events of types
//! outside the catalog still flow through the pipeline untouched.

/// Known event types
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// close() enter
    CloseE = 110,
    /// close() exit
    CloseX = 111,
    /// read() enter
    ReadE = 102,
    /// read() exit
    ReadX = 103,
    /// setreuid() enter
    SetreuidE = 100,
    /// setreuid() exit
    SetreuidX = 101,
    /// mmap() enter
    MmapE = 104,
    /// mmap() exit
    MmapX = 105,
    /// clone() enter
    CloneE = 106,
    /// clone() exit, parent side
    CloneX = 107,
    /// clone() exit, child side
    CloneChildX = 108,
}

impl EventType {
    pub const ALL: [EventType; 11] = [
        EventType::CloseE,
        EventType::CloseX,
        EventType::ReadE,
        EventType::ReadX,
        EventType::SetreuidE,
        EventType::SetreuidX,
        EventType::MmapE,
        EventType::MmapX,
        EventType::CloneE,
        EventType::CloneX,
        EventType::CloneChildX,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            EventType::CloseE => "close_e",
            EventType::CloseX => "close_x",
            EventType::ReadE => "read_e",
            EventType::ReadX => "read_x",
            EventType::SetreuidE => "setreuid_e",
            EventType::SetreuidX => "setreuid_x",
            EventType::MmapE => "mmap_e",
            EventType::MmapX => "mmap_x",
            EventType::CloneE => "clone_e",
            EventType::CloneX => "clone_x",
            EventType::CloneChildX => "clone_child_x",
        }
    }

    /// Parameter count of the current layout
    ///
    /// Enter events of syscalls whose arguments moved to the exit event
    /// carry no parameters.
    pub fn current_nparams(self) -> u32 {
        match self {
            // fd
            EventType::CloseE => 1,
            // res
            EventType::CloseX => 1,
            EventType::ReadE => 0,
            // res, data, fd, size
            EventType::ReadX => 4,
            EventType::SetreuidE => 0,
            // res, ruid, euid
            EventType::SetreuidX => 3,
            EventType::MmapE => 0,
            // res, vm_size
            EventType::MmapX => 2,
            EventType::CloneE => 0,
            // res (child tid), flags
            EventType::CloneX => 2,
            // res (always 0), ptid
            EventType::CloneChildX => 2,
        }
    }

    /// Whether this is the enter half of a syscall
    pub fn is_enter(self) -> bool {
        matches!(
            self,
            EventType::CloseE
                | EventType::ReadE
                | EventType::SetreuidE
                | EventType::MmapE
                | EventType::CloneE
        )
    }
}

impl TryFrom<u16> for EventType {
    type Error = u16;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.code() == code)
            .ok_or(code)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Name for a raw type code, `"unknown"` outside the catalog
pub fn type_name(code: u16) -> &'static str {
    EventType::try_from(code).map(EventType::name).unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for t in EventType::ALL {
            assert_eq!(EventType::try_from(t.code()), Ok(t));
        }
        assert_eq!(EventType::try_from(9999), Err(9999));
    }

    #[test]
    fn test_type_name() {
        assert_eq!(type_name(EventType::SetreuidX.code()), "setreuid_x");
        assert_eq!(type_name(1), "unknown");
    }
}
