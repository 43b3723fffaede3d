//! Conversion rule table
//!
//! A rule is keyed by the `(type, nparams)` pair that identifies one
//! historical layout and says how to turn an event in that layout into the
//! next layout. Layouts with no rule are current.

use std::collections::HashMap;
use syscap_core::EventType;
use thiserror::Error;

/// How to produce one parameter of the output layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamInstr {
    /// Copy parameter `i` of the event being converted
    FromOld(usize),
    /// Copy parameter `i` of the stashed partner event, empty if there is none
    FromPartner(usize),
    /// Empty value
    Empty,
    /// Fixed value
    Default(Vec<u8>),
    /// Integer parameter whose width grew between layouts
    Widen {
        index: usize,
        from: usize,
        to: usize,
        signed: bool,
    },
}

impl ParamInstr {
    pub fn default_u32(value: u32) -> Self {
        ParamInstr::Default(value.to_le_bytes().to_vec())
    }

    pub fn default_i64(value: i64) -> Self {
        ParamInstr::Default(value.to_le_bytes().to_vec())
    }
}

/// Output layout of a conversion step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub event_type: u16,
    pub params: Vec<ParamInstr>,
}

impl Layout {
    pub fn new(event_type: u16, params: Vec<ParamInstr>) -> Self {
        Self { event_type, params }
    }

    pub fn nparams(&self) -> u32 {
        self.params.len() as u32
    }
}

/// What a rule does with a legacy event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Rewrite into `Layout`; the output is checked again
    Rewrite(Layout),
    /// Keep the legacy event as the partner of a later event on the same
    /// thread, and emit it in `Layout`
    Stash(Layout),
    /// Fold the stashed partner of type `partner` into `layout`; final
    Merge { partner: u16, layout: Layout },
    /// Emit `first` now and hold `second` for the next pull
    Split { first: Layout, second: Layout },
}

/// Rule definition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("a rule for type {event_type} with {nparams} params already exists")]
    Duplicate { event_type: u16, nparams: u32 },

    #[error("instruction reads parameter {index} of a {nparams}-parameter layout")]
    SourceOutOfRange { index: usize, nparams: u32 },

    #[error("cannot widen a {from}-byte integer to {to} bytes")]
    InvalidWidth { from: usize, to: usize },
}

/// Rules keyed by source layout
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: HashMap<(u16, u32), Action>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rule for events of `event_type` carrying `nparams`
    pub fn insert(&mut self, event_type: u16, nparams: u32, action: Action) -> Result<(), RuleError> {
        if self.rules.contains_key(&(event_type, nparams)) {
            return Err(RuleError::Duplicate { event_type, nparams });
        }

        let layouts: Vec<&Layout> = match &action {
            Action::Rewrite(layout) | Action::Stash(layout) => vec![layout],
            Action::Merge { layout, .. } => vec![layout],
            Action::Split { first, second } => vec![first, second],
        };
        for instr in layouts.iter().flat_map(|l| l.params.iter()) {
            match instr {
                ParamInstr::FromOld(index) if *index >= nparams as usize => {
                    return Err(RuleError::SourceOutOfRange { index: *index, nparams });
                }
                ParamInstr::Widen { index, from, to, .. } => {
                    if *index >= nparams as usize {
                        return Err(RuleError::SourceOutOfRange { index: *index, nparams });
                    }
                    let widths = [1, 2, 4, 8];
                    if !widths.contains(from) || !widths.contains(to) || to < from {
                        return Err(RuleError::InvalidWidth { from: *from, to: *to });
                    }
                }
                ParamInstr::FromOld(_)
                | ParamInstr::FromPartner(_)
                | ParamInstr::Empty
                | ParamInstr::Default(_) => {}
            }
        }

        self.rules.insert((event_type, nparams), action);
        Ok(())
    }

    pub fn get(&self, event_type: u16, nparams: u32) -> Option<&Action> {
        self.rules.get(&(event_type, nparams))
    }

    pub fn contains(&self, event_type: u16, nparams: u32) -> bool {
        self.rules.contains_key(&(event_type, nparams))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules for the legacy layouts of the built-in catalog
    pub fn legacy() -> Self {
        use EventType::*;
        use ParamInstr::*;

        let rules = [
            // setreuid: ruid/euid moved from enter to exit
            (
                SetreuidE,
                2,
                Action::Stash(Layout::new(SetreuidE.code(), vec![])),
            ),
            (
                SetreuidX,
                1,
                Action::Merge {
                    partner: SetreuidE.code(),
                    layout: Layout::new(
                        SetreuidX.code(),
                        vec![FromOld(0), FromPartner(0), FromPartner(1)],
                    ),
                },
            ),
            // read: fd/size moved from enter to exit
            (
                ReadE,
                2,
                Action::Stash(Layout::new(ReadE.code(), vec![])),
            ),
            (
                ReadX,
                2,
                Action::Merge {
                    partner: ReadE.code(),
                    layout: Layout::new(
                        ReadX.code(),
                        vec![FromOld(0), FromOld(1), FromPartner(0), FromPartner(1)],
                    ),
                },
            ),
            // mmap: 32-bit result widened, protection flags added
            (
                MmapX,
                1,
                Action::Rewrite(Layout::new(
                    MmapX.code(),
                    vec![
                        Widen {
                            index: 0,
                            from: 4,
                            to: 8,
                            signed: true,
                        },
                        ParamInstr::default_u32(0),
                    ],
                )),
            ),
            // clone: the child-side exit used to ride along with the parent's
            (
                CloneX,
                3,
                Action::Split {
                    first: Layout::new(CloneX.code(), vec![FromOld(0), FromOld(1)]),
                    second: Layout::new(
                        CloneChildX.code(),
                        vec![ParamInstr::default_i64(0), FromOld(2)],
                    ),
                },
            ),
        ];

        let mut table = Self::new();
        for (event_type, nparams, action) in rules {
            let inserted = table.insert(event_type.code(), nparams, action);
            debug_assert!(inserted.is_ok(), "invalid built-in rule: {:?}", inserted);
        }
        table
    }
}
