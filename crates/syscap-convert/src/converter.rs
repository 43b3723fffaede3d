//! Schema Converter
//!
//! `convert` runs one rule over one event. `normalize` drives it until the
//! event is current, giving up after a bounded number of passes.

use crate::state::{ConversionState, PendingEvent, StashKind};
use crate::table::{Action, Layout, ParamInstr, RuleTable};
use std::collections::VecDeque;
use std::sync::Arc;
use syscap_core::config::{
    ConverterSettings, DEFAULT_MAX_CONVERSION_PASSES, DEFAULT_MAX_PENDING_CONTEXTS,
};
use syscap_core::events::{catalog, EventWriter};
use syscap_core::EventView;
use tracing::{debug, trace};

/// Outcome of one conversion pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionResult {
    /// Already current; use the input unchanged
    NotNeeded,
    /// Output written; it may need further passes
    Continue,
    /// Output written and final
    Terminal,
    /// The event cannot be converted and must not be delivered
    Failed(String),
}

/// Outcome of the pass loop
#[derive(Debug)]
pub enum Normalized<'a> {
    /// Input was current and is returned as is
    Unchanged(EventView<'a>),
    /// Converted event in scratch memory after `passes` passes
    Converted { event: EventView<'a>, passes: u32 },
    Failed { message: String, passes: u32 },
}

/// Ping-pong buffers for multi-pass conversion
#[derive(Debug, Default)]
pub struct Scratch {
    cur: Vec<u8>,
    next: Vec<u8>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Running totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConverterStats {
    pub converted: u64,
    pub failed: u64,
    pub passes: u64,
    pub last_passes: u32,
}

/// One change to Conversion State made during a pass
#[derive(Debug)]
struct StateChange {
    tid: u64,
    /// Kind of the entry the pass stored, if any
    stored: Option<StashKind>,
    /// Entry the pass removed or overwrote
    removed: Option<PendingEvent>,
}

/// Rewrites legacy events into the current layout
pub struct Converter {
    table: Arc<RuleTable>,
    state: ConversionState,
    max_passes: u32,
    /// Threads with a split remainder waiting, oldest first
    pending_splits: VecDeque<u64>,
    stats: ConverterStats,
}

impl Converter {
    pub fn new(table: Arc<RuleTable>) -> Self {
        Self::with_limits(table, DEFAULT_MAX_CONVERSION_PASSES, DEFAULT_MAX_PENDING_CONTEXTS)
    }

    pub fn with_limits(table: Arc<RuleTable>, max_passes: u32, max_pending_contexts: usize) -> Self {
        Self {
            table,
            state: ConversionState::new(max_pending_contexts),
            max_passes: max_passes.max(1),
            pending_splits: VecDeque::new(),
            stats: ConverterStats::default(),
        }
    }

    pub fn from_settings(table: Arc<RuleTable>, settings: &ConverterSettings) -> Self {
        Self::with_limits(table, settings.max_passes, settings.max_pending_contexts)
    }

    pub fn max_passes(&self) -> u32 {
        self.max_passes
    }

    pub fn stats(&self) -> ConverterStats {
        self.stats
    }

    pub fn state(&self) -> &ConversionState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut ConversionState {
        &mut self.state
    }

    /// Drop all held events
    pub fn clear(&mut self) {
        self.state.clear();
        self.pending_splits.clear();
    }

    /// Whether a rule exists for the event's layout
    pub fn is_conversion_needed(&self, event: &EventView<'_>) -> bool {
        self.table.contains(event.event_type(), event.nparams())
    }

    /// Run one conversion pass, writing any output into `new_slot`
    ///
    /// Never touches `event`'s memory.
    pub fn convert(&mut self, new_slot: &mut Vec<u8>, event: &EventView<'_>) -> ConversionResult {
        self.pass(new_slot, event, &mut Vec::new())
    }

    fn pass(
        &mut self,
        new_slot: &mut Vec<u8>,
        event: &EventView<'_>,
        journal: &mut Vec<StateChange>,
    ) -> ConversionResult {
        let Some(action) = self.table.get(event.event_type(), event.nparams()) else {
            return ConversionResult::NotNeeded;
        };
        trace!(
            tid = event.tid(),
            event_type = catalog::type_name(event.event_type()),
            nparams = event.nparams(),
            "converting"
        );

        match action {
            Action::Rewrite(layout) => match build(new_slot, layout, event, None) {
                Ok(()) => ConversionResult::Continue,
                Err(message) => ConversionResult::Failed(message),
            },
            Action::Stash(layout) => {
                if let Err(message) = build(new_slot, layout, event, None) {
                    return ConversionResult::Failed(message);
                }
                let removed = self
                    .state
                    .store(event.tid(), StashKind::EnterPartner, event.as_bytes());
                journal.push(StateChange {
                    tid: event.tid(),
                    stored: Some(StashKind::EnterPartner),
                    removed,
                });
                ConversionResult::Continue
            }
            Action::Merge { partner, layout } => {
                let stashed = match self.state.get(event.tid()) {
                    Some(entry) if entry.kind == StashKind::EnterPartner => self.state.take(event.tid()),
                    _ => None,
                };
                let had_partner = stashed.is_some();
                if had_partner {
                    journal.push(StateChange {
                        tid: event.tid(),
                        stored: None,
                        removed: stashed,
                    });
                }
                let partner_view = journal
                    .last()
                    .filter(|_| had_partner)
                    .and_then(|change| change.removed.as_ref())
                    .and_then(|entry| EventView::parse(&entry.event).ok())
                    .filter(|p| p.event_type() == *partner);
                if partner_view.is_none() {
                    debug!(
                        tid = event.tid(),
                        "no {} partner held for {}; partner fields left empty",
                        catalog::type_name(*partner),
                        catalog::type_name(event.event_type())
                    );
                }
                match build(new_slot, layout, event, partner_view.as_ref()) {
                    Ok(()) => ConversionResult::Terminal,
                    Err(message) => ConversionResult::Failed(message),
                }
            }
            Action::Split { first, second } => {
                let mut remainder = Vec::new();
                if let Err(message) = build(&mut remainder, second, event, None) {
                    return ConversionResult::Failed(message);
                }
                if let Err(message) = build(new_slot, first, event, None) {
                    return ConversionResult::Failed(message);
                }
                let removed = self
                    .state
                    .store(event.tid(), StashKind::SplitRemainder, &remainder);
                journal.push(StateChange {
                    tid: event.tid(),
                    stored: Some(StashKind::SplitRemainder),
                    removed,
                });
                self.pending_splits.push_back(event.tid());
                ConversionResult::Continue
            }
        }
    }

    /// Convert `event` until it is current
    ///
    /// A current event is handed back without copying. Otherwise passes
    /// alternate between the two scratch buffers and the result borrows
    /// `scratch`. Fails once `max_passes` passes did not reach a current
    /// layout. A failed event leaves Conversion State as it found it.
    pub fn normalize<'a>(&mut self, event: EventView<'a>, scratch: &'a mut Scratch) -> Normalized<'a> {
        let mut passes = 0u32;
        let mut journal = Vec::new();

        match self.pass(&mut scratch.next, &event, &mut journal) {
            ConversionResult::NotNeeded => return Normalized::Unchanged(event),
            ConversionResult::Failed(message) => return self.failed(journal, message, passes),
            ConversionResult::Terminal => {
                passes += 1;
                std::mem::swap(&mut scratch.cur, &mut scratch.next);
                return self.converted(scratch, journal, passes);
            }
            ConversionResult::Continue => {
                passes += 1;
                std::mem::swap(&mut scratch.cur, &mut scratch.next);
            }
        }

        loop {
            let view = match EventView::parse(&scratch.cur) {
                Ok(view) => view,
                Err(e) => {
                    return self.failed(
                        journal,
                        format!("conversion produced a malformed event: {}", e),
                        passes,
                    )
                }
            };
            if !self.is_conversion_needed(&view) {
                break;
            }
            if passes >= self.max_passes {
                return self.failed(
                    journal,
                    format!(
                        "{} event still needs conversion after {} passes",
                        catalog::type_name(view.event_type()),
                        passes
                    ),
                    passes,
                );
            }

            match self.pass(&mut scratch.next, &view, &mut journal) {
                ConversionResult::NotNeeded => break,
                ConversionResult::Failed(message) => return self.failed(journal, message, passes),
                ConversionResult::Terminal => {
                    passes += 1;
                    std::mem::swap(&mut scratch.cur, &mut scratch.next);
                    break;
                }
                ConversionResult::Continue => {
                    passes += 1;
                    std::mem::swap(&mut scratch.cur, &mut scratch.next);
                }
            }
        }

        self.converted(scratch, journal, passes)
    }

    fn converted<'a>(
        &mut self,
        scratch: &'a Scratch,
        journal: Vec<StateChange>,
        passes: u32,
    ) -> Normalized<'a> {
        match EventView::parse(&scratch.cur) {
            Ok(event) => {
                self.stats.converted += 1;
                self.stats.passes += passes as u64;
                self.stats.last_passes = passes;
                Normalized::Converted { event, passes }
            }
            Err(e) => self.failed(
                journal,
                format!("conversion produced a malformed event: {}", e),
                passes,
            ),
        }
    }

    fn failed<'a>(&mut self, journal: Vec<StateChange>, message: String, passes: u32) -> Normalized<'a> {
        if !journal.is_empty() {
            debug!(changes = journal.len(), "undoing state changes of failed event");
        }
        self.rollback(journal);
        self.stats.failed += 1;
        self.stats.passes += passes as u64;
        self.stats.last_passes = passes;
        Normalized::Failed { message, passes }
    }

    /// Undo `journal`, newest change first
    fn rollback(&mut self, journal: Vec<StateChange>) {
        for change in journal.into_iter().rev() {
            if let Some(kind) = change.stored {
                self.state.take_kind(change.tid, kind);
                if kind == StashKind::SplitRemainder {
                    if let Some(at) = self.pending_splits.iter().rposition(|tid| *tid == change.tid) {
                        self.pending_splits.remove(at);
                    }
                }
            }
            if let Some(entry) = change.removed {
                self.state.restore(change.tid, entry);
            }
        }
    }

    /// Next split remainder waiting for delivery, as `(tid, event bytes)`
    pub fn take_split_remainder(&mut self) -> Option<(u64, Vec<u8>)> {
        while let Some(tid) = self.pending_splits.pop_front() {
            if let Some(event) = self.state.take_kind(tid, StashKind::SplitRemainder) {
                return Some((tid, event));
            }
        }
        None
    }

    /// Whether a split remainder is waiting
    pub fn has_split_remainder(&self) -> bool {
        self.pending_splits
            .iter()
            .any(|tid| matches!(self.state.get(*tid), Some(e) if e.kind == StashKind::SplitRemainder))
    }
}

/// Write `layout` into `out` from `old` and the optional partner
fn build(
    out: &mut Vec<u8>,
    layout: &Layout,
    old: &EventView<'_>,
    partner: Option<&EventView<'_>>,
) -> Result<(), String> {
    let mut writer = EventWriter::begin(out, old.ts(), old.tid(), layout.event_type, layout.nparams());
    let mut widened = [0u8; 8];

    for (position, instr) in layout.params.iter().enumerate() {
        let value: &[u8] = match instr {
            ParamInstr::FromOld(index) => old
                .param(*index)
                .ok_or_else(|| format!("parameter {} missing from {}", index, catalog::type_name(old.event_type())))?,
            ParamInstr::FromPartner(index) => partner.and_then(|p| p.param(*index)).unwrap_or(&[]),
            ParamInstr::Empty => &[],
            ParamInstr::Default(bytes) => bytes.as_slice(),
            ParamInstr::Widen {
                index,
                from,
                to,
                signed,
            } => {
                let source = old.param(*index).ok_or_else(|| {
                    format!("parameter {} missing from {}", index, catalog::type_name(old.event_type()))
                })?;
                if source.len() != *from {
                    return Err(format!(
                        "parameter {} is {} bytes, expected {}",
                        index,
                        source.len(),
                        from
                    ));
                }
                let negative = *signed && source.last().is_some_and(|b| b & 0x80 != 0);
                widened = if negative { [0xff; 8] } else { [0; 8] };
                widened[..*from].copy_from_slice(source);
                &widened[..*to]
            }
        };
        writer
            .push_param(value)
            .map_err(|e| format!("output parameter {}: {}", position, e))?;
    }

    writer.finish().map(|_| ()).map_err(|e| e.to_string())
}
