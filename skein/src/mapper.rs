//! Protocol mapping with nested-run lifecycle elision.
//!
//! Tool handlers that start sub-runs forward every sub-event into the
//! parent stream, so a single channel can carry several balanced
//! `RunStart`/`RunEnd` pairs. A protocol consumer should announce the run
//! once; [`DepthMapper`] tracks nesting with a depth counter and surfaces
//! lifecycle events only on the 0↔1 transitions. Sub-runs execute serially
//! relative to the tool call that invoked them, which is what makes a bare
//! counter (rather than per-run correlation ids) sufficient.

use crate::event::{Event, EventPayload};

/// A protocol-level event derived from the unified stream.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ProtocolEvent {
    /// The outermost run opened.
    RunStarted,
    /// The outermost run finished cleanly.
    RunFinished(Event),
    /// The outermost run failed.
    RunFailed(Event),
    /// Any non-lifecycle event, passed through unchanged.
    Passthrough(Event),
}

/// Stateful translator from the unified stream to protocol events.
#[derive(Debug, Default)]
pub struct DepthMapper {
    depth: usize,
}

impl DepthMapper {
    /// Create a mapper at depth zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current nesting depth.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Map one event. Returns `None` for elided nested lifecycle events.
    pub fn map(&mut self, event: Event) -> Option<ProtocolEvent> {
        match &event.payload {
            EventPayload::RunStart => {
                self.depth += 1;
                (self.depth == 1).then_some(ProtocolEvent::RunStarted)
            }
            EventPayload::RunEnd { .. } => {
                self.depth = self.depth.saturating_sub(1);
                (self.depth == 0).then(|| ProtocolEvent::RunFinished(event))
            }
            EventPayload::RunError { .. } => {
                self.depth = self.depth.saturating_sub(1);
                (self.depth == 0).then(|| ProtocolEvent::RunFailed(event))
            }
            _ => Some(ProtocolEvent::Passthrough(event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StopReason;

    fn run_start() -> Event {
        Event::new(EventPayload::RunStart)
    }

    fn run_end() -> Event {
        Event::new(EventPayload::RunEnd {
            reason: StopReason::Stop,
            pending_tool_calls: Vec::new(),
        })
    }

    #[test]
    fn nested_lifecycle_is_elided() {
        let mut mapper = DepthMapper::new();
        let trace = vec![
            run_start(),
            Event::new(EventPayload::StepStart { name: "1".into() }),
            run_start(), // nested sub-run
            Event::new(EventPayload::StepStart { name: "1".into() }),
            Event::new(EventPayload::StepEnd { name: "1".into() }),
            run_end(), // nested sub-run ends
            Event::new(EventPayload::StepEnd { name: "1".into() }),
            run_end(),
        ];

        let mapped: Vec<ProtocolEvent> =
            trace.into_iter().filter_map(|e| mapper.map(e)).collect();

        let starts = mapped
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::RunStarted))
            .count();
        let finishes = mapped
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::RunFinished(_)))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(finishes, 1);
        // Step events from both depths pass through.
        let passthrough = mapped
            .iter()
            .filter(|e| matches!(e, ProtocolEvent::Passthrough(_)))
            .count();
        assert_eq!(passthrough, 4);
        assert_eq!(mapper.depth(), 0);
    }

    #[test]
    fn error_at_depth_one_surfaces() {
        let mut mapper = DepthMapper::new();
        assert!(mapper.map(run_start()).is_some());
        let failed = mapper.map(Event::new(EventPayload::RunError {
            error: "boom".into(),
        }));
        assert!(matches!(failed, Some(ProtocolEvent::RunFailed(_))));
    }
}
