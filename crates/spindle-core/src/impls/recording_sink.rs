//! RecordingEventSink - イベントをメモリに溜める EventSink

use std::sync::{Mutex, PoisonError};

use crate::domain::SchedulerEvent;
use crate::ports::EventSink;

#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event recorded so far, oldest first.
    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: &SchedulerEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UnitId;

    #[test]
    fn records_in_order() {
        let sink = RecordingEventSink::new();
        assert!(sink.is_empty());

        let unit = UnitId::parse("app").unwrap();
        sink.emit(&SchedulerEvent::LoadRequested { unit: unit.clone() });
        sink.emit(&SchedulerEvent::UnitLoaded { unit: unit.clone() });

        assert_eq!(
            sink.events(),
            vec![
                SchedulerEvent::LoadRequested { unit: unit.clone() },
                SchedulerEvent::UnitLoaded { unit },
            ]
        );
    }
}
