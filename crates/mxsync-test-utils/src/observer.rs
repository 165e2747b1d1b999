use mxsync_tree::{TreeObserver, TreePath};

/// One notification received by a [`RecordingObserver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    BeginInsert(TreePath, usize, usize),
    EndInsert(TreePath, usize, usize),
    BeginRemove(TreePath, usize, usize),
    EndRemove(TreePath, usize, usize),
    BeginMove(TreePath, usize, usize, usize),
    EndMove(TreePath, usize, usize, usize),
    AttributesChanged(TreePath),
}

impl ObserverEvent {
    fn closes(&self, begin: &ObserverEvent) -> bool {
        use ObserverEvent::*;
        match (begin, self) {
            (BeginInsert(p, s, c), EndInsert(q, t, d)) | (BeginRemove(p, s, c), EndRemove(q, t, d)) => {
                p == q && s == t && c == d
            }
            (BeginMove(p, f, t, c), EndMove(q, g, u, d)) => p == q && f == g && t == u && c == d,
            _ => false,
        }
    }
}

/// Observer that keeps every notification in order
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub events: Vec<ObserverEvent>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Count of completed structural changes of each type: (insert, remove, move)
    pub fn structural_counts(&self) -> (usize, usize, usize) {
        self.events.iter().fold((0, 0, 0), |(i, r, m), event| match event {
            ObserverEvent::EndInsert(..) => (i + 1, r, m),
            ObserverEvent::EndRemove(..) => (i, r + 1, m),
            ObserverEvent::EndMove(..) => (i, r, m + 1),
            _ => (i, r, m),
        })
    }

    /// Panics unless every begin is immediately closed by its matching end
    pub fn assert_paired(&self) {
        let mut open: Option<&ObserverEvent> = None;
        for event in &self.events {
            match event {
                ObserverEvent::BeginInsert(..)
                | ObserverEvent::BeginRemove(..)
                | ObserverEvent::BeginMove(..) => {
                    assert!(open.is_none(), "nested begin {event:?} inside {open:?}");
                    open = Some(event);
                }
                ObserverEvent::AttributesChanged(_) => {
                    assert!(open.is_none(), "attribute change inside {open:?}");
                }
                end => {
                    let begin = open.take().unwrap_or_else(|| panic!("{end:?} without begin"));
                    assert!(end.closes(begin), "{end:?} does not close {begin:?}");
                }
            }
        }
        assert!(open.is_none(), "unclosed {open:?}");
    }
}

impl TreeObserver for RecordingObserver {
    fn begin_insert(&mut self, parent: &TreePath, start: usize, count: usize) {
        self.events.push(ObserverEvent::BeginInsert(parent.clone(), start, count));
    }

    fn end_insert(&mut self, parent: &TreePath, start: usize, count: usize) {
        self.events.push(ObserverEvent::EndInsert(parent.clone(), start, count));
    }

    fn begin_remove(&mut self, parent: &TreePath, start: usize, count: usize) {
        self.events.push(ObserverEvent::BeginRemove(parent.clone(), start, count));
    }

    fn end_remove(&mut self, parent: &TreePath, start: usize, count: usize) {
        self.events.push(ObserverEvent::EndRemove(parent.clone(), start, count));
    }

    fn begin_move(&mut self, parent: &TreePath, from: usize, to: usize, count: usize) {
        self.events.push(ObserverEvent::BeginMove(parent.clone(), from, to, count));
    }

    fn end_move(&mut self, parent: &TreePath, from: usize, to: usize, count: usize) {
        self.events.push(ObserverEvent::EndMove(parent.clone(), from, to, count));
    }

    fn attributes_changed(&mut self, path: &TreePath) {
        self.events.push(ObserverEvent::AttributesChanged(path.clone()));
    }
}
