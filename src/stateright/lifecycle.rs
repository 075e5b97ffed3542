//! Stateright Model for the Replica Lifecycle
//!
//! Exhaustively explores creates, allocations, commits, aborted writes,
//! reads, pins and state changes on a small pool and verifies:
//! - SPACE_BOUNDED: used space never exceeds the pool size
//! - SPACE_CONSERVED: free + bytes held by records == total
//! - SINGLE_WRITER: only incomplete records have a writer
//! - READERS_SEE_COMMITTED: open readers only exist on committed or removed records
//! - REMOVED_IS_TRANSIENT: a removed record without handles is destroyed at once
//! - PINNED_NOT_REMOVABLE: pinned records never count as removable space

use stateright::{Model, Property};

/// Lifecycle state of one modelled record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Absent,
    Writing,
    Cached,
    Precious,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordModel {
    pub phase: Phase,
    pub size: u64,
    pub broken: bool,
    pub writer: bool,
    pub readers: u8,
    pub pinned: bool,
}

impl RecordModel {
    fn absent() -> Self {
        RecordModel {
            phase: Phase::Absent,
            size: 0,
            broken: false,
            writer: false,
            readers: 0,
            pinned: false,
        }
    }

    fn is_idle(&self) -> bool {
        !self.writer && self.readers == 0
    }

    fn is_removable(&self) -> bool {
        self.phase == Phase::Cached && !self.broken && !self.pinned
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolState {
    pub records: Vec<RecordModel>,
    pub free: u64,
}

impl PoolState {
    fn removable(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| r.is_removable())
            .map(|r| r.size)
            .sum()
    }

    fn held(&self) -> u64 {
        self.records.iter().map(|r| r.size).sum()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleAction {
    Create(usize),
    Allocate(usize),
    Commit { record: usize, precious: bool },
    Abort(usize),
    OpenRead(usize),
    CloseRead(usize),
    SetCached(usize),
    SetPrecious(usize),
    Remove(usize),
    Pin(usize),
    Unpin(usize),
}

pub struct LifecycleModel {
    pub num_records: usize,
    pub total: u64,
    pub chunk: u64,
    pub max_readers: u8,
    /// Abandoned writes are deleted instead of marked broken
    pub delete_on_abort: bool,
}

impl LifecycleModel {
    pub fn new() -> Self {
        LifecycleModel {
            num_records: 2,
            total: 4,
            chunk: 2,
            max_readers: 2,
            delete_on_abort: false,
        }
    }

    fn destroy_if_idle(&self, state: &mut PoolState, index: usize) {
        let record = &mut state.records[index];
        if record.phase == Phase::Removed && record.is_idle() {
            state.free += record.size;
            *record = RecordModel::absent();
        }
    }
}

impl Default for LifecycleModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for LifecycleModel {
    type State = PoolState;
    type Action = LifecycleAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![PoolState {
            records: vec![RecordModel::absent(); self.num_records],
            free: self.total,
        }]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for (i, record) in state.records.iter().enumerate() {
            match record.phase {
                Phase::Absent => actions.push(LifecycleAction::Create(i)),
                Phase::Writing if record.writer => {
                    if state.free >= self.chunk {
                        actions.push(LifecycleAction::Allocate(i));
                    }
                    actions.push(LifecycleAction::Commit {
                        record: i,
                        precious: false,
                    });
                    actions.push(LifecycleAction::Commit {
                        record: i,
                        precious: true,
                    });
                    actions.push(LifecycleAction::Abort(i));
                }
                // Broken leftover of an abandoned write
                Phase::Writing => actions.push(LifecycleAction::Remove(i)),
                Phase::Cached | Phase::Precious => {
                    if !record.broken && record.readers < self.max_readers {
                        actions.push(LifecycleAction::OpenRead(i));
                    }
                    actions.push(LifecycleAction::SetCached(i));
                    actions.push(LifecycleAction::SetPrecious(i));
                    actions.push(LifecycleAction::Remove(i));
                    if record.pinned {
                        actions.push(LifecycleAction::Unpin(i));
                    } else {
                        actions.push(LifecycleAction::Pin(i));
                    }
                }
                Phase::Removed => {}
            }
            if record.readers > 0 {
                actions.push(LifecycleAction::CloseRead(i));
            }
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            LifecycleAction::Create(i) => {
                let record = &mut next.records[i];
                record.phase = Phase::Writing;
                record.writer = true;
            }
            LifecycleAction::Allocate(i) => {
                if next.free < self.chunk {
                    return None;
                }
                next.free -= self.chunk;
                next.records[i].size += self.chunk;
            }
            LifecycleAction::Commit { record, precious } => {
                let r = &mut next.records[record];
                r.phase = if precious { Phase::Precious } else { Phase::Cached };
                r.writer = false;
            }
            LifecycleAction::Abort(i) => {
                let record = &mut next.records[i];
                record.writer = false;
                if self.delete_on_abort {
                    record.phase = Phase::Removed;
                    self.destroy_if_idle(&mut next, i);
                } else {
                    record.broken = true;
                }
            }
            LifecycleAction::OpenRead(i) => next.records[i].readers += 1,
            LifecycleAction::CloseRead(i) => {
                next.records[i].readers -= 1;
                self.destroy_if_idle(&mut next, i);
            }
            LifecycleAction::SetCached(i) => next.records[i].phase = Phase::Cached,
            LifecycleAction::SetPrecious(i) => next.records[i].phase = Phase::Precious,
            LifecycleAction::Remove(i) => {
                next.records[i].phase = Phase::Removed;
                next.records[i].pinned = false;
                self.destroy_if_idle(&mut next, i);
            }
            LifecycleAction::Pin(i) => next.records[i].pinned = true,
            LifecycleAction::Unpin(i) => next.records[i].pinned = false,
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("space_bounded", |model: &LifecycleModel, state: &PoolState| {
                state.held() <= model.total
            }),
            Property::always("space_conserved", |model: &LifecycleModel, state: &PoolState| {
                state.free + state.held() == model.total
            }),
            Property::always("single_writer", |_: &LifecycleModel, state: &PoolState| {
                state
                    .records
                    .iter()
                    .all(|r| !r.writer || r.phase == Phase::Writing)
            }),
            Property::always("readers_see_committed", |_: &LifecycleModel, state: &PoolState| {
                state.records.iter().all(|r| {
                    r.readers == 0
                        || matches!(r.phase, Phase::Cached | Phase::Precious | Phase::Removed)
                })
            }),
            Property::always("removed_is_transient", |_: &LifecycleModel, state: &PoolState| {
                state
                    .records
                    .iter()
                    .all(|r| r.phase != Phase::Removed || !r.is_idle())
            }),
            Property::always("pinned_not_removable", |_: &LifecycleModel, state: &PoolState| {
                state
                    .records
                    .iter()
                    .filter(|r| r.pinned)
                    .all(|r| !r.is_removable())
                    && state.removable() <= state.held()
            }),
            Property::sometimes("replica_read_while_removed", |_: &LifecycleModel, state: &PoolState| {
                state
                    .records
                    .iter()
                    .any(|r| r.phase == Phase::Removed && r.readers > 0)
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stateright::Checker;

    #[test]
    fn test_abort_marks_broken() {
        let model = LifecycleModel::new();
        let init = model.init_states().remove(0);
        let created = model.next_state(&init, LifecycleAction::Create(0)).unwrap();
        let allocated = model
            .next_state(&created, LifecycleAction::Allocate(0))
            .unwrap();
        let aborted = model.next_state(&allocated, LifecycleAction::Abort(0)).unwrap();
        assert!(aborted.records[0].broken);
        assert_eq!(aborted.free, 2);

        let mut actions = Vec::new();
        model.actions(&aborted, &mut actions);
        assert!(actions.contains(&LifecycleAction::Remove(0)));
    }

    #[test]
    fn test_removal_deferred_until_last_reader() {
        let model = LifecycleModel::new();
        let mut state = model.init_states().remove(0);
        for action in [
            LifecycleAction::Create(0),
            LifecycleAction::Allocate(0),
            LifecycleAction::Commit {
                record: 0,
                precious: false,
            },
            LifecycleAction::OpenRead(0),
            LifecycleAction::Remove(0),
        ] {
            state = model.next_state(&state, action).unwrap();
        }
        assert_eq!(state.records[0].phase, Phase::Removed);
        assert_eq!(state.free, 2);

        let state = model.next_state(&state, LifecycleAction::CloseRead(0)).unwrap();
        assert_eq!(state.records[0].phase, Phase::Absent);
        assert_eq!(state.free, 4);
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_lifecycle -- --ignored --nocapture
    fn stateright_lifecycle_model_check() {
        let checker = LifecycleModel::new().checker().spawn_bfs().join();
        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
    }

    #[test]
    fn stateright_lifecycle_delete_on_abort() {
        let model = LifecycleModel {
            num_records: 1,
            delete_on_abort: true,
            ..LifecycleModel::new()
        };
        let checker = model.checker().spawn_bfs().join();
        checker.assert_properties();
    }
}
