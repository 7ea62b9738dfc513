use crate::scheduler::job::{JobId, JobRecord};
use crate::scheduler::queue::JobQueue;

pub type SlotId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy(JobId),
}

/// Fixed-size table of worker slots.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<SlotState>,
}

impl SlotTable {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![SlotState::Idle; size],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, slot_id: SlotId) -> Option<SlotState> {
        self.slots.get(slot_id).copied()
    }

    pub fn idle_slots(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == SlotState::Idle)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.slots.len() - self.idle_slots().len()
    }

    /// Pair the oldest pending job with an idle slot.
    ///
    /// Marks the job processing and the slot busy. Returns `None` without touching
    /// any state when there is no idle slot or no pending job.
    pub fn assign_next_job(&mut self, queue: &mut JobQueue) -> Option<(SlotId, JobRecord)> {
        if !queue.has_pending() {
            return None;
        }
        let slot_id = self
            .slots
            .iter()
            .position(|s| *s == SlotState::Idle)?;

        let job = queue.start_next()?.clone();
        self.slots[slot_id] = SlotState::Busy(job.id);
        tracing::info!(job_id = job.id, slot_id, "Job assigned");
        Some((slot_id, job))
    }

    /// Free a slot after its worker reported `job_id` done.
    ///
    /// Returns false if the slot was not busy with that job.
    pub fn job_completed(&mut self, slot_id: SlotId, job_id: JobId) -> bool {
        match self.slots.get_mut(slot_id) {
            Some(state) if *state == SlotState::Busy(job_id) => {
                *state = SlotState::Idle;
                true
            }
            _ => false,
        }
    }
}
