//! Round-robin epoch assignment
//!
//! Epoch `i` (0-indexed in enumeration order) goes to slot `i % slots`, so
//! every slot gets an ascending list and together they cover `1..=total`
//! exactly once.

/// The epochs one GPU slot is responsible for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerAssignment {
    pub slot: usize,
    pub epochs: Vec<u32>,
}

impl WorkerAssignment {
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

/// Distribute epochs `1..=total_epochs` over `slots` workers.
///
/// Always returns `slots` assignments, ordered by slot. When there are fewer
/// epochs than slots the trailing assignments are empty.
pub fn assign_epochs(total_epochs: u32, slots: usize) -> Vec<WorkerAssignment> {
    let mut assignments: Vec<WorkerAssignment> = (0..slots)
        .map(|slot| WorkerAssignment {
            slot,
            epochs: Vec::new(),
        })
        .collect();

    if slots == 0 {
        return assignments;
    }

    for (i, epoch) in (1..=total_epochs).enumerate() {
        assignments[i % slots].epochs.push(epoch);
    }

    assignments
}
