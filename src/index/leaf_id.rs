//! Process-wide leaf id allocation
//!
//! Fresh leaves draw a random id once. Reconstructed leaves keep their
//! persisted id and only reserve it, so later draws never collide with it.

use ahash::AHashSet;
use parking_lot::Mutex;
use std::sync::OnceLock;

static ISSUED_IDS: OnceLock<Mutex<AHashSet<i32>>> = OnceLock::new();

fn issued_ids() -> &'static Mutex<AHashSet<i32>> {
    ISSUED_IDS.get_or_init(|| Mutex::new(AHashSet::new()))
}

/// Draw a random leaf id not yet handed out or reserved in this process
pub fn next_leaf_id() -> i32 {
    let mut issued = issued_ids().lock();
    loop {
        let candidate: i32 = rand::random();
        if issued.insert(candidate) {
            return candidate;
        }
    }
}

/// Mark `id` as taken by a leaf loaded from disk.
///
/// Several loaded leaves may share an id (indexers passing one id to all
/// their leaves), so reserving an id twice is fine.
pub fn reserve_leaf_id(id: i32) {
    issued_ids().lock().insert(id);
}

#[cfg(test)]
pub(crate) fn is_leaf_id_taken(id: i32) -> bool {
    issued_ids().lock().contains(&id)
}
