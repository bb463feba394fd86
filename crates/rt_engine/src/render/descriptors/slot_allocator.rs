//! Descriptor slot allocator
//!
//! Hands out integer slots of the shader-visible descriptor heap. Freed slots
//! are queued and reused first-in first-out before the high-water counter is
//! advanced. Slots shared between several logical owners are registered with
//! [`SlotAllocator::add_ref`] and only return to the free queue when the last
//! owner releases them.
//!
//! A slot must not be released while GPU work that reads its descriptor is
//! still in flight; callers release only after the frame fence has passed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use parking_lot::Mutex;

use crate::render::api::{GraphicsError, GraphicsResult};

/// Index of a descriptor heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl SlotId {
    /// Slot index as `u32`
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct SlotState {
    next: u32,
    free: VecDeque<u32>,
    free_set: HashSet<u32>,
    owners: HashMap<u32, u32>,
}

/// Thread-safe free-list slot allocator with shared-owner reference counts
#[derive(Debug, Default)]
pub struct SlotAllocator {
    state: Mutex<SlotState>,
}

impl SlotAllocator {
    /// Create an empty allocator
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose high-water counter starts at `next`
    #[cfg(test)]
    pub(crate) fn starting_at(next: u32) -> Self {
        let allocator = Self::default();
        allocator.state.lock().next = next;
        allocator
    }

    /// Take a free slot
    ///
    /// Reuses the oldest released slot when one is queued, otherwise advances
    /// the high-water counter. Fails once the 32-bit range is exhausted.
    pub fn acquire(&self) -> GraphicsResult<SlotId> {
        let mut state = self.state.lock();

        if let Some(slot) = state.free.pop_front() {
            state.free_set.remove(&slot);
            return Ok(SlotId(slot));
        }

        if state.next == u32::MAX {
            return Err(GraphicsError::SlotsExhausted);
        }
        let slot = state.next;
        state.next += 1;
        Ok(SlotId(slot))
    }

    /// Take a free slot with an index below `bound`
    ///
    /// Queued slots at or above the bound are skipped and stay queued; the
    /// high-water counter never advances past the bound.
    pub fn acquire_below(&self, bound: u32) -> GraphicsResult<SlotId> {
        let mut state = self.state.lock();

        if let Some(position) = state.free.iter().position(|slot| *slot < bound) {
            if let Some(slot) = state.free.remove(position) {
                state.free_set.remove(&slot);
                return Ok(SlotId(slot));
            }
        }

        if state.next >= bound {
            return Err(GraphicsError::OutOfRange {
                reason: format!("all {} slots below the bound are in use", bound),
            });
        }
        if state.next == u32::MAX {
            return Err(GraphicsError::SlotsExhausted);
        }
        let slot = state.next;
        state.next += 1;
        Ok(SlotId(slot))
    }

    fn is_live(state: &SlotState, id: SlotId) -> bool {
        id.0 < state.next && !state.free_set.contains(&id.0)
    }

    /// Register one more owner of `id`
    ///
    /// The first call counts the original owner too, so a slot with `k - 1`
    /// calls needs `k` releases. Returns `false` and changes nothing when
    /// `id` is not currently handed out.
    pub fn add_ref(&self, id: SlotId) -> bool {
        let mut state = self.state.lock();
        if !Self::is_live(&state, id) {
            log::warn!("Ignoring add_ref of {id}: not currently allocated");
            return false;
        }
        *state.owners.entry(id.0).or_insert(1) += 1;
        true
    }

    /// Drop one owner of `id`
    ///
    /// Returns `true` when the slot went back to the free queue.
    pub fn release(&self, id: SlotId) -> bool {
        let mut state = self.state.lock();

        if !Self::is_live(&state, id) {
            log::warn!("Ignoring release of {id}: not currently allocated");
            return false;
        }
        if let Some(count) = state.owners.get_mut(&id.0) {
            *count -= 1;
            if *count > 0 {
                return false;
            }
            state.owners.remove(&id.0);
        }

        state.free.push_back(id.0);
        state.free_set.insert(id.0);
        true
    }

    /// Number of owners registered for a shared slot, 1 for plain slots
    pub fn owner_count(&self, id: SlotId) -> u32 {
        self.state.lock().owners.get(&id.0).copied().unwrap_or(1)
    }

    /// Whether `id` is currently queued for reuse
    pub fn is_free(&self, id: SlotId) -> bool {
        self.state.lock().free_set.contains(&id.0)
    }

    /// Number of slots handed out and not yet released
    pub fn live_count(&self) -> u32 {
        let state = self.state.lock();
        state.next - state.free.len() as u32
    }

    /// Highest slot index ever handed out plus one
    pub fn high_water(&self) -> u32 {
        self.state.lock().next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_sequential_allocation() {
        let allocator = SlotAllocator::new();
        let ids: Vec<_> = (0..4).map(|_| allocator.acquire().unwrap()).collect();
        assert_eq!(ids, vec![SlotId(0), SlotId(1), SlotId(2), SlotId(3)]);
        assert_eq!(allocator.high_water(), 4);
        assert_eq!(allocator.live_count(), 4);
    }

    /// Released slots come back oldest first, before the counter grows
    #[test]
    fn test_fifo_reuse() {
        let allocator = SlotAllocator::new();
        let ids: Vec<_> = (0..4).map(|_| allocator.acquire().unwrap()).collect();

        assert!(allocator.release(ids[2]));
        assert!(allocator.release(ids[0]));

        assert_eq!(allocator.acquire().unwrap(), SlotId(2));
        assert_eq!(allocator.acquire().unwrap(), SlotId(0));
        assert_eq!(allocator.acquire().unwrap(), SlotId(4));
    }

    /// A slot with k-1 add_ref calls is freed by the k-th release only
    #[test]
    fn test_shared_slot_freed_exactly_once() {
        for k in 2..6u32 {
            let allocator = SlotAllocator::new();
            let id = allocator.acquire().unwrap();
            for _ in 0..k - 1 {
                assert!(allocator.add_ref(id));
            }
            assert_eq!(allocator.owner_count(id), k);

            for _ in 0..k - 1 {
                assert!(!allocator.release(id));
                assert!(!allocator.is_free(id));
            }
            assert!(allocator.release(id));
            assert!(allocator.is_free(id));

            // Freed once: the queue holds it a single time
            assert_eq!(allocator.acquire().unwrap(), id);
            assert_eq!(allocator.acquire().unwrap(), SlotId(1));
        }
    }

    #[test]
    fn test_plain_release_returns_true() {
        let allocator = SlotAllocator::new();
        let id = allocator.acquire().unwrap();
        assert!(allocator.release(id));
        assert_eq!(allocator.live_count(), 0);
    }

    /// Double release and foreign ids do not corrupt the free queue
    #[test]
    fn test_invalid_release_ignored() {
        let allocator = SlotAllocator::new();
        let id = allocator.acquire().unwrap();
        assert!(allocator.release(id));
        assert!(!allocator.release(id));
        assert!(!allocator.release(SlotId(99)));

        assert_eq!(allocator.acquire().unwrap(), id);
        assert_eq!(allocator.acquire().unwrap(), SlotId(1));
    }

    /// Sharing a freed or never handed out slot must not requeue it later
    #[test]
    fn test_add_ref_requires_live_slot() {
        let allocator = SlotAllocator::new();
        let id = allocator.acquire().unwrap();
        assert!(allocator.release(id));

        assert!(!allocator.add_ref(id));
        assert!(!allocator.release(id));
        assert!(!allocator.release(id));
        assert_eq!(allocator.acquire().unwrap(), SlotId(0));
        assert_eq!(allocator.acquire().unwrap(), SlotId(1));

        let fresh = SlotAllocator::new();
        assert!(!fresh.add_ref(SlotId(1)));
        assert!(!fresh.release(SlotId(1)));
        assert!(!fresh.release(SlotId(1)));
        let ids: Vec<_> = (0..3).map(|_| fresh.acquire().unwrap()).collect();
        assert_eq!(ids, vec![SlotId(0), SlotId(1), SlotId(2)]);
        assert_eq!(fresh.owner_count(SlotId(1)), 1);
    }

    #[test]
    fn test_acquire_below_bound() {
        let allocator = SlotAllocator::new();
        let a = allocator.acquire_below(2).unwrap();
        let b = allocator.acquire_below(2).unwrap();
        assert_eq!((a, b), (SlotId(0), SlotId(1)));

        assert!(matches!(allocator.acquire_below(2), Err(GraphicsError::OutOfRange { .. })));
        assert_eq!(allocator.high_water(), 2);

        assert!(allocator.release(a));
        assert_eq!(allocator.acquire_below(2).unwrap(), a);
    }

    /// Out-of-bound queued slots are passed over, not consumed
    #[test]
    fn test_acquire_below_skips_high_slots() {
        let allocator = SlotAllocator::new();
        let ids: Vec<_> = (0..4).map(|_| allocator.acquire().unwrap()).collect();
        assert!(allocator.release(ids[3]));
        assert!(allocator.release(ids[1]));

        assert_eq!(allocator.acquire_below(2).unwrap(), SlotId(1));
        assert!(allocator.is_free(SlotId(3)));
        assert!(allocator.acquire_below(2).is_err());
        assert_eq!(allocator.acquire().unwrap(), SlotId(3));
    }

    #[test]
    fn test_exhaustion() {
        let allocator = SlotAllocator::starting_at(u32::MAX - 1);
        let last = allocator.acquire().unwrap();
        assert_eq!(last, SlotId(u32::MAX - 1));
        assert!(matches!(allocator.acquire(), Err(GraphicsError::SlotsExhausted)));

        // A released slot is still available after exhaustion
        assert!(allocator.release(last));
        assert_eq!(allocator.acquire().unwrap(), last);
    }

    /// Pseudo-random acquire/release/add_ref sequence keeps live plain ids unique
    #[test]
    fn test_live_ids_unique_under_random_sequence() {
        let allocator = SlotAllocator::new();
        let mut live: Vec<SlotId> = Vec::new();
        let mut shared: HashMap<SlotId, u32> = HashMap::new();
        let mut seed = 0x2545_F491_u32;

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;

            match seed % 4 {
                0 | 1 => {
                    let id = allocator.acquire().unwrap();
                    assert!(!live.contains(&id), "{id} handed out twice");
                    live.push(id);
                }
                2 if !live.is_empty() => {
                    let id = live.swap_remove(seed as usize % live.len());
                    let remaining = shared.get(&id).copied().unwrap_or(0);
                    if remaining > 0 {
                        // Drop every extra owner, then the original one
                        for _ in 0..remaining {
                            assert!(!allocator.release(id));
                        }
                        shared.remove(&id);
                    }
                    assert!(allocator.release(id));
                }
                3 if !live.is_empty() => {
                    let id = live[seed as usize % live.len()];
                    assert!(allocator.add_ref(id));
                    *shared.entry(id).or_insert(0) += 1;
                }
                _ => {}
            }
        }

        assert_eq!(allocator.live_count() as usize, live.len());
    }

    #[test]
    fn test_concurrent_acquire() {
        let allocator = Arc::new(SlotAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || (0..250).map(|_| allocator.acquire().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<SlotId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }
}
