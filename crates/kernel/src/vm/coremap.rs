//! Physical frame registry.
//!
//! Tracks which address space owns each frame and hands out free frames.
//! With swapping enabled, `replace_page` evicts a victim (FIFO rotation,
//! or the oldest frame by `timers` when LRU is on) by asking its owner to
//! page it out, then retries.  Sections are short and run effectively
//! atomically under the single-CPU model.

use log::debug;

use crate::kernel::Kernel;
use crate::util::Bitmap;

struct CoremapState {
    owners: Vec<Option<usize>>,
    /// Ticks since last use, per frame; larger means older.
    timers: Vec<u64>,
    victim_cursor: usize,
    frames: Bitmap,
}

pub struct Coremap {
    state: spin::Mutex<CoremapState>,
    use_lru: bool,
}

impl Coremap {
    pub fn new(num_phys_pages: usize, use_lru: bool) -> Self {
        Self {
            state: spin::Mutex::new(CoremapState {
                owners: vec![None; num_phys_pages],
                timers: vec![0; num_phys_pages],
                victim_cursor: 0,
                frames: Bitmap::new(num_phys_pages),
            }),
            use_lru,
        }
    }

    pub fn count_clear(&self) -> usize {
        self.state.lock().frames.count_clear()
    }

    /// Take a free frame for `space_id`, if one exists.
    pub fn find_frame(&self, space_id: usize) -> Option<u32> {
        let mut state = self.state.lock();
        let frame = state.frames.find()?;
        state.owners[frame] = Some(space_id);
        Some(frame as u32)
    }

    /// Obtain a frame for `space_id`, evicting a victim page if memory is
    /// full.  Only meaningful with swapping enabled.
    pub fn replace_page(&self, k: &Kernel, space_id: usize) -> u32 {
        loop {
            let (victim, owner_id) = {
                let mut state = self.state.lock();
                if let Some(frame) = state.frames.find() {
                    state.owners[frame] = Some(space_id);
                    return frame as u32;
                }
                let victim = self.pick_victim(&mut state);
                let owner = state.owners[victim].expect("victim frame has no owner");
                (victim as u32, owner)
            };
            debug!(target: "vm", "evicting frame {victim} owned by space {owner_id}");
            let owner = k.space(owner_id).expect("owner of a resident frame is gone");
            let vpn = owner.vpn_of_frame(victim);
            owner.swap_page(k, vpn);
        }
    }

    fn pick_victim(&self, state: &mut CoremapState) -> usize {
        if self.use_lru {
            let (victim, _) = state
                .timers
                .iter()
                .enumerate()
                .max_by_key(|&(_, &age)| age)
                .unwrap();
            victim
        } else {
            let victim = state.victim_cursor % state.owners.len();
            state.victim_cursor = state.victim_cursor.wrapping_add(1);
            victim
        }
    }

    /// Age every frame one tick and mark `used` fresh.
    pub fn update_timers(&self, used: u32) {
        let mut state = self.state.lock();
        for age in state.timers.iter_mut() {
            *age += 1;
        }
        state.timers[used as usize] = 0;
    }

    /// Release one frame.
    pub fn clear_frame(&self, frame: u32) {
        let mut state = self.state.lock();
        state.frames.clear(frame as usize);
        state.owners[frame as usize] = None;
    }

    /// Release every frame owned by `space_id` (process teardown).
    pub fn clear_space(&self, space_id: usize) {
        let mut state = self.state.lock();
        for frame in 0..state.owners.len() {
            if state.owners[frame] == Some(space_id) {
                state.frames.clear(frame);
                state.owners[frame] = None;
            }
        }
    }

    pub fn owner(&self, frame: u32) -> Option<usize> {
        self.state.lock().owners[frame as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_handed_out_lowest_first() {
        let map = Coremap::new(4, false);
        assert_eq!(map.find_frame(7), Some(0));
        assert_eq!(map.find_frame(7), Some(1));
        assert_eq!(map.owner(0), Some(7));
        map.clear_frame(0);
        assert_eq!(map.owner(0), None);
        assert_eq!(map.find_frame(9), Some(0));
    }

    #[test]
    fn clear_space_releases_only_that_owner() {
        let map = Coremap::new(4, false);
        map.find_frame(1);
        map.find_frame(2);
        map.find_frame(1);
        map.clear_space(1);
        assert_eq!(map.count_clear(), 3);
        assert_eq!(map.owner(1), Some(2));
    }

    #[test]
    fn lru_timers_age_and_reset() {
        let map = Coremap::new(3, true);
        map.find_frame(1);
        map.find_frame(1);
        map.find_frame(1);
        map.update_timers(0);
        map.update_timers(1);
        map.update_timers(1);
        // Frame 0 was used least recently of the touched ones; frame 2
        // never refreshed, so it is the oldest of all.
        let state = map.state.lock();
        assert!(state.timers[2] > state.timers[0]);
        assert!(state.timers[0] > state.timers[1]);
    }
}
