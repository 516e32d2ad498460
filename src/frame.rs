use crate::device::{CommandList, DescriptorBindings, SubmissionIndex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorSet {
    bindings: DescriptorBindings,
}

impl DescriptorSet {
    pub fn write_all(&mut self, bindings: DescriptorBindings) {
        self.bindings = bindings;
    }

    pub fn bindings(&self) -> DescriptorBindings {
        self.bindings
    }
}

/// Everything one in-flight frame records into.
#[derive(Debug)]
pub struct FrameSlot {
    pub commands: CommandList,
    pub descriptors: DescriptorSet,
    pub(crate) last_submission: Option<SubmissionIndex>,
}

/// N frame slots used round robin, so recording frame f+1 never touches
/// storage the device may still be reading for frame f.
#[derive(Debug)]
pub struct FrameRing {
    slots: Vec<FrameSlot>,
    current: usize,
}

impl FrameRing {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        FrameRing {
            slots: (0..count)
                .map(|i| FrameSlot {
                    commands: CommandList::new(format!("Particle frame {}", i)),
                    descriptors: DescriptorSet::default(),
                    last_submission: None,
                })
                .collect(),
            current: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    // The slot recorded longest ago, which is the next one to be reused.
    pub fn oldest_index(&self) -> usize {
        (self.current + 1) % self.slots.len()
    }

    pub fn current_mut(&mut self) -> &mut FrameSlot {
        &mut self.slots[self.current]
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    pub fn submissions(&self) -> impl Iterator<Item = SubmissionIndex> + '_ {
        self.slots.iter().filter_map(|slot| slot.last_submission)
    }

    pub fn latest_submission(&self) -> Option<SubmissionIndex> {
        self.submissions().max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferHandle, MAX_BINDINGS};

    #[test]
    fn ring_wraps() {
        let mut ring = FrameRing::new(3);
        let visited: Vec<usize> = (0..7)
            .map(|_| {
                let index = ring.current_index();
                ring.advance();
                index
            })
            .collect();
        assert_eq!(visited, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(ring.current_index(), 1);
        assert_eq!(ring.oldest_index(), 2);
    }

    #[test]
    fn single_slot_ring_reuses_itself() {
        let mut ring = FrameRing::new(0);
        assert_eq!(ring.len(), 1);
        ring.advance();
        assert_eq!(ring.current_index(), 0);
        assert_eq!(ring.oldest_index(), 0);
    }

    #[test]
    fn descriptor_sets_belong_to_their_slot() {
        let mut ring = FrameRing::new(2);
        ring.current_mut()
            .descriptors
            .write_all([Some(BufferHandle(5)), None, None, None]);
        ring.advance();
        assert_eq!(ring.current_mut().descriptors.bindings(), [None; MAX_BINDINGS]);
        ring.advance();
        assert_eq!(
            ring.current_mut().descriptors.bindings(),
            [Some(BufferHandle(5)), None, None, None]
        );
    }

    #[test]
    fn latest_submission_spans_slots() {
        let mut ring = FrameRing::new(2);
        assert_eq!(ring.latest_submission(), None);
        ring.current_mut().last_submission = Some(SubmissionIndex(4));
        ring.advance();
        ring.current_mut().last_submission = Some(SubmissionIndex(9));
        assert_eq!(ring.latest_submission(), Some(SubmissionIndex(9)));
        assert_eq!(ring.submissions().count(), 2);
    }
}
