use crate::{
    Error, Result,
    engine::{Completion, Tag},
};
use log::warn;

/// Size of the per-engine tag table.
pub(crate) const TAG_TABLE_SIZE: usize = 1024;

#[derive(Debug)]
enum TagSlot {
    /// request outstanding, completion not yet delivered
    Pending,
    /// completion delivered, awaiting pickup
    Done(Completion),
    /// abandoned by a timed-out waiter; freed when the completion lands
    Closed,
}

/// Allocates request tags from a fixed table with a wrap-around scan
/// starting at the last allocation point. A tag stays occupied from `post`
/// until its completion is picked up (or, after a timeout, until the
/// straggler completion arrives and the slot is reclaimed).
#[derive(Debug)]
pub(crate) struct TagPool {
    slots: Vec<Option<TagSlot>>,
    head: usize,
}

impl TagPool {
    pub fn new() -> Self {
        Self {
            slots: (0..TAG_TABLE_SIZE).map(|_| None).collect(),
            head: 0,
        }
    }

    pub fn get_tag(&mut self) -> Result<Tag> {
        for offset in 0..TAG_TABLE_SIZE {
            let tag = (self.head + offset) % TAG_TABLE_SIZE;
            if self.slots[tag].is_none() {
                self.slots[tag] = Some(TagSlot::Pending);
                self.head = (tag + 1) % TAG_TABLE_SIZE;
                return Ok(tag);
            }
        }
        Err(Error::TagError)
    }

    /// Stores the completion for pickup. Closed slots are reclaimed instead:
    /// their waiter is gone.
    pub fn deliver(&mut self, completion: Completion) {
        let tag = completion.tag;
        match self.slots.get_mut(tag) {
            Some(slot @ Some(TagSlot::Pending)) => *slot = Some(TagSlot::Done(completion)),
            Some(slot @ Some(TagSlot::Closed)) => *slot = None,
            _ => warn!("completion for unknown tag {tag} dropped"),
        }
    }

    /// Picks up a delivered completion, freeing the tag.
    pub fn take(&mut self, tag: Tag) -> Option<Completion> {
        match self.slots.get_mut(tag) {
            Some(slot @ Some(TagSlot::Done(_))) => match slot.take() {
                Some(TagSlot::Done(completion)) => Some(completion),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    /// Marks a pending tag as abandoned; the slot frees itself once the
    /// in-flight completion is delivered.
    pub fn close(&mut self, tag: Tag) {
        if let Some(slot @ Some(TagSlot::Pending)) = self.slots.get_mut(tag) {
            *slot = Some(TagSlot::Closed);
        }
    }

    pub fn is_outstanding(&self, tag: Tag) -> bool {
        matches!(self.slots.get(tag), Some(Some(_)))
    }

    /// True while the request has not completed yet.
    pub fn is_pending(&self, tag: Tag) -> bool {
        matches!(
            self.slots.get(tag),
            Some(Some(TagSlot::Pending | TagSlot::Closed))
        )
    }
}
