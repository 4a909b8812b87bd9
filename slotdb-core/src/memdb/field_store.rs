//! Slot-indexed value pages of one field

use crate::compression::TsdEncoder;
use crate::types::{FamilyId, FieldId, FieldType, SlotRange};

const PAGE_SLOTS: usize = 64;

struct Page {
    presence: u64,
    values: [f64; PAGE_SLOTS],
}

impl Page {
    fn new() -> Box<Self> {
        Box::new(Self {
            presence: 0,
            values: [0.0; PAGE_SLOTS],
        })
    }
}

/// Bytes charged for one allocated page
pub(crate) const PAGE_SIZE: usize = std::mem::size_of::<Page>();
/// Bytes charged for an empty field store
pub(crate) const EMPTY_FIELD_STORE_SIZE: usize = std::mem::size_of::<FieldStore>();

/// Values of one (family, field) pair of a series
pub struct FieldStore {
    family_id: FamilyId,
    field_id: FieldId,
    field_type: FieldType,
    pages: Vec<Option<Box<Page>>>,
    range: Option<SlotRange>,
}

impl FieldStore {
    pub fn new(family_id: FamilyId, field_id: FieldId, field_type: FieldType) -> Self {
        Self {
            family_id,
            field_id,
            field_type,
            pages: Vec::new(),
            range: None,
        }
    }

    pub fn family_id(&self) -> FamilyId {
        self.family_id
    }

    pub fn field_id(&self) -> FieldId {
        self.field_id
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Write `value` at `slot`, merging with an existing value.
    /// Returns the bytes newly allocated.
    pub fn write(&mut self, slot: u16, value: f64) -> usize {
        let page_idx = slot as usize / PAGE_SLOTS;
        let bit = 1u64 << (slot as usize % PAGE_SLOTS);
        let mut allocated = 0;

        if self.pages.len() <= page_idx {
            allocated += (page_idx + 1 - self.pages.len()) * std::mem::size_of::<Option<Box<Page>>>();
            self.pages.resize_with(page_idx + 1, || None);
        }
        let page = self.pages[page_idx].get_or_insert_with(|| {
            allocated += PAGE_SIZE;
            Page::new()
        });

        let idx = slot as usize % PAGE_SLOTS;
        if page.presence & bit != 0 {
            page.values[idx] = self.field_type.merge(page.values[idx], value);
        } else {
            page.presence |= bit;
            page.values[idx] = value;
        }

        match self.range.as_mut() {
            Some(r) => r.set_slot(slot),
            None => self.range = Some(SlotRange::single(slot)),
        }
        allocated
    }

    pub fn get(&self, slot: u16) -> Option<f64> {
        let page = self.pages.get(slot as usize / PAGE_SLOTS)?.as_ref()?;
        let idx = slot as usize % PAGE_SLOTS;
        (page.presence & (1u64 << idx) != 0).then(|| page.values[idx])
    }

    /// Slots written so far
    pub fn slot_range(&self) -> Option<SlotRange> {
        self.range
    }

    /// Present values within `range`, in slot order
    pub fn iter_range(&self, range: SlotRange) -> impl Iterator<Item = (u16, f64)> + '_ {
        let within = self.range.and_then(|r| r.intersect(&range));
        within
            .into_iter()
            .flat_map(|r| r.iter())
            .filter_map(move |slot| self.get(slot).map(|v| (slot, v)))
    }

    /// TSD-encode the values within `range`; `None` when nothing is present
    pub fn encode(&self, range: SlotRange) -> Option<Vec<u8>> {
        let mut encoder = TsdEncoder::new(range.start);
        for (slot, value) in self.iter_range(range) {
            encoder.push(slot, value);
        }
        encoder.finish()
    }
}
