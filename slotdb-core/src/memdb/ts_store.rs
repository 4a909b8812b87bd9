//! Per-series field stores

use super::field_store::{FieldStore, EMPTY_FIELD_STORE_SIZE};
use crate::types::{FamilyId, FieldId, FieldType};

/// Bytes charged for an empty series store
pub(crate) const EMPTY_TS_STORE_SIZE: usize = std::mem::size_of::<TimeSeriesStore>() + 8;

/// Field stores of one series, ordered by (family id, field id)
#[derive(Default)]
pub struct TimeSeriesStore {
    fields: Vec<FieldStore>,
}

impl TimeSeriesStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, family_id: FamilyId, field_id: FieldId) -> Result<usize, usize> {
        self.fields
            .binary_search_by_key(&(family_id, field_id), |f| (f.family_id(), f.field_id()))
    }

    /// Write one value, returning the bytes allocated
    pub fn write(
        &mut self,
        family_id: FamilyId,
        field_id: FieldId,
        field_type: FieldType,
        slot: u16,
        value: f64,
    ) -> usize {
        let (idx, mut allocated) = match self.position(family_id, field_id) {
            Ok(idx) => (idx, 0),
            Err(idx) => {
                self.fields
                    .insert(idx, FieldStore::new(family_id, field_id, field_type));
                (idx, EMPTY_FIELD_STORE_SIZE)
            }
        };
        allocated += self.fields[idx].write(slot, value);
        allocated
    }

    pub fn get(&self, family_id: FamilyId, field_id: FieldId) -> Option<&FieldStore> {
        self.position(family_id, field_id)
            .ok()
            .map(|idx| &self.fields[idx])
    }

    /// Field stores of one family in field id order
    pub fn family_fields(&self, family_id: FamilyId) -> impl Iterator<Item = &FieldStore> {
        self.fields.iter().filter(move |f| f.family_id() == family_id)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
