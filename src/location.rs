//! Immutable registry of regions and resource partitions (spec §4.1).
//!
//! Ids are small dense integers assigned by insertion order so they double
//! as slice indices. The resource-partition count is uniform across every
//! region (mirrors the simulator's single `--rp_num` flag): a region doesn't
//! carry its own partition count, only a shared table-wide one.

use std::collections::HashMap;

use crate::errors::CoreError;

#[derive(Debug, Clone)]
pub struct LocationTable {
    region_names: Vec<String>,
    region_ids: HashMap<String, u32>,
    rp_names: Vec<String>,
}

impl LocationTable {
    pub fn new<I: IntoIterator<Item = String>>(regions: I, rp_count: usize) -> Self {
        let mut region_names = Vec::new();
        let mut region_ids = HashMap::new();
        for name in regions {
            let id = region_names.len() as u32;
            region_ids.insert(name.clone(), id);
            region_names.push(name);
        }
        let rp_names = (0..rp_count).map(|i| format!("rp-{i}")).collect();
        LocationTable {
            region_names,
            region_ids,
            rp_names,
        }
    }

    pub fn region_id_of(&self, name: &str) -> Result<u32, CoreError> {
        self.region_ids
            .get(name)
            .copied()
            .ok_or_else(|| CoreError::UnknownLocation(name.to_string()))
    }

    pub fn region_name_of(&self, id: u32) -> Result<&str, CoreError> {
        self.region_names
            .get(id as usize)
            .map(String::as_str)
            .ok_or_else(|| CoreError::UnknownLocation(format!("region id {id}")))
    }

    pub fn rp_count(&self) -> usize {
        self.rp_names.len()
    }

    pub fn rp_name_of(&self, id: u32) -> Result<&str, CoreError> {
        self.rp_names
            .get(id as usize)
            .map(String::as_str)
            .ok_or_else(|| CoreError::UnknownLocation(format!("rp id {id}")))
    }

    pub fn region_names(&self) -> &[String] {
        &self.region_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_assigned_by_insertion_order() {
        let table = LocationTable::new(
            ["Beijing".to_string(), "Shanghai".to_string()],
            10,
        );
        assert_eq!(table.region_id_of("Beijing").unwrap(), 0);
        assert_eq!(table.region_id_of("Shanghai").unwrap(), 1);
        assert_eq!(table.region_name_of(1).unwrap(), "Shanghai");
        assert_eq!(table.rp_count(), 10);
        assert_eq!(table.rp_name_of(3).unwrap(), "rp-3");
    }

    #[test]
    fn unknown_name_fails() {
        let table = LocationTable::new(["Beijing".to_string()], 1);
        assert!(matches!(
            table.region_id_of("Nowhere"),
            Err(CoreError::UnknownLocation(_))
        ));
    }
}
