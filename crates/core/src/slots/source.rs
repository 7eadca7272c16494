use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Relation};

/// Grouped table/column references. No two members share a
/// (table, column) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSlot {
    pub min_size: usize,
    members: Vec<Entity>,
}

impl SourceSlot {
    pub fn new(min_size: usize) -> Self {
        Self { min_size, members: Vec::new() }
    }

    pub fn members(&self) -> &[Entity] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Adds one reference, returning whether the member list grew.
    ///
    /// A repeated pair only upgrades the verified flag. When the same column
    /// is proposed under another table while the active table already holds
    /// it, the active table wins and the proposal is ignored; an unverified
    /// member from another table is replaced by the active table's.
    pub fn add_one(&mut self, entity: Entity, active_table: Option<&str>) -> bool {
        if let Some(existing) = self.members.iter_mut().find(|member| member.same_target(&entity)) {
            existing.verified |= entity.verified;
            if existing.row.is_none() {
                existing.row = entity.row;
            }
            return false;
        }

        if let Some(active) = active_table {
            let same_column = |member: &Entity| member.column == entity.column && !entity.is_whole_table();
            if entity.table != active
                && self.members.iter().any(|member| same_column(member) && member.table == active)
            {
                return false;
            }
            if entity.table == active {
                if let Some(position) = self
                    .members
                    .iter()
                    .position(|member| same_column(member) && member.table != active && !member.verified)
                {
                    self.members[position] = entity;
                    return false;
                }
            }
        }

        self.members.push(entity);
        true
    }

    /// Marks every member verified, returning how many changed.
    pub fn verify_all(&mut self) -> usize {
        let mut changed = 0;
        for member in self.members.iter_mut().filter(|member| !member.verified) {
            member.verified = true;
            member.relation = member.relation.filter(|relation| *relation != Relation::Ambiguous);
            changed += 1;
        }
        changed
    }

    pub fn drop_unverified(&mut self) {
        self.members.retain(|member| member.verified);
    }

    pub fn drop_relation(&mut self, relation: Relation) -> Vec<Entity> {
        let (dropped, kept): (Vec<Entity>, Vec<Entity>) =
            self.members.drain(..).partition(|member| member.relation == Some(relation));
        self.members = kept;
        dropped
    }

    pub fn tables(&self) -> Vec<&str> {
        let mut tables = Vec::new();
        for member in &self.members {
            if !tables.contains(&member.table.as_str()) {
                tables.push(member.table.as_str());
            }
        }
        tables
    }

    pub fn is_filled(&self) -> bool {
        self.members.len() >= self.min_size
    }

    pub fn is_verified(&self) -> bool {
        self.is_filled() && self.members.iter().all(|member| member.verified)
    }
}

#[cfg(test)]
mod tests {
    use super::SourceSlot;
    use crate::entity::{Entity, Relation};

    #[test]
    fn filled_once_min_size_reached() {
        let mut slot = SourceSlot::new(2);
        assert!(slot.add_one(Entity::new("orders", "Total"), None));
        assert!(!slot.is_filled());
        assert!(!slot.add_one(Entity::new("orders", "Total"), None));
        assert!(!slot.is_filled());
        assert!(slot.add_one(Entity::new("orders", "Date"), None));
        assert!(slot.is_filled());
    }

    #[test]
    fn duplicate_pair_upgrades_verification() {
        let mut slot = SourceSlot::new(1);
        slot.add_one(Entity::new("orders", "Total"), None);
        assert!(!slot.is_verified());
        slot.add_one(Entity::new("orders", "Total").verified(), None);
        assert_eq!(slot.len(), 1);
        assert!(slot.is_verified());
    }

    #[test]
    fn active_table_is_preferred_for_same_column() {
        let mut slot = SourceSlot::new(1);
        slot.add_one(Entity::new("orders", "Date").verified(), Some("orders"));
        assert!(!slot.add_one(Entity::new("returns", "Date"), Some("orders")));
        assert_eq!(slot.members()[0].table, "orders");

        let mut slot = SourceSlot::new(1);
        slot.add_one(Entity::new("returns", "Date"), None);
        slot.add_one(Entity::new("orders", "Date"), Some("orders"));
        assert_eq!(slot.len(), 1);
        assert_eq!(slot.members()[0].table, "orders");
    }

    #[test]
    fn no_duplicate_pairs_after_any_sequence() {
        let mut slot = SourceSlot::new(1);
        let proposals = [
            ("orders", "Total", Some("orders")),
            ("returns", "Total", Some("orders")),
            ("orders", "Total", None),
            ("returns", "Total", None),
            ("returns", "Total", Some("returns")),
            ("orders", "Date", Some("returns")),
            ("orders", "*", Some("orders")),
            ("returns", "*", Some("orders")),
        ];
        for (table, column, active) in proposals {
            slot.add_one(Entity::new(table, column), active);
            let members = slot.members();
            for (index, member) in members.iter().enumerate() {
                assert!(
                    members[index + 1..].iter().all(|other| !other.same_target(member)),
                    "duplicate pair {member:?}"
                );
            }
        }
    }

    #[test]
    fn drop_unverified_and_relations() {
        let mut slot = SourceSlot::new(1);
        slot.add_one(Entity::new("orders", "Total").verified(), None);
        slot.add_one(Entity::new("orders", "Date").with_relation(Relation::Ambiguous), None);
        slot.add_one(Entity::new("orders", "Region"), None);

        let dropped = slot.drop_relation(Relation::Ambiguous);
        assert_eq!(dropped.len(), 1);
        assert_eq!(slot.len(), 2);

        slot.drop_unverified();
        assert_eq!(slot.len(), 1);
        assert_eq!(slot.tables(), vec!["orders"]);
    }
}
