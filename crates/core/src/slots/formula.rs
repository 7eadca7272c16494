//! Formula trees: named expressions over column-grounded clauses.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulaRelation {
    Add,
    Subtract,
    Multiply,
    Divide,
    And,
    Or,
    Less,
    Greater,
    Equal,
    Conditional,
    Placeholder,
}

impl FormulaRelation {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::And => "&",
            Self::Or => "|",
            Self::Less => "<",
            Self::Greater => ">",
            Self::Equal => "=",
            Self::Conditional => "?",
            Self::Placeholder => "_",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Sum,
    Count,
    Average,
    Min,
    Max,
    Top,
    Bottom,
    Filter,
    All,
}

impl Aggregation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Count => "COUNT",
            Self::Average => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Top => "TOP",
            Self::Bottom => "BOTTOM",
            Self::Filter => "FILTER",
            Self::All => "ALL",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormulaNode {
    Expression {
        name: String,
        relation: FormulaRelation,
        children: Vec<FormulaNode>,
    },
    Clause {
        name: String,
        table: String,
        column: String,
        aggregation: Aggregation,
        verified: bool,
    },
}

impl FormulaNode {
    pub fn expression(name: impl Into<String>, relation: FormulaRelation) -> Self {
        Self::Expression { name: name.into(), relation, children: Vec::new() }
    }

    pub fn clause(
        name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        aggregation: Aggregation,
    ) -> Self {
        Self::Clause {
            name: name.into(),
            table: table.into(),
            column: column.into(),
            aggregation,
            verified: false,
        }
    }

    pub fn with_child(mut self, child: FormulaNode) -> Self {
        if let Self::Expression { children, .. } = &mut self {
            children.push(child);
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Expression { name, .. } | Self::Clause { name, .. } => name,
        }
    }

    fn is_empty_expression(&self) -> bool {
        matches!(self, Self::Expression { children, .. } if children.is_empty())
    }

    /// Depth-first: a clause is verified if flagged; an expression is
    /// verified iff every child is verified and no child expression is empty.
    pub fn is_verified(&self) -> bool {
        match self {
            Self::Clause { verified, .. } => *verified,
            Self::Expression { children, .. } => children
                .iter()
                .all(|child| !child.is_empty_expression() && child.is_verified()),
        }
    }

    pub fn mark_verified(&mut self, target: &str) -> bool {
        match self {
            Self::Clause { name, verified, .. } if name == target => {
                *verified = true;
                true
            }
            Self::Clause { .. } => false,
            Self::Expression { children, .. } => {
                children.iter_mut().fold(false, |found, child| child.mark_verified(target) || found)
            }
        }
    }

    pub fn clauses(&self) -> Vec<&FormulaNode> {
        match self {
            Self::Clause { .. } => vec![self],
            Self::Expression { children, .. } => children.iter().flat_map(|child| child.clauses()).collect(),
        }
    }

    fn render(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clause { table, column, aggregation, .. } => {
                write!(f, "{}({table}.{column})", aggregation.as_str())
            }
            Self::Expression { name, children, .. } if children.is_empty() => write!(f, "{name}"),
            Self::Expression { relation, children, .. } => {
                f.write_str("(")?;
                for (index, child) in children.iter().enumerate() {
                    if index > 0 {
                        write!(f, " {} ", relation.symbol())?;
                    }
                    child.render(f)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Display for FormulaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FormulaSlot {
    root: FormulaNode,
}

impl Default for FormulaSlot {
    fn default() -> Self {
        Self { root: FormulaNode::expression("root", FormulaRelation::Placeholder) }
    }
}

impl FormulaSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &FormulaNode {
        &self.root
    }

    /// An expression replaces a still-empty placeholder root; anything
    /// else is appended under the root.
    pub fn assign_one(&mut self, node: FormulaNode) {
        let root_is_blank = matches!(
            &self.root,
            FormulaNode::Expression { relation: FormulaRelation::Placeholder, children, .. } if children.is_empty()
        );
        if root_is_blank && matches!(node, FormulaNode::Expression { .. }) {
            self.root = node;
        } else if let FormulaNode::Expression { children, .. } = &mut self.root {
            children.push(node);
        }
    }

    pub fn set_relation(&mut self, new_relation: FormulaRelation) {
        if let FormulaNode::Expression { relation, .. } = &mut self.root {
            *relation = new_relation;
        }
    }

    pub fn mark_verified(&mut self, name: &str) -> bool {
        self.root.mark_verified(name)
    }

    pub fn is_filled(&self) -> bool {
        match &self.root {
            FormulaNode::Expression { relation, children, .. } => {
                *relation != FormulaRelation::Placeholder && !children.is_empty()
            }
            FormulaNode::Clause { .. } => true,
        }
    }

    pub fn check_if_verified(&self) -> bool {
        self.is_filled() && self.root.is_verified()
    }

    pub fn display(&self) -> String {
        format!("{} = {}", self.root.name(), self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::{Aggregation, FormulaNode, FormulaRelation, FormulaSlot};

    fn revenue_per_order() -> FormulaNode {
        let mut revenue = FormulaNode::clause("revenue", "orders", "Total", Aggregation::Sum);
        if let FormulaNode::Clause { verified, .. } = &mut revenue {
            *verified = true;
        }
        FormulaNode::expression("aov", FormulaRelation::Divide)
            .with_child(revenue)
            .with_child(FormulaNode::clause("orders", "orders", "*", Aggregation::Count))
    }

    #[test]
    fn unverified_leaf_blocks_root_until_marked() {
        let mut slot = FormulaSlot::new();
        slot.assign_one(revenue_per_order());
        assert!(slot.is_filled());
        assert!(!slot.check_if_verified());

        assert!(slot.mark_verified("orders"));
        assert!(slot.check_if_verified());
    }

    #[test]
    fn empty_child_expression_is_never_verified() {
        let mut slot = FormulaSlot::new();
        slot.assign_one(
            FormulaNode::expression("ratio", FormulaRelation::Divide)
                .with_child(FormulaNode::expression("pending", FormulaRelation::Add)),
        );
        assert!(slot.is_filled());
        assert!(!slot.check_if_verified());
    }

    #[test]
    fn placeholder_root_is_not_filled() {
        let mut slot = FormulaSlot::new();
        assert!(!slot.is_filled());
        slot.assign_one(FormulaNode::clause("total", "orders", "Total", Aggregation::Sum));
        assert!(!slot.is_filled(), "placeholder relation keeps the slot open");
        slot.set_relation(FormulaRelation::Add);
        assert!(slot.is_filled());
    }

    #[test]
    fn display_renders_nested_tree() {
        let mut slot = FormulaSlot::new();
        slot.assign_one(revenue_per_order());
        assert_eq!(slot.display(), "aov = (SUM(orders.Total) / COUNT(orders.*))");
        assert_eq!(slot.root().clauses().len(), 2);
    }
}
