use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub name: String,
    pub description: String,
    pub checked: bool,
}

/// Ordered plan of named steps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistSlot {
    pub min_size: usize,
    steps: Vec<ChecklistItem>,
}

impl ChecklistSlot {
    pub fn new(min_size: usize) -> Self {
        Self { min_size, steps: Vec::new() }
    }

    pub fn steps(&self) -> &[ChecklistItem] {
        &self.steps
    }

    pub fn add_one(&mut self, name: impl Into<String>, description: impl Into<String>) -> bool {
        let name = name.into();
        if name.trim().is_empty() || self.steps.iter().any(|step| step.name == name) {
            return false;
        }
        self.steps.push(ChecklistItem { name, description: description.into(), checked: false });
        true
    }

    pub fn check(&mut self, name: &str) -> bool {
        match self.steps.iter_mut().find(|step| step.name == name) {
            Some(step) => {
                step.checked = true;
                true
            }
            None => false,
        }
    }

    pub fn next_unchecked(&self) -> Option<&ChecklistItem> {
        self.steps.iter().find(|step| !step.checked)
    }

    pub fn is_filled(&self) -> bool {
        self.steps.len() >= self.min_size
    }

    pub fn is_verified(&self) -> bool {
        self.is_filled() && self.steps.iter().all(|step| step.checked)
    }
}
