use crate::ansi::ColorClass;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

pub type PaneId = u64;

const MIN_SHARE: f64 = 0.2;
const SIZE_EPSILON: f64 = 1e-9;

static NEXT_PANE_ID: AtomicU64 = AtomicU64::new(1);

fn next_pane_id() -> PaneId {
    NEXT_PANE_ID.fetch_add(1, Ordering::Relaxed)
}

/// `Vertical` places children side by side, `Horizontal` stacks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitDirection {
    Horizontal,
    #[default]
    Vertical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pane {
    pub id: PaneId,
    pub name: String,
    /// Commands shown in this pane; empty means all of them.
    pub process_scope: BTreeSet<String>,
    pub hidden: BTreeSet<String>,
    pub text_filter: String,
    pub color_filter: Option<ColorClass>,
    pub paused: bool,
    /// Lines above the bottom while frozen.
    pub scroll_offset: usize,
}

impl Pane {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: next_pane_id(),
            name: name.into(),
            process_scope: BTreeSet::new(),
            hidden: BTreeSet::new(),
            text_filter: String::new(),
            color_filter: None,
            paused: false,
            scroll_offset: 0,
        }
    }

    pub fn toggle_scope(&mut self, command: &str) {
        if !self.process_scope.remove(command) {
            self.process_scope.insert(command.to_string());
        }
    }

    pub fn toggle_hidden(&mut self, command: &str) {
        if !self.hidden.remove(command) {
            self.hidden.insert(command.to_string());
        }
    }

    pub fn has_filters(&self) -> bool {
        !self.text_filter.trim().is_empty() || self.color_filter.is_some()
    }

    pub fn shows(&self, command: &str) -> bool {
        (self.process_scope.is_empty() || self.process_scope.contains(command))
            && !self.hidden.contains(command)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub direction: SplitDirection,
    pub children: Vec<PaneNode>,
    /// Flex ratios, one per child, summing to `children.len()`.
    pub sizes: Vec<f64>,
}

impl Split {
    fn normalize_sizes(&mut self) {
        let count = self.children.len();
        if self.sizes.len() != count
            || self.sizes.iter().any(|size| !size.is_finite() || *size <= 0.0)
        {
            self.sizes = vec![1.0; count];
            return;
        }
        let total: f64 = self.sizes.iter().sum();
        let target = count as f64;
        if (total - target).abs() < SIZE_EPSILON {
            return;
        }
        for size in &mut self.sizes {
            *size = *size * target / total;
        }
    }

    fn pane_index(&self, id: PaneId) -> Option<usize> {
        self.children
            .iter()
            .position(|child| matches!(child, PaneNode::Pane(pane) if pane.id == id))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaneNode {
    Pane(Pane),
    Split(Split),
}

impl PaneNode {
    fn find(&self, id: PaneId) -> Option<&Pane> {
        match self {
            PaneNode::Pane(pane) => (pane.id == id).then_some(pane),
            PaneNode::Split(split) => split.children.iter().find_map(|child| child.find(id)),
        }
    }

    fn find_mut(&mut self, id: PaneId) -> Option<&mut Pane> {
        match self {
            PaneNode::Pane(pane) => (pane.id == id).then_some(pane),
            PaneNode::Split(split) => split
                .children
                .iter_mut()
                .find_map(|child| child.find_mut(id)),
        }
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a Pane>) {
        match self {
            PaneNode::Pane(pane) => out.push(pane),
            PaneNode::Split(split) => {
                for child in &split.children {
                    child.collect(out);
                }
            }
        }
    }

    fn collect_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Pane>) {
        match self {
            PaneNode::Pane(pane) => out.push(pane),
            PaneNode::Split(split) => {
                for child in &mut split.children {
                    child.collect_mut(out);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    NotFound,
    LastPane,
}

/// Screen region assigned to a pane by [`PaneTree::layout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Area {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaneTree {
    root: PaneNode,
}

impl Default for PaneTree {
    fn default() -> Self {
        Self {
            root: PaneNode::Pane(Pane::new("main")),
        }
    }
}

impl PaneTree {
    pub fn root(&self) -> &PaneNode {
        &self.root
    }

    pub fn find(&self, id: PaneId) -> Option<&Pane> {
        self.root.find(id)
    }

    pub fn find_mut(&mut self, id: PaneId) -> Option<&mut Pane> {
        self.root.find_mut(id)
    }

    /// Panes in pre-order; this order drives next/previous navigation.
    pub fn panes(&self) -> Vec<&Pane> {
        let mut out = Vec::new();
        self.root.collect(&mut out);
        out
    }

    pub fn panes_mut(&mut self) -> Vec<&mut Pane> {
        let mut out = Vec::new();
        self.root.collect_mut(&mut out);
        out
    }

    pub fn pane_ids(&self) -> Vec<PaneId> {
        self.panes().iter().map(|pane| pane.id).collect()
    }

    pub fn pane_count(&self) -> usize {
        self.panes().len()
    }

    pub fn first_id(&self) -> PaneId {
        match self.panes().first() {
            Some(pane) => pane.id,
            None => 0,
        }
    }

    pub fn next_id(&self, id: PaneId) -> PaneId {
        self.step(id, 1)
    }

    pub fn prev_id(&self, id: PaneId) -> PaneId {
        self.step(id, -1)
    }

    fn step(&self, id: PaneId, delta: isize) -> PaneId {
        let ids = self.pane_ids();
        if ids.is_empty() {
            return id;
        }
        let Some(index) = ids.iter().position(|candidate| *candidate == id) else {
            return ids[0];
        };
        let len = ids.len() as isize;
        let next = (index as isize + delta).rem_euclid(len) as usize;
        ids[next]
    }

    /// Splits pane `id`, returning the new pane's id. The new pane copies
    /// the original's scope and hidden set. Unknown ids are ignored.
    pub fn split(&mut self, id: PaneId, direction: SplitDirection) -> Option<PaneId> {
        let original = self.find(id)?;
        let mut fresh = Pane::new(format!("pane {}", self.pane_count() + 1));
        fresh.process_scope = original.process_scope.clone();
        fresh.hidden = original.hidden.clone();
        let new_id = fresh.id;
        let mut slot = Some(fresh);
        split_in(&mut self.root, id, direction, &mut slot).then_some(new_id)
    }

    /// Removes pane `id`. The last remaining pane is never removed.
    pub fn close(&mut self, id: PaneId) -> CloseOutcome {
        if self.find(id).is_none() {
            return CloseOutcome::NotFound;
        }
        if self.pane_count() <= 1 {
            return CloseOutcome::LastPane;
        }
        remove_in(&mut self.root, id);
        flatten(&mut self.root);
        CloseOutcome::Closed
    }

    /// Grows (positive `delta`) or shrinks pane `id` inside its parent
    /// split, trading space with its next sibling (or previous, for the
    /// last child).
    pub fn resize(&mut self, id: PaneId, delta: f64) -> bool {
        resize_in(&mut self.root, id, delta)
    }

    /// Routes `command` to pane `id` and hides it everywhere else.
    pub fn assign_process(&mut self, id: PaneId, command: &str) -> bool {
        if self.find(id).is_none() {
            return false;
        }
        for pane in self.panes_mut() {
            if pane.id == id {
                pane.process_scope.insert(command.to_string());
                pane.hidden.remove(command);
            } else {
                pane.hidden.insert(command.to_string());
            }
        }
        true
    }

    pub fn serialize(&self) -> SerializedNode {
        serialize_node(&self.root)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self.serialize()).unwrap_or(Value::Null)
    }

    pub fn from_serialized(node: SerializedNode) -> Self {
        let mut root = deserialize_node(node);
        flatten(&mut root);
        Self { root }
    }

    /// Builds a tree from persisted JSON, falling back to a single pane
    /// when the value cannot be interpreted as a layout.
    pub fn from_value(value: &Value) -> Self {
        if value.is_null() {
            return Self::default();
        }
        match SerializedNode::deserialize(value) {
            Ok(node) => Self::from_serialized(node),
            Err(err) => {
                warn!("pane_layout_invalid: {err}");
                Self::default()
            }
        }
    }

    /// Divides `area` among panes according to the flex ratios. Each
    /// split hands out whole cells and gives rounding leftovers to its last
    /// child, so the regions tile `area` exactly.
    pub fn layout(&self, area: Area) -> Vec<(PaneId, Area)> {
        let mut out = Vec::new();
        layout_node(&self.root, area, &mut out);
        out
    }
}

fn split_in(
    node: &mut PaneNode,
    id: PaneId,
    direction: SplitDirection,
    fresh: &mut Option<Pane>,
) -> bool {
    if matches!(node, PaneNode::Pane(pane) if pane.id == id) {
        let Some(new_pane) = fresh.take() else {
            return false;
        };
        let original = std::mem::replace(
            node,
            PaneNode::Split(Split {
                direction,
                children: Vec::new(),
                sizes: Vec::new(),
            }),
        );
        *node = PaneNode::Split(Split {
            direction,
            children: vec![original, PaneNode::Pane(new_pane)],
            sizes: vec![1.0, 1.0],
        });
        return true;
    }
    let PaneNode::Split(split) = node else {
        return false;
    };
    if split.direction == direction {
        if let Some(index) = split.pane_index(id) {
            let Some(new_pane) = fresh.take() else {
                return false;
            };
            split.normalize_sizes();
            let share = split.sizes[index] / 2.0;
            split.sizes[index] = share;
            split.children.insert(index + 1, PaneNode::Pane(new_pane));
            split.sizes.insert(index + 1, share);
            split.normalize_sizes();
            return true;
        }
    }
    split
        .children
        .iter_mut()
        .any(|child| split_in(child, id, direction, fresh))
}

fn remove_in(node: &mut PaneNode, id: PaneId) -> bool {
    let PaneNode::Split(split) = node else {
        return false;
    };
    if let Some(index) = split.pane_index(id) {
        split.normalize_sizes();
        split.children.remove(index);
        split.sizes.remove(index);
        split.normalize_sizes();
        if split.children.len() == 1 {
            if let Some(only) = split.children.pop() {
                *node = only;
            }
        }
        return true;
    }
    split
        .children
        .iter_mut()
        .any(|child| remove_in(child, id))
}

/// Restores the structural invariants bottom-up: no split with fewer than
/// two children, no split directly inside a split of the same direction,
/// sizes matching children.
fn flatten(node: &mut PaneNode) {
    let PaneNode::Split(split) = node else {
        return;
    };
    for child in &mut split.children {
        flatten(child);
    }
    split.normalize_sizes();
    let direction = split.direction;
    let nested = split
        .children
        .iter()
        .any(|child| matches!(child, PaneNode::Split(inner) if inner.direction == direction));
    if nested {
        let children = std::mem::take(&mut split.children);
        let sizes = std::mem::take(&mut split.sizes);
        for (child, slot) in children.into_iter().zip(sizes) {
            match child {
                PaneNode::Split(inner) if inner.direction == direction => {
                    let inner_total: f64 = inner.sizes.iter().sum();
                    for (grandchild, size) in inner.children.into_iter().zip(inner.sizes) {
                        split.children.push(grandchild);
                        split.sizes.push(slot * size / inner_total);
                    }
                }
                other => {
                    split.children.push(other);
                    split.sizes.push(slot);
                }
            }
        }
        split.normalize_sizes();
    }
    match split.children.len() {
        0 => *node = PaneNode::Pane(Pane::new("main")),
        1 => {
            if let Some(only) = split.children.pop() {
                *node = only;
            }
        }
        _ => {}
    }
}

fn resize_in(node: &mut PaneNode, id: PaneId, delta: f64) -> bool {
    let PaneNode::Split(split) = node else {
        return false;
    };
    if let Some(index) = split.pane_index(id) {
        split.normalize_sizes();
        let neighbor = if index + 1 < split.children.len() {
            index + 1
        } else {
            index - 1
        };
        // Neither side is pushed below MIN_SHARE; a side already under it
        // only gets bigger.
        let max_grow = (split.sizes[neighbor] - MIN_SHARE).max(0.0);
        let max_shrink = (split.sizes[index] - MIN_SHARE).max(0.0);
        let grow = delta.clamp(-max_shrink, max_grow);
        if grow.abs() < SIZE_EPSILON {
            return false;
        }
        split.sizes[index] += grow;
        split.sizes[neighbor] -= grow;
        return true;
    }
    split
        .children
        .iter_mut()
        .any(|child| resize_in(child, id, delta))
}

fn layout_node(node: &PaneNode, area: Area, out: &mut Vec<(PaneId, Area)>) {
    let split = match node {
        PaneNode::Pane(pane) => {
            out.push((pane.id, area));
            return;
        }
        PaneNode::Split(split) => split,
    };
    let total_cells = match split.direction {
        SplitDirection::Vertical => area.width,
        SplitDirection::Horizontal => area.height,
    };
    let total_weight: f64 = split.sizes.iter().sum();
    let count = split.children.len();
    let mut offset: u16 = 0;
    for (index, child) in split.children.iter().enumerate() {
        let cells = if index + 1 == count {
            total_cells.saturating_sub(offset)
        } else {
            let weight = split.sizes.get(index).copied().unwrap_or(1.0);
            let share = if total_weight > 0.0 {
                (f64::from(total_cells) * weight / total_weight).floor() as u16
            } else {
                total_cells / count as u16
            };
            share.min(total_cells.saturating_sub(offset))
        };
        let child_area = match split.direction {
            SplitDirection::Vertical => Area {
                x: area.x + offset,
                y: area.y,
                width: cells,
                height: area.height,
            },
            SplitDirection::Horizontal => Area {
                x: area.x,
                y: area.y + offset,
                width: area.width,
                height: cells,
            },
        };
        layout_node(child, child_area, out);
        offset = offset.saturating_add(cells);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SerializedNode {
    Pane(SerializedPane),
    Split(SerializedSplit),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedPane {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub processes: Vec<String>,
    #[serde(default)]
    pub hidden: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text_filter: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_color"
    )]
    pub color_filter: Option<ColorClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedSplit {
    #[serde(default)]
    pub direction: SplitDirection,
    #[serde(default)]
    pub children: Vec<SerializedNode>,
    #[serde(default)]
    pub sizes: Vec<f64>,
}

/// Unknown color names load as "no color filter".
fn deserialize_color<'de, D>(deserializer: D) -> Result<Option<ColorClass>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn serialize_node(node: &PaneNode) -> SerializedNode {
    match node {
        PaneNode::Pane(pane) => SerializedNode::Pane(SerializedPane {
            name: pane.name.clone(),
            processes: pane.process_scope.iter().cloned().collect(),
            hidden: pane.hidden.iter().cloned().collect(),
            text_filter: pane.text_filter.clone(),
            color_filter: pane.color_filter,
        }),
        PaneNode::Split(split) => SerializedNode::Split(SerializedSplit {
            direction: split.direction,
            children: split.children.iter().map(serialize_node).collect(),
            sizes: split.sizes.clone(),
        }),
    }
}

fn deserialize_node(node: SerializedNode) -> PaneNode {
    match node {
        SerializedNode::Pane(saved) => {
            let name = if saved.name.trim().is_empty() {
                "main".to_string()
            } else {
                saved.name
            };
            let mut pane = Pane::new(name);
            pane.process_scope = saved.processes.into_iter().collect();
            pane.hidden = saved.hidden.into_iter().collect();
            pane.text_filter = saved.text_filter;
            pane.color_filter = saved.color_filter;
            PaneNode::Pane(pane)
        }
        SerializedNode::Split(saved) => {
            let mut split = Split {
                direction: saved.direction,
                children: saved.children.into_iter().map(deserialize_node).collect(),
                sizes: saved.sizes,
            };
            split.normalize_sizes();
            PaneNode::Split(split)
        }
    }
}
