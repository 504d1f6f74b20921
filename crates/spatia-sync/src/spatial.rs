//! Geometric consistency checks over the locally held node/zone snapshot.
//!
//! A node's `conflict` flag is derived state: every pass recomputes it from
//! scratch out of the current snapshot and writes back only the nodes whose
//! flag actually changed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::queue::GeometryUpdate;

/// Style class the renderer applies to a conflicting node.
pub const CONFLICT_CLASS: &str = "conflict-fold";

/// Missing, non-numeric or non-finite coordinates read as zero.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(finite_or_zero(value.as_f64().unwrap_or(0.0)))
}

/// Domain a node carries when the snapshot leaves it unset.
pub const DEFAULT_NODE_DOMAIN: &str = "generic";

fn default_node_domain() -> String {
    DEFAULT_NODE_DOMAIN.to_string()
}

/// Missing, null or empty node domains read as [`DEFAULT_NODE_DOMAIN`].
fn node_domain<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let domain = Option::<String>::deserialize(deserializer)?;
    Ok(domain
        .filter(|domain| !domain.is_empty())
        .unwrap_or_else(default_node_domain))
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub x: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    #[serde(default, deserialize_with = "lenient_f64")]
    pub w: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub h: f64,
}

impl Size {
    pub fn new(w: f64, h: f64) -> Self {
        Self { w, h }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Rect {
    x: f64,
    y: f64,
    w: f64,
    h: f64,
}

impl Rect {
    fn new(position: Point, size: Size) -> Self {
        Self {
            x: finite_or_zero(position.x),
            y: finite_or_zero(position.y),
            w: finite_or_zero(size.w),
            h: finite_or_zero(size.h),
        }
    }

    fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.x + other.w
            && self.x + self.w > other.x
            && self.y < other.y + other.h
            && self.y + self.h > other.y
    }

    fn center(&self) -> Point {
        Point::new(self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    // inclusive on every edge
    fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.x <= self.x + self.w
            && point.y >= self.y
            && point.y <= self.y + self.h
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialNode {
    pub id: String,
    #[serde(default)]
    pub position: Point,
    #[serde(default)]
    pub size: Size,
    #[serde(default = "default_node_domain", deserialize_with = "node_domain")]
    pub domain: String,
    #[serde(default)]
    pub conflict: bool,
}

impl SpatialNode {
    pub fn new(
        id: impl Into<String>,
        position: Point,
        size: Size,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            position,
            size,
            domain: domain.into(),
            conflict: false,
        }
    }

    /// Style class matching the current flag.
    pub fn class_name(&self) -> &'static str {
        class_for(self.conflict)
    }

    fn bounds(&self) -> Rect {
        Rect::new(self.position, self.size)
    }
}

/// A declared region asserting the domain expected of nodes centred in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    #[serde(default)]
    pub position: Point,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub domain: String,
}

impl Zone {
    pub fn new(
        id: impl Into<String>,
        position: Point,
        size: Size,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            position,
            size,
            domain: domain.into(),
        }
    }

    fn bounds(&self) -> Rect {
        Rect::new(self.position, self.size)
    }
}

fn class_for(conflict: bool) -> &'static str {
    if conflict {
        CONFLICT_CLASS
    } else {
        ""
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictChange {
    pub node_id: String,
    pub conflict: bool,
}

impl ConflictChange {
    pub fn class_name(&self) -> &'static str {
        class_for(self.conflict)
    }
}

/// Computes the conflict flag of every node, index-aligned with `nodes`.
///
/// Rule A flags both nodes of any pair whose boxes overlap. Rule B flags a
/// node whose centre lies inside a zone of a different domain; a zone sharing
/// the node's id is skipped.
pub fn evaluate(nodes: &[SpatialNode], zones: &[Zone]) -> Vec<bool> {
    let boxes: Vec<Rect> = nodes.iter().map(SpatialNode::bounds).collect();
    let mut flags = vec![false; nodes.len()];

    for i in 0..boxes.len() {
        for j in (i + 1)..boxes.len() {
            if boxes[i].overlaps(&boxes[j]) {
                flags[i] = true;
                flags[j] = true;
            }
        }
    }

    for (i, node) in nodes.iter().enumerate() {
        if flags[i] {
            continue;
        }
        let center = boxes[i].center();
        flags[i] = zones.iter().any(|zone| {
            zone.id != node.id && zone.domain != node.domain && zone.bounds().contains(center)
        });
    }
    flags
}

#[derive(Deserialize)]
struct SceneFile {
    #[serde(default)]
    nodes: Vec<SpatialNode>,
    #[serde(default)]
    zones: Vec<Zone>,
}

/// Nodes and zones as held by the rendering layer. Node and zone ids share
/// one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SceneFile")]
pub struct Scene {
    nodes: Vec<SpatialNode>,
    zones: Vec<Zone>,
}

impl TryFrom<SceneFile> for Scene {
    type Error = SyncError;

    fn try_from(file: SceneFile) -> SyncResult<Self> {
        Scene::new(file.nodes, file.zones)
    }
}

impl Scene {
    pub fn new(nodes: Vec<SpatialNode>, zones: Vec<Zone>) -> SyncResult<Self> {
        let mut scene = Scene::default();
        for zone in zones {
            scene.upsert_zone(zone)?;
        }
        for node in nodes {
            scene.upsert_node(node)?;
        }
        Ok(scene)
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        serde_json::from_str(json).map_err(|err| SyncError::InvalidResponse(err.to_string()))
    }

    pub fn into_shared(self) -> SharedScene {
        Arc::new(Mutex::new(self))
    }

    pub fn nodes(&self) -> &[SpatialNode] {
        &self.nodes
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn node(&self, id: &str) -> Option<&SpatialNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    /// Inserts or replaces a node by id.
    pub fn upsert_node(&mut self, node: SpatialNode) -> SyncResult<()> {
        if self.zones.iter().any(|zone| zone.id == node.id) {
            return Err(SyncError::IdCollision(node.id));
        }
        match self.nodes.iter_mut().find(|slot| slot.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
        Ok(())
    }

    /// Inserts or replaces a zone by id.
    pub fn upsert_zone(&mut self, zone: Zone) -> SyncResult<()> {
        if self.nodes.iter().any(|node| node.id == zone.id) {
            return Err(SyncError::IdCollision(zone.id));
        }
        match self.zones.iter_mut().find(|slot| slot.id == zone.id) {
            Some(existing) => *existing = zone,
            None => self.zones.push(zone),
        }
        Ok(())
    }

    pub fn remove_node(&mut self, id: &str) -> Option<SpatialNode> {
        let index = self.nodes.iter().position(|node| node.id == id)?;
        Some(self.nodes.remove(index))
    }

    /// Repositions a node and returns the geometry update to sync, or `None`
    /// for an unknown id. Synced coordinates truncate toward zero.
    pub fn move_node(&mut self, id: &str, position: Point) -> Option<GeometryUpdate> {
        let node = self.nodes.iter_mut().find(|node| node.id == id)?;
        node.position = position;
        Some(GeometryUpdate {
            id: node.id.clone(),
            x: finite_or_zero(position.x).trunc() as i64,
            y: finite_or_zero(position.y).trunc() as i64,
        })
    }

    pub fn conflicting(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|node| node.conflict)
            .map(|node| node.id.as_str())
            .collect()
    }

    /// Recomputes every flag and writes back only those that changed.
    pub fn apply_conflicts(&mut self) -> Vec<ConflictChange> {
        let flags = evaluate(&self.nodes, &self.zones);
        self.nodes
            .iter_mut()
            .zip(flags)
            .filter(|(node, flag)| node.conflict != *flag)
            .map(|(node, flag)| {
                node.conflict = flag;
                ConflictChange {
                    node_id: node.id.clone(),
                    conflict: flag,
                }
            })
            .collect()
    }

    pub fn ids(&self) -> HashSet<&str> {
        self.nodes
            .iter()
            .map(|node| node.id.as_str())
            .chain(self.zones.iter().map(|zone| zone.id.as_str()))
            .collect()
    }
}

pub type SharedScene = Arc<Mutex<Scene>>;

/// Receives the flag changes of a pass. Never called with an empty slice.
pub trait ConflictSink: Send + Sync {
    fn on_conflicts(&self, changes: &[ConflictChange]);
}

impl<F> ConflictSink for F
where
    F: Fn(&[ConflictChange]) + Send + Sync,
{
    fn on_conflicts(&self, changes: &[ConflictChange]) {
        (self)(changes)
    }
}

struct CheckerShared {
    scene: SharedScene,
    sink: Option<Arc<dyn ConflictSink>>,
}

impl CheckerShared {
    fn check(&self) -> Vec<ConflictChange> {
        let changes = self.scene.lock().apply_conflicts();
        if !changes.is_empty() {
            debug!(
                target: "spatia.spatial",
                changed = changes.len(),
                flagged = changes.iter().filter(|change| change.conflict).count(),
                "conflict flags updated"
            );
            if let Some(sink) = &self.sink {
                sink.on_conflicts(&changes);
            }
        }
        changes
    }
}

/// Periodic conflict pass over a shared scene. Independent of the
/// connection state.
pub struct SpatialChecker {
    shared: Arc<CheckerShared>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SpatialChecker {
    pub fn new(scene: SharedScene, interval: Duration) -> Self {
        Self {
            shared: Arc::new(CheckerShared { scene, sink: None }),
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn with_sink(scene: SharedScene, interval: Duration, sink: Arc<dyn ConflictSink>) -> Self {
        Self {
            shared: Arc::new(CheckerShared {
                scene,
                sink: Some(sink),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn scene(&self) -> SharedScene {
        Arc::clone(&self.shared.scene)
    }

    /// Runs a single pass immediately.
    pub fn check_once(&self) -> Vec<ConflictChange> {
        self.shared.check()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let period = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                shared.check();
            }
        }));
        info!(
            target: "spatia.spatial",
            interval_ms = self.interval.as_millis() as u64,
            "spatial checker started"
        );
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!(target: "spatia.spatial", "spatial checker stopped");
        }
    }
}

impl Drop for SpatialChecker {
    fn drop(&mut self) {
        self.stop();
    }
}
