//! Logical axis names, device-mesh resources and the rules mapping one to the other.
//!
//! Parameters and activations are annotated with *logical* axis names. A list of
//! [`LogicalAxisRule`]s resolves those names to axes of the device mesh described
//! by a [`MeshResource`].

use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BATCH_AXES: &str = "oxf_batch";
pub const SEQLEN_AXES: &str = "oxf_seqlen";
pub const SEQLEN_TP_AXES: &str = "oxf_seqlen_tp";
pub const SEQLEN_CP_AXES: &str = "oxf_seqlen_cp";
pub const HEAD_AXES: &str = "oxf_head";
pub const HIDDEN_AXES: &str = "oxf_hidden";
pub const HIDDEN_TP_AXES: &str = "oxf_hidden_tp";
pub const JOINED_AXES: &str = "oxf_joined";
pub const W_NO_SHARD_AXES: &str = "oxf_w_no_shard";
pub const W_FSDP_AXES: &str = "oxf_w_fsdp";
pub const W_TP_AXES: &str = "oxf_w_tp";
pub const W_JOINED_AXES: &str = "oxf_w_joined";

/// Setting this to `1` or `true` puts the fsdp resource outside the data-parallel
/// one in the batch rule.
pub const OUTER_BATCH_FSDP_ENV: &str = "OXIFORMER_OUTER_BATCH_FSDP_DIM";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ShardingError {
    #[error("Rule for logical axis '{logical}' must map to one mesh axis or none, got {mesh}")]
    InvalidRule { logical: String, mesh: MeshAxes },

    #[error("Rule for logical axis '{axis}' diverges: given {given:?}, built-in {builtin}")]
    DivergedRule {
        axis: String,
        given: Vec<MeshAxes>,
        builtin: MeshAxes,
    },
}

pub type ShardingResult<T> = Result<T, ShardingError>;

/// Where a logical axis lands on the device mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshAxes {
    Replicated,
    Axis(String),
    Axes(Vec<String>),
}

impl MeshAxes {
    /// Collapse a list of mesh resources: none → replicated, one → single axis.
    pub fn from_resources(mut resources: Vec<String>) -> Self {
        match resources.len() {
            0 => MeshAxes::Replicated,
            1 => MeshAxes::Axis(resources.remove(0)),
            _ => MeshAxes::Axes(resources),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        match self {
            MeshAxes::Replicated => vec![],
            MeshAxes::Axis(a) => vec![a.as_str()],
            MeshAxes::Axes(axes) => axes.iter().map(String::as_str).collect(),
        }
    }
}

impl From<Option<&str>> for MeshAxes {
    fn from(axis: Option<&str>) -> Self {
        match axis {
            Some(a) => MeshAxes::Axis(a.to_string()),
            None => MeshAxes::Replicated,
        }
    }
}

impl fmt::Display for MeshAxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshAxes::Replicated => write!(f, "None"),
            MeshAxes::Axis(a) => write!(f, "{}", a),
            MeshAxes::Axes(axes) => write!(f, "({})", axes.join(", ")),
        }
    }
}

/// `logical` axis name → mesh axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalAxisRule {
    pub logical: String,
    pub mesh: MeshAxes,
}

impl LogicalAxisRule {
    pub fn new(logical: &str, mesh: MeshAxes) -> Self {
        LogicalAxisRule {
            logical: logical.to_string(),
            mesh,
        }
    }
}

impl From<(&str, Option<&str>)> for LogicalAxisRule {
    fn from((logical, mesh): (&str, Option<&str>)) -> Self {
        LogicalAxisRule::new(logical, mesh.into())
    }
}

pub type LogicalRules = Vec<LogicalAxisRule>;

/// Names of the mesh axes used for each kind of parallelism. `None` means the
/// mesh has no such axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshResource {
    pub dp_resource: Option<String>,
    pub tp_resource: Option<String>,
    pub tpsp_resource: Option<String>,
    pub fsdp_resource: Option<String>,
    pub pp_resource: Option<String>,
    pub cp_resource: Option<String>,
    /// Order the batch rule as (fsdp, dp) instead of (dp, fsdp).
    pub outer_batch_fsdp: bool,
}

impl MeshResource {
    fn outer_batch_fsdp(&self) -> bool {
        self.outer_batch_fsdp
            || std::env::var(OUTER_BATCH_FSDP_ENV)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true"))
                .unwrap_or(false)
    }
}

static GLOBAL_MESH_RESOURCE: RwLock<Option<MeshResource>> = RwLock::new(None);

/// The process-wide mesh resource (all axes absent unless a guard is active).
pub fn global_mesh_resource() -> MeshResource {
    let guard = GLOBAL_MESH_RESOURCE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.clone().unwrap_or_default()
}

/// Restores the previous global mesh resource when dropped.
#[must_use = "the mesh resource is reset as soon as the guard is dropped"]
pub struct ShardGuard {
    previous: Option<MeshResource>,
}

/// Install `resource` as the global mesh resource for the lifetime of the guard.
pub fn global_shard_guard(resource: MeshResource) -> ShardGuard {
    let mut slot = GLOBAL_MESH_RESOURCE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let previous = slot.replace(resource);
    ShardGuard { previous }
}

impl Drop for ShardGuard {
    fn drop(&mut self) {
        let mut slot = GLOBAL_MESH_RESOURCE
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = self.previous.take();
    }
}

fn resource_axes(resource: &Option<String>) -> MeshAxes {
    MeshAxes::from(resource.as_deref())
}

/// The library's own logical axes and their placement on `resource`.
pub fn builtin_axis_rules(resource: &MeshResource) -> LogicalRules {
    let ordered = if resource.outer_batch_fsdp() {
        [&resource.fsdp_resource, &resource.dp_resource]
    } else {
        [&resource.dp_resource, &resource.fsdp_resource]
    };
    let mut batch = Vec::new();
    for r in ordered.into_iter().flatten() {
        if !batch.contains(r) {
            batch.push(r.clone());
        }
    }

    vec![
        LogicalAxisRule::new(BATCH_AXES, MeshAxes::from_resources(batch)),
        LogicalAxisRule::new(SEQLEN_AXES, MeshAxes::Replicated),
        LogicalAxisRule::new(SEQLEN_TP_AXES, resource_axes(&resource.tp_resource)),
        LogicalAxisRule::new(SEQLEN_CP_AXES, resource_axes(&resource.cp_resource)),
        LogicalAxisRule::new(HEAD_AXES, resource_axes(&resource.tp_resource)),
        LogicalAxisRule::new(HIDDEN_AXES, MeshAxes::Replicated),
        LogicalAxisRule::new(HIDDEN_TP_AXES, resource_axes(&resource.tp_resource)),
        LogicalAxisRule::new(JOINED_AXES, MeshAxes::Replicated),
        LogicalAxisRule::new(W_NO_SHARD_AXES, MeshAxes::Replicated),
        LogicalAxisRule::new(W_FSDP_AXES, resource_axes(&resource.fsdp_resource)),
        LogicalAxisRule::new(W_TP_AXES, resource_axes(&resource.tp_resource)),
        LogicalAxisRule::new(W_JOINED_AXES, MeshAxes::Replicated),
    ]
}

/// Resolve logical axis names to mesh axes.
///
/// Rules are visited in order; a rule applies to every still unresolved
/// dimension with its logical name unless one of its mesh axes is already
/// taken by another dimension. Unresolved dimensions stay replicated.
pub fn logical_to_mesh_axes(axes: &[String], rules: &[LogicalAxisRule]) -> Vec<MeshAxes> {
    let mut resolved: Vec<Option<MeshAxes>> = vec![None; axes.len()];
    let mut used: HashSet<String> = HashSet::new();

    for rule in rules {
        for (i, name) in axes.iter().enumerate() {
            if resolved[i].is_some() || *name != rule.logical {
                continue;
            }
            let names = rule.mesh.names();
            if names.iter().any(|n| used.contains(*n)) {
                continue;
            }
            used.extend(names.iter().map(|n| n.to_string()));
            resolved[i] = Some(rule.mesh.clone());
        }
    }

    resolved
        .into_iter()
        .map(|r| r.unwrap_or(MeshAxes::Replicated))
        .collect()
}
