use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, LayerResult};
use crate::sharding::{logical_to_mesh_axes, LogicalAxisRule, MeshAxes};
use crate::Array;

/// Parameter values keyed by their `/`-separated path, e.g. `mlp/wi_kernel`.
pub type ParamTree = BTreeMap<String, Array>;

/// A trainable array together with the logical axis name of each dimension.
///
/// An empty `axes` list means the parameter is unannotated and stays replicated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub value: Array,
    pub axes: Vec<String>,
}

impl Param {
    pub fn new(value: Array, axes: &[String]) -> LayerResult<Self> {
        if !axes.is_empty() && axes.len() != value.ndim() {
            return Err(LayerError::InvalidConfig(format!(
                "{} logical axes given for a parameter of shape {}",
                axes.len(),
                value.shape()
            )));
        }
        Ok(Param {
            value,
            axes: axes.to_vec(),
        })
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.value.shape_vec()
    }
}

/// Prefix child parameter names with `scope/`.
pub fn scoped<'a>(scope: &str, params: Vec<(String, &'a Param)>) -> Vec<(String, &'a Param)> {
    params
        .into_iter()
        .map(|(name, p)| (format!("{}/{}", scope, name), p))
        .collect()
}

pub fn scoped_mut<'a>(
    scope: &str,
    params: Vec<(String, &'a mut Param)>,
) -> Vec<(String, &'a mut Param)> {
    params
        .into_iter()
        .map(|(name, p)| (format!("{}/{}", scope, name), p))
        .collect()
}

/// Prefix child parameter names without a separator, e.g. `wi_` + `kernel`.
pub fn prefixed<'a>(prefix: &str, params: Vec<(String, &'a Param)>) -> Vec<(String, &'a Param)> {
    params
        .into_iter()
        .map(|(name, p)| (format!("{}{}", prefix, name), p))
        .collect()
}

pub fn prefixed_mut<'a>(
    prefix: &str,
    params: Vec<(String, &'a mut Param)>,
) -> Vec<(String, &'a mut Param)> {
    params
        .into_iter()
        .map(|(name, p)| (format!("{}{}", prefix, name), p))
        .collect()
}

/// Base trait of every layer: exposes the parameters it owns.
pub trait Module {
    /// All parameters of this module and its children, with their paths.
    fn named_params(&self) -> Vec<(String, &Param)>;

    fn named_params_mut(&mut self) -> Vec<(String, &mut Param)>;

    /// Total number of scalar parameters.
    fn param_count(&self) -> usize {
        self.named_params()
            .iter()
            .map(|(_, p)| p.value.numel())
            .sum()
    }

    /// Snapshot of all parameter values.
    fn state_dict(&self) -> ParamTree {
        self.named_params()
            .into_iter()
            .map(|(name, p)| (name, p.value.clone()))
            .collect()
    }

    /// Replace every parameter value from `tree`.
    ///
    /// Strict: each parameter must be present with the same shape and `tree`
    /// may not contain extra entries. Nothing is written unless all checks pass.
    fn load_state_dict(&mut self, tree: &ParamTree) -> LayerResult<()> {
        let mut params = self.named_params_mut();
        let known: HashSet<&str> = params.iter().map(|(name, _)| name.as_str()).collect();
        if let Some(extra) = tree.keys().find(|k| !known.contains(k.as_str())) {
            return Err(LayerError::UnexpectedParam(extra.clone()));
        }
        for (name, param) in params.iter() {
            let value = tree
                .get(name)
                .ok_or_else(|| LayerError::MissingParam(name.clone()))?;
            if value.shape() != param.value.shape() {
                return Err(LayerError::ParamShape {
                    name: name.clone(),
                    expected: param.shape_vec(),
                    got: value.shape_vec(),
                });
            }
        }
        for (name, param) in params.iter_mut() {
            if let Some(value) = tree.get(name) {
                param.value = value.clone();
            }
        }
        Ok(())
    }

    /// Write the parameters to a JSON file.
    fn save<P: AsRef<Path>>(&self, path: P) -> LayerResult<()>
    where
        Self: Sized,
    {
        let tree = self.state_dict();
        let json = serde_json::to_string_pretty(&tree)?;
        fs::write(path.as_ref(), json)?;
        debug!("saved {} parameter arrays to {}", tree.len(), path.as_ref().display());
        Ok(())
    }

    /// Load parameters written by [`Module::save`].
    fn load<P: AsRef<Path>>(&mut self, path: P) -> LayerResult<()>
    where
        Self: Sized,
    {
        let json = fs::read_to_string(path.as_ref())?;
        let tree: ParamTree = serde_json::from_str(&json)?;
        self.load_state_dict(&tree)?;
        debug!("loaded {} parameter arrays from {}", tree.len(), path.as_ref().display());
        Ok(())
    }

    /// Mesh placement of every parameter under the given logical axis rules.
    fn partition_specs(&self, rules: &[LogicalAxisRule]) -> BTreeMap<String, Vec<MeshAxes>> {
        self.named_params()
            .into_iter()
            .map(|(name, p)| {
                let spec = if p.axes.is_empty() {
                    vec![MeshAxes::Replicated; p.value.ndim()]
                } else {
                    logical_to_mesh_axes(&p.axes, rules)
                };
                (name, spec)
            })
            .collect()
    }
}
