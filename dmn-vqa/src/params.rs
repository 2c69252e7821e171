//! Parameter groups and checkpoints.
//!
//! The variables of the model are split in three groups:
//! - `backbone`: the convolutional feature extractor, only trained when the backbone is,
//! - `reasoning`: the encoders, the episodic memory and the decoder,
//! - `frozen`: values that are part of the model but are never updated, e.g. fixed word
//!   embeddings.
//!
//! Checkpoints are safetensors files where each name is prefixed by its group.
use std::collections::HashMap;
use std::sync::MutexGuard;

use candle::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Group {
    Backbone,
    Reasoning,
    Frozen,
}

impl Group {
    pub const ALL: [Group; 3] = [Group::Backbone, Group::Reasoning, Group::Frozen];

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Backbone => "backbone",
            Self::Reasoning => "reasoning",
            Self::Frozen => "frozen",
        }
    }
}

#[derive(Clone)]
pub struct ParamGroups {
    backbone: VarMap,
    reasoning: VarMap,
    frozen: VarMap,
    dtype: DType,
    device: Device,
}

// VarMap does not implement Debug.
impl std::fmt::Debug for ParamGroups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamGroups")
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

fn lock(varmap: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    varmap
        .data()
        .lock()
        .map_err(|err| candle::Error::Msg(format!("poisoned parameter store: {err}")))
}

impl ParamGroups {
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            backbone: VarMap::new(),
            reasoning: VarMap::new(),
            frozen: VarMap::new(),
            dtype,
            device: device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self, group: Group) -> &VarMap {
        match group {
            Group::Backbone => &self.backbone,
            Group::Reasoning => &self.reasoning,
            Group::Frozen => &self.frozen,
        }
    }

    /// A builder creating (or retrieving) the variables of `group`.
    pub fn var_builder(&self, group: Group) -> VarBuilder<'static> {
        VarBuilder::from_varmap(self.varmap(group), self.dtype, &self.device)
    }

    /// The variables of `group` sorted by name.
    pub fn named_vars(&self, group: Group) -> Result<Vec<(String, Var)>> {
        let data = lock(self.varmap(group))?;
        let mut vars = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect::<Vec<_>>();
        vars.sort_by(|(n1, _), (n2, _)| n1.cmp(n2));
        Ok(vars)
    }

    /// The variables updated by the optimizer, the backbone ones are only included when the
    /// backbone is trained.
    pub fn trainable_vars(&self, train_backbone: bool) -> Result<Vec<Var>> {
        let mut vars = vec![];
        if train_backbone {
            vars.extend(self.named_vars(Group::Backbone)?.into_iter().map(|(_, v)| v));
        }
        vars.extend(self.named_vars(Group::Reasoning)?.into_iter().map(|(_, v)| v));
        Ok(vars)
    }

    /// The trainable variables that `filter` selects, by name.
    pub fn select(&self, train_backbone: bool, filter: impl Fn(&str) -> bool) -> Result<Vec<Tensor>> {
        let mut groups = vec![Group::Reasoning];
        if train_backbone {
            groups.push(Group::Backbone)
        }
        let mut tensors = vec![];
        for group in groups {
            for (name, var) in self.named_vars(group)? {
                if filter(&name) {
                    tensors.push(var.as_tensor().clone())
                }
            }
        }
        Ok(tensors)
    }

    /// Number of scalar parameters of `group` whose name starts with `prefix`.
    pub fn num_parameters(&self, group: Group, prefix: &str) -> Result<usize> {
        let data = lock(self.varmap(group))?;
        let count = data
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(_, var)| var.elem_count())
            .sum();
        Ok(count)
    }

    /// Overwrites the value of an existing variable.
    pub fn set(&self, group: Group, name: &str, value: &Tensor) -> Result<()> {
        let mut varmap = self.varmap(group).clone();
        varmap.set_one(name, value)
    }

    fn collect(&self, groups: &[Group]) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for &group in groups {
            for (name, var) in self.named_vars(group)? {
                let name = format!("{}.{name}", group.prefix());
                tensors.insert(name, var.as_tensor().clone());
            }
        }
        Ok(tensors)
    }

    fn restore<P: AsRef<std::path::Path>>(&self, groups: &[Group], path: P) -> Result<()> {
        let path = path.as_ref();
        let tensors = candle::safetensors::load(path, &self.device)?;
        for &group in groups {
            for (name, var) in self.named_vars(group)? {
                let key = format!("{}.{name}", group.prefix());
                match tensors.get(&key) {
                    None => candle::bail!("cannot find {key} in {path:?}"),
                    Some(value) => var.set(&value.to_dtype(var.dtype())?)?,
                }
            }
        }
        tracing::info!(?path, groups = ?groups, "restored parameters");
        Ok(())
    }

    /// Saves every group.
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        candle::safetensors::save(&self.collect(&Group::ALL)?, path)
    }

    /// Restores every group, all the existing variables must be found in the file.
    pub fn load<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.restore(&Group::ALL, path)
    }

    /// Saves the backbone alone, so that it can be reused by models with a different reasoning
    /// module.
    pub fn save_backbone<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        candle::safetensors::save(&self.collect(&[Group::Backbone])?, path)
    }

    pub fn load_backbone<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        self.restore(&[Group::Backbone], path)
    }
}
