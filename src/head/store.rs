//! Head storage keyed by effective identity, and seeded parameter init

use super::dense::{Dense, Param};
use super::{ClassificationHead, Head, MaskedLmHead, PretrainHead, SequenceTagHead};
use crate::config::HeadParams;
use crate::error::{MultitaskError, Result};
use crate::features::{RepresentationKind, Representations};
use crate::optim::NamedParam;
use crate::problem::{Problem, ProblemKind};
use crate::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// 64-bit FNV-1a
fn fnv1a(text: &str) -> u64 {
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Seeded initializer issuing parameters under a name prefix
///
/// Every tensor draws from its own stream seeded by the run seed and the
/// parameter's full name, so values do not depend on creation order.
#[derive(Debug, Clone)]
pub(crate) struct ParamInit {
    prefix: String,
    seed: u64,
}

impl ParamInit {
    pub fn new(prefix: impl Into<String>, seed: u64) -> Self {
        Self {
            prefix: prefix.into(),
            seed,
        }
    }

    /// Initializer for a nested scope, `<prefix><scope>/`
    pub fn child(&self, scope: &str) -> Self {
        Self::new(format!("{}{scope}/", self.prefix), self.seed)
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    fn uniform(&self, name: &str, len: usize, limit: f32) -> Param {
        let full = self.full_name(name);
        let mut rng = StdRng::seed_from_u64(self.seed ^ fnv1a(&full));
        let limit = limit.max(0.0);
        let data = (0..len).map(|_| rng.random_range(-limit..=limit)).collect();
        Param::new(full, Tensor::from_vec(data, true))
    }

    /// Xavier-uniform `[fan_in, fan_out]`
    pub fn xavier(&self, name: &str, fan_in: usize, fan_out: usize) -> Param {
        let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
        self.uniform(name, fan_in * fan_out, limit)
    }

    /// Zero-mean uniform with standard deviation `std`
    pub fn uniform_std(&self, name: &str, len: usize, std: f32) -> Param {
        self.uniform(name, len, std * 3.0f32.sqrt())
    }

    pub fn zeros(&self, name: &str, len: usize) -> Param {
        Param::new(self.full_name(name), Tensor::zeros(len, true))
    }

    pub fn ones(&self, name: &str, len: usize) -> Param {
        Param::new(self.full_name(name), Tensor::ones(len, true))
    }

    /// Dense layer with a Xavier kernel and zero bias under `<scope>/`
    pub fn dense_xavier(&self, scope: &str, in_dim: usize, out_dim: usize) -> Dense {
        Dense {
            kernel: self.xavier(&format!("{scope}/kernel"), in_dim, out_dim),
            bias: self.zeros(&format!("{scope}/bias"), out_dim),
            in_dim,
            out_dim,
        }
    }

    /// Dense layer with a uniform(`std`) kernel and zero bias under `<scope>/`
    pub fn dense_uniform(&self, scope: &str, in_dim: usize, out_dim: usize, std: f32) -> Dense {
        Dense {
            kernel: self.uniform_std(&format!("{scope}/kernel"), in_dim * out_dim, std),
            bias: self.zeros(&format!("{scope}/bias"), out_dim),
            in_dim,
            out_dim,
        }
    }

    /// Dropout / sampling stream of the head owning this prefix
    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed.rotate_left(17) ^ fnv1a(&self.prefix))
    }
}

/// The single authoritative map from effective identity to live head
///
/// A head is created exactly once per identity, on first use, with the input
/// widths of the representations it first sees. Its parameters are named
/// `<namespace><identity>_top/<param>`.
pub struct HeadStore {
    namespace: String,
    params: HeadParams,
    heads: BTreeMap<String, Box<dyn Head>>,
}

impl HeadStore {
    /// Store without a namespace
    pub fn new(params: HeadParams) -> Result<Self> {
        Self::with_namespace("", params)
    }

    /// Store whose parameter names start with `namespace`
    ///
    /// Fails with `InvalidConfig` when `params` is out of range.
    pub fn with_namespace(namespace: impl Into<String>, params: HeadParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            namespace: namespace.into(),
            params,
            heads: BTreeMap::new(),
        })
    }

    /// Name prefix of every parameter
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn init_for(&self, identity: &str) -> ParamInit {
        ParamInit::new(format!("{}{identity}_top/", self.namespace), self.params.seed)
    }

    /// Head for `identity`, created for its kind if absent
    ///
    /// `identity` must be the effective identity problem (the end of its
    /// share chain); tasks sharing it get the same instance.
    pub fn get_or_create(&mut self, identity: &Problem, reps: &Representations) -> Result<&mut dyn Head> {
        let init = self.init_for(&identity.name);
        let params = self.params.clone();
        let width = identity.output_width();
        self.insert_with(&identity.name, || {
            let head: Box<dyn Head> = match identity.kind {
                ProblemKind::SequenceTag => {
                    let seq = reps.get(RepresentationKind::Sequence)?;
                    Box::new(SequenceTagHead::new(&init, &params, seq.width(), width)?)
                }
                ProblemKind::Classification => {
                    let pooled = reps.get(RepresentationKind::Pooled)?;
                    Box::new(ClassificationHead::new(&init, &params, pooled.width(), width))
                }
                ProblemKind::Pretrain => Box::new(PretrainHead::new(&init, &params, reps)?),
            };
            Ok(head)
        })
    }

    /// Stand-alone masked-LM head under `identity`, created if absent
    pub fn get_or_create_masked_lm(&mut self, identity: &str, reps: &Representations) -> Result<&mut dyn Head> {
        let init = self.init_for(identity);
        let params = self.params.clone();
        self.insert_with(identity, || {
            let head: Box<dyn Head> = Box::new(MaskedLmHead::new(&init, &params, reps)?);
            Ok(head)
        })
    }

    fn insert_with(
        &mut self,
        identity: &str,
        build: impl FnOnce() -> Result<Box<dyn Head>>,
    ) -> Result<&mut dyn Head> {
        let slot = match self.heads.entry(identity.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let head = build()?;
                tracing::info!(
                    identity,
                    kind = head.name(),
                    parameters = head.parameters().len(),
                    "created head"
                );
                entry.insert(head)
            }
        };
        let head: &mut dyn Head = &mut **slot;
        Ok(head)
    }

    /// Live head for `identity`
    pub fn get(&self, identity: &str) -> Option<&dyn Head> {
        let head: &dyn Head = &**self.heads.get(identity)?;
        Some(head)
    }

    /// Mutable live head for `identity`
    pub fn get_mut(&mut self, identity: &str) -> Option<&mut dyn Head> {
        let head: &mut dyn Head = &mut **self.heads.get_mut(identity)?;
        Some(head)
    }

    /// Whether a head exists for `identity`
    pub fn contains(&self, identity: &str) -> bool {
        self.heads.contains_key(identity)
    }

    /// Identities with a live head, sorted
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.heads.keys().map(String::as_str)
    }

    /// Number of live heads
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether no head exists yet
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Every parameter of every head, by stable name
    pub fn parameters(&self) -> Vec<(String, &Tensor)> {
        self.heads.values().flat_map(|head| head.parameters()).collect()
    }

    /// Every parameter of every head, mutably
    pub fn parameters_mut(&mut self) -> Vec<NamedParam<'_>> {
        self.heads.values_mut().flat_map(|head| head.parameters_mut()).collect()
    }

    /// Clear every parameter gradient
    pub fn zero_grad(&self) {
        for (_, param) in self.parameters() {
            param.zero_grad();
        }
    }

    /// Parameter values by stable name
    pub fn state_dict(&self) -> BTreeMap<String, Vec<f32>> {
        self.parameters()
            .into_iter()
            .map(|(name, tensor)| (name, tensor.data().to_vec()))
            .collect()
    }

    /// Restore values by name, returning how many parameters were restored
    ///
    /// Names without a live parameter are ignored; a length disagreement is
    /// a [`MultitaskError::ShapeMismatch`] and leaves that parameter as is.
    pub fn load_state_dict(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<usize> {
        let mut restored = 0;
        for (name, param) in self.parameters_mut() {
            let Some(values) = state.get(&name) else {
                continue;
            };
            if values.len() != param.len() {
                return Err(MultitaskError::shape(name, vec![param.len()], vec![values.len()]));
            }
            param
                .data_mut()
                .iter_mut()
                .zip(values)
                .for_each(|(dst, &src)| *dst = src);
            restored += 1;
        }
        Ok(restored)
    }
}

impl std::fmt::Debug for HeadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadStore")
            .field("namespace", &self.namespace)
            .field("heads", &self.heads.keys().collect::<Vec<_>>())
            .finish()
    }
}
