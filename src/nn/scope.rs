//! Named variable scopes with explicit sharing.
use std::ops::Div;

use log::trace;
use tch::{nn, Device, Tensor};

use super::init::{self, Init};
use crate::{FaceEmbedError, Result};

/// Whether a scope creates its variables or picks up existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reuse {
    /// Create every variable; creating a name twice is an error.
    #[default]
    Create,
    /// Fetch every variable from the store; a missing name is an error.
    Share,
}

/// A position in a `VarStore` together with the sharing policy used to
/// obtain variables under it.
///
/// Scopes are nested with `/`, the variables they create end up in the
/// store under the dot-joined path, e.g. `Mixed_5b.Branch_0.Conv2d_1x1.weights`.
pub struct Scope<'a> {
    path: nn::Path<'a>,
    name: String,
    reuse: Reuse,
}

impl<'a> Scope<'a> {
    pub fn new(path: nn::Path<'a>, reuse: Reuse) -> Scope<'a> {
        Scope { path, name: String::new(), reuse }
    }

    pub fn root(vs: &'a nn::VarStore, reuse: Reuse) -> Scope<'a> {
        Scope::new(vs.root(), reuse)
    }

    pub fn sub(&self, s: &str) -> Scope<'a> {
        Scope { path: &self.path / s, name: self.full_name(s), reuse: self.reuse }
    }

    pub fn reuse(&self) -> Reuse {
        self.reuse
    }

    pub fn device(&self) -> Device {
        self.path.device()
    }

    /// The dot-joined name of this scope.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn full_name(&self, s: &str) -> String {
        if self.name.is_empty() {
            s.to_string()
        } else {
            format!("{}.{}", self.name, s)
        }
    }

    fn shared(&self, name: &str, dims: &[i64]) -> Result<Tensor> {
        let tensor =
            self.path.get(name).ok_or_else(|| FaceEmbedError::MissingVariable(self.full_name(name)))?;
        if tensor.size() != dims {
            return Err(FaceEmbedError::Shape(format!(
                "shared variable {} has shape {:?}, expected {:?}",
                self.full_name(name),
                tensor.size(),
                dims
            )));
        }
        trace!("sharing {}", self.full_name(name));
        Ok(tensor)
    }

    fn check_fresh(&self, name: &str) -> Result<()> {
        match self.path.get(name) {
            Some(_) => Err(FaceEmbedError::DuplicateVariable(self.full_name(name))),
            None => Ok(()),
        }
    }

    /// A trainable variable.
    pub fn var(&self, name: &str, dims: &[i64], init: Init) -> Result<Tensor> {
        match self.reuse {
            Reuse::Share => self.shared(name, dims),
            Reuse::Create => {
                self.check_fresh(name)?;
                let value = init::init(init, dims, self.device());
                Ok(self.path.var_copy(name, &value))
            }
        }
    }

    /// A variable excluded from training, initialized with zeros.
    pub fn zeros_no_train(&self, name: &str, dims: &[i64]) -> Result<Tensor> {
        match self.reuse {
            Reuse::Share => self.shared(name, dims),
            Reuse::Create => {
                self.check_fresh(name)?;
                Ok(self.path.zeros_no_train(name, dims))
            }
        }
    }

    /// A variable excluded from training, initialized with ones.
    pub fn ones_no_train(&self, name: &str, dims: &[i64]) -> Result<Tensor> {
        match self.reuse {
            Reuse::Share => self.shared(name, dims),
            Reuse::Create => {
                self.check_fresh(name)?;
                Ok(self.path.ones_no_train(name, dims))
            }
        }
    }
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope").field("name", &self.name).field("reuse", &self.reuse).finish()
    }
}

impl<'a> Div<&str> for &Scope<'a> {
    type Output = Scope<'a>;

    fn div(self, rhs: &str) -> Self::Output {
        self.sub(rhs)
    }
}

impl<'a> Div<&str> for Scope<'a> {
    type Output = Scope<'a>;

    fn div(self, rhs: &str) -> Self::Output {
        self.sub(rhs)
    }
}

/// The trainable variables stored under `prefix`, sorted by name.
///
/// This is how a training step is handed an explicit partition of the
/// network, e.g. the base network on one side and a fusion head on the other.
pub fn variables_with_prefix(vs: &nn::VarStore, prefix: &str) -> Vec<Tensor> {
    let mut named: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter(|(name, tensor)| tensor.requires_grad() && name.starts_with(prefix))
        .collect();
    named.sort_by(|(a, _), (b, _)| a.cmp(b));
    named.into_iter().map(|(_, tensor)| tensor).collect()
}
