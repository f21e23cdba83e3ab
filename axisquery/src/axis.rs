//! Axis abstraction
//!
//! Every piece of per-axis state in the engine (filters, join-id slots,
//! indexes, column projections) is held in an [`AxisPair`], so row/column
//! logic is written once and dispatched through an [`Axis`] value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the two orthogonal dimensions of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Row axis (observations)
    Obs,
    /// Column axis (variables)
    Var,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Obs, Axis::Var];

    /// Canonical lowercase name, `"obs"` or `"var"`.
    #[inline]
    pub const fn name(self) -> &'static str {
        match self {
            Axis::Obs => "obs",
            Axis::Var => "var",
        }
    }

    #[inline]
    pub const fn other(self) -> Axis {
        match self {
            Axis::Obs => Axis::Var,
            Axis::Var => Axis::Obs,
        }
    }

    /// Compose `<pre><obs|var><suf>`, e.g. `axis.key("", "m")` is `"obsm"`.
    pub fn key(self, pre: &str, suf: &str) -> String {
        let mut key = String::with_capacity(pre.len() + 3 + suf.len());
        key.push_str(pre);
        key.push_str(self.name());
        key.push_str(suf);
        key
    }

    /// Typed two-member lookup.
    #[inline]
    pub fn get_from<T>(self, pair: &AxisPair<T>) -> &T {
        match self {
            Axis::Obs => &pair.obs,
            Axis::Var => &pair.var,
        }
    }

    #[inline]
    pub fn get_mut_from<T>(self, pair: &mut AxisPair<T>) -> &mut T {
        match self {
            Axis::Obs => &mut pair.obs,
            Axis::Var => &mut pair.var,
        }
    }

    /// Lookup on any holder exposing `obs()`/`var()` accessors.
    #[inline]
    pub fn getattr_from<H: HasObsVar + ?Sized>(self, holder: &H) -> &H::Member {
        match self {
            Axis::Obs => holder.obs(),
            Axis::Var => holder.var(),
        }
    }

    /// Keyed lookup of `source[pre + name + suf]`. Absence is reported by the
    /// map, not treated as an error here.
    pub fn getitem_from<'a, T>(
        self,
        source: &'a BTreeMap<String, T>,
        pre: &str,
        suf: &str,
    ) -> Option<&'a T> {
        source.get(&self.key(pre, suf))
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Something which has an `obs` and a `var` member of the same type.
pub trait HasObsVar {
    type Member;

    fn obs(&self) -> &Self::Member;
    fn var(&self) -> &Self::Member;
}

/// Plain two-slot holder, one value per axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisPair<T> {
    pub obs: T,
    pub var: T,
}

impl<T> AxisPair<T> {
    pub const fn new(obs: T, var: T) -> Self {
        Self { obs, var }
    }

    /// Build both slots from a per-axis constructor.
    pub fn from_fn(mut f: impl FnMut(Axis) -> T) -> Self {
        Self {
            obs: f(Axis::Obs),
            var: f(Axis::Var),
        }
    }

    pub fn map<U>(self, mut f: impl FnMut(Axis, T) -> U) -> AxisPair<U> {
        AxisPair {
            obs: f(Axis::Obs, self.obs),
            var: f(Axis::Var, self.var),
        }
    }

    pub fn as_ref(&self) -> AxisPair<&T> {
        AxisPair {
            obs: &self.obs,
            var: &self.var,
        }
    }
}

impl<T> HasObsVar for AxisPair<T> {
    type Member = T;

    fn obs(&self) -> &T {
        &self.obs
    }

    fn var(&self) -> &T {
        &self.var
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_key_composition() {
        assert_eq!(Axis::Obs.key("", "m"), "obsm");
        assert_eq!(Axis::Var.key("", "p"), "varp");
        assert_eq!(Axis::Obs.key("_", "_df"), "_obs_df");
        assert_eq!(Axis::Var.other(), Axis::Obs);
    }

    #[test]
    fn test_axis_pair_dispatch() {
        let mut pair = AxisPair::new(1, 2);
        assert_eq!(*Axis::Obs.get_from(&pair), 1);
        assert_eq!(*Axis::Var.getattr_from(&pair), 2);

        *Axis::Var.get_mut_from(&mut pair) = 7;
        assert_eq!(pair.var, 7);

        let names = AxisPair::from_fn(Axis::name);
        assert_eq!(names, AxisPair::new("obs", "var"));
    }

    #[test]
    fn test_getitem_from_map() {
        let mut map = BTreeMap::new();
        map.insert("obsm".to_string(), 10);

        assert_eq!(Axis::Obs.getitem_from(&map, "", "m"), Some(&10));
        assert_eq!(Axis::Var.getitem_from(&map, "", "m"), None);
    }
}
