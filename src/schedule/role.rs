//! Logical tile roles, pipeline stages and role-keyed tables.

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// Logical role of a tile buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Input activations
    Input,
    /// Second operand of an element-wise add
    Input2,
    /// Weights (consumed sequentially along output channels)
    Weights,
    /// Per-channel scale
    Scale,
    /// Per-channel bias
    Bias,
    /// Output activations
    Output,
}

impl Role {
    pub const COUNT: usize = 6;

    pub const ALL: [Role; Role::COUNT] = [
        Role::Input,
        Role::Input2,
        Role::Weights,
        Role::Scale,
        Role::Bias,
        Role::Output,
    ];

    /// Roles moved as flat byte ranges, addressed by a running cursor.
    pub const PARAMS: [Role; 3] = [Role::Weights, Role::Scale, Role::Bias];

    /// Roles addressed through the tile-to-global mapping.
    pub const ACTIVATIONS: [Role; 2] = [Role::Input, Role::Input2];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn is_param(self) -> bool {
        matches!(self, Role::Weights | Role::Scale | Role::Bias)
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::Input2 => "input2",
            Role::Weights => "weights",
            Role::Scale => "scale",
            Role::Bias => "bias",
            Role::Output => "output",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Compute stage a buffer or job belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// The only stage of a single-stage layer
    #[default]
    Single,
    /// First 1x1 projection of a fused block
    Expand,
    /// Depthwise-style spatial stage of a fused block
    Spatial,
    /// Final 1x1 projection of a fused block
    Project,
}

impl Stage {
    /// Stages of a fused block, in execution order.
    pub const FUSED: [Stage; 3] = [Stage::Expand, Stage::Spatial, Stage::Project];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Single => "single",
            Stage::Expand => "expand",
            Stage::Spatial => "spatial",
            Stage::Project => "project",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed table with one entry per [`Role`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleTable<T>([T; Role::COUNT]);

impl<T> RoleTable<T> {
    /// Build a table by evaluating `f` for every role.
    pub fn from_fn(mut f: impl FnMut(Role) -> T) -> Self {
        Self(std::array::from_fn(|i| f(Role::ALL[i])))
    }

    /// Iterate `(role, &value)` pairs in role order.
    pub fn iter(&self) -> impl Iterator<Item = (Role, &T)> {
        Role::ALL.iter().copied().zip(self.0.iter())
    }

    /// Map every entry.
    pub fn map<U>(&self, mut f: impl FnMut(Role, &T) -> U) -> RoleTable<U> {
        RoleTable::from_fn(|role| f(role, &self.0[role.index()]))
    }
}

impl<T: Copy> RoleTable<T> {
    /// Same value for every role.
    pub fn splat(value: T) -> Self {
        Self([value; Role::COUNT])
    }
}

impl<T> Index<Role> for RoleTable<T> {
    type Output = T;

    #[inline]
    fn index(&self, role: Role) -> &T {
        &self.0[role.index()]
    }
}

impl<T> IndexMut<Role> for RoleTable<T> {
    #[inline]
    fn index_mut(&mut self, role: Role) -> &mut T {
        &mut self.0[role.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_index_matches_all() {
        for (i, role) in Role::ALL.iter().enumerate() {
            assert_eq!(role.index(), i);
        }
    }

    #[test]
    fn test_role_table_from_fn_and_index() {
        let mut table = RoleTable::from_fn(|r| r.index() * 10);
        assert_eq!(table[Role::Weights], 20);
        table[Role::Output] = 1;
        assert_eq!(table[Role::Output], 1);

        let doubled = table.map(|_, v| v * 2);
        assert_eq!(doubled[Role::Bias], 80);
    }

    #[test]
    fn test_params() {
        assert!(Role::PARAMS.iter().all(|r| r.is_param()));
        assert!(!Role::Input.is_param());
        assert!(!Role::Output.is_param());
    }
}
