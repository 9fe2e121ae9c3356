//! Per-tile transfer bookkeeping.
//!
//! A [`TileStatus`] records, for the tile currently being loaded, which
//! roles need a transfer, which buffer slot each role occupies and where the
//! sequentially consumed roles (weights, scale, bias) continue in bulk memory.
//! [`StatusRules`] derives the status of the next tile from the current one.
//!
//! # Transfer Rules
//!
//! | Role            | Transfers when                                     |
//! |-----------------|----------------------------------------------------|
//! | Input, Input2   | height, width or input channel changes; also output|
//! |                 | channel for grouped kernels                        |
//! | Weights/Scale/  | output channel changes                             |
//! | Bias            |                                                    |
//! | Output          | every tile                                         |
//!
//! A role's slot only rotates when it transfers, so data that stays
//! resident keeps its slot.

use super::geometry::{TileGeometry, TileShape};
use super::index::{Axis, TileIndex, TileIndexSequencer};
use super::role::{Role, RoleTable};

/// Transfer state of one role for one tile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStatus {
    /// Next bulk address for sequentially consumed roles
    pub cursor: u64,
    /// Whether this tile must move this role
    pub needs_transfer: bool,
    /// Buffer slot holding this role's data
    pub slot: u8,
}

/// Index plus per-role transfer state of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStatus {
    pub index: TileIndex,
    pub roles: RoleTable<TransferStatus>,
}

impl TileStatus {
    #[inline]
    pub fn needs(&self, role: Role) -> bool {
        self.roles[role].needs_transfer
    }

    #[inline]
    pub fn slot(&self, role: Role) -> u8 {
        self.roles[role].slot
    }

    #[inline]
    pub fn cursor(&self, role: Role) -> u64 {
        self.roles[role].cursor
    }

    /// Advance a role's bulk cursor past `bytes` just loaded.
    #[inline]
    pub fn consume(&mut self, role: Role, bytes: u64) {
        self.roles[role].cursor += bytes;
    }
}

/// Static rules that evolve a [`TileStatus`] tile by tile.
#[derive(Debug, Clone, Copy)]
pub struct StatusRules {
    sequencer: TileIndexSequencer,
    bases: RoleTable<u64>,
    active: RoleTable<bool>,
    grouped: bool,
    slots: u8,
}

impl StatusRules {
    /// `bases` are the bulk base addresses per role, `active` marks the roles
    /// this stage moves between bulk memory and scratchpad.
    pub fn new(
        sequencer: TileIndexSequencer,
        bases: RoleTable<u64>,
        active: RoleTable<bool>,
        grouped: bool,
        slots: u8,
    ) -> Self {
        Self {
            sequencer,
            bases,
            active,
            grouped,
            slots: slots.max(1),
        }
    }

    #[inline]
    pub fn sequencer(&self) -> &TileIndexSequencer {
        &self.sequencer
    }

    #[inline]
    pub fn is_active(&self, role: Role) -> bool {
        self.active[role]
    }

    #[inline]
    pub fn base(&self, role: Role) -> u64 {
        self.bases[role]
    }

    /// Status of the first tile: every active role transfers into slot 0.
    pub fn first(&self) -> TileStatus {
        TileStatus {
            index: TileIndex::ZERO,
            roles: RoleTable::from_fn(|role| TransferStatus {
                cursor: self.bases[role],
                needs_transfer: self.active[role],
                slot: 0,
            }),
        }
    }

    /// Whether `role` must be transferred when moving from `prev` to `next`.
    pub fn needs_transfer(&self, role: Role, prev: &TileIndex, next: &TileIndex) -> bool {
        if !self.active[role] {
            return false;
        }
        match role {
            Role::Input | Role::Input2 => {
                next.changed(prev, Axis::Height)
                    || next.changed(prev, Axis::Width)
                    || next.changed(prev, Axis::InputChannel)
                    || (self.grouped && next.changed(prev, Axis::OutputChannel))
            }
            Role::Weights | Role::Scale | Role::Bias => next.changed(prev, Axis::OutputChannel),
            Role::Output => true,
        }
    }

    /// Status of the tile after `status`.
    pub fn next(&self, status: &TileStatus) -> TileStatus {
        let prev = status.index;
        let index = self.sequencer.next(prev);
        let channel_wrapped = index.changed(&prev, Axis::OutputChannel) && index.output_channel == 0;

        let roles = status.roles.map(|role, current| {
            let needs_transfer = self.needs_transfer(role, &prev, &index);
            let slot = if needs_transfer {
                (current.slot + 1) % self.slots
            } else {
                current.slot
            };
            let cursor = if role.is_param() && channel_wrapped {
                self.bases[role]
            } else {
                current.cursor
            };
            TransferStatus {
                cursor,
                needs_transfer,
                slot,
            }
        });

        TileStatus { index, roles }
    }
}

/// A concrete tile: its index, its shape and the scratchpad address of every
/// role's buffer. Roles without a buffer have no address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub index: TileIndex,
    pub shape: TileShape,
    pub addr: RoleTable<Option<u64>>,
}

impl Tile {
    pub fn create(status: &TileStatus, geometry: &TileGeometry, addr: RoleTable<Option<u64>>) -> Self {
        Self {
            index: status.index,
            shape: geometry.tile(status.index),
            addr,
        }
    }
}
