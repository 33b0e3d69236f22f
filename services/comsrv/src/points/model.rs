//! Point set and read planning
//!
//! The model owns the authoritative point list for one channel and turns it
//! into coalesced read plans. Channels hold the model behind an atomic
//! pointer swap, so mutation happens on a fresh copy which replaces the old
//! one wholesale.

use std::collections::BTreeMap;

use super::point::Point;
use super::types::PointKind;
use crate::config::PointRow;
use crate::error::Result;
use crate::protocol::FunctionCode;

/// A coalesced span of addresses sharing unit id and function code, sized
/// to one wire request. `count` is in registers or bits depending on the
/// function's addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadGroup {
    pub unit_id: u8,
    pub function_code: FunctionCode,
    pub start: u16,
    pub count: u16,
    /// Member point ids in address order
    pub point_ids: Vec<u32>,
}

/// Authoritative point list for a channel.
#[derive(Debug, Clone, Default)]
pub struct PointModel {
    points: BTreeMap<u32, Point>,
    coalesce_gap: u16,
}

impl PointModel {
    pub fn new(coalesce_gap: u16) -> Self {
        Self {
            points: BTreeMap::new(),
            coalesce_gap,
        }
    }

    /// Build a model from parsed table rows. Fails on the first invalid
    /// row; a partially valid table never produces a partial model.
    pub fn from_rows(rows: &[PointRow], coalesce_gap: u16) -> Result<Self> {
        let mut model = Self::new(coalesce_gap);
        for row in rows {
            model.upsert(Point::try_from(row)?)?;
        }
        Ok(model)
    }

    /// Insert or replace a point. The set is unchanged on error.
    pub fn upsert(&mut self, point: Point) -> Result<()> {
        point.validate()?;
        self.points.insert(point.id, point);
        Ok(())
    }

    /// Remove a point; returns whether it was present.
    pub fn remove(&mut self, point_id: u32) -> bool {
        self.points.remove(&point_id).is_some()
    }

    pub fn get(&self, point_id: u32) -> Option<&Point> {
        self.points.get(&point_id)
    }

    pub fn contains(&self, point_id: u32) -> bool {
        self.points.contains_key(&point_id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points_of_kind(&self, kind: PointKind) -> impl Iterator<Item = &Point> {
        self.points.values().filter(move |p| p.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Point> {
        self.points.values()
    }

    /// Address span of a point in the unit of its function's addressing.
    fn span(point: &Point) -> u16 {
        if point.address.function_code.is_bit_addressed() {
            point.address.bit_length.max(1)
        } else {
            point.address.register_span()
        }
    }

    /// Produce the ordered read plan for all input points: one group per
    /// coalesced address run, respecting the per-frame span limits and the
    /// configured coalescing gap.
    pub fn plan_reads(&self) -> Vec<ReadGroup> {
        let mut inputs: Vec<&Point> = self
            .points
            .values()
            .filter(|p| p.kind.is_input())
            .collect();
        inputs.sort_by_key(|p| {
            (
                p.address.unit_id,
                p.address.function_code,
                p.address.address,
                p.id,
            )
        });

        let mut groups: Vec<ReadGroup> = Vec::new();
        for point in inputs {
            let addr = &point.address;
            let span = Self::span(point);
            if let Some(group) = groups.last_mut() {
                if group.unit_id == addr.unit_id && group.function_code == addr.function_code {
                    // Widened arithmetic: spans near the top of the address
                    // space must not wrap.
                    let end = u32::from(group.start) + u32::from(group.count);
                    let new_end = (u32::from(addr.address) + u32::from(span)).max(end);
                    if u32::from(addr.address) <= end + u32::from(self.coalesce_gap)
                        && new_end - u32::from(group.start)
                            <= u32::from(addr.function_code.max_span())
                    {
                        group.count = (new_end - u32::from(group.start)) as u16;
                        group.point_ids.push(point.id);
                        continue;
                    }
                }
            }
            groups.push(ReadGroup {
                unit_id: addr.unit_id,
                function_code: addr.function_code,
                start: addr.address,
                count: span,
                point_ids: vec![point.id],
            });
        }
        groups
    }
}
