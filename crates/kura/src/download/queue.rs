use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::model::{AssetId, SegmentIndex};

/// One segment transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Job {
    pub asset: AssetId,
    pub rendition: u32,
    pub index: SegmentIndex,
}

#[derive(Debug, Default)]
struct Lane {
    priority: i32,
    sequence: u64,
    pending: VecDeque<(u32, SegmentIndex)>,
    in_flight: usize,
}

/// Pending transfers of all assets. Lower priorities are served first. Assets
/// sharing a priority take turns: the one with the fewest transfers in flight
/// goes next, enqueue order breaking ties. Inside an asset segments go out by
/// index, so init segments lead and renditions advance together.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    order: BTreeSet<(i32, u64, AssetId)>,
    lanes: HashMap<AssetId, Lane>,
}

impl JobQueue {
    /// Queues `segments` of `asset`, replacing whatever was pending for it.
    /// Transfers already in flight keep being counted.
    pub(crate) fn schedule(
        &mut self,
        asset: &AssetId,
        priority: i32,
        sequence: u64,
        mut segments: Vec<(u32, SegmentIndex)>,
    ) {
        segments.sort_by_key(|(rendition, index)| (*index, *rendition));
        let lane = self.lanes.entry(asset.clone()).or_default();
        self.order
            .remove(&(lane.priority, lane.sequence, asset.clone()));
        lane.priority = priority;
        lane.sequence = sequence;
        lane.pending = segments.into();
        self.order.insert((priority, sequence, asset.clone()));
    }

    /// Drops the pending transfers of `asset`. In-flight ones are still
    /// tracked until they finish.
    pub(crate) fn suspend(&mut self, asset: &AssetId) {
        if let Some(lane) = self.lanes.get_mut(asset) {
            lane.pending.clear();
        }
        self.gc(asset);
    }

    /// Next job of the least busy asset below its concurrency cap, among
    /// those of the most urgent priority that has work.
    pub(crate) fn pop(&mut self, per_asset: usize) -> Option<Job> {
        let mut chosen: Option<(i32, usize, &AssetId)> = None;
        for (priority, _, asset) in &self.order {
            if chosen.is_some_and(|(p, _, _)| p != *priority) {
                break;
            }
            let Some(lane) = self.lanes.get(asset) else {
                continue;
            };
            if lane.pending.is_empty() || lane.in_flight >= per_asset {
                continue;
            }
            if chosen.map_or(true, |(_, busy, _)| lane.in_flight < busy) {
                chosen = Some((*priority, lane.in_flight, asset));
            }
        }
        let asset = chosen?.2.clone();
        let lane = self.lanes.get_mut(&asset)?;
        let (rendition, index) = lane.pending.pop_front()?;
        lane.in_flight += 1;
        Some(Job {
            asset,
            rendition,
            index,
        })
    }

    pub(crate) fn finish(&mut self, job: &Job) {
        if let Some(lane) = self.lanes.get_mut(&job.asset) {
            lane.in_flight = lane.in_flight.saturating_sub(1);
        }
        self.gc(&job.asset);
    }

    pub(crate) fn in_flight(&self, asset: &AssetId) -> usize {
        self.lanes.get(asset).map(|l| l.in_flight).unwrap_or_default()
    }

    pub(crate) fn pending(&self, asset: &AssetId) -> usize {
        self.lanes
            .get(asset)
            .map(|l| l.pending.len())
            .unwrap_or_default()
    }

    fn gc(&mut self, asset: &AssetId) {
        let Some(lane) = self.lanes.get(asset) else {
            return;
        };
        if lane.pending.is_empty() && lane.in_flight == 0 {
            self.order.remove(&(lane.priority, lane.sequence, asset.clone()));
            self.lanes.remove(asset);
        }
    }
}
