//! Append-only sequence of version maps shared between snapshots.
//!
//! Maps live in fixed-size segments. Full segments are sealed and shared by
//! every snapshot derived after them; only the open tail segment is copied
//! when a map is appended. Each segment indexes the newest sequence that
//! wrote each object inside it.

use std::collections::HashMap;
use std::sync::Arc;

use fabric_types::ObjectId;

use crate::version_map::VersionMap;

/// Maps per segment.
pub(crate) const SEGMENT_LEN: usize = 64;

#[derive(Debug, Clone, Default)]
pub(crate) struct Segment {
    maps: Vec<Arc<VersionMap>>,
    writes: HashMap<ObjectId, u64>,
}

impl Segment {
    fn push(&mut self, map: Arc<VersionMap>) {
        let seq = map.seq();
        for version in map.versions().filter(|v| v.has_writes()) {
            self.writes.insert(version.object(), seq);
        }
        self.maps.push(map);
    }

    fn from_maps<'a>(maps: impl IntoIterator<Item = &'a Arc<VersionMap>>) -> Self {
        let mut segment = Self::default();
        for map in maps {
            segment.push(Arc::clone(map));
        }
        segment
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MapChain {
    /// Full segments, oldest first.
    sealed: Arc<Vec<Arc<Segment>>>,
    /// Maps hidden at the front of `sealed[0]` by trimming. Zero when
    /// nothing is sealed.
    skip: usize,
    open: Arc<Segment>,
    len: usize,
}

impl MapChain {
    #[must_use]
    pub(crate) const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub(crate) fn get(&self, offset: usize) -> Option<&Arc<VersionMap>> {
        if offset >= self.len {
            return None;
        }
        let at = offset + self.skip;
        let segment = at / SEGMENT_LEN;
        match self.sealed.get(segment) {
            Some(sealed) => sealed.maps.get(at % SEGMENT_LEN),
            None => self.open.maps.get(at - self.sealed.len() * SEGMENT_LEN),
        }
    }

    /// Oldest first.
    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<VersionMap>> + '_ {
        (0..self.len).filter_map(move |offset| self.get(offset))
    }

    /// Newest sequence that wrote `object` among the segments still held.
    #[must_use]
    pub(crate) fn last_write(&self, object: ObjectId) -> Option<u64> {
        self.open.writes.get(&object).copied().or_else(|| {
            self.sealed
                .iter()
                .rev()
                .find_map(|segment| segment.writes.get(&object).copied())
        })
    }

    pub(crate) fn push(&mut self, map: Arc<VersionMap>) {
        Arc::make_mut(&mut self.open).push(map);
        self.len += 1;
        if self.open.maps.len() == SEGMENT_LEN {
            let full = std::mem::take(&mut self.open);
            Arc::make_mut(&mut self.sealed).push(full);
        }
    }

    /// Forget the oldest `count` maps.
    pub(crate) fn drop_front(&mut self, count: usize) {
        let count = count.min(self.len);
        if count == 0 {
            return;
        }
        let mut hide = self.skip + count;
        let whole = (hide / SEGMENT_LEN).min(self.sealed.len());
        if whole > 0 {
            Arc::make_mut(&mut self.sealed).drain(..whole);
            hide -= whole * SEGMENT_LEN;
        }
        if self.sealed.is_empty() {
            if hide > 0 {
                self.open = Arc::new(Segment::from_maps(self.open.maps.iter().skip(hide)));
            }
            self.skip = 0;
        } else {
            self.skip = hide;
        }
        self.len -= count;
    }

    /// Keep only the oldest `count` maps.
    pub(crate) fn truncate(&mut self, count: usize) {
        if count >= self.len {
            return;
        }
        let kept: Vec<Arc<VersionMap>> = self.iter().take(count).cloned().collect();
        *self = Self::default();
        for map in kept {
            self.push(map);
        }
    }

    #[cfg(test)]
    pub(crate) fn shares_segments_with(&self, other: &Self) -> usize {
        self.sealed
            .iter()
            .filter(|mine| other.sealed.iter().any(|theirs| Arc::ptr_eq(mine, theirs)))
            .count()
    }
}
