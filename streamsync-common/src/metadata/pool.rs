//! Marker arena and list handles

use super::marker::{Marker, MarkerKind, Payload};
use super::tracking::TrackingEvent;
use super::MetadataError;
use std::sync::Arc;
use tracing::{error, trace};

/// Generation-checked index of a node in a [`MarkerPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerId {
    index: u32,
    generation: u32,
}

/// Ordered sequence of markers attached to one buffer region
///
/// The handle does not own its nodes; they live in the pool and must be
/// released through [`MarkerPool::destroy_all`] (or moved to another list)
/// before the handle is discarded.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MarkerList {
    head: Option<MarkerId>,
    tail: Option<MarkerId>,
    len: usize,
}

impl MarkerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn first(&self) -> Option<MarkerId> {
        self.head
    }

    pub fn last(&self) -> Option<MarkerId> {
        self.tail
    }
}

#[derive(Debug)]
struct Node {
    marker: Marker,
    prev: Option<MarkerId>,
    next: Option<MarkerId>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena holding the nodes of every marker list of an engine instance
#[derive(Debug, Default)]
pub struct MarkerPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    limit: Option<usize>,
}

impl MarkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool refusing to hold more than `limit` live markers
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Number of markers currently allocated
    pub fn live_count(&self) -> usize {
        self.live
    }

    fn alloc(&mut self, marker: Marker) -> Result<MarkerId, MetadataError> {
        if let Some(limit) = self.limit {
            if self.live >= limit {
                return Err(MetadataError::PoolExhausted { limit });
            }
        }

        let node = Node {
            marker,
            prev: None,
            next: None,
        };

        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                MarkerId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| {
                    MetadataError::PoolExhausted {
                        limit: self.slots.len(),
                    }
                })?;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                MarkerId {
                    index,
                    generation: 0,
                }
            }
        };

        self.live += 1;
        Ok(id)
    }

    fn release(&mut self, id: MarkerId) -> Result<Marker, MetadataError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(MetadataError::UnknownMarker(id))?;
        let node = slot.node.take().ok_or(MetadataError::UnknownMarker(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(node.marker)
    }

    fn node(&self, id: MarkerId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
    }

    fn node_mut(&mut self, id: MarkerId) -> Result<&mut Node, MetadataError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
            .ok_or(MetadataError::UnknownMarker(id))
    }

    pub fn get(&self, id: MarkerId) -> Option<&Marker> {
        self.node(id).map(|n| &n.marker)
    }

    pub fn get_mut(&mut self, id: MarkerId) -> Option<&mut Marker> {
        self.node_mut(id).ok().map(|n| &mut n.marker)
    }

    /// Node following `id` in its list
    pub fn next(&self, id: MarkerId) -> Option<MarkerId> {
        self.node(id).and_then(|n| n.next)
    }

    pub fn iter<'a>(&'a self, list: &MarkerList) -> MarkerIter<'a> {
        MarkerIter {
            pool: self,
            cursor: list.head,
        }
    }

    /// Snapshot of the ids in `list`, for loops that relink nodes
    pub fn ids(&self, list: &MarkerList) -> Vec<MarkerId> {
        self.iter(list).map(|(id, _)| id).collect()
    }

    // ------------------------------------------------------------------
    // Linking
    // ------------------------------------------------------------------

    /// Unlink `id` from `list` without freeing it
    fn detach(&mut self, list: &mut MarkerList, id: MarkerId) -> Result<(), MetadataError> {
        let (prev, next) = {
            let node = self.node(id).ok_or(MetadataError::UnknownMarker(id))?;
            (node.prev, node.next)
        };

        // Ends of the chain must be the ends of this list
        if (prev.is_none() && list.head != Some(id)) || (next.is_none() && list.tail != Some(id)) {
            return Err(MetadataError::ForeignMarker(id));
        }

        match prev {
            Some(p) => self.node_mut(p)?.next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => self.node_mut(n)?.prev = prev,
            None => list.tail = prev,
        }

        let node = self.node_mut(id)?;
        node.prev = None;
        node.next = None;
        list.len -= 1;
        Ok(())
    }

    fn attach_back(&mut self, list: &mut MarkerList, id: MarkerId) -> Result<(), MetadataError> {
        let old_tail = list.tail;
        {
            let node = self.node_mut(id)?;
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t)?.next = Some(id),
            None => list.head = Some(id),
        }
        list.tail = Some(id);
        list.len += 1;
        Ok(())
    }

    fn attach_front(&mut self, list: &mut MarkerList, id: MarkerId) -> Result<(), MetadataError> {
        let old_head = list.head;
        {
            let node = self.node_mut(id)?;
            node.prev = None;
            node.next = old_head;
        }
        match old_head {
            Some(h) => self.node_mut(h)?.prev = Some(id),
            None => list.tail = Some(id),
        }
        list.head = Some(id);
        list.len += 1;
        Ok(())
    }

    fn attach_after(
        &mut self,
        list: &mut MarkerList,
        after: MarkerId,
        id: MarkerId,
    ) -> Result<(), MetadataError> {
        let next = self.node(after).ok_or(MetadataError::UnknownMarker(after))?.next;
        {
            let node = self.node_mut(id)?;
            node.prev = Some(after);
            node.next = next;
        }
        self.node_mut(after)?.next = Some(id);
        match next {
            Some(n) => self.node_mut(n)?.prev = Some(id),
            None => list.tail = Some(id),
        }
        list.len += 1;
        Ok(())
    }

    pub fn push_back(
        &mut self,
        list: &mut MarkerList,
        marker: Marker,
    ) -> Result<MarkerId, MetadataError> {
        let id = self.alloc(marker)?;
        self.attach_back(list, id)?;
        Ok(id)
    }

    pub fn push_front(
        &mut self,
        list: &mut MarkerList,
        marker: Marker,
    ) -> Result<MarkerId, MetadataError> {
        let id = self.alloc(marker)?;
        self.attach_front(list, id)?;
        Ok(id)
    }

    /// Insert keeping offsets non-decreasing; ties go after existing markers
    pub fn insert_sorted(
        &mut self,
        list: &mut MarkerList,
        marker: Marker,
    ) -> Result<MarkerId, MetadataError> {
        let offset = marker.offset;
        let mut after = None;
        for (id, m) in self.iter(list) {
            if m.offset <= offset {
                after = Some(id);
            } else {
                break;
            }
        }

        let id = self.alloc(marker)?;
        match after {
            Some(a) => self.attach_after(list, a, id)?,
            None => self.attach_front(list, id)?,
        }
        Ok(id)
    }

    /// Remove `id` from `list` and return the marker
    pub fn unlink(&mut self, list: &mut MarkerList, id: MarkerId) -> Result<Marker, MetadataError> {
        self.detach(list, id)?;
        self.release(id)
    }

    /// Relink `id` from the list `from` to the tail of `to`
    pub fn move_to(
        &mut self,
        from: &mut MarkerList,
        to: &mut MarkerList,
        id: MarkerId,
    ) -> Result<(), MetadataError> {
        self.detach(from, id)?;
        self.attach_back(to, id)
    }

    /// Splice all of `src` onto the tail of `dst`, leaving `src` empty
    pub fn append(
        &mut self,
        dst: &mut MarkerList,
        src: &mut MarkerList,
    ) -> Result<(), MetadataError> {
        let (Some(src_head), Some(src_tail)) = (src.head, src.tail) else {
            return Ok(());
        };

        match dst.tail {
            Some(dst_tail) => {
                self.node_mut(dst_tail)?.next = Some(src_head);
                self.node_mut(src_head)?.prev = Some(dst_tail);
            }
            None => dst.head = Some(src_head),
        }
        dst.tail = Some(src_tail);
        dst.len += src.len;
        *src = MarkerList::new();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Service operations
    // ------------------------------------------------------------------

    /// Create a marker with a zeroed payload of `size` bytes at offset 0,
    /// appended to `list`.
    pub fn create(
        &mut self,
        list: &mut MarkerList,
        kind: MarkerKind,
        size: usize,
        out_of_band: bool,
    ) -> Result<MarkerId, MetadataError> {
        let bytes = vec![0u8; size];
        let payload = if out_of_band {
            Payload::OutOfBand(Arc::from(bytes))
        } else {
            Payload::InBand(bytes)
        };
        let id = self.push_back(list, Marker::new(kind).with_payload(payload))?;
        trace!("Created {:?} marker {:?} ({} bytes)", kind, id, size);
        Ok(id)
    }

    /// Add an existing marker to the tail of `list`
    pub fn insert(
        &mut self,
        list: &mut MarkerList,
        marker: Marker,
    ) -> Result<MarkerId, MetadataError> {
        self.push_back(list, marker)
    }

    /// Remove and free `id`, completing its tracking as dropped or consumed
    pub fn destroy(
        &mut self,
        list: &mut MarkerList,
        id: MarkerId,
        dropped: bool,
    ) -> Result<(), MetadataError> {
        let mut marker = self.unlink(list, id)?;
        trace!("Destroying {:?} marker {:?} (dropped={})", marker.kind, id, dropped);
        if let Some(tracking) = marker.tracking.take() {
            let event = if dropped {
                TrackingEvent::Dropped
            } else {
                TrackingEvent::Consumed
            };
            tracking.complete(event);
        }
        Ok(())
    }

    /// Destroy every marker in `list`
    pub fn destroy_all(&mut self, list: &mut MarkerList, dropped: bool) {
        while let Some(id) = list.head {
            if let Err(e) = self.destroy(list, id, dropped) {
                // List is corrupt; forget it rather than loop forever
                error!("Failed to destroy marker {:?}: {}", id, e);
                *list = MarkerList::new();
                break;
            }
        }
    }
}

/// Iterator over `(id, marker)` pairs of one list
pub struct MarkerIter<'a> {
    pool: &'a MarkerPool,
    cursor: Option<MarkerId>,
}

impl<'a> Iterator for MarkerIter<'a> {
    type Item = (MarkerId, &'a Marker);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = self.pool.node(id)?;
        self.cursor = node.next;
        Some((id, &node.marker))
    }
}
