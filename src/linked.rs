//! Singly linked chains of pointer-sized values.
//!
//! Injected stubs walk these chains at runtime, so the raw node layout is
//! two machine words, `{value, next}`, where `next` holds the address of the
//! successor (zero for none). On the Rust side a node is referenced by a
//! [`NodeId`] (region index plus slot index), never by its raw address, so
//! no pointer chain leaks into the handle surface.
//!
//! Nodes are carved from dedicated regions treated as flat node arrays. A
//! slot is free when both of its words are zero; a chain can therefore never
//! store a literal zero, and the logically empty chain is expressed by the
//! root holding the reserved [`EMPTY_NODE_VALUE`] instead. A linked array
//! always has at least one node.

use std::ptr;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::region::{MemoryRegion, RegionAllocator};

/// Size of a fresh OS allocation backing a node region.
pub const NODE_REGION_SIZE: usize = 0x10000;

/// Reserved root value representing the logically empty chain.
/// Distinguishable from the zero "destroyed" sentinel and from any real
/// address, which is always above the lowest mappable page.
pub const EMPTY_NODE_VALUE: usize = 1;

const NODE_SIZE: usize = 2 * std::mem::size_of::<usize>();

/// Reference to one node slot: region index in creation order plus slot
/// index within the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeId {
    region: usize,
    slot: usize,
}

/// Raw two-word node image as injected code sees it.
#[derive(Clone, Copy, Debug)]
struct RawNode {
    value: usize,
    next: usize,
}

impl RawNode {
    /// A slot holds a live node unless it is fully zeroed.
    fn is_valid(&self) -> bool {
        !(self.value == 0 && self.next == 0)
    }
}

unsafe fn read_node(address: usize) -> RawNode {
    unsafe {
        RawNode {
            value: ptr::read_volatile(address as *const usize),
            next: ptr::read_volatile((address + std::mem::size_of::<usize>()) as *const usize),
        }
    }
}

unsafe fn write_node(address: usize, node: RawNode) {
    unsafe {
        ptr::write_volatile(address as *mut usize, node.value);
        ptr::write_volatile(
            (address + std::mem::size_of::<usize>()) as *mut usize,
            node.next,
        );
    }
}

/// One region treated as a flat array of node slots. The mutex serializes
/// the capacity scan against the claim that follows it.
struct NodeRegion {
    memory: MemoryRegion,
    slots: usize,
    has_space: bool,
}

impl NodeRegion {
    fn new(memory: MemoryRegion) -> Self {
        Self {
            memory,
            slots: memory.size() / NODE_SIZE,
            has_space: true,
        }
    }

    fn slot_address(&self, slot: usize) -> usize {
        self.memory.address() + slot * NODE_SIZE
    }

    fn first_free_slot(&self) -> Option<usize> {
        (0..self.slots).find(|&slot| !unsafe { read_node(self.slot_address(slot)) }.is_valid())
    }

    /// Recomputed by a full slot scan after every change; the region is out
    /// of space exactly when every slot holds a valid node.
    fn update_has_space(&mut self) {
        self.has_space = self.first_free_slot().is_some();
    }

    fn claim(&mut self, value: usize) -> Result<usize> {
        if !self.has_space {
            return Err(Error::ExhaustedCapacity("no free node slot"));
        }
        let slot = self
            .first_free_slot()
            .ok_or(Error::ExhaustedCapacity("no free node slot"))?;

        unsafe {
            write_node(self.slot_address(slot), RawNode { value, next: 0 });
        }
        self.update_has_space();
        Ok(slot)
    }
}

/// Sub-allocates nodes from dedicated regions and resolves [`NodeId`]s.
pub struct NodeAllocator {
    region_allocator: Arc<RegionAllocator>,
    regions: Mutex<Vec<Arc<Mutex<NodeRegion>>>>,
}

impl NodeAllocator {
    pub fn new(region_allocator: Arc<RegionAllocator>) -> Self {
        Self {
            region_allocator,
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Create a chain whose root holds `start_value`.
    pub fn create_array(self: &Arc<Self>, start_value: usize) -> Result<LinkedArray> {
        let root = self.allocate_node(start_value)?;
        Ok(LinkedArray {
            nodes: self.clone(),
            root,
            last: root,
            disposed: false,
        })
    }

    /// Claim one slot holding `value` from the first region with capacity,
    /// allocating a new region when none has any.
    pub fn allocate_node(&self, value: usize) -> Result<NodeId> {
        let (region_index, region) = self.region_with_space()?;
        let slot = region.lock().claim(value)?;
        Ok(NodeId {
            region: region_index,
            slot,
        })
    }

    fn region_with_space(&self) -> Result<(usize, Arc<Mutex<NodeRegion>>)> {
        let mut regions = self.regions.lock();

        for (index, region) in regions.iter().enumerate() {
            if region.lock().has_space {
                return Ok((index, region.clone()));
            }
        }

        let memory = self.region_allocator.allocate(NODE_REGION_SIZE)?;
        debug!("node region {:#x} created", memory.address());
        let region = Arc::new(Mutex::new(NodeRegion::new(memory)));
        regions.push(region.clone());
        Ok((regions.len() - 1, region))
    }

    /// Raw address of a node, for chaining and for handing to stubs.
    pub fn address_of(&self, id: NodeId) -> usize {
        self.regions.lock()[id.region].lock().slot_address(id.slot)
    }

    /// Map a raw successor address back to a [`NodeId`].
    fn id_at(&self, address: usize) -> Option<NodeId> {
        let regions = self.regions.lock();
        for (index, region) in regions.iter().enumerate() {
            let region = region.lock();
            let base = region.memory.address();
            if address >= base && address < base + region.slots * NODE_SIZE {
                return Some(NodeId {
                    region: index,
                    slot: (address - base) / NODE_SIZE,
                });
            }
        }
        None
    }

    /// Zero a node slot and let its region notice the free capacity.
    fn destroy(&self, id: NodeId) {
        let region = self.regions.lock()[id.region].clone();
        let mut region = region.lock();
        unsafe {
            write_node(region.slot_address(id.slot), RawNode { value: 0, next: 0 });
        }
        region.update_has_space();
    }
}

/// A singly linked chain of pointer-sized values with at least one node.
pub struct LinkedArray {
    nodes: Arc<NodeAllocator>,
    root: NodeId,
    last: NodeId,
    disposed: bool,
}

impl LinkedArray {
    /// Root node of the chain; stable while the chain is logically empty,
    /// but replaced when a populated root is removed.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Address injected stubs start walking from.
    pub fn root_address(&self) -> usize {
        self.nodes.address_of(self.root)
    }

    /// Value currently held by `id`.
    pub fn value_of(&self, id: NodeId) -> usize {
        unsafe { read_node(self.nodes.address_of(id)) }.value
    }

    /// Whether the chain is logically empty (root holds the reserved
    /// empty sentinel).
    pub fn is_empty(&self) -> bool {
        unsafe { read_node(self.nodes.address_of(self.root)) }.value == EMPTY_NODE_VALUE
    }

    /// Number of nodes in the chain, counting the sentinel root.
    pub fn node_count(&self) -> usize {
        let mut count = 1;
        let mut address = self.nodes.address_of(self.root);
        loop {
            let node = unsafe { read_node(address) };
            if node.next == 0 {
                break;
            }
            count += 1;
            address = node.next;
        }
        count
    }

    /// Append `value` to the chain. An empty chain stores the value in the
    /// root instead of growing.
    pub fn add_node(&mut self, value: usize) -> Result<NodeId> {
        if self.disposed {
            return Err(Error::InvalidReuse("add to a disposed linked array"));
        }

        let root_address = self.nodes.address_of(self.root);
        let root = unsafe { read_node(root_address) };
        if root.value == EMPTY_NODE_VALUE {
            unsafe {
                write_node(
                    root_address,
                    RawNode {
                        value,
                        next: root.next,
                    },
                );
            }
            return Ok(self.root);
        }

        let id = self.nodes.allocate_node(value)?;
        let last_address = self.nodes.address_of(self.last);
        let last = unsafe { read_node(last_address) };
        unsafe {
            write_node(
                last_address,
                RawNode {
                    value: last.value,
                    next: self.nodes.address_of(id),
                },
            );
        }
        self.last = id;
        Ok(id)
    }

    /// Remove `id` from the chain. Removing the root promotes its successor
    /// when one exists; removing the only node resets the root to the empty
    /// sentinel, so the chain never has zero nodes.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        if self.disposed {
            return Err(Error::InvalidReuse("remove from a disposed linked array"));
        }

        if id == self.root {
            let root_address = self.nodes.address_of(self.root);
            let root = unsafe { read_node(root_address) };

            if let Some(successor) = (root.next != 0)
                .then(|| self.nodes.id_at(root.next))
                .flatten()
            {
                self.root = successor;
                self.nodes.destroy(id);
            } else {
                unsafe {
                    write_node(
                        root_address,
                        RawNode {
                            value: EMPTY_NODE_VALUE,
                            next: 0,
                        },
                    );
                }
            }
            return Ok(());
        }

        let target_address = self.nodes.address_of(id);
        let mut previous = self.root;
        loop {
            let previous_address = self.nodes.address_of(previous);
            let node = unsafe { read_node(previous_address) };
            if node.next == 0 {
                // Not on this chain; nothing to unlink.
                return Ok(());
            }

            if node.next == target_address {
                let target = unsafe { read_node(target_address) };
                unsafe {
                    write_node(
                        previous_address,
                        RawNode {
                            value: node.value,
                            next: target.next,
                        },
                    );
                }
                if self.last == id {
                    self.last = previous;
                }
                self.nodes.destroy(id);
                return Ok(());
            }

            previous = match self.nodes.id_at(node.next) {
                Some(next) => next,
                None => return Ok(()),
            };
        }
    }

    /// Walk the chain once from the root, clearing every node. Each next
    /// pointer is read before its node is destroyed. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let mut address = self.nodes.address_of(self.root);
        loop {
            let node = unsafe { read_node(address) };
            unsafe {
                write_node(address, RawNode { value: 0, next: 0 });
            }
            if node.next == 0 {
                break;
            }
            address = node.next;
        }

        // Regions holding the destroyed slots regain their capacity.
        let regions = self.nodes.regions.lock().clone();
        for region in regions {
            region.lock().update_has_space();
        }
    }
}

impl Drop for LinkedArray {
    fn drop(&mut self) {
        self.dispose();
    }
}
