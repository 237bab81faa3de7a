//! Block arena over a single GPU buffer.
//!
//! Terrain meshes come and go on every refinement cycle, so instead of
//! creating and destroying a `wgpu::Buffer` per mesh the arena preallocates
//! one large buffer, hands out block-aligned slots of it, and recycles freed
//! slots through a sorted free list. Draw calls then bind one vertex buffer
//! and offset into it per mesh.

use thiserror::Error;

/// Allocation granularity in bytes.
pub const BLOCK_SIZE: u64 = 4096;

const INVALID_RUN: u32 = u32::MAX;

/// A block-aligned byte range inside the arena buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaSlot {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    /// No contiguous free run can hold the request.
    #[error("arena has no free run of {requested_blocks} contiguous blocks")]
    OutOfBlocks { requested_blocks: u32 },
}

/// A run of contiguous free blocks; node of the sorted free list.
#[derive(Clone, Copy, Debug)]
struct FreeRun {
    first_block: u32,
    block_count: u32,
    prev: u32,
    next: u32,
}

/// What a single block is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockState {
    /// Member of the free run with this id.
    Free(u32),
    /// Allocated; the payload is the base block of its slot.
    Used(u32),
}

/// CPU-side allocation bookkeeping of a [`MeshArena`].
///
/// Free runs form a doubly linked list kept sorted ascending by length, so
/// allocation is a first-fit walk that lands on the tightest run able to
/// hold the request. Run ids are stable slab indices, never pointers. The
/// ledger involves no GPU resources and stands alone in tests.
pub struct ArenaLedger {
    blocks: Vec<BlockState>,
    runs: Vec<FreeRun>,
    retired_runs: Vec<u32>,
    /// Shortest free run, or `INVALID_RUN` when nothing is free.
    head: u32,
    free_blocks: u32,
}

impl ArenaLedger {
    /// A ledger whose whole range starts as one free run.
    pub fn new(block_count: u32) -> Self {
        let mut ledger = Self {
            blocks: vec![BlockState::Free(INVALID_RUN); block_count as usize],
            runs: Vec::new(),
            retired_runs: Vec::new(),
            head: INVALID_RUN,
            free_blocks: block_count,
        };
        if block_count > 0 {
            let run = ledger.new_run(0, block_count);
            ledger.insert_sorted(run);
            ledger.tag_free(0, block_count, run);
        }
        ledger
    }

    /// Carves a slot out of the first (therefore tightest) free run that can
    /// hold `size_bytes`, rounded up to whole blocks. The slot comes from
    /// the run's low end; any remainder re-enters the list at its new
    /// sorted position.
    pub fn allocate(&mut self, size_bytes: u64) -> Result<ArenaSlot, ArenaError> {
        debug_assert!(size_bytes > 0, "zero-size arena allocation");
        let requested = size_bytes.div_ceil(BLOCK_SIZE) as u32;

        let mut run_id = self.head;
        while run_id != INVALID_RUN && self.runs[run_id as usize].block_count < requested {
            run_id = self.runs[run_id as usize].next;
        }
        if run_id == INVALID_RUN {
            return Err(ArenaError::OutOfBlocks {
                requested_blocks: requested,
            });
        }

        let run = self.runs[run_id as usize];
        let base = run.first_block;
        self.unlink(run_id);
        if run.block_count > requested {
            // The remainder reuses the slab entry; its blocks already carry
            // this run id.
            let entry = &mut self.runs[run_id as usize];
            entry.first_block = base + requested;
            entry.block_count = run.block_count - requested;
            self.insert_sorted(run_id);
        } else {
            self.retired_runs.push(run_id);
        }
        for block in base..base + requested {
            self.blocks[block as usize] = BlockState::Used(base);
        }
        self.free_blocks -= requested;
        debug_assert!(self.coherent());

        Ok(ArenaSlot {
            offset: base as u64 * BLOCK_SIZE,
            size: requested as u64 * BLOCK_SIZE,
        })
    }

    /// Returns a slot to the free list. If the block immediately below the
    /// slot is free, the freed blocks extend that run. A free run starting
    /// right above the slot stays separate; coalescing only looks downward.
    pub fn free(&mut self, slot: ArenaSlot) {
        debug_assert_eq!(slot.offset % BLOCK_SIZE, 0);
        let first = (slot.offset / BLOCK_SIZE) as u32;
        let count = slot.size.div_ceil(BLOCK_SIZE) as u32;
        debug_assert!(
            (first..first + count).all(|b| self.blocks[b as usize] == BlockState::Used(first)),
            "freeing a slot the arena did not allocate"
        );

        let run_id = match (first > 0).then(|| self.blocks[first as usize - 1]) {
            Some(BlockState::Free(below)) => {
                // That run necessarily ends at `first - 1`; extend it.
                self.unlink(below);
                self.runs[below as usize].block_count += count;
                self.insert_sorted(below);
                below
            }
            _ => {
                let id = self.new_run(first, count);
                self.insert_sorted(id);
                id
            }
        };
        self.tag_free(first, count, run_id);
        self.free_blocks += count;
        debug_assert!(self.coherent());
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    pub fn used_blocks(&self) -> u32 {
        self.block_count() - self.free_blocks
    }

    /// Logs the free list at debug level, shortest run first.
    pub fn log_state(&self) {
        log::debug!(
            "arena: {} of {} blocks free",
            self.free_blocks,
            self.block_count()
        );
        let mut run_id = self.head;
        while run_id != INVALID_RUN {
            let run = self.runs[run_id as usize];
            log::debug!(
                "  run {run_id}: blocks {}..{}",
                run.first_block,
                run.first_block + run.block_count
            );
            run_id = run.next;
        }
    }

    fn new_run(&mut self, first_block: u32, block_count: u32) -> u32 {
        let run = FreeRun {
            first_block,
            block_count,
            prev: INVALID_RUN,
            next: INVALID_RUN,
        };
        match self.retired_runs.pop() {
            Some(id) => {
                self.runs[id as usize] = run;
                id
            }
            None => {
                self.runs.push(run);
                (self.runs.len() - 1) as u32
            }
        }
    }

    /// Links an unlinked run at its length-ascending position.
    fn insert_sorted(&mut self, run_id: u32) {
        let count = self.runs[run_id as usize].block_count;
        let mut prev = INVALID_RUN;
        let mut cur = self.head;
        while cur != INVALID_RUN && self.runs[cur as usize].block_count < count {
            prev = cur;
            cur = self.runs[cur as usize].next;
        }
        self.runs[run_id as usize].prev = prev;
        self.runs[run_id as usize].next = cur;
        if prev == INVALID_RUN {
            self.head = run_id;
        } else {
            self.runs[prev as usize].next = run_id;
        }
        if cur != INVALID_RUN {
            self.runs[cur as usize].prev = run_id;
        }
    }

    fn unlink(&mut self, run_id: u32) {
        let FreeRun { prev, next, .. } = self.runs[run_id as usize];
        if prev == INVALID_RUN {
            self.head = next;
        } else {
            self.runs[prev as usize].next = next;
        }
        if next != INVALID_RUN {
            self.runs[next as usize].prev = prev;
        }
    }

    fn tag_free(&mut self, first: u32, count: u32, run_id: u32) {
        for block in first..first + count {
            self.blocks[block as usize] = BlockState::Free(run_id);
        }
    }

    /// List links intact, lengths ascending, run totals matching the free
    /// block counter.
    fn coherent(&self) -> bool {
        let mut total = 0;
        let mut prev = INVALID_RUN;
        let mut prev_len = 0;
        let mut cur = self.head;
        while cur != INVALID_RUN {
            let run = self.runs[cur as usize];
            if run.prev != prev || run.block_count < prev_len {
                return false;
            }
            total += run.block_count;
            prev = cur;
            prev_len = run.block_count;
            cur = run.next;
        }
        total == self.free_blocks
    }
}

/// Block arena over one `wgpu::Buffer`, holding every terrain mesh.
pub struct MeshArena {
    buffer: wgpu::Buffer,
    ledger: ArenaLedger,
}

impl MeshArena {
    /// Creates the backing buffer (`block_count` × [`BLOCK_SIZE`] bytes) and
    /// an all-free ledger. `COPY_DST` is added for slot uploads.
    pub fn new(device: &wgpu::Device, block_count: u32, usage: wgpu::BufferUsages) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("terrain_mesh_arena"),
            size: block_count as u64 * BLOCK_SIZE,
            usage: usage | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            ledger: ArenaLedger::new(block_count),
        }
    }

    /// See [`ArenaLedger::allocate`].
    pub fn allocate(&mut self, size_bytes: u64) -> Result<ArenaSlot, ArenaError> {
        self.ledger.allocate(size_bytes)
    }

    /// See [`ArenaLedger::free`].
    pub fn free(&mut self, slot: ArenaSlot) {
        self.ledger.free(slot)
    }

    /// Uploads `bytes` into the slot's range.
    pub fn write(&self, queue: &wgpu::Queue, slot: ArenaSlot, bytes: &[u8]) {
        debug_assert!(bytes.len() as u64 <= slot.size);
        queue.write_buffer(&self.buffer, slot.offset, bytes);
    }

    /// The backing buffer, for vertex binding.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn block_count(&self) -> u32 {
        self.ledger.block_count()
    }

    pub fn free_blocks(&self) -> u32 {
        self.ledger.free_blocks()
    }

    pub fn used_blocks(&self) -> u32 {
        self.ledger.used_blocks()
    }

    pub fn log_state(&self) {
        self.ledger.log_state()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
