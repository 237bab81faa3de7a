//! Background meshing worker.
//!
//! The quadtree and mesher travel to a pooled thread as one unit for each
//! refinement cycle and travel back when the caller polls for completion,
//! so no lock guards terrain state and the render thread never blocks on
//! meshing. While a cycle is out, further updates are refused, which keeps
//! diffs strictly ordered.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use glam::Vec3;

use strata_lod::LodQuadtree;
use strata_voxel::VoxelStore;

use crate::mesher::TerrainMesher;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads with no job queue: a job is either handed
/// to an idle worker right away or refused.
pub struct TaskPool {
    sender: Option<crossbeam_channel::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    idle: Arc<AtomicUsize>,
}

impl TaskPool {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = crossbeam_channel::bounded::<Job>(worker_count);
        let idle = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let receiver = receiver.clone();
            let idle_counter = Arc::clone(&idle);
            let spawned = std::thread::Builder::new()
                .name(format!("mesh-worker-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                        idle_counter.fetch_add(1, Ordering::Relaxed);
                    }
                });
            match spawned {
                Ok(handle) => {
                    workers.push(handle);
                    idle.fetch_add(1, Ordering::Relaxed);
                }
                Err(error) => tracing::error!(%error, "failed to spawn a mesh worker"),
            }
        }

        Self {
            sender: Some(sender),
            workers,
            idle,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn idle_workers(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    /// Claims an idle worker, or `None` when every worker is busy or the
    /// pool has shut down. The claim is released by spawning on it or by
    /// dropping it.
    pub fn reserve(&self) -> Option<IdleWorker<'_>> {
        self.sender.as_ref()?;
        let mut idle = self.idle.load(Ordering::Relaxed);
        while idle > 0 {
            match self
                .idle
                .compare_exchange_weak(idle, idle - 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(IdleWorker { pool: self }),
                Err(current) => idle = current,
            }
        }
        None
    }

    /// Reserve-and-spawn in one step. The job is dropped unrun when no
    /// worker is free, so callers whose job owns state they cannot afford
    /// to lose should [`reserve`](Self::reserve) first.
    pub fn try_spawn<T, F>(&self, job: F) -> Option<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Some(self.reserve()?.spawn(job))
    }

    /// Drops the job channel and joins every worker.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A claimed idle worker. Dropping the claim returns the worker unused.
pub struct IdleWorker<'a> {
    pool: &'a TaskPool,
}

impl IdleWorker<'_> {
    /// Runs `job` on the claimed worker and returns a handle to its result.
    pub fn spawn<T, F>(self, job: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let pool = self.pool;
        std::mem::forget(self);

        let (result_sender, result_receiver) = crossbeam_channel::bounded(1);
        let boxed: Job = Box::new(move || {
            let _ = result_sender.send(job());
        });
        // The borrow on the pool keeps the sender alive, so this send only
        // fails if every worker already exited; the dropped job then reads
        // as a lost result on the handle.
        if let Some(sender) = pool.sender.as_ref() {
            if sender.send(boxed).is_err() {
                pool.idle.fetch_add(1, Ordering::Relaxed);
            }
        }
        TaskHandle {
            receiver: result_receiver,
            result: None,
            done: false,
        }
    }
}

impl Drop for IdleWorker<'_> {
    fn drop(&mut self) {
        self.pool.idle.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to one spawned job.
pub struct TaskHandle<T> {
    receiver: crossbeam_channel::Receiver<T>,
    result: Option<T>,
    done: bool,
}

impl<T> TaskHandle<T> {
    /// Non-blocking completion check. A panicked job also counts as
    /// finished; its [`join`](Self::join) then returns `None`.
    pub fn is_finished(&mut self) -> bool {
        if !self.done {
            match self.receiver.try_recv() {
                Ok(value) => {
                    self.result = Some(value);
                    self.done = true;
                }
                Err(crossbeam_channel::TryRecvError::Disconnected) => self.done = true,
                Err(crossbeam_channel::TryRecvError::Empty) => {}
            }
        }
        self.done
    }

    /// Blocks until the job ends. `None` means it panicked.
    pub fn join(mut self) -> Option<T> {
        if self.is_finished() {
            return self.result.take();
        }
        self.receiver.recv().ok()
    }
}

/// The terrain state that shuttles between the render thread and a worker.
pub struct MesherState {
    pub tree: LodQuadtree,
    pub mesher: TerrainMesher,
}

impl MesherState {
    /// One refinement cycle: refocus the tree, then mesh its diff. Both
    /// steps degrade rather than fail, so errors are logged and the next
    /// cycle retries whatever stayed dirty.
    pub fn run_cycle(&mut self, focal: Vec3, store: &VoxelStore) {
        if let Err(error) = self.tree.set_focal_point(focal) {
            tracing::warn!(%error, "quadtree refinement incomplete");
        }
        if let Err(error) = self.mesher.apply_diff(store, &self.tree, self.tree.diff()) {
            tracing::warn!(%error, "meshing cycle incomplete, groups stay dirty");
        }
    }
}

/// Owns the meshing state except while a background cycle runs.
///
/// The render loop calls [`try_collect`](Self::try_collect) every frame to
/// bring finished state home (then syncs it to the GPU), and
/// [`try_update`](Self::try_update) whenever the focal point warrants a new
/// cycle.
pub struct TerrainWorker {
    pool: TaskPool,
    state: Option<MesherState>,
    job: Option<TaskHandle<MesherState>>,
}

impl TerrainWorker {
    pub fn new(tree: LodQuadtree, mesher: TerrainMesher) -> Self {
        let pool = TaskPool::new(mesher.config().worker_threads);
        Self {
            pool,
            state: Some(MesherState { tree, mesher }),
            job: None,
        }
    }

    /// True while a cycle runs in the background.
    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }

    /// The state, when it is home.
    pub fn state(&self) -> Option<&MesherState> {
        self.state.as_ref()
    }

    pub fn state_mut(&mut self) -> Option<&mut MesherState> {
        self.state.as_mut()
    }

    /// Starts a background cycle for `focal`. Returns false without side
    /// effects while a cycle is already out, when the state was lost to a
    /// panicked cycle, or when no worker is idle.
    pub fn try_update(&mut self, focal: Vec3, store: &Arc<VoxelStore>) -> bool {
        if self.job.is_some() || self.state.is_none() {
            return false;
        }
        let Some(worker) = self.pool.reserve() else {
            return false;
        };
        let Some(mut state) = self.state.take() else {
            return false;
        };
        let store = Arc::clone(store);
        self.job = Some(worker.spawn(move || {
            state.run_cycle(focal, &store);
            state
        }));
        true
    }

    /// Brings a finished cycle's state home. Returns true when fresh
    /// results arrived this call.
    pub fn try_collect(&mut self) -> bool {
        if !self.job.as_mut().is_some_and(|job| job.is_finished()) {
            return false;
        }
        let Some(job) = self.job.take() else {
            return false;
        };
        match job.join() {
            Some(state) => {
                self.state = Some(state);
                true
            }
            None => {
                tracing::error!("meshing cycle panicked, terrain state lost");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
