//! Fixed-size pool of search engines shared by all running games.
//!
//! Checkout hands out an [`EngineGuard`]. Dropping the guard returns the
//! engine to the pool, also when unwinding.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{self as chan, Receiver, Sender};

use crate::engine::{EngineFactory, SearchEngine};
use crate::error::EngineError;

pub struct EnginePool {
    idle_tx: Sender<Box<dyn SearchEngine>>,
    idle_rx: Receiver<Box<dyn SearchEngine>>,
    size: usize,
    outstanding: AtomicUsize,
    next_index: AtomicUsize,
    respawned: AtomicUsize,
    factory: Option<EngineFactory>,
}

impl EnginePool {
    /// Starts `size` engines up front. Any launch failure is fatal to the caller.
    pub fn spawn(size: usize, factory: EngineFactory) -> Result<Self, EngineError> {
        let mut engines = Vec::with_capacity(size);
        for index in 0..size {
            engines.push(factory(index)?);
        }
        log::info!("engine pool: {size} engines started");
        Ok(Self::with_engines(engines, Some(factory)))
    }

    /// Builds a pool over already running engines. Without a factory, broken
    /// engines stay in rotation as they are.
    pub fn with_engines(engines: Vec<Box<dyn SearchEngine>>, factory: Option<EngineFactory>) -> Self {
        let size = engines.len();
        let (idle_tx, idle_rx) = chan::bounded(size.max(1));
        for engine in engines {
            // Capacity equals the engine count, so this cannot block or fail.
            let _ = idle_tx.send(engine);
        }
        Self {
            idle_tx,
            idle_rx,
            size,
            outstanding: AtomicUsize::new(0),
            next_index: AtomicUsize::new(size),
            respawned: AtomicUsize::new(0),
            factory,
        }
    }

    /// Blocks until an engine is idle and checks it out.
    ///
    /// Never fails: the pool is sized to parallelism + 1 so a waiter is always
    /// eventually served. An engine that failed its previous search is replaced
    /// before it is handed out.
    pub fn acquire(&self) -> EngineGuard<'_> {
        // The pool owns a sender, so the channel never disconnects.
        let engine = match self.idle_rx.recv() {
            Ok(engine) => engine,
            Err(_) => unreachable!("engine pool channel closed while the pool is alive"),
        };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        EngineGuard {
            pool: self,
            engine: Some(self.ensure_healthy(engine)),
        }
    }

    fn ensure_healthy(&self, engine: Box<dyn SearchEngine>) -> Box<dyn SearchEngine> {
        if engine.is_healthy() {
            return engine;
        }
        let Some(factory) = &self.factory else {
            return engine;
        };
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        log::warn!("engine pool: {} is unhealthy, respawning as engine#{index}", engine.label());
        match factory(index) {
            Ok(fresh) => {
                self.respawned.fetch_add(1, Ordering::Relaxed);
                drop(engine);
                fresh
            }
            Err(e) => {
                // Keep capacity; the caller falls back when this engine fails again.
                log::error!("engine pool: respawn failed, keeping broken engine: {e}");
                engine
            }
        }
    }

    fn release(&self, engine: Box<dyn SearchEngine>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        if self.idle_tx.send(engine).is_err() {
            log::error!("engine pool: failed to return engine to the pool");
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn respawned(&self) -> usize {
        self.respawned.load(Ordering::Relaxed)
    }

    /// Shuts down the idle engines. Used right before the process exits.
    pub fn drain(&self) -> usize {
        let mut closed = 0;
        while let Ok(engine) = self.idle_rx.try_recv() {
            drop(engine);
            closed += 1;
        }
        closed
    }
}

/// A checked-out engine. Returned to the pool on drop.
pub struct EngineGuard<'a> {
    pool: &'a EnginePool,
    engine: Option<Box<dyn SearchEngine>>,
}

impl Deref for EngineGuard<'_> {
    type Target = dyn SearchEngine;

    fn deref(&self) -> &Self::Target {
        match &self.engine {
            Some(engine) => &**engine,
            None => unreachable!("engine guard used after release"),
        }
    }
}

impl DerefMut for EngineGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.engine {
            Some(engine) => &mut **engine,
            None => unreachable!("engine guard used after release"),
        }
    }
}

impl Drop for EngineGuard<'_> {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool.release(engine);
        }
    }
}
