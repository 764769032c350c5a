//! Scene stress demo
//!
//! Runs the render synchronization core on a simulated GPU while several
//! gameplay threads spawn, move and despawn mesh instances.
//!
//! Usage: `scene_stress [config.toml|config.ron]`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use render_sync::prelude::*;

const GAMEPLAY_THREADS: usize = 4;
const RUN_TIME: Duration = Duration::from_secs(3);
const GPU_LATENCY: Duration = Duration::from_micros(500);
const MAX_LIVE_PER_THREAD: usize = 200;

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] render_sync::config::ConfigError),
    
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    
    #[error("failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),
    
    #[error("GPU reported {0} hazards")]
    Hazards(usize),
}

fn load_config() -> Result<RenderSyncConfig, AppError> {
    match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading configuration from {path}");
            Ok(RenderSyncConfig::load_from_file(path)?)
        }
        None => Ok(RenderSyncConfig::default()),
    }
}

fn build_meshes() -> Vec<Arc<Mesh>> {
    vec![
        Mesh::with_radius("asteroid small", MeshData::unit_cube(), 1.0),
        Mesh::with_radius("asteroid large", MeshData::unit_cube(), 4.0),
        Mesh::with_radius("ship", MeshData::unit_cube(), 2.0),
        Mesh::with_draw_distance("station", MeshData::unit_cube(), 5000.0),
    ]
}

/// Spawn, move and despawn instances until `running` clears
fn gameplay(worker: usize, manager: &DataManagerHandle, meshes: &[Arc<Mesh>], running: &AtomicBool) -> usize {
    let mut rng = rand::thread_rng();
    let mut live: Vec<MeshHandle> = Vec::with_capacity(MAX_LIVE_PER_THREAD);
    let mut spawned = 0;
    let origin = Vec3::new(worker as f32 * 500.0, 0.0, 0.0);
    
    while running.load(Ordering::Relaxed) {
        let roll: f32 = rng.gen();
        if live.len() < MAX_LIVE_PER_THREAD && roll < 0.5 {
            let mesh = Arc::clone(&meshes[rng.gen_range(0..meshes.len())]);
            let offset = Vec3::new(rng.gen_range(-200.0..200.0), rng.gen_range(-50.0..50.0), rng.gen_range(-200.0..200.0));
            match MeshHandle::initialize(manager, mesh, Transform::from_position(origin + offset)) {
                Ok(handle) => {
                    live.push(handle);
                    spawned += 1;
                }
                Err(e) => log::warn!("Gameplay thread {worker} could not spawn: {e}"),
            }
        } else if !live.is_empty() && roll < 0.8 {
            let handle = &live[rng.gen_range(0..live.len())];
            let position = origin + Vec3::new(rng.gen_range(-200.0..200.0), 0.0, rng.gen_range(-200.0..200.0));
            if let Err(e) = handle.update_transform(Transform::from_position(position)) {
                log::debug!("Gameplay thread {worker} move rejected: {e}");
            }
        } else if !live.is_empty() {
            let index = rng.gen_range(0..live.len());
            live.swap_remove(index);
        }
        thread::sleep(Duration::from_micros(200));
    }
    
    spawned
}

fn run() -> Result<(), AppError> {
    let config = load_config()?;
    
    log::info!("Creating simulated GPU...");
    let gpu = Arc::new(SimulatedGpu::with_mode(RetireMode::Manual));
    let retire = RetireWorker::start(Arc::clone(&gpu), GPU_LATENCY)?;
    
    let engine = Engine::start(config, Arc::clone(&gpu) as Arc<dyn GpuDevice>)?;
    engine.set_state(GameState::Playing);
    
    let meshes = build_meshes();
    let running = AtomicBool::new(true);
    let started = Instant::now();
    
    let spawned: usize = thread::scope(|scope| {
        let workers: Vec<_> = (0..GAMEPLAY_THREADS)
            .map(|worker| {
                let manager = engine.data_manager();
                let meshes = &meshes;
                let running = &running;
                scope.spawn(move || gameplay(worker, &manager, meshes, running))
            })
            .collect();
        
        thread::sleep(RUN_TIME);
        running.store(false, Ordering::Relaxed);
        workers.into_iter().map(|worker| worker.join().unwrap_or(0)).sum()
    });
    
    let summary = engine.stop()?;
    drop(retire);
    
    let elapsed = started.elapsed().as_secs_f32();
    log::info!(
        "{} frames in {elapsed:.2}s ({:.0} fps), {} publishes, {} scene swaps",
        summary.renderer.frames,
        summary.renderer.frames as f32 / elapsed,
        summary.data_manager.publishes,
        summary.renderer.scene_swaps,
    );
    log::info!(
        "{spawned} instances spawned, {} placed, {} meshes uploaded, {} upload submissions",
        summary.data_manager.instances_placed,
        summary.data_manager.meshes_uploaded,
        summary.data_manager.upload_submissions,
    );
    
    let hazards = gpu.hazards();
    for hazard in &hazards {
        log::error!("GPU hazard: {hazard:?}");
    }
    if !hazards.is_empty() {
        return Err(AppError::Hazards(hazards.len()));
    }
    log::info!("{} GPU buffers left after shutdown", gpu.live_buffers());
    Ok(())
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    
    log::info!("Starting scene stress demo");
    if let Err(e) = run() {
        log::error!("Scene stress demo failed: {e}");
        std::process::exit(1);
    }
    log::info!("Scene stress demo finished successfully");
}
