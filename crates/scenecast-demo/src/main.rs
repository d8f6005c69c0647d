//! Demo producer that streams an animated scene to any connected viewer.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p scenecast-demo -- --frames 300 --compress true`.

mod scene;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use clap::Parser;
use scenecast_config::{CliArgs, Config, DemoConfig};
use scenecast_net::stats::StatsSnapshot;
use scenecast_net::{Connection, MonitorMode, TcpServer};
use tracing::{debug, info, warn};

use crate::scene::DemoScene;

const SCENE_SEED: u64 = 42;
/// Seconds between overlay toggles.
const OVERLAY_PERIOD: f32 = 4.0;
/// Seconds between traffic reports.
const STATS_PERIOD: f32 = 5.0;

fn main() {
    let args = CliArgs::parse();
    let config_dir = args.config_dir();

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);
    if config.debug.log_dir.is_none() && cfg!(debug_assertions) {
        config.debug.log_dir = Some(config_dir.join("logs"));
    }
    scenecast_log::init_logging(Some(&config.debug));

    if let Err(e) = config.validate() {
        tracing::error!("{e}");
        std::process::exit(2);
    }
    if let Err(e) = run(&config) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<(), scenecast_net::MonitorError> {
    let demo = &config.demo;
    let scene = Arc::new(Mutex::new(DemoScene::new(demo.shape_count, SCENE_SEED)));
    let server = TcpServer::new(config.server.clone(), config.info);

    let callback_scene = Arc::clone(&scene);
    server.set_connection_callback(move |_, connection| {
        let scene = callback_scene.lock().unwrap_or_else(PoisonError::into_inner);
        for shape in scene.persistent_shapes() {
            if let Err(e) = connection.create(shape) {
                warn!(peer = %connection.peer_addr(), error = %e, "failed to send scene");
                return;
            }
        }
        debug!(peer = %connection.peer_addr(), "sent current scene");
    });

    let mode = if demo.async_monitor {
        MonitorMode::Asynchronous
    } else {
        MonitorMode::Synchronous
    };
    server.monitor().start(mode)?;
    info!(port = server.port(), ?mode, "demo server started");

    if demo.wait_for_client_ms > 0 {
        let timeout = Duration::from_millis(demo.wait_for_client_ms);
        if server.monitor().wait_for_connections(timeout) {
            server.commit_connections();
        } else {
            info!("no client yet, streaming anyway");
        }
    }

    produce(&server, &scene, demo, mode);
    server.close();
    Ok(())
}

/// Frame loop. Runs until `max_frames` is reached, or forever when zero.
fn produce(server: &TcpServer, scene: &Mutex<DemoScene>, demo: &DemoConfig, mode: MonitorMode) {
    let frame_time = Duration::from_secs_f64(1.0 / f64::from(demo.frame_rate));
    let dt = frame_time.as_secs_f32();
    let overlay_frames = frame_count(OVERLAY_PERIOD, demo.frame_rate);
    let stats_frames = frame_count(STATS_PERIOD, demo.frame_rate);

    let mut frame: u64 = 0;
    while demo.max_frames == 0 || frame < demo.max_frames {
        let started = Instant::now();
        if mode == MonitorMode::Synchronous {
            server.monitor().monitor_connections();
            server.commit_connections();
        }

        {
            let mut scene = scene.lock().unwrap_or_else(PoisonError::into_inner);
            scene.advance(dt);
            for shape in scene.moving_shapes() {
                server.update(shape);
            }
            server.create(scene.marker());

            if frame > 0 && frame % overlay_frames == 0 {
                if scene.toggle_overlay() {
                    server.create(scene.overlay());
                } else {
                    server.destroy(scene.overlay());
                }
                debug!(visible = scene.overlay_visible(), "overlay toggled");
            }
        }

        server.update_transfers(demo.transfer_budget);
        // May commit new connections, whose callback locks the scene.
        let result = server.update_frame(dt, true);
        if !result.is_ok() {
            debug!(frame, failures = result.failures(), "frame not delivered to every client");
        }

        frame += 1;
        if frame % stats_frames == 0 {
            report(server, frame);
        }

        if let Some(remaining) = frame_time.checked_sub(started.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
    info!(frames = frame, "demo finished");
}

fn frame_count(seconds: f32, frame_rate: u32) -> u64 {
    ((seconds * frame_rate as f32) as u64).max(1)
}

fn report(server: &TcpServer, frame: u64) {
    let mut total = StatsSnapshot::default();
    for connection in server.connections() {
        total.accumulate(&connection.stats());
    }
    info!(
        frame,
        clients = server.connection_count(),
        bytes = total.bytes_sent,
        packets = total.packets,
        ratio = total.compression_ratio(),
        "traffic"
    );
}
