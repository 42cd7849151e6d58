use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use glue_sync::config::SyncConfig;
use glue_sync::metrics::{self, Metrics};
use glue_sync::net::transport::WebTransportServer;
use glue_sync::world::{Entity, EntityId, Scheduler, World};

/// Demo entity: a point that drifts with its velocity and expires after `ttl` frames
struct Drifter {
    x: f64,
    y: f64,
    vx: f64,
    vy: f64,
    ttl: f64,
}

impl Entity for Drifter {
    fn add_packet(&self) -> Option<Value> {
        Some(json!({ "x": self.x, "y": self.y }))
    }

    fn update_packet(&self) -> Option<Value> {
        Some(json!({ "x": self.x, "y": self.y }))
    }

    fn step(&mut self, dt: f64) {
        self.x += self.vx * dt;
        self.y += self.vy * dt;
        self.ttl -= dt;
    }

    fn is_dead(&self) -> bool {
        self.ttl <= 0.0
    }
}

/// Demo world: clients may spawn drifters, steer them and hop between rooms.
/// The red room applies drag.
fn demo_world() -> World {
    let mut world = World::new();

    for name in ["red", "blue"] {
        if let Err(e) = world.create_room(name) {
            error!("Failed to create room '{}': {}", name, e);
        }
    }

    // Drifters in the red room lose speed every frame
    let drag = world.set_room_step("red", |room, dt| {
        let factor = 0.98f64.powf(dt);
        for id in room.entity_ids() {
            if let Some(drifter) = room.get_mut(id).and_then(|r| r.downcast_mut::<Drifter>()) {
                drifter.vx *= factor;
                drifter.vy *= factor;
            }
        }
    });
    if let Err(e) = drag {
        error!("Failed to install room step: {}", e);
    }

    world.set_on_connect(|world, conn| {
        let rooms = world.room_names();
        if let Err(e) = world.emit_to(conn, "welcome", json!({ "id": conn, "rooms": rooms })) {
            error!("Welcome failed: {}", e);
        }
    });

    world.on("join", |world, conn, data| {
        let Some(room) = data.as_str() else { return };
        if let Err(e) = world.join(conn, room) {
            let _ = world.emit_to(conn, "error", json!(e.to_string()));
        }
    });

    world.on("spawn", |world, conn, data| {
        let room = world.room_of(conn).unwrap_or(glue_sync::DEFAULT_ROOM).to_string();
        let drifter = Drifter {
            x: data["x"].as_f64().unwrap_or(0.0),
            y: data["y"].as_f64().unwrap_or(0.0),
            vx: 0.0,
            vy: 0.0,
            ttl: 600.0,
        };
        if let Err(e) = world.add_entity_to("drifter", drifter, &room) {
            error!("Spawn failed: {}", e);
        }
    });

    world.on("steer", |world, _, data| {
        let Some(id) = data["id"].as_u64() else { return };
        if let Some(drifter) = world.entity_as_mut::<Drifter>(id as EntityId) {
            drifter.vx = data["vx"].as_f64().unwrap_or(drifter.vx);
            drifter.vy = data["vy"].as_f64().unwrap_or(drifter.vy);
        }
    });

    world.on("chat", |world, conn, data| {
        let room = world.room_of(conn).unwrap_or(glue_sync::DEFAULT_ROOM).to_string();
        let _ = world.emit_to(room, "chat", json!({ "from": conn, "text": data }));
    });

    world
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str())),
        )
        .with_target(false)
        .init();

    info!("Glue Sync Server v{}", env!("CARGO_PKG_VERSION"));

    let config = SyncConfig::load_or_default();
    config.validate().map_err(anyhow::Error::msg)?;
    info!(
        "Configuration loaded: {}:{}, simulation {} Hz, flush {} Hz",
        config.bind_address, config.port, config.simulation_rate, config.flush_rate
    );

    let metrics = Arc::new(Metrics::new());

    if config.metrics_port != 0 {
        let metrics_clone = metrics.clone();
        let metrics_port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let scheduler = Scheduler::new(demo_world(), &config, metrics.clone());
    let server = WebTransportServer::new(config.clone(), scheduler.inbound_sender()).await?;

    info!("Server ready on https://{}", server.bind_addr());
    info!(
        "Chrome flag: --ignore-certificate-errors-spki-list={}",
        server.cert_hash()
    );

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        world = scheduler.run_until(shutdown) => {
            info!(
                "Shutting down with {} connections and {} entities",
                world.connection_count(),
                world.entity_count()
            );
        }
    }

    info!("Server stopped");
    Ok(())
}
