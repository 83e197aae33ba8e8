//! Performance benchmarks for critical movement systems

use bincode::{deserialize, serialize};
use shared::{
    EntityHandle, InsertionPoints, Location, ManualClock, Motion, MovementComposer,
    MovementUpdate, Packet, PathPlanner, PathPlanningContext, Point, Position, WalkabilityGrid,
};
use std::sync::Arc;
use std::time::Instant;

/// 128x96 map with a wall every 16 columns, each with a gap
fn maze_context() -> PathPlanningContext {
    let mut grid = WalkabilityGrid::bordered(128, 96);
    for x in (16..128).step_by(16) {
        let gap = if (x / 16) % 2 == 0 { 8 } else { 86 };
        for y in 1..95 {
            if y != gap && y != gap + 1 {
                grid.set(x, y, false);
            }
        }
    }
    PathPlanningContext::new(grid, 16, 1).unwrap()
}

struct Walker {
    key: String,
}

impl EntityHandle for Walker {
    fn is_master(&self) -> bool {
        false
    }

    fn send_message(&self, _update: MovementUpdate) {}

    fn location(&self) -> Option<Location> {
        Some(Location::World(0))
    }

    fn primary_key(&self) -> String {
        self.key.clone()
    }

    fn sync_id(&self) -> u8 {
        0
    }
}

struct NoInsertion;

impl InsertionPoints for NoInsertion {
    fn insertion_point(&self, _location: &Location) -> Option<Point> {
        None
    }
}

/// Benchmarks route planning across the maze
#[test]
fn benchmark_path_planning() {
    let context = maze_context();
    let iterations = 20;
    let start = Instant::now();

    for i in 0..iterations {
        let from = Point::new(32, 32 + (i % 10) * 16);
        let to = Point::new(1980, 1400);
        let path = context.find_path(from, to, false).unwrap();
        assert!(path.len() >= 2);
    }

    let duration = start.elapsed();
    println!(
        "Path planning: {} routes in {:?} ({:.2} ms/route)",
        iterations,
        duration,
        duration.as_secs_f64() * 1000.0 / iterations as f64
    );

    // Generous bound for unoptimized builds
    assert!(duration.as_millis() < 10_000);
}

/// Benchmarks smoothing on a long open diagonal
#[test]
fn benchmark_path_smoothing() {
    let context = PathPlanningContext::new(WalkabilityGrid::open(200, 200), 8, 1).unwrap();
    let route = context
        .search(Point::new(0, 0), Point::new(199, 150))
        .unwrap();

    let iterations = 20;
    let start = Instant::now();

    for _ in 0..iterations {
        let smoothed = context.smooth(route.clone());
        assert_eq!(smoothed.len(), 2);
    }

    let duration = start.elapsed();
    println!(
        "Path smoothing: {} x {} tiles in {:?}",
        iterations,
        route.len(),
        duration
    );

    assert!(duration.as_millis() < 5_000);
}

/// Benchmarks ticking many walking replicas
#[test]
fn benchmark_composer_ticks() {
    let planner = PathPlanner::configured(maze_context());
    let clock = Arc::new(ManualClock::new(1_000));

    let mut composers: Vec<MovementComposer> = (0..200)
        .map(|i| {
            let mut composer = MovementComposer::new(
                Arc::new(Walker {
                    key: format!("npc#{}", i),
                }),
                Arc::new(NoInsertion),
                planner.clone(),
                Position::new(32.0, 32.0 + (i % 80) as f32 * 16.0),
                0.0,
            )
            .with_clock(clock.clone());
            composer.move_to(Point::new(240, 1400));
            composer
        })
        .collect();

    assert!(composers.iter().all(|composer| composer.is_moving()));

    let ticks = 500;
    let start = Instant::now();

    for _ in 0..ticks {
        clock.advance(33);
        for composer in &mut composers {
            composer.tick();
        }
    }

    let duration = start.elapsed();
    println!(
        "Composer ticks: {} replicas x {} ticks in {:?} ({:.2} ns/tick)",
        composers.len(),
        ticks,
        duration,
        duration.as_nanos() as f64 / (composers.len() * ticks) as f64
    );

    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks movement update serialization
#[test]
fn benchmark_packet_serialization() {
    let packet = Packet::EntityUpdate {
        primary_key: "player#12".to_string(),
        update: MovementUpdate {
            primary_key: None,
            sync_id: 4,
            source: Point::new(512, 300),
            orientation: 1.25,
            motion: Motion::Moving {
                destination: Point::new(900, 640),
                delta_ms: 180,
            },
        },
    };

    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let data = serialize(&packet).unwrap();
        let _: Packet = deserialize(&data).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Update serialization: {} round trips in {:?}",
        iterations, duration
    );

    assert!(duration.as_millis() < 2_000);
}

/// Benchmarks serializing the whole map for a joining client
#[test]
fn benchmark_world_info_size() {
    let context = maze_context();
    let packet = Packet::WorldInfo {
        tile_size: context.tile_size(),
        footprint: context.footprint(),
        rows: context.grid().to_rows(),
    };

    let start = Instant::now();
    let data = serialize(&packet).unwrap();
    let duration = start.elapsed();

    println!("World info: {} bytes in {:?}", data.len(), duration);

    // Must fit a single datagram
    assert!(data.len() <= shared::MAX_PACKET_SIZE);
}
