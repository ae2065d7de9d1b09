//! Operations served by `pipeshim serve`.
//!
//! A handful of plain utilities plus `walkTo`, which moves a simulated
//! player across a tile grid so controllers can watch progress reporting
//! and skipping work end to end.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pipeshim::{
    MethodRegistry, Operation, OperationError, OperationProvider, ParamType, RegistryError, Scalar,
    WaitOutcome, wait_until_or_skipped,
};

const START_TILE: (i64, i64) = (3222, 3218);
const WALK_TIMEOUT: Duration = Duration::from_secs(120);
const TILE_INTERVAL: Duration = Duration::from_millis(200);

/// Player position on an unbounded tile grid.
#[derive(Debug)]
struct World {
    position: Mutex<(i64, i64)>,
}

impl World {
    fn new(start: (i64, i64)) -> Self {
        Self {
            position: Mutex::new(start),
        }
    }

    fn position(&self) -> (i64, i64) {
        *self.position.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move one tile towards `target` on each axis. Returns the new position.
    fn step_towards(&self, target: (i64, i64)) -> (i64, i64) {
        let mut pos = self.position.lock().unwrap_or_else(|p| p.into_inner());
        pos.0 += direction(pos.0, target.0);
        pos.1 += direction(pos.1, target.1);
        *pos
    }
}

fn direction(from: i64, to: i64) -> i64 {
    to.cmp(&from) as i64
}

fn distance(a: (i64, i64), b: (i64, i64)) -> f64 {
    // Differences of extreme coordinates overflow i64.
    let dx = a.0 as f64 - b.0 as f64;
    let dy = a.1 as f64 - b.1 as f64;
    dx.hypot(dy)
}

pub struct DemoOperations {
    world: Arc<World>,
    tile_interval: Duration,
}

impl DemoOperations {
    pub fn new() -> Self {
        Self {
            world: Arc::new(World::new(START_TILE)),
            tile_interval: TILE_INTERVAL,
        }
    }

    /// Time the simulated player takes per tile.
    pub fn with_tile_interval(mut self, interval: Duration) -> Self {
        self.tile_interval = interval;
        self
    }

    fn register_utilities(registry: &mut MethodRegistry) -> Result<(), RegistryError> {
        registry.register(
            Operation::new("echo", &[ParamType::Str], |_, args| {
                Ok(Scalar::from(args.str(0)?))
            })
            .with_description("return the argument"),
        )?;

        registry.register(
            Operation::new("add", &[ParamType::Int, ParamType::Int], |_, args| {
                args.int(0)?
                    .checked_add(args.int(1)?)
                    .map(Scalar::Int)
                    .ok_or_else(|| OperationError::failed("integer overflow"))
            })
            .with_description("integer sum"),
        )?;

        registry.register(
            Operation::new("helloWorld", &[], |_, _| {
                Ok(Scalar::from("Hello World from pipeshim!"))
            })
            .with_description("connectivity check"),
        )?;

        registry.register(
            Operation::new("greet", &[ParamType::Str], |_, args| {
                Ok(Scalar::from(format!("Hello, {}!", args.str(0)?)))
            })
            .with_description("greet someone by name"),
        )?;

        registry.register(
            Operation::new(
                "calculate",
                &[ParamType::Float, ParamType::Float, ParamType::Str],
                |_, args| {
                    let (a, b) = (args.float(0)?, args.float(1)?);
                    let result = match args.str(2)?.to_ascii_lowercase().as_str() {
                        "add" => a + b,
                        "subtract" => a - b,
                        "multiply" => a * b,
                        "divide" if b == 0.0 => {
                            return Err(OperationError::failed("division by zero"));
                        }
                        "divide" => a / b,
                        other => {
                            return Err(OperationError::failed(format!(
                                "unknown operation: {}",
                                other
                            )));
                        }
                    };
                    tracing::info!(a, b, result, "Calculated");
                    Ok(Scalar::Float(result))
                },
            )
            .with_description("add, subtract, multiply or divide two numbers"),
        )?;

        registry.register(
            Operation::new(
                "processData",
                &[ParamType::Str, ParamType::Int, ParamType::Bool],
                |_, args| {
                    let (file, max_lines, verbose) = (args.str(0)?, args.int(1)?, args.bool(2)?);
                    tracing::info!(file, max_lines, verbose, "Processing data");
                    if verbose {
                        tracing::info!(file, "Reading up to {} lines", max_lines);
                    }
                    Ok(Scalar::from(format!("Processed {} successfully", file)))
                },
            )
            .with_description("mixed argument types"),
        )?;

        registry.register(
            Operation::new(
                "logMessage",
                &[ParamType::Str, ParamType::Str],
                |ctx, args| {
                    let (level, message) = (args.str(0)?, args.str(1)?);
                    match level.to_ascii_lowercase().as_str() {
                        "error" => tracing::error!(method = ctx.method(), "{}", message),
                        "warn" | "warning" => tracing::warn!(method = ctx.method(), "{}", message),
                        "debug" => tracing::debug!(method = ctx.method(), "{}", message),
                        _ => tracing::info!(method = ctx.method(), "{}", message),
                    }
                    Ok(Scalar::from(format!("Logged message at level {}", level)))
                },
            )
            .with_description("write to the bridge log"),
        )
    }

    fn register_movement(&self, registry: &mut MethodRegistry) -> Result<(), RegistryError> {
        let world = Arc::clone(&self.world);
        registry.register(
            Operation::new("getPosition", &[], move |_, _| {
                let (x, y) = world.position();
                Ok(Scalar::from(format!("({}, {})", x, y)))
            })
            .with_description("current tile"),
        )?;

        let world = Arc::clone(&self.world);
        let tile_interval = self.tile_interval;
        registry.register(
            Operation::new("walkTo", &[ParamType::Int, ParamType::Int], move |ctx, args| {
                let target = (args.int(0)?, args.int(1)?);
                let label = format!("Walking to ({}, {})", target.0, target.1);

                if world.position() == target {
                    return Ok(Scalar::from(format!("{} - Already at destination", label)));
                }

                ctx.status().set_current_step(&label);
                let mut attempts = 0u32;
                let outcome = wait_until_or_skipped(
                    || {
                        attempts += 1;
                        let pos = world.step_towards(target);
                        ctx.status().set_current_step(format!(
                            "{} - {:.1} tiles away",
                            label,
                            distance(pos, target)
                        ));
                        pos == target
                    },
                    WALK_TIMEOUT,
                    tile_interval,
                    ctx.skip(),
                );
                ctx.status().reset_current_step();

                tracing::info!(x = target.0, y = target.1, %outcome, attempts, "Walk finished");
                Ok(Scalar::from(match outcome {
                    WaitOutcome::Succeeded => {
                        format!("{} - SUCCESS (arrived after {} attempts)", label, attempts)
                    }
                    other => format!("{} - {}", label, other),
                }))
            })
            .with_description("walk the simulated player to a tile, honouring skip"),
        )
    }
}

impl Default for DemoOperations {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationProvider for DemoOperations {
    fn register(&self, registry: &mut MethodRegistry) -> Result<(), RegistryError> {
        Self::register_utilities(registry)?;
        self.register_movement(registry)
    }
}
