/**
 * Test run worker.
 *
 * One spawned task owns the whole sweep: home, then per point
 * move -> settle -> trigger VNA -> read sensors -> record, honoring pause
 * and stop at the top of every iteration. The worker never calls back into
 * operator-owned state; everything it reports goes out on the event channel.
 *
 * Pause and stop are cooperative. A stop always lets an in-flight move
 * finish, and cleanup makes one best-effort attempt to return the platform
 * to zero. The run-id guard makes a superseded loop (new run started, or an
 * emergency stop) exit silently instead of racing the replacement.
 */

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::types::{
    Measurement, RunControl, RunOutcome, RunState, RunSummary, TestKind, TestParameters,
};
use crate::data::SharedSink;
use crate::events::{emit, AppEvent, EventSender};
use crate::hardware::dispatcher::SendOptions;
use crate::hardware::protocol::degrees_to_steps;
use crate::hardware::{Command, DispatchError, Dispatcher, Response};
use crate::vna::SweepTrigger;

/// How long a paused run waits between re-checks of the control state.
const PAUSE_POLL: Duration = Duration::from_millis(100);

pub(crate) struct RunContext {
    pub run_id: u64,
    pub params: TestParameters,
    pub control: Arc<Mutex<RunControl>>,
    pub dispatcher: Arc<Dispatcher>,
    pub trigger: Arc<dyn SweepTrigger>,
    pub sink: SharedSink,
    pub events: EventSender,
}

/// How a sweep ended, before outcome mapping.
enum SweepEnd {
    Completed,
    Stopped,
    /// The control state no longer belongs to this loop; exit silently.
    Superseded,
    Failed(String),
}

enum Checkpoint {
    Proceed,
    StopRequested,
    Superseded,
}

pub(crate) async fn run_loop(ctx: RunContext) {
    let started = Instant::now();
    let total_points = ctx.params.points_per_loop() * ctx.params.loops;
    let mut progress_points = 0u32;
    let mut extra_points = 0u32;
    let mut steps_from_zero: i64 = 0;

    let end = run_sweep(
        &ctx,
        total_points,
        &mut progress_points,
        &mut extra_points,
        &mut steps_from_zero,
    )
    .await;

    let outcome = match end {
        SweepEnd::Completed => RunOutcome::Completed,
        SweepEnd::Stopped => RunOutcome::Stopped,
        SweepEnd::Superseded => {
            debug!("run {} superseded; exiting", ctx.run_id);
            return;
        }
        SweepEnd::Failed(ref reason) => {
            error!("test run {} failed: {}", ctx.run_id, reason);
            RunOutcome::Failed
        }
    };

    if outcome == RunOutcome::Stopped {
        return_to_zero(&ctx, steps_from_zero).await;
    }

    if !ctx.control.lock().unwrap().finish(ctx.run_id) {
        // A newer run owns the state now; report nothing.
        return;
    }
    emit(&ctx.events, AppEvent::RunState(RunState::Idle));

    let recorded = progress_points + extra_points;
    let summary = RunSummary {
        run_id: ctx.run_id,
        outcome,
        points_recorded: recorded,
        total_points,
        completion_percentage: percentage(progress_points, total_points),
        elapsed_secs: started.elapsed().as_secs_f64(),
        error: match end {
            SweepEnd::Failed(reason) => Some(reason),
            _ => None,
        },
    };
    match outcome {
        RunOutcome::Completed => info!("test run {} completed: {} points", ctx.run_id, recorded),
        RunOutcome::Stopped => info!("test run {} stopped at {} points", ctx.run_id, recorded),
        RunOutcome::Failed => {}
    }
    emit(&ctx.events, AppEvent::RunFinished(summary));
}

async fn run_sweep(
    ctx: &RunContext,
    total_points: u32,
    progress_points: &mut u32,
    extra_points: &mut u32,
    steps_from_zero: &mut i64,
) -> SweepEnd {
    if let Err(e) = ctx.sink.lock().unwrap().begin_run(ctx.run_id) {
        return SweepEnd::Failed(format!("could not open data sink: {}", e));
    }

    info!("homing platform");
    match ctx.dispatcher.send(Command::Home).await {
        Ok(_) => {}
        Err(DispatchError::TestNotRunning) => return SweepEnd::Superseded,
        Err(e) => return SweepEnd::Failed(format!("homing failed: {}", e)),
    }
    *steps_from_zero = 0;

    if !ctx.control.lock().unwrap().enter_sweep(ctx.run_id) {
        return SweepEnd::Superseded;
    }
    emit(&ctx.events, AppEvent::RunState(RunState::Sweeping));

    // Fill tests measure once at the home position before the first move;
    // that point rides outside the progress count.
    if ctx.params.kind == TestKind::Fill {
        info!("taking first measurement at home position");
        match measure_point(ctx, 0.0).await {
            Ok(measurement) => {
                if let Err(e) = record(ctx, measurement) {
                    return SweepEnd::Failed(e);
                }
                *extra_points += 1;
            }
            Err(end) => return end,
        }
    }

    let angles = ctx.params.angles();
    for loop_index in 0..ctx.params.loops {
        if ctx.params.loops > 1 {
            info!("starting loop {} of {}", loop_index + 1, ctx.params.loops);
        }
        for &target in &angles {
            match checkpoint(ctx).await {
                Checkpoint::Proceed => {}
                Checkpoint::StopRequested => return SweepEnd::Stopped,
                Checkpoint::Superseded => return SweepEnd::Superseded,
            }

            // Tilt mode chases absolute targets; fill mode just advances a
            // fixed raw step count per point.
            let delta = match ctx.params.kind {
                TestKind::Tilt => degrees_to_steps(target) as i64 - *steps_from_zero,
                TestKind::Fill => ctx.params.step_increment as i64,
            };
            if delta != 0 {
                debug!("moving {} steps toward {:.2} deg", delta, target);
                match ctx.dispatcher.send(Command::Move(delta as i32)).await {
                    Ok(_) => {}
                    Err(DispatchError::TestNotRunning) => return SweepEnd::Superseded,
                    Err(e) => return SweepEnd::Failed(format!("move failed: {}", e)),
                }
                *steps_from_zero += delta;
            }

            // A post-move status probe catches a hardware-side emergency
            // stop before any measurement is taken for this point.
            match ctx.dispatcher.send(Command::Status).await {
                Ok(Response::Status(record)) if record.emergency_stop => {
                    return SweepEnd::Failed("hardware emergency stop engaged".into());
                }
                Ok(_) => {}
                Err(DispatchError::TestNotRunning) => return SweepEnd::Superseded,
                Err(e) => return SweepEnd::Failed(format!("status check failed: {}", e)),
            }

            match measure_point(ctx, target).await {
                Ok(measurement) => {
                    if let Err(e) = record(ctx, measurement) {
                        return SweepEnd::Failed(e);
                    }
                    *progress_points += 1;
                    emit(
                        &ctx.events,
                        AppEvent::Progress {
                            percent: percentage(*progress_points, total_points),
                            point: *progress_points,
                            total: total_points,
                        },
                    );
                }
                Err(end) => return end,
            }

            if ctx.params.drain_delay_secs > 0.0 {
                debug!("drain delay {}s", ctx.params.drain_delay_secs);
                sleep(Duration::from_secs_f64(ctx.params.drain_delay_secs)).await;
            }
        }
    }

    SweepEnd::Completed
}

/// Settle, trigger the VNA, wait out its sweep, then read both sensors.
async fn measure_point(ctx: &RunContext, target: f64) -> Result<Measurement, SweepEnd> {
    debug!("settling {}s", ctx.params.dwell_secs);
    sleep(Duration::from_secs_f64(ctx.params.dwell_secs)).await;

    ctx.trigger.trigger();
    sleep(Duration::from_secs_f64(ctx.params.vna_dwell_secs)).await;

    let temperature_c = read_sensor(ctx, Command::Temp).await?;
    let measured_deg = read_sensor(ctx, Command::Tilt).await?;

    Ok(Measurement {
        timestamp: Local::now(),
        target_deg: target,
        measured_deg,
        temperature_c,
    })
}

async fn read_sensor(ctx: &RunContext, command: Command) -> Result<f64, SweepEnd> {
    let response = match ctx.dispatcher.send(command).await {
        Ok(r) => r,
        Err(DispatchError::TestNotRunning) => return Err(SweepEnd::Superseded),
        Err(e) => return Err(SweepEnd::Failed(format!("{} failed: {}", command.verb(), e))),
    };
    let line = response.into_text();
    crate::hardware::protocol::trailing_float(&line)
        .map_err(|e| SweepEnd::Failed(format!("{} response unreadable: {}", command.verb(), e)))
}

fn record(ctx: &RunContext, measurement: Measurement) -> Result<(), String> {
    if let Err(e) = ctx.sink.lock().unwrap().append(&measurement) {
        return Err(format!("error logging data: {}", e));
    }
    emit(&ctx.events, AppEvent::Measurement(measurement));
    Ok(())
}

/// Pause/stop/identity checkpoint at the top of every iteration. While
/// paused, re-check every 100 ms so resume latency stays bounded without
/// busy-spinning.
async fn checkpoint(ctx: &RunContext) -> Checkpoint {
    loop {
        let (run_id, state) = ctx.control.lock().unwrap().snapshot();
        if run_id != ctx.run_id {
            return Checkpoint::Superseded;
        }
        match state {
            RunState::Paused => sleep(PAUSE_POLL).await,
            RunState::Stopping => return Checkpoint::StopRequested,
            RunState::Idle => return Checkpoint::Superseded,
            RunState::Homing | RunState::Sweeping => return Checkpoint::Proceed,
        }
    }
}

/// Best-effort cleanup after a stop: one move back to the zero position.
/// Deliberately unguarded — its result is ignored so a cleanup failure can
/// never mask the run's own outcome.
async fn return_to_zero(ctx: &RunContext, steps_from_zero: i64) {
    if steps_from_zero == 0 {
        return;
    }
    info!("returning platform to zero ({} steps)", -steps_from_zero);
    if let Err(e) = ctx
        .dispatcher
        .send_unchecked(Command::Move(-steps_from_zero as i32), SendOptions::best_effort())
        .await
    {
        warn!("return to zero failed: {}", e);
    }
}

fn percentage(done: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done as f64 / total as f64) * 100.0).round() as u8
}
