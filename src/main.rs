/*************** Program Entry Point *******************/

// wires the hardware link, sequencer and event plumbing, then drops into an
// interactive command loop on stdin

mod config;
mod data;
mod events;
mod hardware;
mod sequencer;
mod vna;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::data::{CsvSink, SharedSink};
use crate::events::AppEvent;
use crate::hardware::connection::spawn_drain;
use crate::hardware::mock::MockTransport;
use crate::hardware::{shared_transport, Command, ConnectionManager, Dispatcher};
use crate::sequencer::{RunControl, RunOutcome, Sequencer};
use crate::vna::{KeypressTrigger, SweepTrigger};

#[derive(Parser)]
#[command(name = "tiltbed", about = "Tilt platform measurement rig controller")]
struct Args {
    /// Serial device path; probed automatically when omitted.
    #[arg(long)]
    port: Option<String>,
    /// Override the configured baud rate.
    #[arg(long)]
    baud: Option<u32>,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Run against a simulated rig instead of real hardware.
    #[arg(long)]
    mock: bool,
}

const HELP: &str = "\
commands:
  TEST          start a test run with the configured parameters
  PAUSE         pause the active run
  RESUME        resume a paused run
  STOP          stop the active run (or send STOP to the firmware)
  ESTOP         emergency stop
  STATUS        request a status frame
  TEMP          read temperature
  TILT          read tilt angle
  MOVE <steps>  move the platform by a signed step count
  HOME          run the homing sequence
  CALIBRATE     calibrate the tilt sensor
  HELP          show this list
  EXIT          quit";

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = Config::load_or_create(&args.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let transport = shared_transport();
    let control = Arc::new(Mutex::new(RunControl::new()));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&transport), control));
    let (events_tx, mut events_rx) = events::channel();

    let baudrate = args.baud.unwrap_or(config.hardware.baudrate);
    let timeout = Duration::from_secs_f64(config.hardware.timeout_secs);
    let manager = Arc::new(ConnectionManager::new(
        Arc::clone(&transport),
        events_tx.clone(),
        baudrate,
        timeout,
    ));

    if args.mock {
        let (mock, _) = MockTransport::simulated();
        manager.attach(Box::new(mock));
        info!("running against simulated hardware");
    } else {
        let port = args.port.as_deref().or(config.hardware.port.as_deref());
        if let Err(e) = manager.connect(port) {
            error!("hardware unavailable: {}", e);
            return ExitCode::from(1);
        }
    }

    manager.spawn_poll(
        Arc::clone(&dispatcher),
        Duration::from_secs(config.hardware.poll_interval_secs),
    );
    spawn_drain(Arc::clone(&transport));

    let sink: SharedSink = Arc::new(Mutex::new(CsvSink::new(config.test.export_dir.clone())));
    let trigger: Arc<dyn SweepTrigger> =
        Arc::new(KeypressTrigger::new(config.vna.trigger_key.clone()));
    let sequencer = Sequencer::new(
        Arc::clone(&dispatcher),
        trigger,
        sink,
        events_tx.clone(),
        manager.state_handle(),
    );

    // Event printer: everything the workers report lands here.
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                AppEvent::Connection(state) => info!("connection: {:?}", state),
                AppEvent::RunState(state) => info!("run state: {:?}", state),
                AppEvent::Progress { percent, point, total } => {
                    println!("progress: {}% ({}/{})", percent, point, total);
                }
                AppEvent::Measurement(m) => {
                    println!(
                        "measured: target {:+.2} deg, tilt {:+.2} deg, {:.2} C",
                        m.target_deg, m.measured_deg, m.temperature_c
                    );
                }
                AppEvent::RunFinished(summary) => match summary.outcome {
                    RunOutcome::Completed => println!(
                        "run {} completed: {} points in {:.0}s",
                        summary.run_id, summary.points_recorded, summary.elapsed_secs
                    ),
                    RunOutcome::Stopped => println!(
                        "run {} stopped at {}% ({} points)",
                        summary.run_id, summary.completion_percentage, summary.points_recorded
                    ),
                    RunOutcome::Failed => println!(
                        "run {} FAILED: {}",
                        summary.run_id,
                        summary.error.as_deref().unwrap_or("unknown error")
                    ),
                },
            }
        }
    });

    println!("tiltbed ready - type HELP for commands");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !handle_command(&line, &sequencer, &dispatcher, &config).await {
            break;
        }
    }

    if sequencer.is_running() {
        sequencer.stop();
    }
    manager.disconnect();
    ExitCode::SUCCESS
}

/// One operator command; returns false when the loop should exit.
async fn handle_command(
    line: &str,
    sequencer: &Sequencer,
    dispatcher: &Dispatcher,
    config: &Config,
) -> bool {
    let mut parts = line.trim().split_whitespace();
    let Some(word) = parts.next() else {
        return true;
    };

    match word.to_uppercase().as_str() {
        "TEST" => match sequencer.start(&config.test) {
            Ok(()) => println!("test run started"),
            Err(e) => println!("cannot start test: {}", e),
        },
        "PAUSE" => {
            if !sequencer.pause() {
                println!("nothing to pause");
            }
        }
        "RESUME" => {
            if !sequencer.resume() {
                println!("nothing to resume");
            }
        }
        "STOP" => {
            if !sequencer.stop() {
                // No run to stop; forward to the firmware instead.
                report(dispatcher.send(Command::Stop).await);
            }
        }
        "ESTOP" | "EMERGENCY_STOP" => {
            let delivered = sequencer.emergency_stop().await;
            println!(
                "emergency stop {}",
                if delivered { "issued" } else { "NOT confirmed by hardware" }
            );
        }
        "STATUS" => report(dispatcher.send(Command::Status).await),
        "TEMP" => report(dispatcher.send(Command::Temp).await),
        "TILT" => report(dispatcher.send(Command::Tilt).await),
        "HOME" => report(dispatcher.send(Command::Home).await),
        "CALIBRATE" => report(dispatcher.send(Command::Calibrate).await),
        "MOVE" => match parts.next().map(str::parse::<i32>) {
            Some(Ok(steps)) => report(dispatcher.send(Command::Move(steps)).await),
            _ => println!("usage: MOVE <steps>"),
        },
        "HELP" => println!("{}", HELP),
        "EXIT" | "QUIT" => return false,
        other => println!("unknown command {:?} - type HELP", other),
    }
    true
}

fn report(result: Result<hardware::Response, hardware::DispatchError>) {
    match result {
        Ok(hardware::Response::Status(record)) => println!(
            "position {} steps, angle {:+.3} deg, speed {:.1}, accel {:.1}, homed {}, e-stop {}",
            record.position,
            record.angle,
            record.speed,
            record.acceleration,
            record.homed,
            record.emergency_stop
        ),
        Ok(hardware::Response::Text(text)) => println!("{}", text),
        Err(e) => println!("error: {}", e),
    }
}
