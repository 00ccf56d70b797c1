use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use sttbridge::{
    ExitReason, OutputSource, SupervisorConfig, SupervisorError, Termination, WorkerEvent,
    WorkerSupervisor,
};
use tokio::time::{Instant, sleep_until};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Delay between stopping transcription and terminating the worker.
const STOP_TO_TERMINATE: Duration = Duration::from_secs(2);

struct Args {
    worker: PathBuf,
    python: Option<PathBuf>,
    device: Option<i64>,
    model: String,
    duration: Duration,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!(
                "Usage: sttbridge <worker> [--python <cmd>] [--device <n>] [--model <name>] [--duration <secs>]"
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <worker>            Worker script (.py) or executable (.exe, .app)");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --python <cmd>      Interpreter for scripts [default: python]");
            eprintln!("  --device <n>        Input device index [default: first input device]");
            eprintln!("  --model <name>      Model name [default: tiny]");
            eprintln!("  --duration <secs>   Stop transcription after this long [default: 30]");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut worker: Option<PathBuf> = None;
    let mut python = None;
    let mut device = None;
    let mut model = "tiny".to_string();
    let mut duration = Duration::from_secs(30);

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--python" => {
                i += 1;
                python = Some(PathBuf::from(args.get(i).ok_or("--python requires a value")?));
            }
            "--device" => {
                i += 1;
                let raw = args.get(i).ok_or("--device requires a value")?;
                device = Some(
                    raw.parse::<i64>()
                        .map_err(|_| format!("invalid device index '{raw}'"))?,
                );
            }
            "--model" => {
                i += 1;
                model = args.get(i).ok_or("--model requires a value")?.clone();
            }
            "--duration" => {
                i += 1;
                let raw = args.get(i).ok_or("--duration requires a value")?;
                let secs = raw
                    .parse::<u64>()
                    .map_err(|_| format!("invalid duration '{raw}'"))?;
                duration = Duration::from_secs(secs);
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if worker.is_some() {
                    return Err(format!("unexpected argument: {arg}"));
                }
                worker = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let worker = worker.ok_or("missing required argument: <worker>")?;
    Ok(Args {
        worker,
        python,
        device,
        model,
        duration,
    })
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("STTBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        let filter_str = format!(
            "sttbridge={level},sttbridge_cli={level},sttbridge::worker=warn",
            level = base_level
        );

        EnvFilter::new(filter_str)
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

async fn run(args: Args) -> anyhow::Result<i32> {
    let mut config = SupervisorConfig::new(&args.worker);
    if let Some(python) = &args.python {
        config = config.with_interpreter(python);
    }
    let (mut supervisor, mut events) = WorkerSupervisor::new(config);

    println!("Starting transcriber worker {}...", args.worker.display());
    supervisor
        .start()
        .with_context(|| format!("could not start {}", args.worker.display()))?;

    let stop_at = Instant::now() + args.duration;
    let mut stop_sent = false;
    let mut terminate_at: Option<Instant> = None;
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = event.context("event channel closed")?;
                if let Some(termination) = handle_event(&supervisor, &args, event) {
                    return Ok(exit_code(&termination));
                }
            }
            _ = sleep_until(stop_at), if !stop_sent => {
                stop_sent = true;
                println!();
                println!(
                    "Demo time limit reached ({}s), stopping transcription",
                    args.duration.as_secs()
                );
                report(supervisor.stop_transcription());
                terminate_at = Some(Instant::now() + STOP_TO_TERMINATE);
            }
            _ = sleep_until(terminate_at.unwrap_or(stop_at)), if terminate_at.is_some() => {
                terminate_at = None;
                supervisor.terminate();
            }
            result = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
                    continue;
                }
                println!();
                println!("Shutting down...");
                supervisor.terminate();
            }
        }
    }
}

/// React to one worker event. Returns the termination once the worker is gone.
fn handle_event(
    supervisor: &WorkerSupervisor,
    args: &Args,
    event: WorkerEvent,
) -> Option<Termination> {
    match event {
        WorkerEvent::Ready(payload) => {
            println!("Ready: {}", payload.message().unwrap_or_default());
            println!("Listing audio devices...");
            report(supervisor.list_devices());
        }
        WorkerEvent::Devices(payload) => {
            let devices = match payload.devices() {
                Ok(list) => list.devices,
                Err(e) => {
                    tracing::error!(error = %e, "Malformed device list");
                    supervisor.terminate();
                    return None;
                }
            };
            println!("Available input devices:");
            let inputs: Vec<_> = devices.iter().filter(|d| d.is_input_capable()).collect();
            for device in &inputs {
                println!(
                    "  [{}] {} ({} channels, {}Hz)",
                    device.index,
                    device.name.as_deref().unwrap_or("<unnamed>"),
                    device.channels,
                    device.sample_rate
                );
            }

            match args.device.or_else(|| inputs.first().map(|d| d.index)) {
                Some(index) => {
                    println!("Initializing with device {index} and model {}...", args.model);
                    report(supervisor.initialize(index, args.model.clone()));
                }
                None => {
                    eprintln!("No input-capable audio device found");
                    supervisor.terminate();
                }
            }
        }
        WorkerEvent::Initialized(payload) => {
            println!("Initialized: {}", payload.data);
            println!("Starting transcription...");
            report(supervisor.start_transcription());
        }
        WorkerEvent::Started(payload) => {
            println!("{}", payload.message().unwrap_or("Transcription started"));
            println!("Listening for speech... (press Ctrl+C to stop)");
        }
        WorkerEvent::SpeechDetected(payload) => {
            println!("{}", payload.message().unwrap_or("Speech detected"));
        }
        WorkerEvent::Transcription(payload) => match payload.transcription() {
            Ok(t) if t.is_partial => println!("... {}", t.text),
            Ok(t) => println!("Transcription: {}", t.text),
            Err(e) => tracing::warn!(error = %e, "Malformed transcription"),
        },
        WorkerEvent::Stopped(payload) => {
            println!("{}", payload.message().unwrap_or("Transcription stopped"));
        }
        WorkerEvent::Status(payload) => {
            println!("status: {}", payload.message().unwrap_or_default());
        }
        WorkerEvent::Error(payload) => {
            eprintln!("worker error: {}", payload.message().unwrap_or_default());
        }
        WorkerEvent::Warning(payload) => {
            eprintln!("worker warning: {}", payload.message().unwrap_or_default());
        }
        WorkerEvent::Diagnostic {
            source: OutputSource::Stderr,
            line,
        } => eprintln!("[worker] {line}"),
        WorkerEvent::Diagnostic { .. } | WorkerEvent::Unknown { .. } => {}
        WorkerEvent::Closed(termination) => {
            println!("Worker closed: {}", termination.reason);
            return Some(termination);
        }
    }
    None
}

fn report(result: Result<(), SupervisorError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Command not sent");
    }
}

fn exit_code(termination: &Termination) -> i32 {
    match termination.reason {
        ExitReason::Exited(code) => code,
        ExitReason::Signaled(signal) => 128 + signal,
        ExitReason::SpawnFailed(_) | ExitReason::WaitFailed(_) => 1,
    }
}
