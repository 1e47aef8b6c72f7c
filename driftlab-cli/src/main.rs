//! `driftlab`: run one overnight session from the terminal.
//!
//! Live output goes to stdout as JSON lines of the form
//! `{"channel": "...", "data": {...}}`. Logs go to stderr.
//!
//! Stdin accepts one command per line: `interact`, `stop`, or a sensor
//! reading as JSON (`{"sensor":"accelerometer","x":0.1,"y":0.0,"z":1.0}`).

mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use driftlab_core::{
    MeteringSource, ReplayHandle, ReplaySource, SensorInput, SessionReport, SleepEngine,
    EngineConfig,
};
use serde::Serialize;
use settings::{default_settings_path, load_settings, normalize_sensitivity, AppSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

const USAGE: &str = "\
usage: driftlab [options]

sources (default: microphone)
  --replay FILE       metering dB values, one per line
  --wav FILE          16-bit or float WAV, metered at the session rate
  --pace-ms N         sleep N ms between replayed values (default: as fast as possible)
  --device NAME       preferred microphone
  --list-devices      print input devices and exit

session
  --session ID        session id (default: night-<timestamp>)
  --sensitivity S     low | medium | high
  --thermostat F      thermostat setting in Fahrenheit
  --no-sonar          disable movement classification
  --no-fade           disable smart fade
  --levels            also stream the 10 Hz level feed

recording (microphone only)
  --record-dir DIR    parent folder for per-session WAV segments
  --no-record         meter only, keep no audio

files
  --settings FILE     settings file (default: app data dir)
  --report FILE       also write the final report here
  --save-settings     persist the effective settings and exit
";

#[derive(Debug, Default)]
struct CliArgs {
    replay: Option<PathBuf>,
    wav: Option<PathBuf>,
    pace_ms: Option<u64>,
    device: Option<String>,
    list_devices: bool,
    session_id: Option<String>,
    sensitivity: Option<String>,
    thermostat_f: Option<f32>,
    no_sonar: bool,
    no_fade: bool,
    levels: bool,
    record_dir: Option<PathBuf>,
    no_record: bool,
    settings_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    save_settings: bool,
    help: bool,
}

fn parse_args<I>(args: I) -> anyhow::Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut out = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .with_context(|| format!("{flag} needs a value"))
        };
        match arg.as_str() {
            "--replay" => out.replay = Some(value("--replay")?.into()),
            "--wav" => out.wav = Some(value("--wav")?.into()),
            "--pace-ms" => {
                let raw = value("--pace-ms")?;
                out.pace_ms = Some(raw.parse().with_context(|| format!("bad --pace-ms {raw:?}"))?);
            }
            "--device" => out.device = Some(value("--device")?),
            "--list-devices" => out.list_devices = true,
            "--session" => out.session_id = Some(value("--session")?),
            "--sensitivity" => out.sensitivity = Some(value("--sensitivity")?),
            "--thermostat" => {
                let raw = value("--thermostat")?;
                out.thermostat_f =
                    Some(raw.parse().with_context(|| format!("bad --thermostat {raw:?}"))?);
            }
            "--no-sonar" => out.no_sonar = true,
            "--no-fade" => out.no_fade = true,
            "--levels" => out.levels = true,
            "--record-dir" => out.record_dir = Some(value("--record-dir")?.into()),
            "--no-record" => out.no_record = true,
            "--settings" => out.settings_path = Some(value("--settings")?.into()),
            "--report" => out.report_path = Some(value("--report")?.into()),
            "--save-settings" => out.save_settings = true,
            "-h" | "--help" => out.help = true,
            other => bail!("unknown argument {other:?}\n\n{USAGE}"),
        }
    }
    if out.replay.is_some() && out.wav.is_some() {
        bail!("--replay and --wav are mutually exclusive");
    }
    Ok(out)
}

impl CliArgs {
    /// Flags override whatever the settings file and environment produced.
    fn apply_to(&self, settings: &mut AppSettings) {
        if let Some(s) = &self.sensitivity {
            settings.sensitivity = normalize_sensitivity(s);
        }
        if let Some(t) = self.thermostat_f {
            settings.thermostat_f = Some(t);
        }
        if let Some(d) = &self.device {
            settings.preferred_input_device = Some(d.clone());
        }
        if self.no_sonar {
            settings.sonar_enabled = false;
        }
        if self.no_fade {
            settings.smart_fade_enabled = false;
        }
        if self.levels {
            settings.emit_levels = true;
        }
        if let Some(dir) = &self.record_dir {
            settings.recording_dir = Some(dir.clone());
        }
        if self.no_record {
            settings.record_audio = false;
        }
        settings.normalize();
    }
}

#[derive(Serialize)]
struct OutputLine<'a, T> {
    channel: &'a str,
    data: &'a T,
}

fn print_line<T: Serialize>(channel: &str, data: &T) {
    match serde_json::to_string(&OutputLine { channel, data }) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!("serialize {channel}: {e}"),
    }
}

/// Print every message from `rx` until the engine drops the sender.
fn forward<T>(channel: &'static str, mut rx: broadcast::Receiver<T>) -> tokio::task::JoinHandle<()>
where
    T: Serialize + Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => print_line(channel, &message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("{channel} receiver lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

enum StdinCommand {
    Interact,
    Sensor(SensorInput),
    Stop,
}

fn parse_stdin_line(line: &str) -> Option<StdinCommand> {
    let line = line.trim();
    match line {
        "" => None,
        "interact" => Some(StdinCommand::Interact),
        "stop" | "quit" => Some(StdinCommand::Stop),
        json => match serde_json::from_str::<SensorInput>(json) {
            Ok(input) => Some(StdinCommand::Sensor(input)),
            Err(e) => {
                warn!("ignoring stdin line {json:?}: {e}");
                None
            }
        },
    }
}

/// Apply stdin commands to the running engine. Resolves when `stop` is
/// read; stdin reaching EOF leaves the session running.
async fn read_stdin(engine: Arc<SleepEngine>, stop_tx: mpsc::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!("stdin: {e}");
                return;
            }
        };
        let result = match parse_stdin_line(&line) {
            None => continue,
            Some(StdinCommand::Interact) => engine.record_user_interaction(),
            Some(StdinCommand::Sensor(input)) => engine.submit_sensor(input),
            Some(StdinCommand::Stop) => {
                let _ = stop_tx.send(()).await;
                return;
            }
        };
        if let Err(e) = result {
            warn!("stdin command rejected: {e}");
        }
    }
}

/// Resolves once a replay has been pushed and fully analysed.
async fn replay_drained(engine: Arc<SleepEngine>, handle: Option<ReplayHandle>) {
    let Some(handle) = handle else {
        return std::future::pending().await;
    };
    loop {
        if handle.is_finished()
            && engine.pipeline_diagnostics_snapshot().samples_in as u64 >= handle.pushed()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn open_source(
    args: &CliArgs,
    settings: &AppSettings,
    session_id: &str,
    sample_period: Duration,
) -> anyhow::Result<(Box<dyn MeteringSource>, Option<ReplayHandle>)> {
    let replay = if let Some(path) = &args.replay {
        Some(ReplaySource::from_text_file(path).with_context(|| format!("reading {}", path.display()))?)
    } else if let Some(path) = &args.wav {
        Some(
            ReplaySource::from_wav_file(path, sample_period)
                .with_context(|| format!("reading {}", path.display()))?,
        )
    } else {
        None
    };

    if let Some(mut replay) = replay {
        if let Some(ms) = args.pace_ms.filter(|ms| *ms > 0) {
            replay = replay.paced(Duration::from_millis(ms));
        }
        let handle = replay.handle();
        return Ok((Box::new(replay), Some(handle)));
    }
    microphone(settings, session_id, sample_period)
}

#[cfg(feature = "audio-cpal")]
fn microphone(
    settings: &AppSettings,
    session_id: &str,
    sample_period: Duration,
) -> anyhow::Result<(Box<dyn MeteringSource>, Option<ReplayHandle>)> {
    let mut mic = driftlab_core::MicrophoneSource::new(sample_period);
    if let Some(device) = &settings.preferred_input_device {
        mic = mic.with_device(device.clone());
    }
    if let Some(dir) = settings.session_recording_dir(session_id) {
        info!(dir = %dir.display(), "recording microphone segments");
        mic = mic.record_to(dir);
    }
    Ok((Box::new(mic), None))
}

#[cfg(not(feature = "audio-cpal"))]
fn microphone(
    _settings: &AppSettings,
    _session_id: &str,
    _sample_period: Duration,
) -> anyhow::Result<(Box<dyn MeteringSource>, Option<ReplayHandle>)> {
    bail!("built without microphone support; use --replay or --wav")
}

#[cfg(feature = "audio-cpal")]
fn list_devices() -> anyhow::Result<()> {
    for name in driftlab_core::MicrophoneSource::list_input_devices()? {
        println!("{name}");
    }
    Ok(())
}

#[cfg(not(feature = "audio-cpal"))]
fn list_devices() -> anyhow::Result<()> {
    bail!("built without microphone support")
}

fn write_report(report: &SessionReport, path: Option<&PathBuf>) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    println!("{json}");
    if let Some(path) = path {
        std::fs::write(path, &json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("driftlab=info,driftlab_core=info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print!("{USAGE}");
        return Ok(());
    }
    if args.list_devices {
        return list_devices();
    }

    let settings_path = args.settings_path.clone().unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    app_settings.apply_env_overrides();
    args.apply_to(&mut app_settings);

    if args.save_settings {
        settings::save_settings(&settings_path, &app_settings)
            .with_context(|| format!("saving {}", settings_path.display()))?;
        info!(path = %settings_path.display(), "settings saved");
        return Ok(());
    }

    let engine = Arc::new(SleepEngine::new(EngineConfig::default())?);
    let sample_period = Duration::from_millis(engine.config().sample_period_ms());
    let session_id = args
        .session_id
        .clone()
        .unwrap_or_else(|| format!("night-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S")));
    let (source, replay_handle) = open_source(&args, &app_settings, &session_id, sample_period)?;
    let session = app_settings.session_config(session_id);
    info!(
        session_id = %session.session_id,
        sensitivity = %session.sensitivity,
        sonar = session.sonar_enabled,
        smart_fade = session.smart_fade_enabled,
        "starting session"
    );

    let mut forwarders = vec![
        forward("status", engine.subscribe_status()),
        forward("event", engine.subscribe_events()),
        forward("breathing", engine.subscribe_breathing()),
        forward("sonar", engine.subscribe_sonar()),
        forward("fade", engine.subscribe_fade()),
        forward("segment", engine.subscribe_segments()),
    ];
    if app_settings.emit_levels {
        forwarders.push(forward("level", engine.subscribe_levels()));
    }

    engine.start(session, source)?;

    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let stdin_task = tokio::spawn(read_stdin(Arc::clone(&engine), stop_tx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        _ = replay_drained(Arc::clone(&engine), replay_handle) => info!("replay finished"),
        Some(()) = stop_rx.recv() => info!("stop requested on stdin"),
    }
    stdin_task.abort();

    let stopper = Arc::clone(&engine);
    let report = tokio::task::spawn_blocking(move || stopper.stop()).await??;

    let diagnostics = engine.pipeline_diagnostics_snapshot();
    info!(
        samples = diagnostics.samples_in,
        events = diagnostics.events_emitted,
        suppressed = diagnostics.detections_suppressed,
        "session finished"
    );

    // Status and the last live messages may still be queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for task in forwarders {
        task.abort();
    }

    write_report(&report, args.report_path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> anyhow::Result<CliArgs> {
        parse_args(raw.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_replay_session() {
        let parsed = args(&[
            "--replay",
            "night.txt",
            "--pace-ms",
            "5",
            "--sensitivity",
            "HIGH",
            "--no-fade",
        ])
        .expect("valid args");
        assert_eq!(parsed.replay, Some(PathBuf::from("night.txt")));
        assert_eq!(parsed.pace_ms, Some(5));
        assert!(parsed.no_fade);
        assert!(!parsed.no_sonar);

        let mut settings = AppSettings::default();
        parsed.apply_to(&mut settings);
        assert_eq!(settings.sensitivity, "high");
        assert!(!settings.smart_fade_enabled);
        assert!(settings.sonar_enabled);
        assert!(settings.record_audio);
    }

    #[test]
    fn recording_flags_override_settings() {
        let parsed = args(&["--record-dir", "/data/nights", "--no-record"]).expect("valid args");
        let mut settings = AppSettings::default();
        parsed.apply_to(&mut settings);
        assert_eq!(settings.recording_dir, Some(PathBuf::from("/data/nights")));
        assert!(!settings.record_audio);

        let parsed = args(&["--record-dir", "/data/nights"]).expect("valid args");
        let mut settings = AppSettings::default();
        parsed.apply_to(&mut settings);
        assert_eq!(
            settings.session_recording_dir("night-3"),
            Some(PathBuf::from("/data/nights/night-3"))
        );
        assert!(args(&["--record-dir"]).is_err());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(args(&["--bogus"]).is_err());
        assert!(args(&["--replay"]).is_err());
        assert!(args(&["--thermostat", "warm"]).is_err());
        assert!(args(&["--replay", "a.txt", "--wav", "b.wav"]).is_err());
    }

    #[test]
    fn stdin_lines() {
        assert!(matches!(parse_stdin_line("interact"), Some(StdinCommand::Interact)));
        assert!(matches!(parse_stdin_line(" stop "), Some(StdinCommand::Stop)));
        assert!(parse_stdin_line("").is_none());
        assert!(parse_stdin_line("not json").is_none());
        assert!(matches!(
            parse_stdin_line(r#"{"sensor":"accelerometer","x":0.1,"y":0.0,"z":1.0}"#),
            Some(StdinCommand::Sensor(SensorInput::Accelerometer { .. }))
        ));
    }

    #[test]
    fn output_line_shape() {
        let line = serde_json::to_value(OutputLine {
            channel: "event",
            data: &serde_json::json!({"x": 1}),
        })
        .expect("json");
        assert_eq!(line["channel"], "event");
        assert_eq!(line["data"]["x"], 1);
    }
}
