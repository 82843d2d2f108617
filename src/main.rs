use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use confique::Config;
use doasteer::{
    delay_and_sum, Audio, Direction, Estimator, EstimatorConfig, EstimatorEvent, GeometryProvider,
    GeometrySnapshot, LevelCalibrator, PcmFormat, Pipeline, Position, StaticGeometry,
    SteeringComputer, SubArray, F,
};
use log::{info, warn};

/// Array layout and estimator settings, read from a TOML file.
#[derive(Config)]
struct Conf {
    /// Microphone positions in cm, indexed by channel.
    mics: Vec<[F; 3]>,
    /// Channels that are switched off.
    #[config(default = [])]
    inactive: Vec<usize>,
    /// Trolley offset along y in cm.
    #[config(default = 0.0)]
    trolley_y: F,
    estimator: Option<EstimatorConfig>,
}

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// TOML file describing the array.
    #[arg(long, short, default_value = "doasteer.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Localizes the source in a recording frame by frame.
    Locate {
        #[command(flatten)]
        input: Input,
    },
    /// Streams a recording through the estimator thread at capture speed.
    Replay {
        #[command(flatten)]
        input: Input,
        /// Frames recorded for gain calibration before it is applied.
        #[arg(long)]
        calibrate: Option<usize>,
    },
    /// Prints the steering towards a fixed target, optionally beamforming a
    /// recording.
    Steer {
        /// `x,y,z` in cm.
        #[arg(value_parser = parse_position, allow_hyphen_values = true)]
        target: Position,
        /// Wav recording to beamform towards the target.
        #[arg(long)]
        beamform: Option<PathBuf>,
        /// Output wav for the beamformed signal.
        #[arg(long, short, requires = "beamform")]
        out: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct Input {
    /// Wav file, or headerless PCM when `--format` is given.
    audio: PathBuf,
    /// Sample format of headerless PCM, e.g. S16LE.
    #[arg(long)]
    format: Option<PcmFormat>,
    /// Channels of headerless PCM.
    #[arg(long, default_value_t = 16)]
    channels: usize,
    /// Sample rate of headerless PCM.
    #[arg(long, default_value_t = 48_000.0)]
    sample_rate: F,
}

impl Input {
    fn load(&self) -> Result<Audio> {
        if let Some(format) = self.format {
            ensure!(self.channels > 0, "--channels must be at least 1");
            let data = std::fs::read(&self.audio)
                .with_context(|| format!("reading {}", self.audio.display()))?;
            Ok(Audio::from_pcm_bytes(
                format,
                self.sample_rate,
                self.channels,
                &data,
            ))
        } else {
            Audio::from_file(&self.audio)
                .with_context(|| format!("reading {}", self.audio.display()))
        }
    }
}

fn parse_position(s: &str) -> Result<Position, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<F>().map_err(|e| format!("{v:?}: {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match values[..] {
        [x, y, z] => Ok(Position::new(x, y, z)),
        _ => Err(format!("expected x,y,z, got {s:?}")),
    }
}

fn load_conf(path: &Path) -> Result<(EstimatorConfig, Arc<StaticGeometry>)> {
    let conf = Conf::builder()
        .file(path)
        .load()
        .with_context(|| format!("loading {}", path.display()))?;
    let mut config = conf.estimator.unwrap_or_default();
    config.channel_count = conf.mics.len();
    ensure!(config.channel_count >= 2, "at least two microphones are needed");
    let geometry = StaticGeometry::new(conf.mics.iter().copied());
    for mic in conf.inactive {
        geometry.set_active(mic, false);
    }
    geometry.set_trolley_y(conf.trolley_y);
    Ok((config, Arc::new(geometry)))
}

fn check_audio(audio: &Audio, config: &mut EstimatorConfig) -> Result<()> {
    ensure!(
        audio.channels() == config.channel_count,
        "recording has {} channels, the array {}",
        audio.channels(),
        config.channel_count
    );
    if audio.sample_rate() != config.sample_rate {
        warn!(
            "using the recording's sample rate {} instead of {}",
            audio.sample_rate(),
            config.sample_rate
        );
        config.sample_rate = audio.sample_rate();
    }
    Ok(())
}

fn print_target(label: &str, snapshot: &GeometrySnapshot) {
    let target = snapshot.target;
    let direction = Direction::towards(&snapshot.centroid(SubArray::Array1), &target);
    let look = direction.to_unit_vec();
    println!(
        "{label}: target ({:.1}, {:.1}, {:.1}) cm, azimuth {:.1}°, elevation {:.1}°, \
         look ({:.3}, {:.3}, {:.3})",
        target.x,
        target.y,
        target.z,
        direction.azimuth.to_degrees(),
        direction.elevation.to_degrees(),
        look.x,
        look.y,
        look.z
    );
}

fn locate(mut config: EstimatorConfig, geometry: &StaticGeometry, input: &Input) -> Result<()> {
    let audio = input.load()?;
    check_audio(&audio, &mut config)?;
    let mut pipeline = Pipeline::new(&config);
    let steering = SteeringComputer::from_config(&config);
    let frames = audio.frames(config.window_len()).collect::<Vec<_>>();
    if frames.is_empty() {
        bail!(
            "recording is shorter than one window of {} samples",
            config.window_len()
        );
    }
    for (index, frame) in frames.iter().enumerate() {
        let snapshot = GeometrySnapshot::new(geometry.current(), pipeline.target());
        let target = pipeline.process(frame, &snapshot)?;
        let snapshot = steering.apply(GeometrySnapshot::new(geometry.current(), target));
        print_target(&format!("window {index}"), &snapshot);
    }
    Ok(())
}

fn replay(
    mut config: EstimatorConfig,
    geometry: Arc<StaticGeometry>,
    input: &Input,
    calibrate: Option<usize>,
) -> Result<()> {
    let audio = input.load()?;
    check_audio(&audio, &mut config)?;
    let interval = Duration::from_secs_f64(config.frame_interval());
    let frame_size = config.frame_size;
    let calibrator = calibrate.map(|frames| Arc::new(LevelCalibrator::new(frames)));

    let mut estimator = Estimator::new(config, geometry);
    if let Some(calibrator) = &calibrator {
        estimator.set_calibration_source(Some(calibrator.clone()));
    }
    let events = estimator.subscribe();
    let sink = estimator.frame_sink();
    estimator.start()?;

    let mut calibrated = calibrator.is_none();
    for frame in audio.frames(frame_size) {
        sink.add_audio_frame(frame);
        thread::sleep(interval);
        if !calibrated {
            match estimator.calibrate() {
                Ok(gains) => {
                    info!("calibration applied");
                    println!("gains: {gains:.3?}");
                    calibrated = true;
                }
                Err(e) => log::debug!("{e}"),
            }
        }
        for event in events.try_iter() {
            match event {
                EstimatorEvent::GeometryChanged(snapshot) => print_target("update", &snapshot),
                EstimatorEvent::StateChanged(state) => info!("estimator {state}"),
                EstimatorEvent::Connection(false) => warn!("estimator lost processing"),
                EstimatorEvent::Connection(true) => info!("estimator resumed"),
            }
        }
    }
    // let the last frames drain
    thread::sleep(estimator.config().poll_interval() * 4);
    estimator.stop()?;
    print_target("final", &estimator.snapshot());
    Ok(())
}

fn steer(
    config: &EstimatorConfig,
    geometry: &StaticGeometry,
    target: Position,
    beamform: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    let target = config.room.clamp(&target);
    let snapshot = SteeringComputer::from_config(config)
        .apply(GeometrySnapshot::new(geometry.current(), target));
    print_target("steering", &snapshot);
    let steering = doasteer::steering::from_snapshot(&snapshot);
    for (mic, s) in steering.iter().enumerate() {
        println!(
            "mic {mic:2}: delay {:.6} s, steering {:3} samples, gain {:.2}",
            s.delay_seconds, s.steering, s.gain
        );
    }
    let Some(beamform) = beamform else {
        return Ok(());
    };
    let audio = Audio::from_file(beamform)
        .with_context(|| format!("reading {}", beamform.display()))?;
    let beam = delay_and_sum(&audio, &steering)?;
    if let Some(out) = out {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: audio.sample_rate() as u32,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(out, spec)
            .with_context(|| format!("creating {}", out.display()))?;
        for sample in beam {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_sample(sample as f32)?;
        }
        writer.finalize()?;
        info!("wrote {}", out.display());
    } else {
        println!("beamformed {} samples", beam.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let (config, geometry) = load_conf(&cli.config)?;
    match cli.command {
        Command::Locate { input } => locate(config, &geometry, &input),
        Command::Replay { input, calibrate } => replay(config, geometry, &input, calibrate),
        Command::Steer {
            target,
            beamform,
            out,
        } => steer(
            &config,
            &geometry,
            target,
            beamform.as_deref(),
            out.as_deref(),
        ),
    }
}
