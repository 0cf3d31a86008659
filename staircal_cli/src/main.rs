use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueHint};
use staircal::{
    detect_steps, physics, plateau_positions, AlignmentConfig, AlignmentSession, CalibrationKind,
    Dopant, Profile, Window,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Staircase profile calibration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Align a measurement against a staircase calibration profile and fit
    /// the calibration curve
    Calibrate(CalibrateArgs),
    /// Detect staircase transitions in a calibration profile
    DetectSteps(DetectStepsArgs),
    /// Convert between resistivity and carrier concentration
    Convert(ConvertArgs),
}

#[derive(Parser, Debug)]
struct CalibrateArgs {
    /// Calibration profile (two-column text)
    #[arg(long, value_hint = ValueHint::FilePath)]
    calibration: PathBuf,

    /// Measurement profile (two-column text)
    #[arg(long, value_hint = ValueHint::FilePath)]
    measurement: PathBuf,

    /// Settings JSON (saved project); command-line flags override it
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Output path for the calibration record JSON
    #[arg(short, long, default_value = "record.json", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// Optional CSV of the fitted calibration curve
    #[arg(long, value_hint = ValueHint::FilePath)]
    curve: Option<PathBuf>,

    /// Sample name stored in the record (defaults to the calibration file stem)
    #[arg(long)]
    sample: Option<String>,

    /// Multiplier applied to raw positions before normalisation
    #[arg(long, default_value_t = 1.0)]
    position_scale: f64,

    /// Number of plateaus in the staircase
    #[arg(long)]
    steps: Option<usize>,

    /// Minimum distance between transitions (position units)
    #[arg(long)]
    min_distance: Option<f64>,

    /// Derivative smoothing window (points)
    #[arg(long)]
    filter_width: Option<usize>,

    /// Derivative smoothing polynomial order
    #[arg(long)]
    filter_order: Option<usize>,

    /// Lower stretch bound (percent)
    #[arg(long)]
    stretch_min: Option<f64>,

    /// Upper stretch bound (percent)
    #[arg(long)]
    stretch_max: Option<f64>,

    /// Shift search resolution
    #[arg(long)]
    shift_resolution: Option<usize>,

    /// Stretch search resolution
    #[arg(long)]
    stretch_resolution: Option<usize>,

    /// Widen the shift search to the full calibration extent
    #[arg(long, action = ArgAction::SetTrue)]
    widen_search: bool,

    /// Grid candidates evaluated by the fine aligner
    #[arg(long)]
    fine_candidates: Option<usize>,

    /// Include the left segment edge as an anchor
    #[arg(long, action = ArgAction::SetTrue)]
    include_left_edge: bool,

    /// Include the right segment edge as an anchor
    #[arg(long, action = ArgAction::SetTrue)]
    include_right_edge: bool,

    /// Extra anchors per inter-plateau span (comma separated)
    #[arg(long, value_delimiter = ',')]
    subdivisions: Option<Vec<usize>>,

    /// Manual calibration anchor values instead of automatic detection
    #[arg(long, value_delimiter = ',')]
    manual_anchors: Option<Vec<f64>>,

    /// Flip the calibration profile
    #[arg(long, action = ArgAction::SetTrue)]
    flip_calibration: bool,

    /// Flip the measurement profile
    #[arg(long, action = ArgAction::SetTrue)]
    flip_measurement: bool,

    /// Calibration border window: low high
    #[arg(long, num_args = 2)]
    cal_window: Option<Vec<f64>>,

    /// Measurement border window: low high
    #[arg(long, num_args = 2)]
    meas_window: Option<Vec<f64>>,

    /// Dopant species (As, P, B)
    #[arg(long)]
    dopant: Option<String>,

    /// Calibration quantity: carrier, resistivity, or a custom denomination
    #[arg(long)]
    kind: Option<String>,

    /// Also store carrier-concentration anchors converted via the mobility
    /// model (resistivity mode only)
    #[arg(long, action = ArgAction::SetTrue)]
    convert: bool,
}

#[derive(Parser, Debug)]
struct DetectStepsArgs {
    /// Profile to analyse (two-column text)
    #[arg(long, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Number of plateaus in the staircase
    #[arg(long, default_value_t = 5)]
    steps: usize,

    /// Minimum distance between transitions (position units)
    #[arg(long, default_value_t = 0.3)]
    min_distance: f64,

    /// Smoothing window for step detection (0 = off)
    #[arg(long, default_value_t = 0)]
    smooth: usize,

    /// Multiplier applied to raw positions before normalisation
    #[arg(long, default_value_t = 1.0)]
    position_scale: f64,
}

#[derive(Parser, Debug)]
struct ConvertArgs {
    /// Dopant species (As, P, B)
    #[arg(long, default_value = "B")]
    dopant: String,

    /// Resistivities [Ohm cm] to convert to concentration
    #[arg(long, value_delimiter = ',')]
    resistivity: Option<Vec<f64>>,

    /// Concentrations [cm^-3] to convert to resistivity
    #[arg(long, value_delimiter = ',')]
    concentration: Option<Vec<f64>>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Calibrate(args) => run_calibrate(args),
        Command::DetectSteps(args) => run_detect_steps(args),
        Command::Convert(args) => run_convert(args),
    }
}

fn run_calibrate(args: CalibrateArgs) -> Result<()> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed reading config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed parsing config {}", path.display()))?
        }
        None => AlignmentConfig::default(),
    };
    apply_overrides(&mut cfg, &args)?;

    let cal = read_profile(&args.calibration, args.position_scale)?;
    let meas = read_profile(&args.measurement, args.position_scale)?;
    info!(
        cal_points = cal.len(),
        meas_points = meas.len(),
        "profiles loaded"
    );

    let mut session = AlignmentSession::new(cfg);
    session.import_profiles(cal, meas);

    let (rough_m, rough_t, quality) = {
        let rough = session.rough_align()?;
        (rough.best.m, rough.best.t, rough.best_quality)
    };
    info!(m = rough_m, t = rough_t, quality, "rough alignment done");

    let (fine_m, fine_t, cost, evaluated) = {
        let fine = session.fine_align()?;
        (fine.transform.m, fine.transform.t, fine.cost, fine.evaluated)
    };
    info!(m = fine_m, t = fine_t, cost, evaluated, "fine alignment done");

    session.fit()?;
    let fitted = session
        .fitted()
        .context("fit finished without a stored result")?;
    info!(
        anchors = fitted.anchors.len(),
        residual_norm = fitted.residual_norm,
        "calibration fitted"
    );

    let converted = if args.convert {
        if matches!(session.config().kind, CalibrationKind::Resistivity) {
            Some(physics::resistivity_to_concentration(
                &fitted.anchors.calibration,
                session.config().dopant,
            ))
        } else {
            warn!("--convert only applies in resistivity mode; skipping");
            None
        }
    } else {
        None
    };

    let sample = args.sample.clone().unwrap_or_else(|| {
        args.calibration
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown_sample".to_string())
    });
    let data_path = args.measurement.to_string_lossy().into_owned();
    let record = session.record(&sample, &data_path, converted)?;
    fs::write(&args.output, record.to_json()?)
        .with_context(|| format!("failed writing {}", args.output.display()))?;
    info!(output = %args.output.display(), "calibration record written");

    if let Some(curve_path) = &args.curve {
        write_curve(curve_path, session.fitted().context("missing fit")?)?;
        info!(curve = %curve_path.display(), "calibration curve written");
    }
    Ok(())
}

fn run_detect_steps(args: DetectStepsArgs) -> Result<()> {
    let profile = read_profile(&args.input, args.position_scale)?;
    let transitions = args.steps.saturating_sub(1);
    let found = detect_steps(&profile, transitions, args.min_distance, args.smooth)?;
    let Some(positions) = found else {
        bail!("profile has zero position span");
    };
    println!("# {} transitions", positions.len());
    for p in &positions {
        println!("{p}");
    }
    let centers = plateau_positions(profile.x_first(), profile.x_last(), &positions);
    println!("# {} plateau centers", centers.len());
    for c in &centers {
        println!("{c}");
    }
    Ok(())
}

fn run_convert(args: ConvertArgs) -> Result<()> {
    let dopant: Dopant = args.dopant.parse()?;
    match (&args.resistivity, &args.concentration) {
        (Some(rho), None) => {
            for n in physics::resistivity_to_concentration(rho, dopant) {
                println!("{n:e}");
            }
        }
        (None, Some(values)) => {
            for &n in values {
                println!("{}", physics::concentration_to_resistivity(n, dopant));
            }
        }
        _ => bail!("pass exactly one of --resistivity or --concentration"),
    }
    Ok(())
}

fn apply_overrides(cfg: &mut AlignmentConfig, args: &CalibrateArgs) -> Result<()> {
    if let Some(v) = args.steps {
        cfg.step_count = v;
    }
    if let Some(v) = args.min_distance {
        cfg.min_step_distance = v;
    }
    if let Some(v) = args.filter_width {
        cfg.filter_width = v;
    }
    if let Some(v) = args.filter_order {
        cfg.filter_order = v;
    }
    if let Some(v) = args.stretch_min {
        cfg.stretch_min_pct = v;
    }
    if let Some(v) = args.stretch_max {
        cfg.stretch_max_pct = v;
    }
    if let Some(v) = args.shift_resolution {
        cfg.shift_resolution = v;
    }
    if let Some(v) = args.stretch_resolution {
        cfg.stretch_resolution = v;
    }
    if args.widen_search {
        cfg.widen_search = true;
    }
    if let Some(v) = args.fine_candidates {
        cfg.fine_candidates = v;
    }
    if args.include_left_edge {
        cfg.include_left_edge = true;
    }
    if args.include_right_edge {
        cfg.include_right_edge = true;
    }
    if let Some(v) = &args.subdivisions {
        cfg.subdivisions = v.clone();
    }
    if let Some(v) = &args.manual_anchors {
        cfg.manual_anchors = Some(v.clone());
    }
    if args.flip_calibration {
        cfg.cal_flip = true;
    }
    if args.flip_measurement {
        cfg.meas_flip = true;
    }
    if let Some(w) = &args.cal_window {
        cfg.cal_window = Some(Window::new(w[0], w[1]));
    }
    if let Some(w) = &args.meas_window {
        cfg.meas_window = Some(Window::new(w[0], w[1]));
    }
    if let Some(d) = &args.dopant {
        cfg.dopant = d.parse()?;
    }
    if let Some(k) = &args.kind {
        cfg.kind = parse_kind(k);
    }
    Ok(())
}

fn parse_kind(value: &str) -> CalibrationKind {
    match value {
        "carrier" | "charge-carrier" => CalibrationKind::ChargeCarrier,
        "resistivity" => CalibrationKind::Resistivity,
        other => CalibrationKind::Custom(other.to_string()),
    }
}

/// Load a two-column numeric profile, trying the delimiters the instrument
/// exports use (semicolon, tab, comma, whitespace). Positions are scaled and
/// normalised to start at zero.
fn read_profile(path: &Path, position_scale: f64) -> Result<Profile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    if lines.is_empty() {
        bail!("no data rows in {}", path.display());
    }

    let (mut xs, ys) = parse_columns(&lines)
        .with_context(|| format!("could not parse two numeric columns from {}", path.display()))?;
    let origin = xs[0] * position_scale;
    for x in xs.iter_mut() {
        *x = *x * position_scale - origin;
    }
    Ok(Profile::new(xs, ys)?)
}

fn parse_columns(lines: &[&str]) -> Option<(Vec<f64>, Vec<f64>)> {
    for delim in [";", "\t", ","] {
        if let Some(cols) = parse_with(lines, |l| {
            l.split(delim)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        }) {
            return Some(cols);
        }
    }
    parse_with(lines, |l| l.split_whitespace().map(str::to_string).collect())
}

fn parse_with<F>(lines: &[&str], split: F) -> Option<(Vec<f64>, Vec<f64>)>
where
    F: Fn(&str) -> Vec<String>,
{
    let mut xs = Vec::with_capacity(lines.len());
    let mut ys = Vec::with_capacity(lines.len());
    for line in lines {
        let parts = split(line);
        if parts.len() < 2 {
            return None;
        }
        xs.push(parts[0].parse::<f64>().ok()?);
        ys.push(parts[1].parse::<f64>().ok()?);
    }
    Some((xs, ys))
}

fn write_curve(path: &Path, fitted: &staircal::FittedCalibration) -> Result<()> {
    let lo = fitted
        .anchors
        .measured
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    let hi = fitted
        .anchors
        .measured
        .iter()
        .cloned()
        .fold(f64::NEG_INFINITY, f64::max);
    let pad = 0.1 * (hi - lo).abs().max(1e-9);
    let n = 500;
    let mut out = String::from("measured,calibrated\n");
    for i in 0..n {
        let x = (lo - pad) + (hi - lo + 2.0 * pad) * i as f64 / (n - 1) as f64;
        out.push_str(&format!("{x},{}\n", fitted.model.evaluate(x)));
    }
    fs::write(path, out).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}
