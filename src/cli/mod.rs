//! Command-line interface for the M-TEMP pipeline.

use anyhow::{bail, Context};
use chrono::NaiveDateTime;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{PipelineConfig, RunConfig};
use crate::core::loaders::{self, LoadedTable};
use crate::core::writers;
use crate::processors::pipeline::{
    process_run, process_runs, profile_name, RunContext, RunInputs, RunOutput, SourceKind, SourceTable,
};
use crate::visualization::{self, TimeSeriesOptions};

#[derive(Parser)]
#[command(name = "mtemp-pipeline")]
#[command(about = "Align, convert and grid M-TEMP sensor cart recordings", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Where a run's recordings come from: a configured run id or explicit files.
#[derive(Args, Clone, Default)]
struct SourceArgs {
    /// Run id from the config's `runs` list
    #[arg(long)]
    run: Option<u32>,
    /// Temperature DAQ export
    #[arg(long)]
    temperature: Option<PathBuf>,
    /// IR/RH DAQ export
    #[arg(long)]
    ir_rh: Option<PathBuf>,
    /// GPS track CSV
    #[arg(long)]
    gps: Option<PathBuf>,
    /// Cart name (e.g. "Cart 2"); detected from the DAQ serial number if omitted
    #[arg(long)]
    cart: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage for one run and write all outputs
    Process {
        #[command(flatten)]
        sources: SourceArgs,
        /// Output directory
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
        /// Fill empty heatmap cells by inverse-distance weighting
        #[arg(long)]
        interpolate: bool,
        /// Heatmap cell edge in metres
        #[arg(long)]
        cell_size: Option<u32>,
        /// Skip PNG rendering
        #[arg(long)]
        no_plots: bool,
    },

    /// Merge temperature and IR/RH recordings into one CSV
    Merge {
        #[command(flatten)]
        sources: SourceArgs,
        /// Output CSV file
        output: PathBuf,
    },

    /// Build a spatial heatmap of one channel
    Heatmap {
        #[command(flatten)]
        sources: SourceArgs,
        /// Output PNG file
        output: PathBuf,
        /// Channel to map (defaults to the configured target)
        #[arg(long)]
        column: Option<String>,
        /// Heatmap cell edge in metres
        #[arg(long)]
        cell_size: Option<u32>,
        /// Fill empty cells by inverse-distance weighting
        #[arg(long)]
        interpolate: bool,
        /// Also write the cells as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Build vertical profiles of the mast channels
    Profile {
        #[command(flatten)]
        sources: SourceArgs,
        /// Output PNG file
        output: PathBuf,
        /// Top of the profile in feet
        #[arg(long)]
        max_height: Option<f64>,
        /// Include the IR channel
        #[arg(long)]
        ir: bool,
        /// Include relative humidity
        #[arg(long)]
        rh: bool,
        /// Leave out the secondary ("b") temperature sensors
        #[arg(long)]
        no_secondary: bool,
        /// Also write the bands as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Plot the selected channels of a run against time
    Timeseries {
        #[command(flatten)]
        sources: SourceArgs,
        /// Output PNG file
        output: PathBuf,
        /// Include the IR channel
        #[arg(long)]
        ir: bool,
        /// Include relative humidity
        #[arg(long)]
        rh: bool,
        /// Leave out the secondary ("b") temperature sensors
        #[arg(long)]
        no_secondary: bool,
        /// Lower y-axis limit
        #[arg(long, requires = "ymax", allow_hyphen_values = true)]
        ymin: Option<f64>,
        /// Upper y-axis limit
        #[arg(long, requires = "ymin", allow_hyphen_values = true)]
        ymax: Option<f64>,
        /// First timestamp to plot (e.g. "10/15/2024 13:05:00")
        #[arg(long, value_parser = parse_time_arg)]
        start: Option<NaiveDateTime>,
        /// Last timestamp to plot
        #[arg(long, value_parser = parse_time_arg)]
        end: Option<NaiveDateTime>,
        /// Plot title
        #[arg(long)]
        title: Option<String>,
    },

    /// Show metadata, channels and time span of a DAQ or GPS file
    Inspect {
        /// Input CSV file
        file: PathBuf,
        /// Treat the file as a GPS track
        #[arg(long)]
        gps: bool,
    },

    /// Process every configured run in parallel
    Batch {
        /// Output directory (one sub-directory per run)
        #[arg(short, long, default_value = "output")]
        output_dir: PathBuf,
        /// Skip PNG rendering
        #[arg(long)]
        no_plots: bool,
    },

    /// Write the default configuration to a YAML file
    InitConfig {
        /// Output YAML path
        #[arg(default_value = "mtemp.yaml")]
        path: PathBuf,
    },
}

fn parse_time_arg(raw: &str) -> Result<NaiveDateTime, String> {
    loaders::parse_timestamp(raw).ok_or_else(|| format!("unrecognised timestamp '{}'", raw))
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<62} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 39 {
            format!("{}...", value.chars().take(36).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<39} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Log the error, clear the spinner and exit with status 1.
fn fail(spinner: Option<&ProgressBar>, what: &str, err: anyhow::Error) -> ! {
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }
    error!("{} failed: {:#}", what, err);
    std::process::exit(1);
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    // Load config
    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!("Failed to load config from {}: {}, using defaults", path.display(), e);
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    // Dispatch to subcommands
    match cli.command {
        Commands::Process { sources, output_dir, interpolate, cell_size, no_plots } => {
            let mut config = config;
            config.grid.interpolate |= interpolate;
            if let Some(size) = cell_size {
                config.grid.cell_size_m = size;
            }
            cmd_process(&sources, &output_dir, !no_plots, &config);
        }
        Commands::Merge { sources, output } => {
            cmd_merge(&sources, &output, &config);
        }
        Commands::Heatmap { sources, output, column, cell_size, interpolate, csv } => {
            let mut config = config;
            config.grid.interpolate |= interpolate;
            if let Some(size) = cell_size {
                config.grid.cell_size_m = size;
            }
            cmd_heatmap(&sources, &output, column.as_deref(), csv.as_deref(), &config);
        }
        Commands::Profile { sources, output, max_height, ir, rh, no_secondary, csv } => {
            let mut config = config;
            if let Some(h) = max_height {
                config.profile.max_height_ft = h;
            }
            config.profile.quantities.ir |= ir;
            config.profile.quantities.humidity |= rh;
            config.profile.include_secondary &= !no_secondary;
            cmd_profile(&sources, &output, csv.as_deref(), &config);
        }
        Commands::Timeseries {
            sources,
            output,
            ir,
            rh,
            no_secondary,
            ymin,
            ymax,
            start,
            end,
            title,
        } => {
            let mut options = TimeSeriesOptions {
                include_secondary: !no_secondary,
                y_range: ymin.zip(ymax),
                ..TimeSeriesOptions::default()
            };
            options.quantities.ir = ir;
            options.quantities.humidity = rh;
            if start.is_some() || end.is_some() {
                options.window = Some((
                    start.unwrap_or(NaiveDateTime::MIN),
                    end.unwrap_or(NaiveDateTime::MAX),
                ));
            }
            if let Some(title) = title {
                options.title = title;
            }
            cmd_timeseries(&sources, &output, &options, &config);
        }
        Commands::Inspect { file, gps } => {
            cmd_inspect(&file, gps, &config);
        }
        Commands::Batch { output_dir, no_plots } => {
            cmd_batch(&output_dir, !no_plots, &config);
        }
        Commands::InitConfig { path } => {
            cmd_init_config(&path, &config);
        }
    }
}

/// Resolve the cart of a DAQ recording: explicit name first, then serial number.
fn resolve_cart(loaded: &LoadedTable, explicit: Option<&str>, config: &PipelineConfig) -> anyhow::Result<String> {
    if let Some(cart) = explicit {
        return Ok(cart.to_string());
    }
    let serial = loaded.serial_number().unwrap_or("<none>");
    match config.carts.cart_for_serial(serial) {
        Some(cart) => Ok(cart.to_string()),
        None => bail!(
            "cannot determine cart for {} (serial {}); pass --cart",
            loaded.source_path.display(),
            serial
        ),
    }
}

fn load_daq_source(
    path: &Path,
    kind: SourceKind,
    cart: Option<&str>,
    config: &PipelineConfig,
) -> anyhow::Result<SourceTable> {
    let loaded = loaders::load_daq_csv(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let cart = resolve_cart(&loaded, cart, config)?;
    info!("{}: {} ({} rows)", path.display(), cart, loaded.table.len());
    Ok(SourceTable {
        table: loaded.table,
        profile: profile_name(&cart, kind),
    })
}

/// Load every file a run lists.
pub fn load_run_inputs(run: &RunConfig, config: &PipelineConfig) -> anyhow::Result<RunInputs> {
    let cart = run.cart.as_deref();
    let temperature = run
        .temperature_path()
        .map(|p| load_daq_source(&p, SourceKind::Temperature, cart, config))
        .transpose()?;
    let ir_rh = run
        .ir_rh_path()
        .map(|p| load_daq_source(&p, SourceKind::IrRh, cart, config))
        .transpose()?;
    let gps = run
        .gps_path()
        .map(|p| {
            loaders::load_gps_csv(&p)
                .map(|loaded| loaded.table)
                .with_context(|| format!("Failed to load GPS track {}", p.display()))
        })
        .transpose()?;

    if temperature.is_none() && ir_rh.is_none() {
        bail!("run {} lists no temperature or IR/RH recording", run.id);
    }
    if let Some(route) = &run.route {
        info!("Run {}: route {}", run.id, route);
    }

    Ok(RunInputs {
        id: run.id,
        temperature,
        ir_rh,
        gps,
    })
}

/// Turn command-line source arguments into a run description.
fn run_from_args(sources: &SourceArgs, config: &PipelineConfig) -> anyhow::Result<RunConfig> {
    let mut run = match sources.run {
        Some(id) => config
            .run(id)
            .cloned()
            .with_context(|| format!("run {} is not in the config", id))?,
        None => RunConfig {
            id: 0,
            folder: PathBuf::new(),
            temperature_file: None,
            ir_rh_file: None,
            gps_file: None,
            cart: None,
            route: None,
        },
    };

    let as_string = |p: &PathBuf| p.to_string_lossy().to_string();
    if let Some(p) = &sources.temperature {
        run.temperature_file = Some(as_string(p));
    }
    if let Some(p) = &sources.ir_rh {
        run.ir_rh_file = Some(as_string(p));
    }
    if let Some(p) = &sources.gps {
        run.gps_file = Some(as_string(p));
    }
    if sources.cart.is_some() {
        run.cart = sources.cart.clone();
    }
    Ok(run)
}

fn prepare_context<'a>(
    inputs: &RunInputs,
    config: &'a PipelineConfig,
) -> anyhow::Result<RunContext<'a>> {
    let mut ctx = RunContext::new(config);
    if let Some(source) = &inputs.temperature {
        ctx.prepare_temperature(&source.table, &source.profile)
            .context("Temperature preparation")?;
    }
    if let Some(source) = &inputs.ir_rh {
        ctx.prepare_ir_rh(&source.table, &source.profile)
            .context("IR/RH preparation")?;
    }
    ctx.merge().context("Merge")?;
    Ok(ctx)
}

/// Write every product of a run into `dir`.
fn write_run_outputs(output: &RunOutput, dir: &Path, plots: bool) -> anyhow::Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    let merged_path = dir.join("merged.csv");
    writers::write_table_csv(&merged_path, &output.merged)?;
    written.push(merged_path);

    if let Some(geo) = &output.geo {
        let path = dir.join("geo.csv");
        writers::write_geo_csv(&path, geo)?;
        written.push(path);
    }

    if let Some(grid) = &output.heatmap {
        let path = dir.join("heatmap.csv");
        writers::write_grid_csv(&path, grid)?;
        written.push(path);
        if plots {
            let png = dir.join("heatmap.png");
            visualization::plot_heatmap(&png, grid)?;
            written.push(png);
        }
    }

    if !output.profiles.is_empty() {
        let path = dir.join("profile.csv");
        writers::write_profiles_csv(&path, &output.profiles)?;
        written.push(path);
        if plots {
            let png = dir.join("profile.png");
            visualization::plot_profiles(&png, &output.profiles)?;
            written.push(png);
        }
    }

    Ok(written)
}

fn cmd_process(sources: &SourceArgs, output_dir: &Path, plots: bool, config: &PipelineConfig) {
    let start = Instant::now();
    let spinner = create_spinner("Loading recordings...");

    let inputs = match run_from_args(sources, config).and_then(|run| load_run_inputs(&run, config)) {
        Ok(inputs) => inputs,
        Err(e) => fail(Some(&spinner), "Loading", e),
    };

    spinner.set_message("Running pipeline...");
    let output = match process_run(&inputs, config) {
        Ok(output) => output,
        Err(e) => fail(Some(&spinner), "Pipeline", e.into()),
    };

    spinner.set_message("Writing outputs...");
    let written = match write_run_outputs(&output, output_dir, plots) {
        Ok(files) => files,
        Err(e) => fail(Some(&spinner), "Writing outputs", e),
    };
    spinner.finish_and_clear();

    for warning in &output.warnings {
        warn!("{}", warning);
    }

    print_summary(
        "Processing Complete",
        &[
            ("Output directory", output_dir.display().to_string()),
            ("Rows", output.merged.len().to_string()),
            ("Columns", output.merged.columns().len().to_string()),
            (
                "Positioned rows",
                output.geo.as_ref().map_or(0, |g| g.positioned_count()).to_string(),
            ),
            (
                "Heatmap cells",
                output.heatmap.as_ref().map_or(0, |g| g.defined_cells()).to_string(),
            ),
            ("Profiles", output.profiles.len().to_string()),
            ("Files written", written.len().to_string()),
            ("Warnings", output.warnings.len().to_string()),
            ("Failed stages", output.failures.len().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );
}

fn cmd_merge(sources: &SourceArgs, output: &Path, config: &PipelineConfig) {
    let start = Instant::now();
    let spinner = create_spinner("Merging recordings...");

    let result = run_from_args(sources, config)
        .and_then(|run| load_run_inputs(&run, config))
        .and_then(|inputs| {
            let ctx = prepare_context(&inputs, config)?;
            let merged = ctx.merged().context("nothing to merge")?;
            writers::write_table_csv(output, merged)?;
            Ok((merged.len(), merged.columns().len(), ctx.warnings().len()))
        });

    match result {
        Ok((rows, columns, warnings)) => {
            spinner.finish_and_clear();
            print_summary(
                "Merge Complete",
                &[
                    ("Output file", output.display().to_string()),
                    ("Rows", rows.to_string()),
                    ("Columns", columns.to_string()),
                    ("Warnings", warnings.to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => fail(Some(&spinner), "Merge", e),
    }
}

fn cmd_heatmap(
    sources: &SourceArgs,
    output: &Path,
    column: Option<&str>,
    csv: Option<&Path>,
    config: &PipelineConfig,
) {
    let start = Instant::now();
    let spinner = create_spinner("Building heatmap...");

    let result = run_from_args(sources, config)
        .and_then(|run| load_run_inputs(&run, config))
        .and_then(|inputs| {
            let gps = inputs.gps.as_ref().context("a GPS track is required (--gps)")?;
            let mut ctx = prepare_context(&inputs, config)?;
            ctx.spatially_enable(gps).context("Spatial join")?;
            let grid = ctx.heatmap(column)?;
            visualization::plot_heatmap(output, &grid)?;
            if let Some(path) = csv {
                writers::write_grid_csv(path, &grid)?;
            }
            Ok(grid)
        });

    match result {
        Ok(grid) => {
            spinner.finish_and_clear();
            let range = grid
                .value_range()
                .map(|(lo, hi)| format!("{:.2} .. {:.2}", lo, hi))
                .unwrap_or_default();
            print_summary(
                "Heatmap Complete",
                &[
                    ("Output PNG", output.display().to_string()),
                    ("Channel", grid.column().to_string()),
                    ("Grid", format!("{} x {}", grid.cols(), grid.rows())),
                    ("Cell size (m)", grid.cell_size_m().to_string()),
                    ("Observed cells", grid.observed_cells().to_string()),
                    ("Defined cells", grid.defined_cells().to_string()),
                    ("Value range", range),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => fail(Some(&spinner), "Heatmap", e),
    }
}

fn cmd_profile(sources: &SourceArgs, output: &Path, csv: Option<&Path>, config: &PipelineConfig) {
    let start = Instant::now();
    let spinner = create_spinner("Building vertical profiles...");

    let result = run_from_args(sources, config)
        .and_then(|run| load_run_inputs(&run, config))
        .and_then(|inputs| {
            let ctx = prepare_context(&inputs, config)?;
            let profiles = ctx.vertical_profile()?;
            visualization::plot_profiles(output, &profiles)?;
            if let Some(path) = csv {
                writers::write_profiles_csv(path, &profiles)?;
            }
            Ok(profiles)
        });

    match result {
        Ok(profiles) => {
            spinner.finish_and_clear();
            let quantities: Vec<String> = profiles.iter().map(|p| p.quantity.to_string()).collect();
            let bands: usize = profiles.iter().map(|p| p.bands.len()).sum();
            print_summary(
                "Vertical Profile Complete",
                &[
                    ("Output PNG", output.display().to_string()),
                    ("Quantities", quantities.join(", ")),
                    ("Bands", bands.to_string()),
                    ("Max height (ft)", config.profile.max_height_ft.to_string()),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => fail(Some(&spinner), "Vertical profile", e),
    }
}

fn cmd_timeseries(sources: &SourceArgs, output: &Path, options: &TimeSeriesOptions, config: &PipelineConfig) {
    let start = Instant::now();
    let spinner = create_spinner("Plotting time series...");

    let result = run_from_args(sources, config)
        .and_then(|run| load_run_inputs(&run, config))
        .and_then(|inputs| {
            let ctx = prepare_context(&inputs, config)?;
            let merged = ctx.merged().context("Merged table missing")?;
            let series = visualization::timeseries_series(merged, options);
            visualization::plot_timeseries(output, merged, options)?;
            Ok(series.len())
        });

    match result {
        Ok(series) => {
            spinner.finish_and_clear();
            let window = match options.window {
                Some((first, last)) => format!("{} .. {}", first.format("%H:%M:%S"), last.format("%H:%M:%S")),
                None => "full run".to_string(),
            };
            print_summary(
                "Time Series Complete",
                &[
                    ("Output PNG", output.display().to_string()),
                    ("Channels", series.to_string()),
                    ("Window", window),
                    ("Duration", format!("{:.2?}", start.elapsed())),
                ],
            );
        }
        Err(e) => fail(Some(&spinner), "Time series", e),
    }
}

fn cmd_inspect(file: &Path, gps: bool, config: &PipelineConfig) {
    let loaded = if gps {
        loaders::load_gps_csv(file)
    } else {
        loaders::load_daq_csv(file)
    };
    let loaded = match loaded {
        Ok(l) => l,
        Err(e) => fail(None, "Inspect", e.into()),
    };

    let table = &loaded.table;
    let span = match (table.timestamps().first(), table.timestamps().last()) {
        (Some(first), Some(last)) => format!("{} .. {}", first.format("%H:%M:%S"), last.format("%H:%M:%S")),
        _ => String::new(),
    };

    let mut items = vec![
        ("File", file.display().to_string()),
        ("Rows", table.len().to_string()),
        ("Time span", span),
    ];
    if let Some(serial) = loaded.serial_number() {
        items.push(("Serial number", serial.to_string()));
        items.push((
            "Cart",
            config.carts.cart_for_serial(serial).unwrap_or("unknown").to_string(),
        ));
    }
    print_summary("File Summary", &items);

    for (key, value) in &loaded.metadata {
        println!("  {}: {}", key, value);
    }
    for column in table.columns() {
        println!("  {:<24} {:>8} values", column.label, column.count_present());
    }
}

fn cmd_batch(output_dir: &Path, plots: bool, config: &PipelineConfig) {
    let start = Instant::now();

    if config.runs.is_empty() {
        error!("The config lists no runs; add a `runs` section or use `process`");
        std::process::exit(1);
    }

    let spinner = create_spinner(&format!("Loading {} runs...", config.runs.len()));
    let mut inputs = Vec::with_capacity(config.runs.len());
    let mut load_failures = 0usize;
    for run in &config.runs {
        match load_run_inputs(run, config) {
            Ok(i) => inputs.push(i),
            Err(e) => {
                error!("Run {}: {:#}", run.id, e);
                load_failures += 1;
            }
        }
    }

    spinner.set_message(format!("Processing {} runs...", inputs.len()));
    let results = process_runs(&inputs, config);

    spinner.set_message("Writing outputs...");
    let mut succeeded = 0usize;
    let mut failed = load_failures;
    for (id, result) in results {
        let dir = output_dir.join(format!("run_{}", id));
        match result.map_err(anyhow::Error::from).and_then(|out| write_run_outputs(&out, &dir, plots)) {
            Ok(_) => succeeded += 1,
            Err(e) => {
                error!("Run {}: {:#}", id, e);
                failed += 1;
            }
        }
    }
    spinner.finish_and_clear();

    print_summary(
        "Batch Complete",
        &[
            ("Output directory", output_dir.display().to_string()),
            ("Runs configured", config.runs.len().to_string()),
            ("Succeeded", succeeded.to_string()),
            ("Failed", failed.to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    if failed > 0 {
        std::process::exit(1);
    }
}

fn cmd_init_config(path: &Path, config: &PipelineConfig) {
    if path.exists() {
        error!("{} already exists; refusing to overwrite", path.display());
        std::process::exit(1);
    }
    match config.to_yaml(path) {
        Ok(()) => println!("Wrote configuration to {}", path.display()),
        Err(e) => fail(None, "Writing config", e.into()),
    }
}
