#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use hdfe::config::FixefRemoval;
use hdfe::inference::ritest::{CiMethod, RitestAlgorithm, RitestStatistic};
use hdfe::{
    Dataset, EstimationConfig, MultiFit, RitestOptions, RitestResult, VcovType, WeightsType,
    feols, fepois, load_dataset,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Args)]
struct EstimateArgs {
    /// Path to a TSV (or .csv) file with a header row
    #[arg(value_name = "DATA")]
    data: PathBuf,

    /// Model formula, e.g. "Y ~ X1 + X2 | f1 + f2"
    #[arg(long, short)]
    formula: String,

    /// TOML file with estimation settings; flags below override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Covariance estimator: iid, hetero, HC1, HC2, HC3, CRV1:<vars>, CRV3:<var>
    #[arg(long)]
    vcov: Option<VcovType>,

    /// Column holding observation weights
    #[arg(long)]
    weights: Option<String>,

    /// aweights or fweights
    #[arg(long)]
    weights_type: Option<WeightsType>,

    /// none or singleton
    #[arg(long)]
    fixef_rm: Option<FixefRemoval>,

    /// Fit least squares on groups of identical regressor rows
    #[arg(long)]
    use_compression: bool,

    /// Treat non-convergence as an error
    #[arg(long)]
    strict: bool,
}

#[derive(Args)]
struct RitestArgs {
    #[command(flatten)]
    estimate: EstimateArgs,

    /// Coefficient and null: X, X=h0, X>h0 or X<h0
    #[arg(long)]
    resampvar: String,

    /// Index of the model to test when the formula expands to several
    #[arg(long, default_value = "0")]
    model: usize,

    #[arg(long, default_value = "1000")]
    reps: usize,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// slow, fast or auto
    #[arg(long, default_value = "auto")]
    algorithm: RitestAlgorithm,

    /// randomization-c or randomization-t
    #[arg(long = "type", default_value = "randomization-c")]
    statistic: RitestStatistic,

    /// Re-assign the treatment by clusters of this column
    #[arg(long)]
    cluster: Option<String>,

    /// wald or clopper-pearson
    #[arg(long, default_value = "wald")]
    ci_method: CiMethod,

    #[arg(long, default_value = "0.95")]
    level: f64,

    /// Write every resampled statistic to this CSV file
    #[arg(long, value_name = "PATH")]
    statistics_out: Option<PathBuf>,

    /// Show a progress bar for the resampling loop
    #[arg(long)]
    progress: bool,
}

#[derive(Parser)]
#[command(
    name = "hdfe",
    about = "Regression with high-dimensional fixed effects and randomization inference"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate linear and IV models
    #[command(about = "Estimate OLS/WLS or 2SLS models with fixed effects")]
    Feols(EstimateArgs),

    /// Estimate Poisson models
    #[command(about = "Estimate Poisson models with fixed effects")]
    Fepois(EstimateArgs),

    /// Randomization inference on one coefficient of a linear model
    #[command(about = "Run randomization inference on a coefficient")]
    Ritest(RitestArgs),

    /// Display version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Feols(args)) => run_estimation(&args, feols).map(|fits| print!("{fits}")),
        Some(Commands::Fepois(args)) => run_estimation(&args, fepois).map(|fits| print!("{fits}")),
        Some(Commands::Ritest(args)) => run_ritest(args),
        Some(Commands::Version) => {
            println!("hdfe {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn estimation_config(args: &EstimateArgs) -> Result<EstimationConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => EstimationConfig::from_toml_file(path)?,
        None => EstimationConfig::default(),
    };
    if let Some(vcov) = &args.vcov {
        config.vcov = Some(vcov.to_string());
    }
    if let Some(weights) = &args.weights {
        config.weights = Some(weights.clone());
    }
    if let Some(weights_type) = args.weights_type {
        config.weights_type = weights_type;
    }
    if let Some(fixef_rm) = args.fixef_rm {
        config.fixef_rm = fixef_rm;
    }
    config.use_compression |= args.use_compression;
    config.strict |= args.strict;
    Ok(config)
}

type Estimator = fn(&str, &Dataset, &EstimationConfig) -> Result<MultiFit, hdfe::EstimationError>;

fn run_estimation(args: &EstimateArgs, estimate: Estimator) -> Result<MultiFit, Box<dyn Error>> {
    let config = estimation_config(args)?;
    let data = load_dataset(&args.data)?;
    Ok(estimate(&args.formula, &data, &config)?)
}

fn run_ritest(args: RitestArgs) -> Result<(), Box<dyn Error>> {
    let config = estimation_config(&args.estimate)?;
    let data = load_dataset(&args.estimate.data)?;
    let fits = feols(&args.estimate.formula, &data, &config)?;
    let fit = fits.fetch_model(args.model)?;

    let options = RitestOptions {
        resampvar: args.resampvar,
        reps: args.reps,
        algorithm: args.algorithm,
        statistic: args.statistic,
        seed: args.seed,
        cluster: args.cluster,
        level: args.level,
        ci_method: args.ci_method,
        store_statistics: args.statistics_out.is_some(),
        show_progress: args.progress,
    };
    let result = fit.ritest(&data, &options)?;
    let augmented = fit.with_ritest(result);

    print!("{augmented}");
    for result in &augmented.extras().ritest {
        println!();
        print!("{result}");
        if let Some(path) = &args.statistics_out {
            write_statistics(path, result)?;
            println!("Resampled statistics written to {}", path.display());
        }
    }
    Ok(())
}

fn write_statistics(path: &Path, result: &RitestResult) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["rep", "statistic"])?;
    for (rep, value) in result.statistics.iter().flatten().enumerate() {
        writer.write_record([rep.to_string(), value.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}
